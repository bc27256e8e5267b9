use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RiskConfig;
use crate::domain::{Position, Side};

/// Why a stop-loss fired
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Held side's probability fell at least the configured amount below entry
    OddsDrop {
        entry: Decimal,
        current: Decimal,
        drop: Decimal,
    },
    /// Reference price is now on the losing side of the open
    ReferenceCross { open: Decimal, reference: Decimal },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::OddsDrop {
                entry,
                current,
                drop,
            } => write!(f, "odds {} -> {} (drop {})", entry, current, drop),
            StopReason::ReferenceCross { open, reference } => {
                write!(f, "reference {} crossed open {}", reference, open)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopLossTrigger {
    pub position_id: String,
    pub side: Side,
    pub reasons: Vec<StopReason>,
}

impl StopLossTrigger {
    pub fn describe(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Position & risk manager: decides when a held position must be exited
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.stop_loss_enabled
    }

    /// Check a held position against both stop-loss triggers.
    ///
    /// Either trigger is sufficient. When both hold, both are reported. The
    /// reference-cross trigger is skipped when the open or the reference price
    /// is unknown.
    pub fn check(
        &self,
        position: &Position,
        current_probability: Option<Decimal>,
        reference: Option<Decimal>,
        open: Option<Decimal>,
    ) -> Option<StopLossTrigger> {
        if !self.config.stop_loss_enabled {
            return None;
        }

        let mut reasons = Vec::new();

        if let Some(current) = current_probability {
            let drop = position.entry_price - current;
            if drop >= self.config.stop_loss_drop {
                reasons.push(StopReason::OddsDrop {
                    entry: position.entry_price,
                    current,
                    drop,
                });
            }
        }

        if self.config.reference_cross_enabled {
            if let (Some(open), Some(reference)) = (open, reference) {
                let margin = self.config.reference_cross_margin_usd;
                let crossed = match position.side {
                    Side::Up => reference < open - margin,
                    Side::Down => reference > open + margin,
                };
                if crossed {
                    reasons.push(StopReason::ReferenceCross { open, reference });
                }
            }
        }

        if reasons.is_empty() {
            return None;
        }

        Some(StopLossTrigger {
            position_id: position.id.clone(),
            side: position.side,
            reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StrategyKind;
    use rust_decimal_macros::dec;

    fn position(side: Side, entry: Decimal) -> Position {
        Position::new("w", side, "tok", entry, dec!(7.14), StrategyKind::Checkpoint)
    }

    #[test]
    fn test_odds_drop_fires_at_threshold() {
        let risk = RiskManager::new(RiskConfig::default());
        let pos = position(Side::Up, dec!(0.70));

        assert!(risk.check(&pos, Some(dec!(0.41)), None, None).is_none());

        let trigger = risk.check(&pos, Some(dec!(0.39)), None, None).unwrap();
        assert_eq!(
            trigger.reasons,
            vec![StopReason::OddsDrop {
                entry: dec!(0.70),
                current: dec!(0.39),
                drop: dec!(0.31),
            }]
        );

        // Exactly the threshold counts
        assert!(risk.check(&pos, Some(dec!(0.40)), None, None).is_some());
    }

    #[test]
    fn test_reference_cross_by_side() {
        let risk = RiskManager::new(RiskConfig::default());
        let open = Some(dec!(97000));

        let up = position(Side::Up, dec!(0.8));
        assert!(risk.check(&up, Some(dec!(0.8)), Some(dec!(97001)), open).is_none());
        assert!(risk.check(&up, Some(dec!(0.8)), Some(dec!(97000)), open).is_none());
        assert!(risk.check(&up, Some(dec!(0.8)), Some(dec!(96999)), open).is_some());

        let down = position(Side::Down, dec!(0.8));
        assert!(risk.check(&down, Some(dec!(0.8)), Some(dec!(97005)), open).is_some());
        assert!(risk.check(&down, Some(dec!(0.8)), Some(dec!(96990)), open).is_none());
    }

    #[test]
    fn test_both_reasons_recorded() {
        let risk = RiskManager::new(RiskConfig::default());
        let pos = position(Side::Up, dec!(0.70));

        let trigger = risk
            .check(&pos, Some(dec!(0.30)), Some(dec!(96950)), Some(dec!(97000)))
            .unwrap();
        assert_eq!(trigger.reasons.len(), 2);
        assert!(trigger.describe().contains("crossed open"));
    }

    #[test]
    fn test_missing_open_skips_cross() {
        let risk = RiskManager::new(RiskConfig::default());
        let pos = position(Side::Up, dec!(0.70));
        assert!(risk.check(&pos, Some(dec!(0.65)), Some(dec!(1)), None).is_none());
    }

    #[test]
    fn test_disabled() {
        let risk = RiskManager::new(RiskConfig {
            stop_loss_enabled: false,
            ..RiskConfig::default()
        });
        let pos = position(Side::Up, dec!(0.70));
        assert!(!risk.enabled());
        assert!(risk.check(&pos, Some(dec!(0.01)), None, None).is_none());
    }
}
