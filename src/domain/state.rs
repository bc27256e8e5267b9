use serde::{Deserialize, Serialize};
use std::fmt;

/// Market cycle controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleState {
    /// Looking for the window that contains "now"
    Seeking,
    /// A window is current and being traded
    Active,
    /// Current window closed, waiting to hand over to the next one
    Rolling,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Seeking => "SEEKING",
            CycleState::Active => "ACTIVE",
            CycleState::Rolling => "ROLLING",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::*;

        match (self, target) {
            // Window found with enough time left
            (Seeking, Active) => true,
            // Rollover timer fired
            (Active, Rolling) => true,
            // Next window lookup starts
            (Rolling, Seeking) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<CycleState> {
        use CycleState::*;

        match self {
            Seeking => vec![Active],
            Active => vec![Rolling],
            Rolling => vec![Seeking],
        }
    }

    /// Is the engine allowed to evaluate signals in this state?
    pub fn is_trading(&self) -> bool {
        matches!(self, CycleState::Active)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CycleState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "SEEKING" => Ok(CycleState::Seeking),
            "ACTIVE" => Ok(CycleState::Active),
            "ROLLING" => Ok(CycleState::Rolling),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CycleState,
    pub to: CycleState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: CycleState, to: CycleState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Which strategy produced a signal or a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    EarlyEntry,
    Checkpoint,
    LastResort,
    DivergenceArb,
    PassiveResting,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::EarlyEntry => "early_entry",
            StrategyKind::Checkpoint => "checkpoint",
            StrategyKind::LastResort => "last_resort",
            StrategyKind::DivergenceArb => "divergence_arb",
            StrategyKind::PassiveResting => "passive_resting",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use CycleState::*;

        assert!(Seeking.can_transition_to(Active));
        assert!(Active.can_transition_to(Rolling));
        assert!(Rolling.can_transition_to(Seeking));

        assert!(!Seeking.can_transition_to(Rolling));
        assert!(!Active.can_transition_to(Seeking));
        assert!(!Rolling.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_valid_transitions_match_table() {
        for state in [CycleState::Seeking, CycleState::Active, CycleState::Rolling] {
            for next in state.valid_transitions() {
                assert!(state.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(CycleState::try_from("active").unwrap(), CycleState::Active);
        assert_eq!(
            CycleState::try_from("ROLLING").unwrap(),
            CycleState::Rolling
        );
        assert!(CycleState::try_from("IDLE").is_err());
    }

    #[test]
    fn test_strategy_kind_serde() {
        let json = serde_json::to_string(&StrategyKind::DivergenceArb).unwrap();
        assert_eq!(json, "\"divergence_arb\"");
        assert_eq!(StrategyKind::EarlyEntry.to_string(), "early_entry");
    }
}
