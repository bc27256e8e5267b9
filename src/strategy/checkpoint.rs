//! Consumable checkpoint ladder.
//!
//! Each checkpoint is handed out at most once per window, strictly in ladder
//! order, and counts as consumed whether or not the caller trades on it.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::CheckpointLevel;
use crate::error::{Result, UpDownError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Checkpoint {
    pub index: usize,
    pub threshold_secs: f64,
    pub min_confidence: Decimal,
}

#[derive(Debug, Clone)]
pub struct CheckpointLadder {
    checkpoints: Vec<Checkpoint>,
    /// Index of the next unconsumed checkpoint
    next: usize,
    floor_secs: f64,
    fired: Option<usize>,
}

impl CheckpointLadder {
    pub fn new(levels: &[CheckpointLevel], floor_secs: f64) -> Result<Self> {
        if levels.windows(2).any(|w| w[1].secs > w[0].secs) {
            return Err(UpDownError::Validation(
                "checkpoint time thresholds must be non-increasing".to_string(),
            ));
        }

        let checkpoints = levels
            .iter()
            .enumerate()
            .map(|(index, level)| Checkpoint {
                index,
                threshold_secs: level.secs,
                min_confidence: level.min_confidence,
            })
            .collect();

        Ok(Self {
            checkpoints,
            next: 0,
            floor_secs,
            fired: None,
        })
    }

    /// Consume and return the next checkpoint whose threshold has been crossed.
    ///
    /// Below the floor nothing is returned and the rest of the ladder is
    /// consumed, so a late window never evaluates a checkpoint.
    pub fn take_due(&mut self, remaining_secs: f64) -> Option<Checkpoint> {
        if remaining_secs < self.floor_secs {
            self.next = self.checkpoints.len();
            return None;
        }

        let checkpoint = *self.checkpoints.get(self.next)?;
        if remaining_secs <= checkpoint.threshold_secs {
            self.next += 1;
            Some(checkpoint)
        } else {
            None
        }
    }

    /// Record that a consumed checkpoint produced a signal
    pub fn mark_fired(&mut self, index: usize) {
        if self.fired.is_none() {
            self.fired = Some(index);
        }
    }

    pub fn fired(&self) -> Option<usize> {
        self.fired
    }

    pub fn consumed(&self) -> usize {
        self.next
    }

    pub fn all_consumed(&self) -> bool {
        self.next >= self.checkpoints.len()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}
