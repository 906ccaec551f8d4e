//! Conditional branch prediction from taken/not-taken counts.

use crate::feedback::SaturatingCounter;

/// Observations a branch needs before it is predicted.
pub const MIN_BRANCH_SAMPLES: u32 = 200;

/// Outcome of [`predict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPrediction {
    /// At most [`MIN_BRANCH_SAMPLES`] observations.
    NotEnoughData,
    /// Only one direction was ever taken.
    Likely(bool),
    /// Both directions were taken.
    Unpredictable,
}

/// Predict a branch from how often its condition was true and false.
pub fn predict(was_true: u32, was_false: u32) -> BranchPrediction {
    if was_true.saturating_add(was_false) <= MIN_BRANCH_SAMPLES {
        return BranchPrediction::NotEnoughData;
    }
    match (was_true, was_false) {
        (_, 0) => BranchPrediction::Likely(true),
        (0, _) => BranchPrediction::Likely(false),
        _ => BranchPrediction::Unpredictable,
    }
}

/// Per-site condition counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchFeedback {
    pub was_true: SaturatingCounter,
    pub was_false: SaturatingCounter,
}

impl BranchFeedback {
    #[inline]
    pub fn record(&mut self, condition: bool) {
        if condition {
            self.was_true.increment();
        } else {
            self.was_false.increment();
        }
    }

    #[inline]
    pub fn predict(&self) -> BranchPrediction {
        predict(
            u32::from(self.was_true.get()),
            u32::from(self.was_false.get()),
        )
    }
}

/// Prediction outcomes of every branch site a VM has planned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CondBranchStats {
    pub total: u64,
    pub optimized: u64,
    pub not_enough_data: u64,
    pub unpredictable: u64,
}

impl CondBranchStats {
    pub fn record(&mut self, prediction: BranchPrediction) {
        self.total += 1;
        match prediction {
            BranchPrediction::NotEnoughData => self.not_enough_data += 1,
            BranchPrediction::Likely(_) => self.optimized += 1,
            BranchPrediction::Unpredictable => self.unpredictable += 1,
        }
    }

    pub fn merge(&mut self, other: &CondBranchStats) {
        self.total += other.total;
        self.optimized += other.optimized;
        self.not_enough_data += other.not_enough_data;
        self.unpredictable += other.unpredictable;
    }
}
