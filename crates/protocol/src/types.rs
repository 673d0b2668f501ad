use serde::{Deserialize, Serialize};

/// Scheduling priority of a request. Lower numeric value runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Maximum,
    Interactive,
    SemiInteractive,
    Update,
    #[default]
    Bulk,
    Prefetch,
    Minimum,
}

impl PriorityClass {
    /// Numeric class, 0 (maximum) to 6 (minimum).
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Current state of a client-visible request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl RequestStatus {
    /// Returns `true` for succeeded, failed and cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a request's aggregate block counters.
///
/// This is the counter contract every progress surface relies on:
/// `successful + failed + fatally_failed <= total` once `finalized` is set,
/// and no field ever decreases while the request is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockProgress {
    pub total_blocks: u32,
    pub successful_blocks: u32,
    pub failed_blocks: u32,
    pub fatally_failed_blocks: u32,
    pub min_success_blocks: u32,
    /// `total_blocks` will not change again.
    pub finalized: bool,
}

impl BlockProgress {
    /// Fraction of the required blocks that succeeded, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        let needed = if self.min_success_blocks > 0 {
            self.min_success_blocks
        } else {
            self.total_blocks
        };
        if needed == 0 {
            return 0.0;
        }
        (self.successful_blocks as f64 / needed as f64).min(1.0)
    }

    /// Blocks that have reached any outcome.
    pub fn settled_blocks(&self) -> u32 {
        self.successful_blocks + self.failed_blocks + self.fatally_failed_blocks
    }
}
