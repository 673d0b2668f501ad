use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// Identity of one sub-state instance, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(u64);

impl StateId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Progress saved by an earlier run of an insert, handed back to the encoder
/// on its first start so it can skip work already done.
pub type ProgressHint = BTreeMap<String, String>;

/// The component doing the work for the current phase of an operation.
pub trait SubState: Send + Sync {
    fn id(&self) -> StateId;

    /// Begins work, optionally seeded with progress from an earlier run.
    fn start(&self, progress_hint: Option<ProgressHint>) -> Result<(), OperationError> {
        let _ = progress_hint;
        self.schedule()
    }

    /// Begins work.
    fn schedule(&self) -> Result<(), OperationError>;

    /// Stops work. The outcome is reported later through the owner.
    fn cancel(&self);

    /// Frees resources once the owner no longer references this state.
    fn release(&self) {}
}
