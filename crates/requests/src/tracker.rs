//! Exactly-once completion adapter between the scheduler and one block.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use freight_protocol::PriorityClass;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ContractViolation, LowLevelFetchError, LowLevelInsertError};

/// Which kind of network operation a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFlavor {
    Fetch,
    Insert,
}

/// Final result of one dispatched block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    FetchSuccess,
    FetchFailure(LowLevelFetchError),
    InsertSuccess,
    InsertFailure(LowLevelInsertError),
}

impl Outcome {
    pub fn flavor(&self) -> BlockFlavor {
        match self {
            Self::FetchSuccess | Self::FetchFailure(_) => BlockFlavor::Fetch,
            Self::InsertSuccess | Self::InsertFailure(_) => BlockFlavor::Insert,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::FetchSuccess | Self::InsertSuccess)
    }

    /// `Some(fatal)` for failures, `None` for successes.
    pub fn failure_is_fatal(&self) -> Option<bool> {
        match self {
            Self::FetchFailure(e) => Some(e.is_fatal()),
            Self::InsertFailure(e) => Some(e.is_fatal()),
            _ => None,
        }
    }

    fn forgotten(flavor: BlockFlavor) -> Self {
        const MSG: &str = "sender returned without a callback";
        match flavor {
            BlockFlavor::Fetch => Self::FetchFailure(LowLevelFetchError::Internal(MSG.into())),
            BlockFlavor::Insert => Self::InsertFailure(LowLevelInsertError::Internal(MSG.into())),
        }
    }
}

/// A failure reported by the scheduler for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFailure {
    Fetch(LowLevelFetchError),
    Insert(LowLevelInsertError),
}

impl From<BlockFailure> for Outcome {
    fn from(f: BlockFailure) -> Self {
        match f {
            BlockFailure::Fetch(e) => Self::FetchFailure(e),
            BlockFailure::Insert(e) => Self::InsertFailure(e),
        }
    }
}

/// Key material identifying a block without loading its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Routing key bytes.
    pub routing: Vec<u8>,
    /// Client-level key, if the block has one.
    pub client_key: Option<String>,
}

impl BlockKey {
    pub fn new(routing: impl Into<Vec<u8>>) -> Self {
        Self {
            routing: routing.into(),
            client_key: None,
        }
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.routing[..self.routing.len().min(8)];
        for b in shown {
            write!(f, "{b:02x}")?;
        }
        if let Some(k) = &self.client_key {
            write!(f, " ({k})")?;
        }
        Ok(())
    }
}

/// Request flags copied from the parent when a block is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    pub local_only: bool,
    pub cache_local_requests: bool,
    pub ignore_store: bool,
}

/// Strategy that performs the network attempt for one block.
pub trait BlockSender: Send + Sync {
    /// Returns `true` if a request was actually sent.
    fn send(&self, tracker: &BlockCompletionTracker) -> bool;
}

/// What a tracker reports to and delegates to.
pub trait BlockParent: Send + Sync {
    /// Called exactly once per tracker, after its outcome is recorded.
    fn on_block_finished(&self, tracker: &BlockCompletionTracker);
    fn priority(&self) -> PriorityClass;
    fn sender(&self) -> Arc<dyn BlockSender>;
    /// Shared flag the tracker polls without locking the parent.
    fn cancel_flag(&self) -> Arc<AtomicBool>;
    fn block_flags(&self) -> BlockFlags;
}

// ---------------------------------------------------------------------------
// BlockCompletionTracker
// ---------------------------------------------------------------------------

/// Completion state of one dispatched block.
///
/// Exactly one terminal call is accepted; it records the [`Outcome`] and
/// notifies the parent before returning. Later calls are reported as
/// [`ContractViolation`]s and leave the stored outcome untouched.
pub struct BlockCompletionTracker {
    flavor: BlockFlavor,
    key: BlockKey,
    flags: BlockFlags,
    parent: Arc<dyn BlockParent>,
    cancelled: Arc<AtomicBool>,
    outcome: Mutex<Option<Outcome>>,
}

impl BlockCompletionTracker {
    pub fn new(flavor: BlockFlavor, parent: Arc<dyn BlockParent>, key: BlockKey) -> Self {
        Self {
            flavor,
            key,
            flags: parent.block_flags(),
            cancelled: parent.cancel_flag(),
            parent,
            outcome: Mutex::new(None),
        }
    }

    pub fn on_fetch_success(&self) -> Result<(), ContractViolation> {
        self.complete(Outcome::FetchSuccess)
    }

    pub fn on_insert_success(&self) -> Result<(), ContractViolation> {
        self.complete(Outcome::InsertSuccess)
    }

    pub fn on_failure(&self, failure: BlockFailure) -> Result<(), ContractViolation> {
        self.complete(failure.into())
    }

    /// Runs the network attempt through the parent's sender.
    ///
    /// If the sender returns (or unwinds) without a terminal callback having
    /// fired, the tracker finishes itself with an internal failure so the
    /// parent still hears about the block exactly once.
    pub fn send(&self) -> bool {
        let _backstop = Backstop(self);
        let sender = self.parent.sender();
        sender.send(self)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().is_some()
    }

    pub fn flavor(&self) -> BlockFlavor {
        self.flavor
    }

    pub fn key(&self) -> &BlockKey {
        &self.key
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn priority(&self) -> PriorityClass {
        self.parent.priority()
    }

    pub fn sender(&self) -> Arc<dyn BlockSender> {
        self.parent.sender()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn complete(&self, outcome: Outcome) -> Result<(), ContractViolation> {
        if outcome.flavor() != self.flavor {
            let v = ContractViolation::WrongFlavor {
                expected: self.flavor,
                got: outcome.flavor(),
            };
            v.report();
            return Err(v);
        }
        {
            let mut slot = self.lock();
            if slot.is_some() {
                let v = ContractViolation::DoubleCompletion(self.to_string());
                v.report();
                return Err(v);
            }
            debug!(block = %self.key, ?outcome, "block finished");
            *slot = Some(outcome);
        }
        self.parent.on_block_finished(self);
        Ok(())
    }

    fn force_finish(&self) {
        {
            let mut slot = self.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(Outcome::forgotten(self.flavor));
        }
        ContractViolation::ForgottenCallback(self.to_string()).report();
        self.parent.on_block_finished(self);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Outcome>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for BlockCompletionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} block {}", self.flavor, self.key)
    }
}

struct Backstop<'a>(&'a BlockCompletionTracker);

impl Drop for Backstop<'_> {
    fn drop(&mut self) {
        self.0.force_finish();
    }
}
