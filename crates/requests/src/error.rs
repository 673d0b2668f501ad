//! Error types for the request layer.

use freight_protocol::NodeIdentity;
use freight_transfer::{AbortReason, TransferError};
use tracing::error;

use crate::state::StateId;
use crate::tracker::BlockFlavor;

/// Typed failure of a single block fetch, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LowLevelFetchError {
    #[error("data not found")]
    DataNotFound,

    #[error("route not found")]
    RouteNotFound,

    #[error("rejected: overload")]
    RejectedOverload,

    #[error("transfer failed")]
    TransferFailed,

    #[error("recently failed")]
    RecentlyFailed,

    #[error("decode failed")]
    DecodeFailed,

    #[error("verify failed")]
    VerifyFailed,

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl LowLevelFetchError {
    /// Fatal errors are not worth retrying on another route.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DecodeFailed | Self::VerifyFailed | Self::Cancelled | Self::Internal(_)
        )
    }
}

/// Typed failure of a single block insert, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LowLevelInsertError {
    #[error("route not found")]
    RouteNotFound,

    #[error("route really not found")]
    RouteReallyNotFound,

    #[error("rejected: overload")]
    RejectedOverload,

    #[error("collision with different data")]
    Collision,

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl LowLevelInsertError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Collision | Self::Cancelled | Self::Internal(_))
    }
}

/// Error delivered to the owner of an operation through its failure callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("no data bound to request")]
    NoData,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("bucket error: {0}")]
    Bucket(String),

    #[error("binary blob format error: {0}")]
    BinaryBlobFormat(String),

    #[error("unknown peer {0}")]
    PeerUnknown(NodeIdentity),

    #[error("transfer failed: {0}")]
    Transfer(AbortReason),

    #[error("block fetch failed: {0}")]
    Fetch(LowLevelFetchError),

    #[error("block insert failed: {0}")]
    Insert(LowLevelInsertError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OperationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<AbortReason> for OperationError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Cancelled => Self::Cancelled,
            other => Self::Transfer(other),
        }
    }
}

impl From<TransferError> for OperationError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(io) => Self::Bucket(io.to_string()),
            TransferError::InvalidPath(p) => Self::InvalidTarget(p),
            TransferError::Aborted(reason) => reason.into(),
            TransferError::Disconnected => Self::Transfer(AbortReason::ReceiverDied),
            other => Self::Transfer(AbortReason::Protocol(other.to_string())),
        }
    }
}

/// A collaborator broke the calling contract of the request layer.
///
/// These never abort the process: the first valid completion wins and the
/// offending call is dropped after being reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("{0} completed twice")]
    DoubleCompletion(String),

    #[error("stale transition {old} -> {new} (current {current:?})")]
    StaleTransition {
        current: Option<StateId>,
        old: StateId,
        new: StateId,
    },

    #[error("sender returned without a terminal callback on {0}")]
    ForgottenCallback(String),

    #[error("{got:?} completion on a {expected:?} block")]
    WrongFlavor {
        expected: BlockFlavor,
        got: BlockFlavor,
    },

    #[error("generated URI twice: kept {kept}, dropped {dropped}")]
    GeneratedUriTwice { kept: String, dropped: String },

    #[error("peer {0} not found")]
    PeerNotFound(NodeIdentity),
}

impl ContractViolation {
    /// Logs the violation at error level.
    pub fn report(&self) {
        error!(violation = %self, "contract violation");
    }
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no stored object under {0}")]
    Missing(String),

    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
}
