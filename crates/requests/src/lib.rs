//! Request and insert lifecycle engine for freight nodes.
//!
//! A [`RequestLifecycle`] drives one client-visible operation (an insert, a
//! direct file send, or a direct file receive) through its sub-states and
//! guarantees the client sees exactly one terminal callback. Blocks handed
//! to the scheduler are wrapped in a [`BlockCompletionTracker`]; direct
//! transfers run under a [`BulkTransferCoordinator`]. Progress reaches
//! watchers through the [`EventChannel`] of the operation's
//! [`OperationContext`].

pub mod callback;
pub mod context;
pub mod coordinator;
pub mod counters;
pub mod directory;
pub mod env;
pub mod error;
pub mod events;
pub mod insert;
pub mod lifecycle;
pub mod persist;
pub mod scheduler;
pub mod state;
pub mod tracker;
pub mod uri;

pub use callback::RequestCallback;
pub use context::{ContextConfig, OperationContext};
pub use coordinator::{BulkTransferCoordinator, Direction, TransferOwner, TransferParams};
pub use counters::BlockCounters;
pub use directory::{MemoryPeer, PeerDirectory, PeerHandle, StaticPeerDirectory};
pub use env::NodeContext;
pub use error::{
    ContractViolation, LowLevelFetchError, LowLevelInsertError, OperationError, PersistError,
};
pub use events::{ChannelRef, ClientEvent, EventChannel, Listener};
pub use insert::{InsertBlock, InsertEncoderFactory, InsertOptions};
pub use lifecycle::{LifecycleRecord, NewRequest, RequestKind, RequestLifecycle};
pub use persist::{Depth, Handle, JsonDirStore, Loaded, ObjectStore};
pub use scheduler::Scheduler;
pub use state::{ProgressHint, StateId, SubState};
pub use tracker::{
    BlockCompletionTracker, BlockFailure, BlockFlags, BlockFlavor, BlockKey, BlockParent,
    BlockSender, Outcome,
};
pub use uri::{KeyType, TargetUri};
