//! Shared types for freight nodes.
//!
//! Everything here is plain data: identifiers for requests and peers,
//! priority classes, request status, and the block-progress snapshot that
//! progress-reporting surfaces consume.

pub mod ids;
pub mod types;

pub use ids::{IdentityError, NodeIdentity, RequestId};
pub use types::{BlockProgress, PriorityClass, RequestStatus};
