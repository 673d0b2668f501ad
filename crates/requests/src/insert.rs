//! Inputs to the insert encoder.
//!
//! The encoder itself (splitting, compression, key generation) lives behind
//! [`InsertEncoderFactory`]; the lifecycle only builds its sub-state and
//! receives its callbacks.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::lifecycle::RequestLifecycle;
use crate::state::SubState;
use crate::uri::TargetUri;

/// Per-insert options chosen by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InsertOptions {
    /// Publish the data as a one-file manifest under this name.
    pub target_filename: Option<String>,
    /// Compute the final key without sending anything.
    pub get_chk_only: bool,
    /// The data is itself metadata.
    pub is_metadata: bool,
    /// The data is a pre-encoded binary blob of blocks.
    pub binary_blob: bool,
    /// MIME type recorded in the metadata.
    pub mime_type: Option<String>,
}

/// What to insert and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBlock {
    /// File holding the data.
    pub data: PathBuf,
    /// Size of the data in bytes.
    pub size: u64,
    pub mime_type: Option<String>,
    pub target: TargetUri,
}

/// Builds the sub-state that encodes and inserts one file.
///
/// The built state reports back through `owner`: blocks via
/// [`RequestLifecycle::submit_block`], the final URI via
/// [`RequestLifecycle::on_encode`], and its terminal outcome via
/// [`RequestLifecycle::on_success`] / [`RequestLifecycle::on_failure`].
pub trait InsertEncoderFactory: Send + Sync {
    fn single_file(
        &self,
        owner: Arc<RequestLifecycle>,
        block: InsertBlock,
        options: &InsertOptions,
        early_encode: bool,
    ) -> Result<Arc<dyn SubState>, OperationError>;

    /// Fails with [`OperationError::BinaryBlobFormat`] if the blob is malformed.
    fn binary_blob(
        &self,
        owner: Arc<RequestLifecycle>,
        block: InsertBlock,
    ) -> Result<Arc<dyn SubState>, OperationError>;
}
