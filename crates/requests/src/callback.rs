use freight_protocol::RequestId;

use crate::error::OperationError;
use crate::uri::TargetUri;

/// The owner of an operation.
///
/// Exactly one of `on_success` / `on_failure` is called per run of the
/// operation. Cancellation arrives as `on_failure` with
/// [`OperationError::Cancelled`].
pub trait RequestCallback: Send + Sync {
    fn on_success(&self, request: &RequestId);

    fn on_failure(&self, request: &RequestId, error: &OperationError);

    /// An insert knows its final URI. Called at most once.
    fn on_generated_uri(&self, request: &RequestId, uri: &TargetUri) {
        let _ = (request, uri);
    }

    fn on_major_progress(&self, request: &RequestId) {
        let _ = request;
    }

    /// Enough of an early-encoded insert is on the network to fetch it.
    fn on_fetchable(&self, request: &RequestId) {
        let _ = request;
    }
}
