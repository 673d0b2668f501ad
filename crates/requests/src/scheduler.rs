use std::sync::Arc;

use crate::tracker::{BlockCompletionTracker, BlockSender};

/// Queues dispatched blocks and decides when to send them.
///
/// Implementations guarantee that every submitted tracker eventually gets
/// exactly one terminal call, either from the sender's callback or from the
/// tracker's own backstop in [`BlockCompletionTracker::send`].
pub trait Scheduler: Send + Sync {
    fn submit(&self, tracker: Arc<BlockCompletionTracker>);

    /// Strategy used for block network attempts.
    fn sender(&self) -> Arc<dyn BlockSender>;
}
