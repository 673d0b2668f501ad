//! Frame-level link to one peer.
//!
//! `PeerLink` is the seam to the packet transport: a bulk transfer only needs
//! to push frames to the other side and pull frames back. [`memory_link`]
//! gives a connected in-process pair, used by tests and loopback transfers.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{Mutex, mpsc};

use crate::TransferError;
use crate::types::{AbortReason, Chunk};

/// A unit exchanged between transmitter and receiver.
#[derive(Debug, Clone)]
pub enum LinkFrame {
    /// Chunk data, transmitter to receiver.
    Block(Chunk),
    /// Chunk confirmed, receiver to transmitter.
    Ack(u32),
    /// Either side gave up.
    Abort(AbortReason),
}

/// Bidirectional frame link to a peer, scoped to one transfer.
pub trait PeerLink: Send + Sync {
    /// Sends a frame to the peer.
    fn send(
        &self,
        frame: LinkFrame,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + '_>>;

    /// Receives the next frame. `None` means the link is closed.
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<LinkFrame>> + Send + '_>>;
}

/// One end of an in-memory link.
pub struct MemoryLink {
    tx: mpsc::Sender<LinkFrame>,
    rx: Mutex<mpsc::Receiver<LinkFrame>>,
}

/// Creates a connected pair of in-memory link ends.
///
/// `capacity` bounds the frames buffered in each direction.
pub fn memory_link(capacity: usize) -> (MemoryLink, MemoryLink) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    (
        MemoryLink {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        },
        MemoryLink {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        },
    )
}

impl PeerLink for MemoryLink {
    fn send(
        &self,
        frame: LinkFrame,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + '_>> {
        Box::pin(async move {
            self.tx
                .send(frame)
                .await
                .map_err(|_| TransferError::Disconnected)
        })
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<LinkFrame>> + Send + '_>> {
        Box::pin(async move { self.rx.lock().await.recv().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_link_is_bidirectional() {
        let (a, b) = memory_link(4);
        a.send(LinkFrame::Ack(7)).await.unwrap();
        assert!(matches!(b.recv().await, Some(LinkFrame::Ack(7))));

        b.send(LinkFrame::Abort(AbortReason::Rejected)).await.unwrap();
        assert!(matches!(
            a.recv().await,
            Some(LinkFrame::Abort(AbortReason::Rejected))
        ));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, b) = memory_link(4);
        drop(b);
        assert!(a.recv().await.is_none());
        assert!(matches!(
            a.send(LinkFrame::Ack(0)).await,
            Err(TransferError::Disconnected)
        ));
    }
}
