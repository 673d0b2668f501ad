//! Windowed transmitter and receiver for one bulk file.
//!
//! Frame protocol over a [`PeerLink`]:
//!
//! 1. The transmitter sends `Block` frames, keeping at most `window`
//!    unacknowledged chunks in flight.
//! 2. The receiver verifies and writes each chunk, then answers `Ack(index)`.
//!    Duplicate chunks are re-acknowledged without being counted twice.
//! 3. Either side may send `Abort(reason)` and stop. A closed link counts as
//!    the other side dying.
//!
//! Each side reports `on_block_finished` once per newly confirmed chunk and
//! then exactly one of `on_success` / `on_failure`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bulk::PartialBulk;
use crate::chunked::{ChunkReader, ChunkWriter};
use crate::link::{LinkFrame, PeerLink};
use crate::types::AbortReason;
use crate::{DEFAULT_WINDOW, TransferError};

/// Completion interface of a bulk transfer.
pub trait TransmitCallback: Send + Sync {
    /// Every chunk has been confirmed.
    fn on_success(&self);
    /// The transfer stopped before completing.
    fn on_failure(&self, reason: AbortReason);
    /// Chunk `index` was confirmed for the first time.
    fn on_block_finished(&self, index: u32);
}

/// Abort handle for a running transfer.
///
/// Cloning shares the same underlying state; the first reason given to
/// [`cancel`](Self::cancel) is the one reported.
#[derive(Clone, Default)]
pub struct TransferControl {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the transfer. Returns `false` if it was already aborted.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn cancelled(&self) -> AbortReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(AbortReason::Cancelled)
    }
}

/// Why a run loop stopped, and whether the peer still needs to be told.
struct Stop {
    reason: AbortReason,
    notify_peer: bool,
}

impl Stop {
    fn local(reason: AbortReason) -> Self {
        Self {
            reason,
            notify_peer: true,
        }
    }

    fn remote(reason: AbortReason) -> Self {
        Self {
            reason,
            notify_peer: false,
        }
    }
}

async fn finish(
    result: Result<(), Stop>,
    link: &dyn PeerLink,
    callback: &dyn TransmitCallback,
    uid: u64,
) {
    match result {
        Ok(()) => callback.on_success(),
        Err(stop) => {
            if stop.notify_peer
                && let Err(e) = link.send(LinkFrame::Abort(stop.reason.clone())).await
            {
                debug!(uid, error = %e, "could not deliver abort to peer");
            }
            callback.on_failure(stop.reason);
        }
    }
}

// ---------------------------------------------------------------------------
// BulkTransmitter
// ---------------------------------------------------------------------------

/// Sending side of a bulk transfer.
pub struct BulkTransmitter {
    uid: u64,
    reader: ChunkReader,
    acked: PartialBulk,
    link: Arc<dyn PeerLink>,
    window: usize,
    control: TransferControl,
    callback: Arc<dyn TransmitCallback>,
}

impl BulkTransmitter {
    /// Prepares to send `path`, starting at chunk `resume_from`.
    pub fn new(
        uid: u64,
        path: &Path,
        chunk_size: usize,
        resume_from: u32,
        link: Arc<dyn PeerLink>,
        callback: Arc<dyn TransmitCallback>,
    ) -> Result<Self, TransferError> {
        let mut reader = ChunkReader::new(path, chunk_size)?;
        let resume_from = resume_from.min(reader.block_count());
        reader.seek_to_block(resume_from)?;
        let acked = PartialBulk::new(reader.file_size(), chunk_size, resume_from);
        Ok(Self {
            uid,
            reader,
            acked,
            link,
            window: DEFAULT_WINDOW,
            control: TransferControl::new(),
            callback,
        })
    }

    /// Sets the number of unacknowledged chunks kept in flight (at least 1).
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Returns the abort handle for this transfer.
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// Runs the transfer to completion, reporting through the callback.
    pub async fn send(mut self) {
        debug!(
            uid = self.uid,
            from = self.reader.next_index(),
            total = self.reader.block_count(),
            "bulk transmit starting"
        );
        let result = self.run().await;
        finish(result, self.link.as_ref(), self.callback.as_ref(), self.uid).await;
    }

    async fn run(&mut self) -> Result<(), Stop> {
        let total = self.acked.total_blocks();
        let mut in_flight = 0usize;

        loop {
            if self.acked.is_complete() {
                debug!(uid = self.uid, total, "bulk transmit complete");
                return Ok(());
            }

            while in_flight < self.window {
                if let Some(reason) = self.control.reason() {
                    return Err(Stop::local(reason));
                }
                let chunk = match self.reader.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => return Err(Stop::local(AbortReason::Io(e.to_string()))),
                };
                self.link
                    .send(LinkFrame::Block(chunk))
                    .await
                    .map_err(|_| Stop::remote(AbortReason::ReceiverDied))?;
                in_flight += 1;
            }

            let frame = tokio::select! {
                biased;
                reason = self.control.cancelled() => return Err(Stop::local(reason)),
                frame = self.link.recv() => frame,
            };

            match frame {
                None => return Err(Stop::remote(AbortReason::ReceiverDied)),
                Some(LinkFrame::Ack(index)) if index >= total => {
                    return Err(Stop::local(AbortReason::Protocol(format!(
                        "ack for block {index} of {total}"
                    ))));
                }
                Some(LinkFrame::Ack(index)) => {
                    if self.acked.mark_received(index) {
                        in_flight = in_flight.saturating_sub(1);
                        self.callback.on_block_finished(index);
                    } else {
                        debug!(uid = self.uid, block = index, "duplicate ack ignored");
                    }
                }
                Some(LinkFrame::Abort(reason)) => {
                    warn!(uid = self.uid, %reason, "receiver aborted transfer");
                    return Err(Stop::remote(reason));
                }
                Some(LinkFrame::Block(_)) => {
                    return Err(Stop::local(AbortReason::Protocol(
                        "unexpected block frame at transmitter".into(),
                    )));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BulkReceiver
// ---------------------------------------------------------------------------

/// Receiving side of a bulk transfer.
pub struct BulkReceiver {
    uid: u64,
    writer: ChunkWriter,
    bulk: Arc<PartialBulk>,
    link: Arc<dyn PeerLink>,
    control: TransferControl,
    callback: Arc<dyn TransmitCallback>,
}

impl BulkReceiver {
    /// Prepares to receive `size` bytes into `path`, with the first
    /// `resume_from` chunks already on disk.
    pub fn new(
        uid: u64,
        path: &Path,
        size: u64,
        chunk_size: usize,
        resume_from: u32,
        link: Arc<dyn PeerLink>,
        callback: Arc<dyn TransmitCallback>,
    ) -> Result<Self, TransferError> {
        let writer = ChunkWriter::open(path, size, chunk_size)?;
        Ok(Self {
            uid,
            writer,
            bulk: Arc::new(PartialBulk::new(size, chunk_size, resume_from)),
            link,
            control: TransferControl::new(),
            callback,
        })
    }

    /// Returns the abort handle for this transfer.
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// Returns the shared received-chunk state.
    pub fn bulk(&self) -> Arc<PartialBulk> {
        Arc::clone(&self.bulk)
    }

    /// Runs the transfer to completion, reporting through the callback.
    pub async fn receive(mut self) {
        debug!(
            uid = self.uid,
            have = self.bulk.blocks_received(),
            total = self.bulk.total_blocks(),
            "bulk receive starting"
        );
        let result = self.run().await;
        if let Err(stop) = &result {
            self.bulk.abort(stop.reason.clone());
        }
        finish(result, self.link.as_ref(), self.callback.as_ref(), self.uid).await;
    }

    async fn run(&mut self) -> Result<(), Stop> {
        let total = self.bulk.total_blocks();

        loop {
            if self.bulk.is_complete() {
                self.writer
                    .sync()
                    .map_err(|e| Stop::local(AbortReason::Io(e.to_string())))?;
                debug!(uid = self.uid, total, "bulk receive complete");
                return Ok(());
            }

            let frame = tokio::select! {
                biased;
                reason = self.control.cancelled() => return Err(Stop::local(reason)),
                frame = self.link.recv() => frame,
            };

            match frame {
                None => return Err(Stop::remote(AbortReason::SenderDied)),
                Some(LinkFrame::Block(chunk)) => {
                    let index = chunk.index;
                    if index >= total {
                        return Err(Stop::local(AbortReason::Protocol(format!(
                            "block {index} of {total}"
                        ))));
                    }
                    if !self.bulk.is_received(index) {
                        self.writer.write_chunk(&chunk).map_err(|e| match e {
                            TransferError::Io(io) => Stop::local(AbortReason::Io(io.to_string())),
                            other => Stop::local(AbortReason::Protocol(other.to_string())),
                        })?;
                    }
                    let fresh = self.bulk.mark_received(index);
                    self.link
                        .send(LinkFrame::Ack(index))
                        .await
                        .map_err(|_| Stop::remote(AbortReason::SenderDied))?;
                    if fresh {
                        self.callback.on_block_finished(index);
                    }
                }
                Some(LinkFrame::Abort(reason)) => {
                    warn!(uid = self.uid, %reason, "sender aborted transfer");
                    return Err(Stop::remote(reason));
                }
                Some(LinkFrame::Ack(_)) => {
                    return Err(Stop::local(AbortReason::Protocol(
                        "unexpected ack frame at receiver".into(),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::checksum_bytes;
    use crate::link::memory_link;
    use crate::types::Chunk;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<u32>>,
        successes: AtomicU32,
        failures: Mutex<Vec<AbortReason>>,
    }

    impl TransmitCallback for Recorder {
        fn on_success(&self) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failure(&self, reason: AbortReason) {
            self.failures.lock().unwrap().push(reason);
        }
        fn on_block_finished(&self, index: u32) {
            self.blocks.lock().unwrap().push(index);
        }
    }

    fn write_file(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn transfers_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "src.bin", 10_000);
        let dst = dir.path().join("dst.bin");
        let (a, b) = memory_link(8);

        let tx_cb = Arc::new(Recorder::default());
        let rx_cb = Arc::new(Recorder::default());
        let tx = BulkTransmitter::new(1, &src, 1024, 0, Arc::new(a), tx_cb.clone())
            .unwrap()
            .with_window(3);
        let rx = BulkReceiver::new(1, &dst, 10_000, 1024, 0, Arc::new(b), rx_cb.clone()).unwrap();

        tokio::join!(tx.send(), rx.receive());

        assert_eq!(tx_cb.successes.load(Ordering::SeqCst), 1);
        assert_eq!(rx_cb.successes.load(Ordering::SeqCst), 1);
        assert_eq!(tx_cb.blocks.lock().unwrap().len(), 10);
        assert_eq!(rx_cb.blocks.lock().unwrap().len(), 10);
        assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
    }

    #[tokio::test]
    async fn resumes_from_block() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "src.bin", 4096);
        let dst = dir.path().join("dst.bin");
        // Pretend the first two chunks already arrived in an earlier run.
        std::fs::write(&dst, &std::fs::read(&src).unwrap()[..2048]).unwrap();

        let (a, b) = memory_link(8);
        let tx_cb = Arc::new(Recorder::default());
        let rx_cb = Arc::new(Recorder::default());
        let tx = BulkTransmitter::new(2, &src, 1024, 2, Arc::new(a), tx_cb.clone()).unwrap();
        let rx = BulkReceiver::new(2, &dst, 4096, 1024, 2, Arc::new(b), rx_cb.clone()).unwrap();

        tokio::join!(tx.send(), rx.receive());

        assert_eq!(*rx_cb.blocks.lock().unwrap(), vec![2, 3]);
        assert_eq!(*tx_cb.blocks.lock().unwrap(), vec![2, 3]);
        assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
    }

    #[tokio::test]
    async fn empty_file_succeeds_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "empty.bin", 0);
        let dst = dir.path().join("out.bin");
        let (a, b) = memory_link(1);

        let tx_cb = Arc::new(Recorder::default());
        let rx_cb = Arc::new(Recorder::default());
        let tx = BulkTransmitter::new(3, &src, 1024, 0, Arc::new(a), tx_cb.clone()).unwrap();
        let rx = BulkReceiver::new(3, &dst, 0, 1024, 0, Arc::new(b), rx_cb.clone()).unwrap();

        tokio::join!(tx.send(), rx.receive());
        assert_eq!(tx_cb.successes.load(Ordering::SeqCst), 1);
        assert_eq!(rx_cb.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_reports_reason_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "src.bin", 8192);
        let dst = dir.path().join("dst.bin");
        let (a, b) = memory_link(8);

        let tx_cb = Arc::new(Recorder::default());
        let rx_cb = Arc::new(Recorder::default());
        let tx = BulkTransmitter::new(4, &src, 1024, 0, Arc::new(a), tx_cb.clone()).unwrap();
        let rx = BulkReceiver::new(4, &dst, 8192, 1024, 0, Arc::new(b), rx_cb.clone()).unwrap();

        let control = tx.control();
        assert!(control.cancel(AbortReason::Cancelled));
        assert!(!control.cancel(AbortReason::Restart));

        tokio::join!(tx.send(), rx.receive());

        assert_eq!(*tx_cb.failures.lock().unwrap(), vec![AbortReason::Cancelled]);
        assert_eq!(*rx_cb.failures.lock().unwrap(), vec![AbortReason::Cancelled]);
        assert_eq!(tx_cb.successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn receiver_reports_sender_died_when_link_drops() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");
        let (a, b) = memory_link(8);
        let rx_cb = Arc::new(Recorder::default());
        let rx = BulkReceiver::new(5, &dst, 4096, 1024, 0, Arc::new(b), rx_cb.clone()).unwrap();
        let bulk = rx.bulk();
        drop(a);

        rx.receive().await;
        assert_eq!(*rx_cb.failures.lock().unwrap(), vec![AbortReason::SenderDied]);
        assert_eq!(bulk.abort_reason(), Some(AbortReason::SenderDied));
    }

    #[tokio::test]
    async fn receiver_aborts_on_bad_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");
        let (a, b) = memory_link(8);
        let rx_cb = Arc::new(Recorder::default());
        let rx = BulkReceiver::new(6, &dst, 4, 4, 0, Arc::new(b), rx_cb.clone()).unwrap();

        a.send(LinkFrame::Block(Chunk {
            index: 0,
            offset: 0,
            data: b"abcd".to_vec(),
            checksum: checksum_bytes(b"wxyz"),
        }))
        .await
        .unwrap();

        rx.receive().await;
        let failures = rx_cb.failures.lock().unwrap();
        assert!(matches!(failures.as_slice(), [AbortReason::Protocol(_)]));
        // The transmitter end is told why.
        assert!(matches!(
            a.recv().await,
            Some(LinkFrame::Abort(AbortReason::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn duplicate_block_is_reacked_once_counted() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");
        let (a, b) = memory_link(8);
        let rx_cb = Arc::new(Recorder::default());
        let rx = BulkReceiver::new(7, &dst, 8, 4, 0, Arc::new(b), rx_cb.clone()).unwrap();

        let block = |index: u32, data: &[u8]| {
            LinkFrame::Block(Chunk {
                index,
                offset: index as u64 * 4,
                data: data.to_vec(),
                checksum: checksum_bytes(data),
            })
        };
        a.send(block(0, b"abcd")).await.unwrap();
        a.send(block(0, b"abcd")).await.unwrap();
        a.send(block(1, b"efgh")).await.unwrap();

        rx.receive().await;
        assert_eq!(*rx_cb.blocks.lock().unwrap(), vec![0, 1]);
        assert_eq!(rx_cb.successes.load(Ordering::SeqCst), 1);
        let mut acks = Vec::new();
        while let Some(LinkFrame::Ack(i)) = a.recv().await {
            acks.push(i);
        }
        assert_eq!(acks, vec![0, 0, 1]);
    }
}
