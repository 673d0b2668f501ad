//! Direct file transfer to or from one peer.
//!
//! A [`BulkTransferCoordinator`] is the sub-state of a send or receive
//! operation. It resolves the peer lazily by identity, runs one windowed
//! transfer at a time on the node's executor, and forwards per-chunk and
//! final completion to its [`TransferOwner`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use freight_protocol::NodeIdentity;
use freight_transfer::{
    AbortReason, BulkReceiver, BulkTransmitter, DEFAULT_CHUNK_SIZE, SpeedCalculator,
    TransferControl, TransmitCallback, block_count,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::directory::{PeerDirectory, PeerHandle};
use crate::error::{ContractViolation, OperationError};
use crate::state::{StateId, SubState};

/// Receives the progress and outcome of a transfer.
pub trait TransferOwner: Send + Sync {
    /// One more chunk confirmed.
    fn completed_block(&self);
    fn on_transfer_success(&self, state: &dyn SubState);
    fn on_transfer_failure(&self, error: OperationError, state: &dyn SubState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Send,
    Receive,
}

/// What to transfer and with whom.
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub peer: NodeIdentity,
    pub file: PathBuf,
    pub uid: u64,
    pub chunk_size: usize,
    pub window: usize,
    /// Chunks already transferred by an earlier run.
    pub resume_from: u32,
}

struct CoordInner {
    peer: Option<Arc<dyn PeerHandle>>,
    control: Option<TransferControl>,
    generation: u64,
    running: bool,
    finished: bool,
    cancelled: bool,
}

/// Windowed chunked transfer of one file, reporting to its owner.
pub struct BulkTransferCoordinator {
    id: StateId,
    direction: Direction,
    params: TransferParams,
    size: u64,
    total_blocks: u32,
    owner: Weak<dyn TransferOwner>,
    peers: Arc<dyn PeerDirectory>,
    executor: Handle,
    blocks_received: AtomicU32,
    speed: SpeedCalculator,
    inner: Mutex<CoordInner>,
    me: Weak<Self>,
}

impl BulkTransferCoordinator {
    /// Coordinator sending `params.file`. Fails if the file cannot be read.
    pub fn sender(
        owner: Weak<dyn TransferOwner>,
        peers: Arc<dyn PeerDirectory>,
        executor: Handle,
        params: TransferParams,
    ) -> Result<Arc<Self>, OperationError> {
        let size = std::fs::metadata(&params.file)
            .map_err(|e| OperationError::Bucket(format!("{}: {e}", params.file.display())))?
            .len();
        Ok(Self::build(
            Direction::Send,
            size,
            owner,
            peers,
            executor,
            params,
        ))
    }

    /// Coordinator receiving `size` bytes into `params.file`.
    pub fn receiver(
        owner: Weak<dyn TransferOwner>,
        peers: Arc<dyn PeerDirectory>,
        executor: Handle,
        params: TransferParams,
        size: u64,
    ) -> Arc<Self> {
        Self::build(Direction::Receive, size, owner, peers, executor, params)
    }

    fn build(
        direction: Direction,
        size: u64,
        owner: Weak<dyn TransferOwner>,
        peers: Arc<dyn PeerDirectory>,
        executor: Handle,
        mut params: TransferParams,
    ) -> Arc<Self> {
        if params.chunk_size == 0 {
            params.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        let total_blocks = block_count(size, params.chunk_size);
        params.resume_from = params.resume_from.min(total_blocks);
        Arc::new_cyclic(|me| Self {
            id: StateId::next(),
            direction,
            blocks_received: AtomicU32::new(params.resume_from),
            params,
            size,
            total_blocks,
            owner,
            peers,
            executor,
            speed: SpeedCalculator::default(),
            inner: Mutex::new(CoordInner {
                peer: None,
                control: None,
                generation: 0,
                running: false,
                finished: false,
                cancelled: false,
            }),
            me: me.clone(),
        })
    }

    /// Launches the transfer from the current resume block.
    ///
    /// With `restart`, an in-flight transfer is aborted first and its late
    /// callbacks are ignored.
    pub fn start(&self, restart: bool) -> Result<(), OperationError> {
        {
            let inner = self.lock();
            if inner.cancelled {
                return Err(OperationError::Cancelled);
            }
            if inner.finished || (inner.running && !restart) {
                debug!(uid = self.params.uid, "transfer already started");
                return Ok(());
            }
        }
        debug!(
            uid = self.params.uid,
            peer = %self.params.peer,
            direction = ?self.direction,
            from = self.blocks_received(),
            total = self.total_blocks,
            restart,
            "starting bulk transfer"
        );

        let peer = self.resolve_peer()?;
        let link = peer.open_link(self.params.uid)?;

        let (generation, superseded) = {
            let mut inner = self.lock();
            if inner.cancelled {
                return Err(OperationError::Cancelled);
            }
            inner.generation += 1;
            inner.running = false;
            (inner.generation, inner.control.take())
        };
        if let Some(old) = superseded {
            old.cancel(AbortReason::Restart);
        }

        let callback = Arc::new(GenerationCallback {
            coordinator: self.me.clone(),
            generation,
        });
        let resume = self.blocks_received();
        let p = &self.params;
        match self.direction {
            Direction::Send => {
                let tx =
                    BulkTransmitter::new(p.uid, &p.file, p.chunk_size, resume, link, callback)?
                        .with_window(p.window);
                self.install(tx.control())?;
                self.executor.spawn(tx.send());
            }
            Direction::Receive => {
                let rx = BulkReceiver::new(
                    p.uid,
                    &p.file,
                    self.size,
                    p.chunk_size,
                    resume,
                    link,
                    callback,
                )?;
                self.install(rx.control())?;
                self.executor.spawn(rx.receive());
            }
        }
        Ok(())
    }

    /// Aborts and relaunches the transfer.
    pub fn restart(&self) -> Result<(), OperationError> {
        self.start(true)
    }

    /// Declines a file offer; the transfer fails with [`AbortReason::Rejected`].
    pub fn reject(&self) {
        let control = {
            let inner = self.lock();
            if inner.finished {
                return;
            }
            inner.control.clone().filter(|_| inner.running)
        };
        match control {
            Some(c) => {
                c.cancel(AbortReason::Rejected);
            }
            None => self.on_failure(AbortReason::Rejected),
        }
    }

    pub fn on_block_finished(&self, index: u32) {
        self.blocks_received.fetch_add(1, Ordering::AcqRel);
        self.speed.add_sample(self.chunk_len(index));
        let remaining = (self.total_blocks.saturating_sub(self.blocks_received()) as u64)
            .saturating_mul(self.params.chunk_size as u64)
            .min(self.size);
        trace!(
            uid = self.params.uid,
            block = index,
            eta_ms = self.speed.eta(remaining).map(|d| d.as_millis() as u64),
            "block finished"
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.completed_block();
        }
    }

    pub fn on_success(&self) {
        if !self.finish() {
            debug!(uid = self.params.uid, "duplicate transfer success ignored");
            return;
        }
        info!(
            uid = self.params.uid,
            peer = %self.params.peer,
            blocks = self.blocks_received(),
            bytes = self.speed.total_bytes(),
            rate = self.speed.bytes_per_second() as u64,
            "bulk transfer succeeded"
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.on_transfer_success(self);
        }
    }

    pub fn on_failure(&self, reason: AbortReason) {
        if !self.finish() {
            debug!(uid = self.params.uid, %reason, "duplicate transfer failure ignored");
            return;
        }
        warn!(
            uid = self.params.uid,
            peer = %self.params.peer,
            blocks = self.blocks_received(),
            total = self.total_blocks,
            %reason,
            "bulk transfer failed"
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.on_transfer_failure(reason.into(), self);
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn uid(&self) -> u64 {
        self.params.uid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// `ceil(size / chunk_size)`.
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Every chunk must arrive.
    pub fn min_success_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn blocks_received(&self) -> u32 {
        self.blocks_received.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn resolve_peer(&self) -> Result<Arc<dyn PeerHandle>, OperationError> {
        if let Some(peer) = self.lock().peer.clone() {
            return Ok(peer);
        }
        match self.peers.lookup(&self.params.peer) {
            Some(peer) => {
                self.lock().peer = Some(Arc::clone(&peer));
                Ok(peer)
            }
            None => {
                ContractViolation::PeerNotFound(self.params.peer.clone()).report();
                Err(OperationError::PeerUnknown(self.params.peer.clone()))
            }
        }
    }

    fn install(&self, control: TransferControl) -> Result<(), OperationError> {
        let mut inner = self.lock();
        if inner.cancelled {
            return Err(OperationError::Cancelled);
        }
        inner.control = Some(control);
        inner.running = true;
        Ok(())
    }

    /// Marks the coordinator finished. Returns `false` if it already was.
    fn finish(&self) -> bool {
        let mut inner = self.lock();
        if inner.finished {
            return false;
        }
        inner.finished = true;
        inner.running = false;
        inner.control = None;
        true
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn chunk_len(&self, index: u32) -> u64 {
        let chunk = self.params.chunk_size as u64;
        self.size.saturating_sub(index as u64 * chunk).min(chunk)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SubState for BulkTransferCoordinator {
    fn id(&self) -> StateId {
        self.id
    }

    fn schedule(&self) -> Result<(), OperationError> {
        self.start(false)
    }

    /// Monotonic. A running transfer is aborted and reports its failure
    /// later; otherwise the failure is reported now.
    fn cancel(&self) {
        let control = {
            let mut inner = self.lock();
            if inner.cancelled || inner.finished {
                return;
            }
            inner.cancelled = true;
            inner.control.clone().filter(|_| inner.running)
        };
        debug!(uid = self.params.uid, running = control.is_some(), "cancelling transfer");
        match control {
            Some(c) => {
                c.cancel(AbortReason::Cancelled);
            }
            None => self.on_failure(AbortReason::Cancelled),
        }
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.peer = None;
        inner.control = None;
    }
}

/// Forwards transfer callbacks only while their transfer is the current one.
struct GenerationCallback {
    coordinator: Weak<BulkTransferCoordinator>,
    generation: u64,
}

impl GenerationCallback {
    fn current(&self) -> Option<Arc<BulkTransferCoordinator>> {
        let c = self.coordinator.upgrade()?;
        if c.generation() != self.generation {
            debug!(
                uid = c.params.uid,
                generation = self.generation,
                "callback from superseded transfer ignored"
            );
            return None;
        }
        Some(c)
    }
}

impl TransmitCallback for GenerationCallback {
    fn on_success(&self) {
        if let Some(c) = self.current() {
            c.on_success();
        }
    }

    fn on_failure(&self, reason: AbortReason) {
        if let Some(c) = self.current() {
            c.on_failure(reason);
        }
    }

    fn on_block_finished(&self, index: u32) {
        if let Some(c) = self.current() {
            c.on_block_finished(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryPeer, StaticPeerDirectory};
    use freight_transfer::memory_link;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeOwner {
        completed: AtomicU32,
        successes: AtomicU32,
        failures: Mutex<Vec<OperationError>>,
        done: tokio::sync::Notify,
    }

    impl FakeOwner {
        fn terminal_count(&self) -> usize {
            self.successes.load(Ordering::SeqCst) as usize + self.failures.lock().unwrap().len()
        }

        async fn wait(&self) {
            while self.terminal_count() == 0 {
                self.done.notified().await;
            }
        }
    }

    impl TransferOwner for FakeOwner {
        fn completed_block(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_transfer_success(&self, _state: &dyn SubState) {
            self.successes.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
        }
        fn on_transfer_failure(&self, error: OperationError, _state: &dyn SubState) {
            self.failures.lock().unwrap().push(error);
            self.done.notify_one();
        }
    }

    fn params(peer: &NodeIdentity, file: PathBuf, chunk_size: usize, resume_from: u32) -> TransferParams {
        TransferParams {
            peer: peer.clone(),
            file,
            uid: 77,
            chunk_size,
            window: 4,
            resume_from,
        }
    }

    fn owner_ref(owner: &Arc<FakeOwner>) -> Weak<dyn TransferOwner> {
        let owner: Arc<dyn TransferOwner> = owner.clone();
        Arc::downgrade(&owner)
    }

    fn receiver(owner: &Arc<FakeOwner>, size: u64, chunk: usize) -> Arc<BulkTransferCoordinator> {
        let peer = NodeIdentity::new(vec![1]);
        BulkTransferCoordinator::receiver(
            owner_ref(owner),
            Arc::new(StaticPeerDirectory::new()),
            Handle::current(),
            params(&peer, PathBuf::from("/nonexistent/unused.bin"), chunk, 0),
            size,
        )
    }

    #[tokio::test]
    async fn block_totals_round_up() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 100_000, 32768);
        assert_eq!(c.total_blocks(), 4);
        assert_eq!(c.min_success_blocks(), 4);
        assert_eq!(receiver(&owner, 0, 32768).total_blocks(), 0);
        assert_eq!(receiver(&owner, 32769, 32768).total_blocks(), 2);
    }

    #[tokio::test]
    async fn failure_after_partial_progress_is_failure() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 100_000, 32768);
        for i in 0..3 {
            c.on_block_finished(i);
        }
        c.on_failure(AbortReason::SenderDied);
        c.on_success();

        assert_eq!(owner.completed.load(Ordering::SeqCst), 3);
        assert_eq!(owner.successes.load(Ordering::SeqCst), 0);
        assert_eq!(
            *owner.failures.lock().unwrap(),
            vec![OperationError::Transfer(AbortReason::SenderDied)]
        );
        assert_eq!(c.blocks_received(), 3);
    }

    #[tokio::test]
    async fn unknown_peer_fails_start() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 10, 4);
        assert!(matches!(c.start(false), Err(OperationError::PeerUnknown(_))));
        assert_eq!(owner.terminal_count(), 0);
    }

    #[tokio::test]
    async fn cancel_when_idle_fails_immediately_once() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 10, 4);
        c.cancel();
        c.cancel();
        assert_eq!(*owner.failures.lock().unwrap(), vec![OperationError::Cancelled]);
        assert!(matches!(c.start(false), Err(OperationError::Cancelled)));
    }

    #[tokio::test]
    async fn reject_when_idle_reports_rejected() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 10, 4);
        c.reject();
        assert_eq!(
            *owner.failures.lock().unwrap(),
            vec![OperationError::Transfer(AbortReason::Rejected)]
        );
    }

    #[tokio::test]
    async fn superseded_generation_is_ignored() {
        let owner = Arc::new(FakeOwner::default());
        let c = receiver(&owner, 10, 4);
        c.lock().generation = 2;
        let stale = GenerationCallback {
            coordinator: Arc::downgrade(&c),
            generation: 1,
        };
        stale.on_block_finished(0);
        stale.on_failure(AbortReason::Restart);
        assert_eq!(owner.completed.load(Ordering::SeqCst), 0);
        assert_eq!(owner.terminal_count(), 0);

        let live = GenerationCallback {
            coordinator: Arc::downgrade(&c),
            generation: 2,
        };
        live.on_success();
        assert_eq!(owner.successes.load(Ordering::SeqCst), 1);
    }

    async fn run_pair(size: usize, chunk: usize, resume_from: u32) -> (Arc<FakeOwner>, Arc<FakeOwner>, Vec<u8>, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let data: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let prefix = (resume_from as usize * chunk).min(size);
        std::fs::write(&dst, &data[..prefix]).unwrap();

        let alice = NodeIdentity::new(vec![0xa1]);
        let bob = NodeIdentity::new(vec![0xb0]);
        let (a_end, b_end) = memory_link(8);

        // Alice sees Bob and vice versa.
        let alice_dir = Arc::new(StaticPeerDirectory::new());
        let bob_peer = Arc::new(MemoryPeer::new(bob.clone()));
        bob_peer.offer(77, a_end);
        alice_dir.insert(bob_peer);
        let bob_dir = Arc::new(StaticPeerDirectory::new());
        let alice_peer = Arc::new(MemoryPeer::new(alice.clone()));
        alice_peer.offer(77, b_end);
        bob_dir.insert(alice_peer);

        let send_owner = Arc::new(FakeOwner::default());
        let recv_owner = Arc::new(FakeOwner::default());
        let sender = BulkTransferCoordinator::sender(
            owner_ref(&send_owner),
            alice_dir,
            Handle::current(),
            params(&bob, src, chunk, resume_from),
        )
        .unwrap();
        let receiver = BulkTransferCoordinator::receiver(
            owner_ref(&recv_owner),
            bob_dir,
            Handle::current(),
            params(&alice, dst.clone(), chunk, resume_from),
            size as u64,
        );

        receiver.schedule().unwrap();
        sender.schedule().unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            send_owner.wait().await;
            recv_owner.wait().await;
        })
        .await
        .unwrap();

        let received = std::fs::read(&dst).unwrap();
        (send_owner, recv_owner, data, received)
    }

    #[tokio::test]
    async fn send_and_receive_over_memory_link() {
        let (send_owner, recv_owner, data, received) = run_pair(10_000, 1024, 0).await;
        assert_eq!(send_owner.successes.load(Ordering::SeqCst), 1);
        assert_eq!(recv_owner.successes.load(Ordering::SeqCst), 1);
        assert_eq!(recv_owner.completed.load(Ordering::SeqCst), 10);
        assert_eq!(send_owner.completed.load(Ordering::SeqCst), 10);
        assert_eq!(data, received);
    }

    #[tokio::test]
    async fn resumed_transfer_moves_only_missing_chunks() {
        let (send_owner, recv_owner, data, received) = run_pair(5000, 1000, 3).await;
        assert_eq!(recv_owner.successes.load(Ordering::SeqCst), 1);
        assert_eq!(recv_owner.completed.load(Ordering::SeqCst), 2);
        assert_eq!(send_owner.completed.load(Ordering::SeqCst), 2);
        assert_eq!(data, received);
    }

    #[tokio::test]
    async fn sender_of_missing_file_is_bucket_error() {
        let owner = Arc::new(FakeOwner::default());
        let result = BulkTransferCoordinator::sender(
            owner_ref(&owner),
            Arc::new(StaticPeerDirectory::new()),
            Handle::current(),
            params(&NodeIdentity::new(vec![1]), PathBuf::from("/nonexistent/file"), 4, 0),
        );
        assert!(matches!(result, Err(OperationError::Bucket(_))));
    }
}
