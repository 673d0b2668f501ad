//! End-to-end direct transfers: two request lifecycles, one sending and one
//! receiving, connected by an in-memory link.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use freight_protocol::{NodeIdentity, RequestId, RequestStatus};
use freight_requests::{
    BlockCompletionTracker, BlockSender, ClientEvent, ContextConfig, InsertBlock,
    InsertEncoderFactory, InsertOptions, MemoryPeer, NewRequest, NodeContext, OperationContext,
    OperationError, RequestCallback, RequestLifecycle, Scheduler, StaticPeerDirectory, SubState,
};
use freight_transfer::memory_link;

struct NoScheduler;

impl BlockSender for NoScheduler {
    fn send(&self, _tracker: &BlockCompletionTracker) -> bool {
        false
    }
}

impl Scheduler for NoScheduler {
    fn submit(&self, _tracker: Arc<BlockCompletionTracker>) {}

    fn sender(&self) -> Arc<dyn BlockSender> {
        Arc::new(NoScheduler)
    }
}

struct NoEncoder;

impl InsertEncoderFactory for NoEncoder {
    fn single_file(
        &self,
        _owner: Arc<RequestLifecycle>,
        _block: InsertBlock,
        _options: &InsertOptions,
        _early_encode: bool,
    ) -> Result<Arc<dyn SubState>, OperationError> {
        Err(OperationError::Internal("no encoder".into()))
    }

    fn binary_blob(
        &self,
        _owner: Arc<RequestLifecycle>,
        _block: InsertBlock,
    ) -> Result<Arc<dyn SubState>, OperationError> {
        Err(OperationError::Internal("no encoder".into()))
    }
}

#[derive(Default)]
struct Outcome {
    successes: AtomicU32,
    failures: Mutex<Vec<OperationError>>,
    done: tokio::sync::Notify,
}

impl Outcome {
    fn terminal(&self) -> usize {
        self.successes.load(Ordering::SeqCst) as usize + self.failures.lock().unwrap().len()
    }

    async fn wait(&self) {
        while self.terminal() == 0 {
            self.done.notified().await;
        }
    }
}

impl RequestCallback for Outcome {
    fn on_success(&self, _request: &RequestId) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.done.notify_one();
    }

    fn on_failure(&self, _request: &RequestId, error: &OperationError) {
        self.failures.lock().unwrap().push(error.clone());
        self.done.notify_one();
    }
}

/// One side of the connection: a node that knows the other side as a peer.
fn node(remote: NodeIdentity, uid: u64, link: freight_transfer::MemoryLink) -> Arc<NodeContext> {
    let peers = StaticPeerDirectory::new();
    let peer = MemoryPeer::new(remote);
    peer.offer(uid, link);
    peers.insert(Arc::new(peer));
    Arc::new(NodeContext::new(
        Arc::new(NoScheduler),
        Arc::new(peers),
        Arc::new(NoEncoder),
        tokio::runtime::Handle::current(),
    ))
}

fn context(chunk_size: usize) -> Arc<OperationContext> {
    Arc::new(OperationContext::from_config(ContextConfig {
        chunk_size,
        window: 3,
        ..Default::default()
    }))
}

fn source_file(dir: &Path, size: usize) -> (PathBuf, Vec<u8>) {
    let path = dir.join("source.bin");
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

struct Pair {
    sender: Arc<RequestLifecycle>,
    receiver: Arc<RequestLifecycle>,
    sent: Arc<Outcome>,
    received: Arc<Outcome>,
}

fn pair(src: &Path, dst: &Path, size: u64, chunk_size: usize) -> Pair {
    let alice = NodeIdentity::new(vec![0xa1, 0x1c, 0xe0]);
    let bob = NodeIdentity::new(vec![0xb0, 0xb0]);
    let uid = 4242;
    let (alice_end, bob_end) = memory_link(8);

    let sent = Arc::new(Outcome::default());
    let received = Arc::new(Outcome::default());
    let sender = RequestLifecycle::new(
        NewRequest::send(src, bob.clone(), uid).with_client_tag("alice"),
        context(chunk_size),
        node(bob, uid, alice_end),
        sent.clone(),
    );
    let receiver = RequestLifecycle::new(
        NewRequest::receive(dst, alice.clone(), uid, size).with_client_tag("bob"),
        context(chunk_size),
        node(alice, uid, bob_end),
        received.clone(),
    );
    Pair {
        sender,
        receiver,
        sent,
        received,
    }
}

#[tokio::test]
async fn file_arrives_intact() {
    let dir = tempfile::tempdir().unwrap();
    let (src, data) = source_file(dir.path(), 100_000);
    let dst = dir.path().join("dest.bin");
    let p = pair(&src, &dst, data.len() as u64, 32768);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    p.receiver.context().events().subscribe(Box::new(move |e| {
        if let ClientEvent::Progress { progress, .. } = e {
            sink.lock().unwrap().push(progress.successful_blocks);
        }
    }));

    assert!(p.receiver.start(false, false).unwrap());
    assert!(p.sender.start(false, false).unwrap());

    tokio::time::timeout(Duration::from_secs(10), async {
        p.sent.wait().await;
        p.received.wait().await;
    })
    .await
    .unwrap();

    assert_eq!(p.sent.successes.load(Ordering::SeqCst), 1);
    assert_eq!(p.received.successes.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&dst).unwrap(), data);

    let rp = p.receiver.progress();
    assert_eq!(rp.total_blocks, 4);
    assert_eq!(rp.min_success_blocks, 4);
    assert_eq!(rp.successful_blocks, 4);
    assert!(rp.finalized);
    assert_eq!(p.sender.progress().successful_blocks, 4);
    assert_eq!(p.receiver.status(), RequestStatus::Succeeded);
    assert_eq!(p.sender.status(), RequestStatus::Succeeded);

    let seen = progress.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&4));
}

#[tokio::test]
async fn empty_file_completes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (src, _) = source_file(dir.path(), 0);
    let dst = dir.path().join("dest.bin");
    let p = pair(&src, &dst, 0, 1024);

    assert!(p.receiver.start(false, false).unwrap());
    assert!(p.sender.start(false, false).unwrap());
    tokio::time::timeout(Duration::from_secs(10), async {
        p.sent.wait().await;
        p.received.wait().await;
    })
    .await
    .unwrap();

    assert_eq!(p.receiver.progress().total_blocks, 0);
    assert_eq!(p.received.successes.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&dst).unwrap().len(), 0);
}

#[tokio::test]
async fn cancelled_receiver_fails_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let (src, data) = source_file(dir.path(), 10_000);
    let dst = dir.path().join("dest.bin");
    let p = pair(&src, &dst, data.len() as u64, 1000);

    assert!(p.receiver.start(false, false).unwrap());
    p.receiver.cancel();
    assert_eq!(
        *p.received.failures.lock().unwrap(),
        vec![OperationError::Cancelled]
    );
    assert!(p.receiver.is_finished());

    assert!(p.sender.start(false, false).unwrap());
    tokio::time::timeout(Duration::from_secs(10), p.sent.wait())
        .await
        .unwrap();
    assert_eq!(p.sent.successes.load(Ordering::SeqCst), 0);
    assert_eq!(p.sent.failures.lock().unwrap().len(), 1);

    // The receiver's own abort report arrives late and is swallowed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(p.received.terminal(), 1);
}
