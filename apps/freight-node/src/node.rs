//! Wiring of the request engine into a standalone node.
//!
//! This node has no block network and no insert encoder: block submissions
//! fail with route-not-found, inserts fail at setup. Direct transfers run in
//! full.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use freight_protocol::{NodeIdentity, RequestId, RequestStatus};
use freight_requests::{
    BlockCompletionTracker, BlockFailure, BlockFlavor, BlockSender, ClientEvent, InsertBlock,
    InsertEncoderFactory, InsertOptions, JsonDirStore, LowLevelFetchError, LowLevelInsertError,
    MemoryPeer, NewRequest, NodeContext, ObjectStore, OperationContext, OperationError,
    RequestCallback, RequestLifecycle, Scheduler, StaticPeerDirectory, SubState,
};
use freight_transfer::{MemoryLink, calculate_file_checksum, memory_link, validate_offer_name};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Scheduler of a node with no block network.
struct OfflineScheduler;

impl BlockSender for OfflineScheduler {
    fn send(&self, tracker: &BlockCompletionTracker) -> bool {
        let failure = match tracker.flavor() {
            BlockFlavor::Fetch => BlockFailure::Fetch(LowLevelFetchError::RouteNotFound),
            BlockFlavor::Insert => BlockFailure::Insert(LowLevelInsertError::RouteNotFound),
        };
        if let Err(violation) = tracker.on_failure(failure) {
            debug!(block = %tracker, %violation, "block already finished");
        }
        true
    }
}

impl Scheduler for OfflineScheduler {
    fn submit(&self, tracker: Arc<BlockCompletionTracker>) {
        debug!(block = %tracker, "no block network, failing block");
        tracker.send();
    }

    fn sender(&self) -> Arc<dyn BlockSender> {
        Arc::new(OfflineScheduler)
    }
}

struct NoEncoder;

impl NoEncoder {
    fn unsupported() -> OperationError {
        OperationError::Internal("this node has no insert encoder".into())
    }
}

impl InsertEncoderFactory for NoEncoder {
    fn single_file(
        &self,
        _owner: Arc<RequestLifecycle>,
        _block: InsertBlock,
        _options: &InsertOptions,
        _early_encode: bool,
    ) -> Result<Arc<dyn SubState>, OperationError> {
        Err(Self::unsupported())
    }

    fn binary_blob(
        &self,
        _owner: Arc<RequestLifecycle>,
        _block: InsertBlock,
    ) -> Result<Arc<dyn SubState>, OperationError> {
        Err(Self::unsupported())
    }
}

/// Client callback that lets the caller await the terminal outcome.
#[derive(Default)]
struct Completion {
    done: AtomicBool,
    error: Mutex<Option<OperationError>>,
    notify: Notify,
}

impl Completion {
    async fn wait(&self) -> Result<(), OperationError> {
        while !self.done.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
        match self.error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&self, error: Option<OperationError>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
        self.done.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

impl RequestCallback for Completion {
    fn on_success(&self, request: &RequestId) {
        debug!(%request, "request callback: success");
        self.finish(None);
    }

    fn on_failure(&self, request: &RequestId, error: &OperationError) {
        debug!(%request, %error, "request callback: failure");
        self.finish(Some(error.clone()));
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    cfg: NodeConfig,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Node {
    pub fn new(cfg: NodeConfig) -> anyhow::Result<Self> {
        let store: Option<Arc<dyn ObjectStore>> = if cfg.context.persistent {
            let store = JsonDirStore::open(&cfg.state_dir)
                .with_context(|| format!("opening {}", cfg.state_dir.display()))?;
            Some(Arc::new(store))
        } else {
            None
        };
        Ok(Self { cfg, store })
    }

    /// Node context whose only peer is `remote`, reachable through `link`.
    fn env(&self, remote: NodeIdentity, uid: u64, link: Option<MemoryLink>) -> Arc<NodeContext> {
        let peers = StaticPeerDirectory::new();
        let peer = MemoryPeer::new(remote);
        if let Some(link) = link {
            peer.offer(uid, link);
        }
        peers.insert(Arc::new(peer));
        let mut env = NodeContext::new(
            Arc::new(OfflineScheduler),
            Arc::new(peers),
            Arc::new(NoEncoder),
            tokio::runtime::Handle::current(),
        );
        if let Some(store) = &self.store {
            env = env.with_store(Arc::clone(store));
        }
        Arc::new(env)
    }

    /// Sends `file` to this node itself and waits for both sides to finish.
    ///
    /// Returns the path the file was received at.
    pub async fn send_to_self(&self, file: &Path) -> anyhow::Result<PathBuf> {
        let size = std::fs::metadata(file)
            .with_context(|| format!("reading {}", file.display()))?
            .len();
        let offered = file
            .file_name()
            .and_then(|n| n.to_str())
            .context("file has no usable name")?;
        validate_offer_name(offered)?;
        std::fs::create_dir_all(&self.cfg.download_dir)?;
        let dest = self.cfg.download_dir.join(offered);

        let me = self.cfg.identity();
        let uid = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let (out_end, in_end) = memory_link(self.cfg.context.window.max(1) * 2);

        let send_done = Arc::new(Completion::default());
        let recv_done = Arc::new(Completion::default());
        let receiver = RequestLifecycle::new(
            NewRequest::receive(&dest, me.clone(), uid, size).with_client_tag("loopback"),
            Arc::new(OperationContext::from_config(self.cfg.context.clone())),
            self.env(me.clone(), uid, Some(in_end)),
            recv_done.clone(),
        );
        let sender = RequestLifecycle::new(
            NewRequest::send(file, me.clone(), uid).with_client_tag("loopback"),
            Arc::new(OperationContext::from_config(self.cfg.context.clone())),
            self.env(me.clone(), uid, Some(out_end)),
            send_done.clone(),
        );

        let id = receiver.id().clone();
        receiver.context().events().subscribe(Box::new(move |event| {
            if let ClientEvent::Progress { progress, .. } = event
                && progress.total_blocks > 0
            {
                debug!(request = %id, percent = (progress.fraction() * 100.0) as u32, "receiving");
            }
        }));

        info!(file = %file.display(), size, peer = %me, uid, "sending file to self");
        receiver.start(false, false)?;
        sender.start(false, false)?;

        let sent = send_done.wait().await;
        let received = recv_done.wait().await;
        for lifecycle in [&sender, &receiver] {
            if lifecycle.status() == RequestStatus::Succeeded
                && let Err(e) = lifecycle.remove()
            {
                warn!(request = %lifecycle.id(), error = %e, "failed to remove request record");
            }
        }
        match (sent, received) {
            (Ok(()), Ok(())) => {
                let want = calculate_file_checksum(file)?;
                let got = calculate_file_checksum(&dest)?;
                if want != got {
                    bail!("checksum mismatch after transfer: {want} != {got}");
                }
                info!(dest = %dest.display(), sha256 = %got, "file received");
                Ok(dest)
            }
            (Err(e), _) => bail!("send failed: {e}"),
            (_, Err(e)) => bail!("receive failed: {e}"),
        }
    }

    /// Stored requests that have not finished.
    pub fn pending(&self) -> anyhow::Result<Vec<freight_requests::LifecycleRecord>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in store.keys()? {
            let lifecycle = RequestLifecycle::rehydrate(
                Arc::clone(store),
                &RequestId::new(key.as_str()),
                Arc::new(OperationContext::from_config(self.cfg.context.clone())),
                self.env(self.cfg.identity(), 0, None),
                Arc::new(Completion::default()),
            );
            match lifecycle {
                Ok(l) if !l.status().is_terminal() => out.push(l.record()),
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "unreadable request record"),
            }
        }
        Ok(out)
    }
}
