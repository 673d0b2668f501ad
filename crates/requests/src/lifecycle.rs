//! The top-level state machine of one client-visible operation.
//!
//! A [`RequestLifecycle`] is an insert, a direct file send or a direct file
//! receive. It owns at most one active sub-state, aggregates block counters
//! reported by trackers or by a bulk transfer, and delivers exactly one
//! terminal callback to the client per run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use freight_protocol::{BlockProgress, NodeIdentity, PriorityClass, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::callback::RequestCallback;
use crate::context::OperationContext;
use crate::coordinator::{BulkTransferCoordinator, TransferOwner, TransferParams};
use crate::counters::BlockCounters;
use crate::env::NodeContext;
use crate::error::{ContractViolation, OperationError, PersistError};
use crate::events::ClientEvent;
use crate::insert::{InsertBlock, InsertOptions};
use crate::persist::{Depth, Handle, ObjectStore};
use crate::state::{ProgressHint, StateId, SubState};
use crate::tracker::{BlockCompletionTracker, BlockFlags, BlockFlavor, BlockKey, BlockParent, BlockSender};
use crate::uri::TargetUri;

// ---------------------------------------------------------------------------
// Request description
// ---------------------------------------------------------------------------

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Insert {
        target: TargetUri,
        options: InsertOptions,
    },
    Send {
        peer: NodeIdentity,
        uid: u64,
    },
    Receive {
        peer: NodeIdentity,
        uid: u64,
        size: u64,
    },
}

impl RequestKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
        }
    }
}

/// Everything needed to create a [`RequestLifecycle`].
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: RequestId,
    /// Falls back to the context's configured priority.
    pub priority: Option<PriorityClass>,
    pub client_tag: String,
    pub kind: RequestKind,
    /// Source data of an insert or send, destination of a receive.
    pub data: Option<PathBuf>,
    pub progress_hint: Option<ProgressHint>,
}

impl NewRequest {
    fn with_kind(kind: RequestKind, data: PathBuf) -> Self {
        Self {
            id: RequestId::generate(),
            priority: None,
            client_tag: String::new(),
            kind,
            data: Some(data),
            progress_hint: None,
        }
    }

    pub fn insert(data: impl Into<PathBuf>, target: TargetUri, options: InsertOptions) -> Self {
        Self::with_kind(RequestKind::Insert { target, options }, data.into())
    }

    pub fn send(file: impl Into<PathBuf>, peer: NodeIdentity, uid: u64) -> Self {
        Self::with_kind(RequestKind::Send { peer, uid }, file.into())
    }

    pub fn receive(file: impl Into<PathBuf>, peer: NodeIdentity, uid: u64, size: u64) -> Self {
        Self::with_kind(RequestKind::Receive { peer, uid, size }, file.into())
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_client_tag(mut self, tag: impl Into<String>) -> Self {
        self.client_tag = tag.into();
        self
    }

    pub fn with_progress_hint(mut self, hint: ProgressHint) -> Self {
        self.progress_hint = Some(hint);
        self
    }
}

/// Stored form of a persistent lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRecord {
    pub id: RequestId,
    pub priority: PriorityClass,
    pub client_tag: String,
    pub kind: RequestKind,
    pub data: Option<PathBuf>,
    pub progress: BlockProgress,
    pub status: RequestStatus,
    pub finished: bool,
    pub cancelled: bool,
    pub result_uri: Option<TargetUri>,
    pub early_finalize: bool,
    #[serde(default)]
    pub progress_hint: Option<ProgressHint>,
}

// ---------------------------------------------------------------------------
// RequestLifecycle
// ---------------------------------------------------------------------------

struct LifecycleInner {
    status: RequestStatus,
    current: Option<Arc<dyn SubState>>,
    finished: bool,
    cancelled: bool,
    started_starting: bool,
    counters: BlockCounters,
    result_uri: Option<TargetUri>,
    progress_hint: Option<ProgressHint>,
    data: Option<PathBuf>,
    sent_to_network: bool,
    early_finalize: bool,
}

pub struct RequestLifecycle {
    id: RequestId,
    priority: PriorityClass,
    client_tag: String,
    kind: RequestKind,
    ctx: Arc<OperationContext>,
    env: Arc<NodeContext>,
    callback: Arc<dyn RequestCallback>,
    cancel_flag: Arc<AtomicBool>,
    record: Option<Handle<LifecycleRecord>>,
    /// Serialises record writes so an older snapshot never lands last.
    persist_lock: Mutex<()>,
    inner: Mutex<LifecycleInner>,
    me: Weak<Self>,
}

impl RequestLifecycle {
    pub fn new(
        req: NewRequest,
        ctx: Arc<OperationContext>,
        env: Arc<NodeContext>,
        callback: Arc<dyn RequestCallback>,
    ) -> Arc<Self> {
        let record = match &env.store {
            Some(store) if ctx.config().persistent => {
                Some(Handle::attach(Arc::clone(store), req.id.as_str()))
            }
            _ => None,
        };
        let priority = req.priority.unwrap_or(ctx.config().priority);
        let inner = LifecycleInner {
            status: RequestStatus::Created,
            current: None,
            finished: false,
            cancelled: false,
            started_starting: false,
            counters: BlockCounters::new(),
            result_uri: None,
            progress_hint: req.progress_hint,
            data: req.data,
            sent_to_network: false,
            early_finalize: false,
        };
        let lifecycle = Self::assemble(
            req.id,
            priority,
            req.client_tag,
            req.kind,
            inner,
            false,
            record,
            ctx,
            env,
            callback,
        );
        debug!(
            request = %lifecycle.id,
            kind = lifecycle.kind.label(),
            priority = ?lifecycle.priority,
            persistent = lifecycle.record.is_some(),
            "request created"
        );
        lifecycle.persist();
        lifecycle
    }

    /// Rebuilds a persistent lifecycle from its stored record.
    pub fn rehydrate(
        store: Arc<dyn ObjectStore>,
        id: &RequestId,
        ctx: Arc<OperationContext>,
        env: Arc<NodeContext>,
        callback: Arc<dyn RequestCallback>,
    ) -> Result<Arc<Self>, PersistError> {
        let handle: Handle<LifecycleRecord> = Handle::attach(store, id.as_str());
        let rec = {
            let loaded = handle.load(Depth::FULL)?;
            let rec = (*loaded).clone();
            loaded.release()?;
            rec
        };
        let inner = LifecycleInner {
            status: rec.status,
            current: None,
            finished: rec.finished,
            cancelled: rec.cancelled,
            started_starting: false,
            counters: BlockCounters::from_progress(rec.progress),
            result_uri: rec.result_uri,
            progress_hint: rec.progress_hint,
            data: rec.data,
            sent_to_network: false,
            early_finalize: rec.early_finalize,
        };
        let lifecycle = Self::assemble(
            rec.id,
            rec.priority,
            rec.client_tag,
            rec.kind,
            inner,
            rec.cancelled,
            Some(handle),
            ctx,
            env,
            callback,
        );
        info!(
            request = %lifecycle.id,
            kind = lifecycle.kind.label(),
            status = ?rec.status,
            "request rehydrated"
        );
        Ok(lifecycle)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: RequestId,
        priority: PriorityClass,
        client_tag: String,
        kind: RequestKind,
        inner: LifecycleInner,
        cancelled: bool,
        record: Option<Handle<LifecycleRecord>>,
        ctx: Arc<OperationContext>,
        env: Arc<NodeContext>,
        callback: Arc<dyn RequestCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            priority,
            client_tag,
            kind,
            ctx,
            env,
            callback,
            cancel_flag: Arc::new(AtomicBool::new(cancelled)),
            record,
            persist_lock: Mutex::new(()),
            inner: Mutex::new(inner),
            me: me.clone(),
        })
    }

    // -- start / restart ----------------------------------------------------

    /// Builds and begins the first sub-state.
    ///
    /// Returns `Ok(true)` when a sub-state was started, `Ok(false)` when
    /// nothing was started (already running, or the request failed during
    /// setup and the failure callback has fired), and `Err(NoData)` when no
    /// data is bound.
    pub fn start(&self, early_finalize: bool, restart: bool) -> Result<bool, OperationError> {
        let hint = {
            let mut inner = self.lock();
            if inner.data.is_none() {
                return Err(OperationError::NoData);
            }
            if restart {
                if inner.current.is_some() && !inner.finished {
                    debug!(request = %self.id, "restart refused, request still active");
                    return Ok(false);
                }
                if inner.finished {
                    self.reset_for_restart(&mut inner);
                }
            }
            if inner.started_starting {
                debug!(request = %self.id, "request already started");
                return Ok(false);
            }
            inner.started_starting = true;
            if inner.cancelled {
                drop(inner);
                self.complete(Err(OperationError::Cancelled), None);
                return Ok(false);
            }
            if inner.finished {
                debug!(request = %self.id, "request already finished");
                return Ok(false);
            }
            inner.early_finalize = early_finalize;
            inner.status = RequestStatus::Running;
            inner.progress_hint.take()
        };
        info!(request = %self.id, kind = self.kind.label(), restart, "starting request");
        self.publish_status(RequestStatus::Running);

        let state = match self.build_state(early_finalize) {
            Ok(s) => s,
            Err(e) => {
                error!(request = %self.id, error = %e, "request setup failed");
                self.complete(Err(e), None);
                return Ok(false);
            }
        };

        {
            let mut inner = self.lock();
            if inner.cancelled || inner.finished {
                drop(inner);
                state.release();
                self.complete(Err(OperationError::Cancelled), None);
                return Ok(false);
            }
            inner.current = Some(Arc::clone(&state));
        }

        let begun = match self.kind {
            RequestKind::Insert { .. } => state.start(hint),
            _ => state.schedule(),
        };
        if let Err(e) = begun {
            error!(request = %self.id, state = %state.id(), error = %e, "sub-state failed to start");
            self.complete(Err(e), Some(&*state));
            return Ok(false);
        }
        if self.lock().cancelled {
            debug!(request = %self.id, state = %state.id(), "cancelled while starting");
            self.complete(Err(OperationError::Cancelled), Some(&*state));
            return Ok(false);
        }
        self.persist();
        Ok(true)
    }

    pub fn can_restart(&self) -> bool {
        let inner = self.lock();
        inner.data.is_some() && (inner.current.is_none() || inner.finished)
    }

    /// Runs a finished request again from the top.
    pub fn restart(&self, early_finalize: bool) -> Result<bool, OperationError> {
        self.start(early_finalize, true)
    }

    /// Re-attaches a rehydrated request. Counters and the transfer resume
    /// point are kept.
    pub fn resume(&self) -> Result<bool, OperationError> {
        let early_finalize = {
            let inner = self.lock();
            if inner.finished {
                return Ok(false);
            }
            inner.early_finalize
        };
        self.start(early_finalize, false)
    }

    fn reset_for_restart(&self, inner: &mut LifecycleInner) {
        let resume_from = match self.kind {
            RequestKind::Insert { .. } => 0,
            _ => inner.counters.successful(),
        };
        inner.counters.reset_for_restart(resume_from);
        inner.finished = false;
        inner.cancelled = false;
        inner.started_starting = false;
        inner.result_uri = None;
        inner.status = RequestStatus::Created;
        self.cancel_flag.store(false, Ordering::Release);
        debug!(request = %self.id, resume_from, "request reset for restart");
    }

    fn build_state(&self, early_finalize: bool) -> Result<Arc<dyn SubState>, OperationError> {
        let (data, resume_from) = {
            let inner = self.lock();
            (inner.data.clone(), inner.counters.successful())
        };
        let data = data.ok_or(OperationError::NoData)?;
        let owner = self
            .me
            .upgrade()
            .ok_or_else(|| OperationError::Internal("request dropped during start".into()))?;

        match &self.kind {
            RequestKind::Insert { target, options } => {
                target.check_insert_uri()?;
                let size = std::fs::metadata(&data)
                    .map_err(|e| OperationError::Bucket(format!("{}: {e}", data.display())))?
                    .len();
                let block = InsertBlock {
                    data,
                    size,
                    mime_type: options.mime_type.clone(),
                    target: target.clone(),
                };
                if options.binary_blob {
                    self.env.encoders.binary_blob(owner, block)
                } else {
                    self.env
                        .encoders
                        .single_file(owner, block, options, early_finalize)
                }
            }
            RequestKind::Send { peer, uid } | RequestKind::Receive { peer, uid, .. } => {
                let config = self.ctx.config();
                let params = TransferParams {
                    peer: peer.clone(),
                    file: data,
                    uid: *uid,
                    chunk_size: config.chunk_size,
                    window: config.window,
                    resume_from,
                };
                let transfer_owner: Weak<dyn TransferOwner> = self.me.clone();
                let peers = Arc::clone(&self.env.peers);
                let executor = self.env.executor.clone();
                let coordinator = match self.kind {
                    RequestKind::Receive { size, .. } => {
                        BulkTransferCoordinator::receiver(transfer_owner, peers, executor, params, size)
                    }
                    _ => BulkTransferCoordinator::sender(transfer_owner, peers, executor, params)?,
                };
                self.lock()
                    .counters
                    .set_fixed_total(coordinator.total_blocks());
                self.notify_progress();
                Ok(coordinator)
            }
        }
    }

    // -- terminal path ------------------------------------------------------

    /// Terminal success reported by `state`.
    pub fn on_success(&self, state: &dyn SubState) {
        self.complete(Ok(()), Some(state));
    }

    /// Terminal failure reported by `state`.
    pub fn on_failure(&self, error: OperationError, state: &dyn SubState) {
        self.complete(Err(error), Some(state));
    }

    fn complete(&self, outcome: Result<(), OperationError>, reporter: Option<&dyn SubState>) {
        let (old, progress, anomaly) = {
            let mut inner = self.lock();
            if inner.finished {
                let after_cancel = inner.cancelled;
                drop(inner);
                if after_cancel {
                    debug!(request = %self.id, outcome = ?outcome, "completion after cancel ignored");
                } else {
                    ContractViolation::DoubleCompletion(format!("request {}", self.id)).report();
                }
                return;
            }
            inner.finished = true;
            inner.status = match &outcome {
                Ok(()) => RequestStatus::Succeeded,
                Err(e) if e.is_cancelled() => RequestStatus::Cancelled,
                Err(_) => RequestStatus::Failed,
            };
            inner.progress_hint = None;
            (
                inner.current.take(),
                inner.counters.snapshot(),
                inner.counters.has_anomaly(),
            )
        };

        if let Some(old) = &old {
            old.release();
        }
        if let Some(r) = reporter
            && old.as_ref().is_none_or(|o| o.id() != r.id())
        {
            r.release();
        }

        self.persist();
        match &outcome {
            Ok(()) => {
                if anomaly {
                    warn!(
                        request = %self.id,
                        total = progress.total_blocks,
                        successful = progress.successful_blocks,
                        failed = progress.failed_blocks,
                        fatal = progress.fatally_failed_blocks,
                        "request succeeded with outstanding or failed blocks"
                    );
                }
                info!(request = %self.id, kind = self.kind.label(), "request succeeded");
                self.publish_status(RequestStatus::Succeeded);
                self.callback.on_success(&self.id);
            }
            Err(e) => {
                let status = if e.is_cancelled() {
                    RequestStatus::Cancelled
                } else {
                    RequestStatus::Failed
                };
                info!(request = %self.id, kind = self.kind.label(), error = %e, "request failed");
                self.publish_status(status);
                self.callback.on_failure(&self.id, e);
            }
        }
    }

    /// Replaces the current sub-state if it is still `old`.
    pub fn on_transition(&self, old: StateId, new: Arc<dyn SubState>) -> bool {
        let (replaced, cancelled) = {
            let mut inner = self.lock();
            let current = inner.current.as_ref().map(|c| c.id());
            if current != Some(old) {
                drop(inner);
                ContractViolation::StaleTransition {
                    current,
                    old,
                    new: new.id(),
                }
                .report();
                return false;
            }
            (inner.current.replace(Arc::clone(&new)), inner.cancelled)
        };
        debug!(request = %self.id, %old, new = %new.id(), "sub-state transition");
        if let Some(replaced) = replaced {
            replaced.release();
        }
        if cancelled {
            new.cancel();
        }
        true
    }

    /// Cancels the request. Only the first call has an effect.
    pub fn cancel(&self) {
        let current = {
            let mut inner = self.lock();
            if inner.cancelled || inner.finished {
                return;
            }
            inner.cancelled = true;
            self.cancel_flag.store(true, Ordering::Release);
            inner.current.clone()
        };
        info!(request = %self.id, "cancelling request");
        if let Some(state) = &current {
            state.cancel();
        }
        self.complete(Err(OperationError::Cancelled), current.as_deref());
    }

    // -- progress -----------------------------------------------------------

    pub fn on_block_set_finalized(&self) {
        if self.lock().counters.finalize() {
            debug!(request = %self.id, "block set finalized");
            self.notify_progress();
        }
    }

    /// Records the final URI of an insert and tells the client.
    pub fn on_encode(&self, uri: TargetUri, state: &dyn SubState) {
        let uri = match &self.kind {
            RequestKind::Insert { options, .. } => match &options.target_filename {
                Some(name) => uri.push_meta_string(name.clone()),
                None => uri,
            },
            _ => uri,
        };
        {
            let mut inner = self.lock();
            if let Some(kept) = &inner.result_uri {
                let violation = ContractViolation::GeneratedUriTwice {
                    kept: kept.to_string(),
                    dropped: uri.to_string(),
                };
                drop(inner);
                violation.report();
                return;
            }
            inner.result_uri = Some(uri.clone());
        }
        debug!(request = %self.id, state = %state.id(), %uri, "generated URI");
        self.persist();
        self.callback.on_generated_uri(&self.id, &uri);
    }

    /// Metadata produced by an insert is not inserted on its own.
    pub fn on_metadata(&self, state: &dyn SubState) {
        error!(request = %self.id, state = %state.id(), "insert produced metadata that will not be inserted");
    }

    pub fn on_fetchable(&self, _state: &dyn SubState) {
        self.callback.on_fetchable(&self.id);
    }

    pub fn on_major_progress(&self) {
        self.persist();
        self.callback.on_major_progress(&self.id);
    }

    /// The first block is leaving for the network. Published once.
    pub fn to_network(&self) {
        if std::mem::replace(&mut self.lock().sent_to_network, true) {
            return;
        }
        self.ctx.publish(&ClientEvent::SendingToNetwork {
            request: self.id.clone(),
        });
    }

    pub fn notify_progress(&self) {
        let progress = self.progress();
        self.ctx.publish(&ClientEvent::Progress {
            request: self.id.clone(),
            progress,
        });
    }

    pub fn add_blocks(&self, n: u32) {
        if self.lock().counters.add_blocks(n) {
            self.notify_progress();
        }
    }

    pub fn add_must_succeed_blocks(&self, n: u32) {
        self.lock().counters.add_must_succeed(n);
        self.notify_progress();
    }

    pub fn completed_block(&self) {
        if self.lock().counters.completed() {
            self.notify_progress();
            self.persist();
        }
    }

    pub fn failed_block(&self, fatal: bool) {
        if self.lock().counters.failed(fatal) {
            self.notify_progress();
            self.persist();
        }
    }

    /// Wraps one dispatched block in a tracker and hands it to the scheduler.
    pub fn submit_block(
        &self,
        flavor: BlockFlavor,
        key: BlockKey,
    ) -> Result<Arc<BlockCompletionTracker>, OperationError> {
        let parent: Arc<dyn BlockParent> = self
            .me
            .upgrade()
            .ok_or_else(|| OperationError::Internal("request dropped".into()))?;
        let tracker = Arc::new(BlockCompletionTracker::new(flavor, parent, key));
        self.env.scheduler.submit(Arc::clone(&tracker));
        Ok(tracker)
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    pub fn client_tag(&self) -> &str {
        &self.client_tag
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn context(&self) -> &Arc<OperationContext> {
        &self.ctx
    }

    pub fn status(&self) -> RequestStatus {
        self.lock().status
    }

    /// True once finished or cancelled.
    pub fn is_finished(&self) -> bool {
        let inner = self.lock();
        inner.finished || inner.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn progress(&self) -> BlockProgress {
        self.lock().counters.snapshot()
    }

    pub fn result_uri(&self) -> Option<TargetUri> {
        self.lock().result_uri.clone()
    }

    pub fn current_state_id(&self) -> Option<StateId> {
        self.lock().current.as_ref().map(|s| s.id())
    }

    /// Drops the bound data; a later start fails with `NoData`.
    pub fn unbind_data(&self) {
        self.lock().data = None;
    }

    // -- persistence --------------------------------------------------------

    pub fn record(&self) -> LifecycleRecord {
        let inner = self.lock();
        LifecycleRecord {
            id: self.id.clone(),
            priority: self.priority,
            client_tag: self.client_tag.clone(),
            kind: self.kind.clone(),
            data: inner.data.clone(),
            progress: inner.counters.snapshot(),
            status: inner.status,
            finished: inner.finished,
            cancelled: inner.cancelled,
            result_uri: inner.result_uri.clone(),
            early_finalize: inner.early_finalize,
            progress_hint: inner.progress_hint.clone(),
        }
    }

    /// Tears the request down: closes an owned event channel and deletes
    /// the stored record.
    pub fn remove(&self) -> Result<(), PersistError> {
        self.ctx.release();
        if let Some(handle) = &self.record {
            handle.remove()?;
            debug!(request = %self.id, "request record removed");
        }
        Ok(())
    }

    fn persist(&self) {
        let Some(handle) = &self.record else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = handle.save(&self.record()) {
            warn!(request = %self.id, error = %e, "failed to persist request");
        }
    }

    fn publish_status(&self, status: RequestStatus) {
        self.ctx.publish(&ClientEvent::StatusChanged {
            request: self.id.clone(),
            status,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockParent for RequestLifecycle {
    fn on_block_finished(&self, tracker: &BlockCompletionTracker) {
        match tracker.outcome() {
            Some(o) if o.is_success() => self.completed_block(),
            Some(o) => self.failed_block(o.failure_is_fatal().unwrap_or(false)),
            None => {}
        }
    }

    fn priority(&self) -> PriorityClass {
        self.priority
    }

    fn sender(&self) -> Arc<dyn BlockSender> {
        self.env.scheduler.sender()
    }

    fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    fn block_flags(&self) -> BlockFlags {
        let config = self.ctx.config();
        BlockFlags {
            local_only: config.local_request_only,
            cache_local_requests: config.can_write_client_cache,
            ignore_store: config.ignore_store,
        }
    }
}

impl TransferOwner for RequestLifecycle {
    fn completed_block(&self) {
        RequestLifecycle::completed_block(self);
    }

    fn on_transfer_success(&self, state: &dyn SubState) {
        self.on_success(state);
    }

    fn on_transfer_failure(&self, error: OperationError, state: &dyn SubState) {
        self.on_failure(error, state);
    }
}
