//! Progress and status events published to whoever watches an operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use freight_protocol::{BlockProgress, RequestId, RequestStatus};
use serde::Serialize;

/// An event produced by a running operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Snapshot of the aggregate block counters.
    Progress {
        request: RequestId,
        #[serde(flatten)]
        progress: BlockProgress,
    },
    /// The insert has started sending blocks to the network.
    SendingToNetwork { request: RequestId },
    StatusChanged {
        request: RequestId,
        status: RequestStatus,
    },
}

/// Receives every event published on a channel.
pub type Listener = Box<dyn Fn(&ClientEvent) + Send + Sync>;

/// Shared publish point for [`ClientEvent`]s.
///
/// Several operations may publish on one channel. Once closed, further
/// events are dropped.
#[derive(Default)]
pub struct EventChannel {
    listeners: RwLock<Vec<Listener>>,
    closed: AtomicBool,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: Listener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Delivers `event` to every listener. Returns `false` if the channel is closed.
    pub fn publish(&self, event: &ClientEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(event);
        }
        true
    }

    /// Closes the channel and drops its listeners.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// How a context holds its event channel.
///
/// Only the `Owned` side closes the channel on release; ownership is fixed
/// when the reference is created.
pub enum ChannelRef {
    Owned(Arc<EventChannel>),
    Borrowed(Arc<EventChannel>),
}

impl ChannelRef {
    /// A fresh channel owned by the holder.
    pub fn owned() -> Self {
        Self::Owned(Arc::new(EventChannel::new()))
    }

    /// A non-owning reference to the same channel.
    pub fn borrow(&self) -> Self {
        Self::Borrowed(Arc::clone(self.channel()))
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        match self {
            Self::Owned(c) | Self::Borrowed(c) => c,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    pub fn publish(&self, event: &ClientEvent) -> bool {
        self.channel().publish(event)
    }

    /// Closes the channel if this reference owns it.
    pub fn release(&self) {
        if let Self::Owned(c) = self {
            c.close();
        }
    }
}
