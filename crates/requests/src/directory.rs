//! Resolution of stable peer identities to live peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use freight_protocol::NodeIdentity;
use freight_transfer::{MemoryLink, PeerLink, TransferError};
use tracing::debug;

/// A connected peer.
pub trait PeerHandle: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    /// Opens the frame link for transfer `uid`.
    fn open_link(&self, uid: u64) -> Result<Arc<dyn PeerLink>, TransferError>;
}

/// Looks up connected peers by identity.
///
/// May return `None` for a peer that was known before a restart.
pub trait PeerDirectory: Send + Sync {
    fn lookup(&self, identity: &NodeIdentity) -> Option<Arc<dyn PeerHandle>>;
}

/// A directory with an explicitly managed peer set.
#[derive(Default)]
pub struct StaticPeerDirectory {
    peers: RwLock<HashMap<NodeIdentity, Arc<dyn PeerHandle>>>,
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<dyn PeerHandle>) {
        let id = peer.identity().clone();
        debug!(peer = %id, "peer added");
        self.write().insert(id, peer);
    }

    pub fn remove(&self, identity: &NodeIdentity) -> Option<Arc<dyn PeerHandle>> {
        self.write().remove(identity)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeIdentity, Arc<dyn PeerHandle>>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn lookup(&self, identity: &NodeIdentity) -> Option<Arc<dyn PeerHandle>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }
}

/// In-process peer whose links are handed over ahead of time.
///
/// Each offered link can be opened once.
pub struct MemoryPeer {
    identity: NodeIdentity,
    links: Mutex<HashMap<u64, MemoryLink>>,
}

impl MemoryPeer {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `link` available for transfer `uid`.
    pub fn offer(&self, uid: u64, link: MemoryLink) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid, link);
    }
}

impl PeerHandle for MemoryPeer {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn open_link(&self, uid: u64) -> Result<Arc<dyn PeerLink>, TransferError> {
        let link = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&uid)
            .ok_or(TransferError::Disconnected)?;
        Ok(Arc::new(link))
    }
}
