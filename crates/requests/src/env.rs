use std::sync::Arc;

use tokio::runtime::Handle;

use crate::directory::PeerDirectory;
use crate::insert::InsertEncoderFactory;
use crate::persist::ObjectStore;
use crate::scheduler::Scheduler;

/// Node-wide collaborators shared by every operation.
pub struct NodeContext {
    pub scheduler: Arc<dyn Scheduler>,
    pub peers: Arc<dyn PeerDirectory>,
    pub encoders: Arc<dyn InsertEncoderFactory>,
    /// Backing store for persistent operations. `None` makes every
    /// operation transient.
    pub store: Option<Arc<dyn ObjectStore>>,
    /// Runtime that bulk transfers are spawned on.
    pub executor: Handle,
}

impl NodeContext {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        peers: Arc<dyn PeerDirectory>,
        encoders: Arc<dyn InsertEncoderFactory>,
        executor: Handle,
    ) -> Self {
        Self {
            scheduler,
            peers,
            encoders,
            store: None,
            executor,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }
}
