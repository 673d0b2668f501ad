//! Per-operation configuration.
//!
//! [`ContextConfig`] is the serialisable form, read from JSON with every
//! field optional. [`OperationContext`] is the immutable runtime bundle an
//! operation is created with: the config plus the event channel it
//! publishes on.

use std::path::Path;
use std::sync::Arc;

use freight_protocol::PriorityClass;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::events::{ChannelRef, ClientEvent, EventChannel};

// ---------------------------------------------------------------------------
// ContextConfig
// ---------------------------------------------------------------------------

/// Tunables for one operation or a family of operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextConfig {
    /// Retries per block insert; -1 retries forever.
    pub max_insert_retries: i32,
    /// Consecutive route-not-found results that count as a successful insert.
    pub consecutive_rnfs_count_as_success: u32,
    pub splitfile_segment_data_blocks: u32,
    pub splitfile_segment_check_blocks: u32,
    /// Results may be written to the local client cache.
    pub can_write_client_cache: bool,
    pub dont_compress: bool,
    /// Comma-separated compressor names, in order of preference.
    pub compressor_descriptor: Option<String>,
    /// Bulk transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Bulk transfer window in chunks.
    pub window: usize,
    pub priority: PriorityClass,
    /// Operations created with this config keep a persisted record.
    pub persistent: bool,
    pub local_request_only: bool,
    pub ignore_store: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_insert_retries: 10,
            consecutive_rnfs_count_as_success: 0,
            splitfile_segment_data_blocks: 128,
            splitfile_segment_check_blocks: 128,
            can_write_client_cache: false,
            dont_compress: false,
            compressor_descriptor: None,
            chunk_size: freight_transfer::DEFAULT_CHUNK_SIZE,
            window: freight_transfer::DEFAULT_WINDOW,
            priority: PriorityClass::default(),
            persistent: false,
            local_request_only: false,
            ignore_store: false,
        }
    }
}

impl ContextConfig {
    /// Reads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        if !path.exists() {
            debug!(path = %path.display(), "no context config, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.chunk_size == 0 {
            warn!("chunk size 0 in config, using default");
            self.chunk_size = freight_transfer::DEFAULT_CHUNK_SIZE;
        }
        if self.window == 0 {
            self.window = 1;
        }
    }
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Immutable configuration bundle handed to an operation.
pub struct OperationContext {
    config: ContextConfig,
    events: ChannelRef,
}

impl OperationContext {
    /// A context that owns a fresh event channel.
    pub fn from_config(config: ContextConfig) -> Self {
        Self {
            config,
            events: ChannelRef::owned(),
        }
    }

    /// A context publishing on a channel owned by someone else.
    pub fn with_channel(config: ContextConfig, channel: Arc<EventChannel>) -> Self {
        Self {
            config,
            events: ChannelRef::Borrowed(channel),
        }
    }

    /// A child context with the same config.
    ///
    /// With `keep_events` the child borrows this context's channel; otherwise
    /// it owns a new one.
    pub fn derive(&self, keep_events: bool) -> Self {
        let events = if keep_events {
            self.events.borrow()
        } else {
            ChannelRef::owned()
        };
        Self {
            config: self.config.clone(),
            events,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        self.events.channel()
    }

    pub fn owns_events(&self) -> bool {
        self.events.is_owned()
    }

    pub fn publish(&self, event: &ClientEvent) {
        self.events.publish(event);
    }

    /// Tears the context down. Only an owned channel is closed.
    pub fn release(&self) {
        self.events.release();
    }
}
