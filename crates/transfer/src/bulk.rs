use std::sync::{Mutex, PoisonError};

use crate::types::AbortReason;
use crate::{DEFAULT_CHUNK_SIZE, block_count};

/// Which chunks of a bulk file have been confirmed, plus the abort state.
///
/// Shared between a transfer task and whoever wants to observe or abort it.
/// Thread-safe.
pub struct PartialBulk {
    size: u64,
    chunk_size: usize,
    total: u32,
    inner: Mutex<BulkInner>,
}

struct BulkInner {
    bits: Vec<u64>,
    received: u32,
    aborted: Option<AbortReason>,
}

impl PartialBulk {
    /// Creates the tracking state for a file of `size` bytes.
    ///
    /// The first `resume_from` chunks are treated as already received.
    pub fn new(size: u64, chunk_size: usize, resume_from: u32) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let total = block_count(size, chunk_size);
        let mut inner = BulkInner {
            bits: vec![0u64; total.div_ceil(64) as usize],
            received: 0,
            aborted: None,
        };
        for index in 0..resume_from.min(total) {
            inner.set(index);
        }
        Self {
            size,
            chunk_size,
            total,
            inner: Mutex::new(inner),
        }
    }

    /// Marks chunk `index` as received. Returns `true` if it was new.
    ///
    /// Out-of-range indices are ignored and return `false`.
    pub fn mark_received(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        let mut inner = self.lock();
        inner.set(index)
    }

    pub fn is_received(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        self.lock().get(index)
    }

    /// Number of distinct chunks received so far.
    pub fn blocks_received(&self) -> u32 {
        self.lock().received
    }

    /// Lowest chunk index not yet received, or `None` when complete.
    pub fn first_missing(&self) -> Option<u32> {
        let inner = self.lock();
        (0..self.total).find(|&i| !inner.get(i))
    }

    pub fn is_complete(&self) -> bool {
        self.lock().received == self.total
    }

    /// Records an abort. The first reason wins; returns `false` if already aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let mut inner = self.lock();
        if inner.aborted.is_some() {
            return false;
        }
        inner.aborted = Some(reason);
        true
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.lock().aborted.clone()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BulkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BulkInner {
    fn get(&self, index: u32) -> bool {
        self.bits[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    fn set(&mut self, index: u32) -> bool {
        let word = &mut self.bits[(index / 64) as usize];
        let mask = 1u64 << (index % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.received += 1;
        true
    }
}
