use freight_protocol::BlockProgress;
use tracing::warn;

/// Aggregate block counters of one operation.
///
/// Counters only grow. Once the block set is finalized, `total_blocks` is
/// fixed and completions that would push the settled count past it are
/// refused. Not synchronised; the owner keeps it under its own lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounters {
    p: BlockProgress,
}

impl BlockCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores counters from a persisted snapshot.
    pub fn from_progress(p: BlockProgress) -> Self {
        Self { p }
    }

    /// Adds `n` blocks to the total. Ignored once finalized.
    pub fn add_blocks(&mut self, n: u32) -> bool {
        if self.p.finalized {
            warn!(n, total = self.p.total_blocks, "blocks added after finalize");
            return false;
        }
        self.p.total_blocks = self.p.total_blocks.saturating_add(n);
        true
    }

    /// Adds `n` blocks that must succeed for the operation to succeed.
    pub fn add_must_succeed(&mut self, n: u32) {
        self.p.min_success_blocks = self.p.min_success_blocks.saturating_add(n);
    }

    /// Sets an all-or-nothing block set of `total` blocks and finalizes it.
    pub fn set_fixed_total(&mut self, total: u32) {
        self.p.total_blocks = self.p.total_blocks.max(total);
        self.p.min_success_blocks = self.p.min_success_blocks.max(total);
        self.p.finalized = true;
        self.cover_settled();
    }

    /// Marks the block set final. Returns `true` the first time.
    pub fn finalize(&mut self) -> bool {
        let first = !std::mem::replace(&mut self.p.finalized, true);
        if first {
            self.cover_settled();
        }
        first
    }

    /// Raises the total to the settled count when more blocks completed
    /// before finalize than were ever added.
    fn cover_settled(&mut self) {
        let settled = self.p.settled_blocks();
        if settled > self.p.total_blocks {
            warn!(
                total = self.p.total_blocks,
                settled, "more blocks settled than added, raising total"
            );
            self.p.total_blocks = settled;
        }
    }

    /// Counts one successful block.
    pub fn completed(&mut self) -> bool {
        if !self.has_room() {
            return false;
        }
        self.p.successful_blocks += 1;
        true
    }

    /// Counts one failed block.
    pub fn failed(&mut self, fatal: bool) -> bool {
        if !self.has_room() {
            return false;
        }
        if fatal {
            self.p.fatally_failed_blocks += 1;
        } else {
            self.p.failed_blocks += 1;
        }
        true
    }

    /// Counters for a fresh run: failures cleared, `resume_from` blocks
    /// already successful. Totals of a finalized set are kept.
    pub fn reset_for_restart(&mut self, resume_from: u32) {
        if !self.p.finalized {
            self.p.total_blocks = 0;
            self.p.min_success_blocks = 0;
        }
        self.p.successful_blocks = resume_from;
        self.p.failed_blocks = 0;
        self.p.fatally_failed_blocks = 0;
    }

    /// Blocks still missing or failed at success time.
    pub fn has_anomaly(&self) -> bool {
        self.p.failed_blocks > 0
            || self.p.fatally_failed_blocks > 0
            || self.p.successful_blocks < self.p.total_blocks
    }

    pub fn snapshot(&self) -> BlockProgress {
        self.p
    }

    pub fn successful(&self) -> u32 {
        self.p.successful_blocks
    }

    fn has_room(&self) -> bool {
        if self.p.finalized && self.p.settled_blocks() >= self.p.total_blocks {
            warn!(
                total = self.p.total_blocks,
                settled = self.p.settled_blocks(),
                "completion beyond finalized block set ignored"
            );
            return false;
        }
        true
    }
}
