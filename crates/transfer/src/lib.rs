//! Windowed, chunked bulk file transfer with resume support.
//!
//! A file is moved between two peers as fixed-size chunks indexed from 0.
//! The sending side runs a [`BulkTransmitter`], the receiving side a
//! [`BulkReceiver`]; both talk over a [`PeerLink`] and report every finished
//! chunk and exactly one terminal outcome through a [`TransmitCallback`].
//! Either side can be aborted with a typed [`AbortReason`] via its
//! [`TransferControl`].

mod bulk;
mod chunked;
mod link;
mod progress;
mod types;
mod validation;
mod window;

pub use bulk::PartialBulk;
pub use chunked::{ChunkReader, ChunkWriter, calculate_file_checksum, checksum_bytes};
pub use link::{LinkFrame, MemoryLink, PeerLink, memory_link};
pub use progress::SpeedCalculator;
pub use types::{AbortReason, Chunk};
pub use validation::validate_offer_name;
pub use window::{BulkReceiver, BulkTransmitter, TransferControl, TransmitCallback};

/// Default chunk size: 32 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default number of unacknowledged chunks a transmitter keeps in flight.
pub const DEFAULT_WINDOW: usize = 16;

/// Number of chunks needed to carry `size` bytes: `ceil(size / chunk_size)`.
///
/// A zero `chunk_size` is treated as [`DEFAULT_CHUNK_SIZE`].
pub fn block_count(size: u64, chunk_size: usize) -> u32 {
    let chunk = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    };
    let blocks = size / chunk + u64::from(size % chunk > 0);
    u32::try_from(blocks).unwrap_or(u32::MAX)
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch on block {0}")]
    ChecksumMismatch(u32),

    #[error("block {index} out of range (total {total})")]
    BlockOutOfRange { index: u32, total: u32 },

    #[error("block {index} has {got} bytes, expected {expected}")]
    ChunkSize {
        index: u32,
        got: usize,
        expected: usize,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("peer link closed")]
    Disconnected,

    #[error("transfer aborted: {0}")]
    Aborted(AbortReason),
}
