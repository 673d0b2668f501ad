use std::fmt;

use serde::{Deserialize, Serialize};

/// A chunk of file data for transfer.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based chunk index within the file.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data. Only the last chunk may be shorter than the chunk size.
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data` (empty means no verification).
    pub checksum: String,
}

impl Chunk {
    /// Size of this chunk in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Why a bulk transfer was aborted.
///
/// Sent to the other side in an abort frame and handed to the local
/// [`TransmitCallback::on_failure`](crate::TransmitCallback::on_failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// The local owner cancelled the operation.
    Cancelled,
    /// The transfer object was replaced by a restart.
    Restart,
    /// The receiving side declined the file offer.
    Rejected,
    /// The sending side went away.
    SenderDied,
    /// The receiving side went away.
    ReceiverDied,
    /// Local file I/O failed.
    Io(String),
    /// The peer violated the frame protocol (bad index, bad checksum, ...).
    Protocol(String),
}

impl AbortReason {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Restart => f.write_str("restart"),
            Self::Rejected => f.write_str("offer rejected"),
            Self::SenderDied => f.write_str("sender died"),
            Self::ReceiverDied => f.write_str("receiver died"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}
