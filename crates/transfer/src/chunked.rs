use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, TransferError, block_count};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn effective_chunk_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file in fixed-size, indexed chunks with SHA-256 checksums.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    next_index: u32,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size: effective_chunk_size(chunk_size),
            next_index: 0,
            file_size,
        })
    }

    /// Positions the reader at chunk `index` (for resume).
    pub fn seek_to_block(&mut self, index: u32) -> Result<(), TransferError> {
        let total = self.block_count();
        if index > total {
            return Err(TransferError::BlockOutOfRange { index, total });
        }
        self.file
            .seek(SeekFrom::Start(index as u64 * self.chunk_size as u64))?;
        self.next_index = index;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` once every chunk has been read.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let offset = self.next_index as u64 * self.chunk_size as u64;
        if offset >= self.file_size {
            return Ok(None);
        }

        let read_size = (self.file_size - offset).min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; read_size];
        self.file.read_exact(&mut buf)?;

        let chunk = Chunk {
            index: self.next_index,
            offset,
            checksum: checksum_bytes(&buf),
            data: buf,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Index of the chunk the next call to [`next_chunk`](Self::next_chunk) returns.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Total number of chunks in the file.
    pub fn block_count(&self) -> u32 {
        block_count(self.file_size, self.chunk_size)
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes indexed chunks into one target file at their exact offsets.
///
/// The file is opened without truncation so that a resumed transfer keeps
/// the chunks already on disk.
pub struct ChunkWriter {
    file: std::fs::File,
    path: PathBuf,
    chunk_size: usize,
    file_size: u64,
}

impl ChunkWriter {
    /// Opens (or creates) `path` to receive a file of `file_size` bytes.
    pub fn open(path: &Path, file_size: u64, chunk_size: usize) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            chunk_size: effective_chunk_size(chunk_size),
            file_size,
        })
    }

    /// Verifies and writes one chunk.
    ///
    /// - Rejects indices past the end of the file and chunks of the wrong size.
    /// - Verifies the checksum if non-empty.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        let total = self.block_count();
        if chunk.index >= total {
            return Err(TransferError::BlockOutOfRange {
                index: chunk.index,
                total,
            });
        }

        let offset = chunk.index as u64 * self.chunk_size as u64;
        let expected = (self.file_size - offset).min(self.chunk_size as u64) as usize;
        if chunk.data.len() != expected {
            return Err(TransferError::ChunkSize {
                index: chunk.index,
                got: chunk.data.len(),
                expected,
            });
        }

        if !chunk.checksum.is_empty() && checksum_bytes(&chunk.data) != chunk.checksum {
            return Err(TransferError::ChecksumMismatch(chunk.index));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&chunk.data)?;
        Ok(())
    }

    /// Flushes file contents to disk.
    pub fn sync(&mut self) -> Result<(), TransferError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Total number of chunks expected.
    pub fn block_count(&self) -> u32 {
        block_count(self.file_size, self.chunk_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"test content for checksum";
        let path = create_test_file(dir.path(), "test.bin", data);

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(data));
    }

    #[test]
    fn chunk_reader_reads_all() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert_eq!(reader.file_size(), 10);
        assert_eq!(reader.block_count(), 3);

        let c1 = reader.next_chunk().unwrap().unwrap();
        assert_eq!((c1.index, c1.offset), (0, 0));
        assert_eq!(&c1.data, b"AABB");
        assert!(!c1.checksum.is_empty());

        let c2 = reader.next_chunk().unwrap().unwrap();
        assert_eq!((c2.index, c2.offset), (1, 4));
        assert_eq!(&c2.data, b"CCDD");

        let c3 = reader.next_chunk().unwrap().unwrap();
        assert_eq!((c3.index, c3.offset), (2, 8));
        assert_eq!(&c3.data, b"EE");

        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn chunk_reader_resumes_at_block() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");

        let mut reader = ChunkReader::new(&path, 4).unwrap();
        reader.seek_to_block(1).unwrap();
        assert_eq!(reader.next_index(), 1);

        let c = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c.index, 1);
        assert_eq!(&c.data, b"4567");
    }

    #[test]
    fn chunk_reader_rejects_seek_past_end() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");
        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert!(matches!(
            reader.seek_to_block(4),
            Err(TransferError::BlockOutOfRange { index: 4, total: 3 })
        ));
        // Seeking exactly to the end is a completed transfer.
        reader.seek_to_block(3).unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn chunk_reader_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "empty.bin", b"");
        let mut reader = ChunkReader::new(&path, 0).unwrap();
        assert_eq!(reader.block_count(), 0);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn chunk_writer_writes_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut writer = ChunkWriter::open(&path, 11, 5).unwrap();

        let second = Chunk {
            index: 1,
            offset: 5,
            data: b" Worl".to_vec(),
            checksum: String::new(),
        };
        let first = Chunk {
            index: 0,
            offset: 0,
            data: b"Hello".to_vec(),
            checksum: checksum_bytes(b"Hello"),
        };
        let last = Chunk {
            index: 2,
            offset: 10,
            data: b"d".to_vec(),
            checksum: String::new(),
        };
        writer.write_chunk(&second).unwrap();
        writer.write_chunk(&first).unwrap();
        writer.write_chunk(&last).unwrap();
        writer.sync().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"Hello World");
    }

    #[test]
    fn chunk_writer_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/dir/file.txt");
        let mut writer = ChunkWriter::open(&path, 4, 4).unwrap();
        writer
            .write_chunk(&Chunk {
                index: 0,
                offset: 0,
                data: b"data".to_vec(),
                checksum: String::new(),
            })
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn chunk_writer_verifies_checksum() {
        let dir = TempDir::new().unwrap();
        let mut writer = ChunkWriter::open(&dir.path().join("bad.bin"), 9, 16).unwrap();
        let result = writer.write_chunk(&Chunk {
            index: 0,
            offset: 0,
            data: b"test data".to_vec(),
            checksum: "00".repeat(32),
        });
        assert!(matches!(result, Err(TransferError::ChecksumMismatch(0))));
    }

    #[test]
    fn chunk_writer_rejects_out_of_range_block() {
        let dir = TempDir::new().unwrap();
        let mut writer = ChunkWriter::open(&dir.path().join("x.bin"), 8, 4).unwrap();
        let result = writer.write_chunk(&Chunk {
            index: 2,
            offset: 8,
            data: b"zz".to_vec(),
            checksum: String::new(),
        });
        assert!(matches!(
            result,
            Err(TransferError::BlockOutOfRange { index: 2, total: 2 })
        ));
    }

    #[test]
    fn chunk_writer_keeps_existing_data_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.bin");
        {
            let mut w = ChunkWriter::open(&path, 8, 4).unwrap();
            w.write_chunk(&Chunk {
                index: 0,
                offset: 0,
                data: b"abcd".to_vec(),
                checksum: String::new(),
            })
            .unwrap();
        }
        let mut w = ChunkWriter::open(&path, 8, 4).unwrap();
        w.write_chunk(&Chunk {
            index: 1,
            offset: 4,
            data: b"efgh".to_vec(),
            checksum: String::new(),
        })
        .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
    }

    #[test]
    fn reader_writer_roundtrip() {
        let dir = TempDir::new().unwrap();
        let original = b"The quick brown fox jumps over the lazy dog";
        let src = create_test_file(dir.path(), "src.txt", original);
        let dst = dir.path().join("dst.txt");

        let mut reader = ChunkReader::new(&src, 10).unwrap();
        let mut writer = ChunkWriter::open(&dst, reader.file_size(), 10).unwrap();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            writer.write_chunk(&chunk).unwrap();
        }

        assert_eq!(std::fs::read(&dst).unwrap(), original);
    }
}
