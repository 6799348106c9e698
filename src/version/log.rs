//! On-disk version log: a flat sequence of `(cid, epoch, version)` records.

use std::io;
use std::path::{Path, PathBuf};

use crate::device::{BufferedFile, DiskDevice};
use crate::ids::{ChunkId, Version};

/// Size of one serialized version record: cid (8) + epoch (2) + counter (4).
pub const VERSION_RECORD_SIZE: usize = 14;

/// Append-only version log.
///
/// Version records are tiny and latency-insensitive, so the log always uses
/// buffered file access regardless of the configured mode for data logs.
pub struct VersionLog {
    device: BufferedFile,
    path: PathBuf,
}

impl VersionLog {
    /// Open or create the version log at `path`. The append tail resumes at
    /// the end of the existing records.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existing = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let device = BufferedFile::open(&path, 0)?;
        device.set_tail(existing);
        Ok(Self { device, path })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of version records.
    pub fn append_batch(&self, records: &[(ChunkId, Version)]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(records.len() * VERSION_RECORD_SIZE);
        for (cid, version) in records {
            buf.extend_from_slice(&cid.raw().to_le_bytes());
            buf.extend_from_slice(&version.epoch.to_le_bytes());
            buf.extend_from_slice(&version.version.to_le_bytes());
        }
        self.device.append(&buf)?;
        Ok(())
    }

    /// Read every record in log order. A trailing partial record (torn
    /// write) is ignored.
    pub fn read_all(&self) -> io::Result<Vec<(ChunkId, Version)>> {
        let len = self.device.tail() as usize;
        let whole = len - len % VERSION_RECORD_SIZE;
        if whole == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; whole];
        self.device.read_at(0, &mut buf)?;

        let mut records = Vec::with_capacity(whole / VERSION_RECORD_SIZE);
        for record in buf.chunks_exact(VERSION_RECORD_SIZE) {
            let cid = ChunkId::from_raw(u64::from_le_bytes(record[..8].try_into().unwrap()));
            let epoch = u16::from_le_bytes(record[8..10].try_into().unwrap());
            let version = u32::from_le_bytes(record[10..14].try_into().unwrap());
            records.push((cid, Version::new(epoch, version)));
        }
        Ok(records)
    }

    /// Fsync the log.
    pub fn flush(&self) -> io::Result<()> {
        self.device.flush()
    }

    /// Flush and close the log file.
    pub fn close(&self) -> io::Result<()> {
        self.device.close()
    }

    /// Close and delete the backing file.
    pub fn delete(self) -> io::Result<()> {
        self.device.close()?;
        std::fs::remove_file(&self.path)
    }
}
