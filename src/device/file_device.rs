//! Buffered file backend (`raf` mode).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::device::traits::DiskDevice;

/// A preallocated log file accessed through the page cache.
pub struct BufferedFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
    capacity: u64,
    tail: AtomicU64,
}

impl BufferedFile {
    /// Open or create `path` and preallocate it to `size` bytes.
    pub fn open(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            capacity: size,
            tail: AtomicU64::new(0),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => op(file),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "device is closed",
            )),
        }
    }
}

impl DiskDevice for BufferedFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)
        })
    }

    fn append(&self, buf: &[u8]) -> io::Result<u64> {
        let tail = self.tail.load(Ordering::Acquire);
        self.write_at(tail, buf)?;
        let new_tail = tail + buf.len() as u64;
        self.tail.store(new_tail, Ordering::Release);
        Ok(new_tail)
    }

    fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    fn set_tail(&self, offset: u64) {
        self.tail.store(offset, Ordering::Release);
    }

    fn flush(&self) -> io::Result<()> {
        self.with_file(|file| file.sync_all())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_preallocation_and_rw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffered.sec");

        let device = BufferedFile::open(&path, 64 * 1024).unwrap();
        assert_eq!(device.capacity(), 64 * 1024);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 1024);

        device.write_at(4096, b"chunk payload").unwrap();
        let mut buf = vec![0u8; 13];
        device.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"chunk payload");
    }

    #[test]
    fn test_append_tracks_tail() {
        let dir = tempdir().unwrap();
        let device = BufferedFile::open(dir.path().join("a.log"), 8192).unwrap();

        assert_eq!(device.tail(), 0);
        let tail = device.append(b"0123").unwrap();
        assert_eq!(tail, 4);
        let tail = device.append(b"4567").unwrap();
        assert_eq!(tail, 8);

        let mut buf = vec![0u8; 8];
        device.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"01234567");

        device.set_tail(0);
        assert_eq!(device.tail(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let device = BufferedFile::open(dir.path().join("b.log"), 4096).unwrap();

        device.close().unwrap();
        device.close().unwrap();
        assert!(device.read_at(0, &mut [0u8; 1]).is_err());
    }
}
