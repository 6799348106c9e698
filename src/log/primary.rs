//! The circular primary log.
//!
//! Small drained batches from many ranges are appended here back to back so
//! the SSD sees one sequential write stream. Entries are primary-format and
//! are never read back by recovery: the same bytes are fanned into the
//! per-range secondary buffers at drain time, and space is reclaimed as the
//! head laps the tail.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer_pool::PooledBuffer;
use crate::device::DiskDevice;
use crate::log::write_unaligned;

/// Circular byte log over one preallocated device.
pub struct PrimaryLog {
    device: Box<dyn DiskDevice>,
    capacity: u64,
    head: Mutex<u64>,
    bytes_written: AtomicU64,
}

impl PrimaryLog {
    /// Wrap `device` as a circular log.
    pub fn new(device: Box<dyn DiskDevice>) -> Self {
        let capacity = device.capacity();
        Self {
            device,
            capacity,
            head: Mutex::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Append `data` at the head, wrapping at the end of the device.
    /// A single writer (the drainer) calls this.
    pub fn append(&self, data: &[u8], scratch: &mut PooledBuffer) -> io::Result<()> {
        debug_assert!((data.len() as u64) <= self.capacity);

        let mut head = self.head.lock();
        let pos = *head % self.capacity;
        let until_end = (self.capacity - pos) as usize;

        if data.len() <= until_end {
            write_unaligned(&*self.device, pos, data, scratch)?;
        } else {
            write_unaligned(&*self.device, pos, &data[..until_end], scratch)?;
            write_unaligned(&*self.device, 0, &data[until_end..], scratch)?;
        }

        *head += data.len() as u64;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Total bytes ever appended.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Current fill fraction of the circular window, in percent.
    pub fn utilization_percent(&self) -> u64 {
        let written = self.bytes_written.load(Ordering::Relaxed);
        (written.min(self.capacity) * 100) / self.capacity
    }

    /// Log capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Flush outstanding writes.
    pub fn flush(&self) -> io::Result<()> {
        self.device.flush()
    }

    /// Flush and close the underlying device. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        self.device.close()
    }
}
