//! Multi-producer single-consumer byte ring.
//!
//! Producers reserve disjoint regions with a compare-and-swap on the write
//! cursor, copy their entries in, then publish a descriptor. The drainer
//! pops descriptors, routes the referenced bytes and marks the regions
//! consumed; the read cursor advances over the contiguous consumed prefix,
//! which is what frees space for blocked producers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::error::{LogError, Result};
use crate::ids::RangeKey;
use crate::utility::AlignedBuffer;

/// Occupancy fraction that wakes the drainer eagerly.
const DRAIN_WATERMARK_DIVISOR: u64 = 4;

/// One published batch: a region of the ring holding exactly one
/// primary-format entry for `key`.
#[derive(Debug, Clone, Copy)]
pub struct BatchDescriptor {
    /// Range the entry belongs to.
    pub key: RangeKey,
    /// Absolute start position (monotonic, not wrapped).
    pub start: u64,
    /// Region length in bytes.
    pub len: u32,
}

/// The shared ingestion ring.
pub struct WriteBuffer {
    data: AlignedBuffer,
    capacity: u64,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    closed: AtomicBool,
    batches: SegQueue<BatchDescriptor>,
    space: Mutex<()>,
    space_cond: Condvar,
    work: Mutex<()>,
    work_cond: Condvar,
    consumed: Mutex<BTreeMap<u64, u64>>,
}

impl WriteBuffer {
    /// Allocate a ring of `capacity` bytes.
    pub fn new(capacity: u64, page_size: usize) -> Self {
        Self {
            data: AlignedBuffer::zeroed(page_size, capacity as usize).expect("ring allocation"),
            capacity,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            batches: SegQueue::new(),
            space: Mutex::new(()),
            space_cond: Condvar::new(),
            work: Mutex::new(()),
            work_cond: Condvar::new(),
            consumed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently reserved but not yet reclaimed.
    pub fn occupancy(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire) - self.read_pos.load(Ordering::Acquire)
    }

    /// Whether all published work has been consumed.
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0 && self.batches.is_empty()
    }

    /// The backing slice. Producers write through this into regions they
    /// reserved; the drainer reads regions that were published.
    ///
    /// Safety: reservation hands out disjoint regions, and a region is only
    /// read after its descriptor was published, so no byte is ever accessed
    /// mutably and shared at the same time.
    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_slice().as_ptr() as *mut u8,
                self.capacity as usize,
            )
        }
    }

    /// Read-only view of the ring for the drainer.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Reserve `len` bytes, blocking while the ring is too full. Fails with
    /// [`LogError::BufferFull`] if `len` exceeds the ring capacity and with
    /// [`LogError::Shutdown`] once the ring is closed.
    pub fn reserve(&self, len: u64) -> Result<u64> {
        if len > self.capacity {
            return Err(LogError::BufferFull);
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(LogError::Shutdown);
            }

            let read = self.read_pos.load(Ordering::Acquire);
            let current = self.write_pos.load(Ordering::Acquire);

            if current + len - read > self.capacity {
                // Bounded wait; the drainer signals when space is reclaimed.
                let mut guard = self.space.lock();
                if self.write_pos.load(Ordering::Acquire) + len
                    - self.read_pos.load(Ordering::Acquire)
                    > self.capacity
                    && !self.closed.load(Ordering::Acquire)
                {
                    self.space_cond
                        .wait_for(&mut guard, Duration::from_millis(10));
                }
                continue;
            }

            if self
                .write_pos
                .compare_exchange(current, current + len, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// Copy `bytes` into the ring at absolute position `pos` (wrapping).
    pub fn write(&self, pos: u64, bytes: &[u8]) {
        let data = self.data_mut();
        let offset = (pos % self.capacity) as usize;
        let until_end = self.capacity as usize - offset;
        if bytes.len() <= until_end {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        } else {
            data[offset..].copy_from_slice(&bytes[..until_end]);
            data[..bytes.len() - until_end].copy_from_slice(&bytes[until_end..]);
        }
    }

    /// Publish a copied region to the drainer.
    pub fn publish(&self, descriptor: BatchDescriptor) {
        self.batches.push(descriptor);
        if self.occupancy() >= self.capacity / DRAIN_WATERMARK_DIVISOR {
            self.signal_drain();
        }
    }

    /// Wake the drainer immediately (flush-now).
    pub fn signal_drain(&self) {
        let _guard = self.work.lock();
        self.work_cond.notify_all();
    }

    /// Drainer side: sleep until signaled or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        if !self.batches.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.work.lock();
        if self.batches.is_empty() && !self.closed.load(Ordering::Acquire) {
            self.work_cond.wait_for(&mut guard, timeout);
        }
    }

    /// Drainer side: take all currently published descriptors in order.
    pub fn pop_batches(&self) -> Vec<BatchDescriptor> {
        let mut batches = Vec::new();
        while let Some(descriptor) = self.batches.pop() {
            batches.push(descriptor);
        }
        batches
    }

    /// Drainer side: mark a region consumed and advance the read cursor
    /// over the contiguous consumed prefix.
    pub fn mark_consumed(&self, start: u64, len: u32) {
        let mut consumed = self.consumed.lock();
        consumed.insert(start, start + len as u64);

        let mut read = self.read_pos.load(Ordering::Acquire);
        while let Some((&first_start, &first_end)) = consumed.iter().next() {
            if first_start != read {
                break;
            }
            consumed.remove(&first_start);
            read = first_end;
        }
        self.read_pos.store(read, Ordering::Release);
        drop(consumed);

        let _guard = self.space.lock();
        self.space_cond.notify_all();
    }

    /// Block until every published byte has been consumed (or `timeout`).
    /// Returns whether the ring drained completely.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.space.lock();
        while !self.is_empty() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.space_cond.wait_for(&mut guard, deadline - now);
        }
        true
    }

    /// Close the ring: blocked producers fail with `Shutdown`, the drainer
    /// wakes to finish the remaining work.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let _guard = self.space.lock();
            self.space_cond.notify_all();
        }
        self.signal_drain();
    }

    /// Whether the ring is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
