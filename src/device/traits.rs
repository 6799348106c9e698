//! The disk backend contract.

use std::io;

/// Synchronous positioned access to one preallocated log file or partition.
///
/// At most one thread appends to a device at a time; positioned reads may
/// run in parallel with each other and with the appender (recovery relies on
/// this). Implementations for direct modes must reject unaligned access.
pub trait DiskDevice: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` at `offset`, overwriting existing bytes.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Write `buf` at the current tail and return the new tail offset.
    fn append(&self, buf: &[u8]) -> io::Result<u64>;

    /// Current tail offset (bytes appended so far).
    fn tail(&self) -> u64;

    /// Reset the tail to `offset` (used by circular logs).
    fn set_tail(&self, offset: u64);

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Preallocated capacity in bytes.
    fn capacity(&self) -> u64;

    /// Alignment requirement for offsets, lengths and buffer addresses.
    fn alignment(&self) -> usize {
        1
    }

    /// Flush and release the device. Idempotent; the second call is a no-op.
    fn close(&self) -> io::Result<()>;
}

/// Validate direct-I/O alignment of an access.
pub(crate) fn check_alignment(
    offset: u64,
    len: usize,
    addr: *const u8,
    alignment: usize,
) -> io::Result<()> {
    if alignment <= 1 {
        return Ok(());
    }
    let align = alignment as u64;
    if offset % align != 0 || len as u64 % align != 0 || addr as u64 % align != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "unaligned direct access: offset {offset}, len {len}, alignment {alignment}"
            ),
        ));
    }
    Ok(())
}
