//! Disk access layer.
//!
//! All log and version files are reached through the [`DiskDevice`] trait,
//! which offers positioned reads and writes plus tail-tracked appends. Three
//! backends implement it:
//!
//! - [`BufferedFile`]: ordinary file I/O through the page cache (`raf`)
//! - [`DirectFile`]: `O_DIRECT` file access; offsets, lengths and buffer
//!   addresses must be flash-page aligned (`dir`)
//! - [`RawDevice`]: direct access to a raw partition (`raw`); requires the
//!   device to be prepared by the operator beforehand
//!
//! The factory [`open_device`] picks the backend from the configured
//! [`DiskAccessMode`].

mod direct_device;
mod file_device;
mod traits;

use std::io;
use std::path::Path;

use crate::config::DiskAccessMode;

pub use direct_device::{DirectFile, RawDevice};
pub use file_device::BufferedFile;
pub use traits::DiskDevice;

/// Open a device for `path`, preallocated to `size` bytes, using the
/// configured access mode. `page_size` is the alignment direct modes enforce.
pub fn open_device(
    mode: DiskAccessMode,
    path: &Path,
    size: u64,
    page_size: usize,
) -> io::Result<Box<dyn DiskDevice>> {
    match mode {
        DiskAccessMode::Raf => Ok(Box::new(BufferedFile::open(path, size)?)),
        DiskAccessMode::Dir => Ok(Box::new(DirectFile::open(path, size, page_size)?)),
        DiskAccessMode::Raw => Ok(Box::new(RawDevice::open(path, size, page_size)?)),
    }
}
