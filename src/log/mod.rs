//! On-disk logs: the circular primary log and the per-range segmented
//! secondary logs with their staging buffers.

mod primary;
mod sec_buffer;
mod secondary;

pub use primary::PrimaryLog;
pub use sec_buffer::SecondaryLogBuffer;
pub use secondary::{AppendTarget, SecondaryLog, SegmentId, SegmentInfo, SegmentState};

use std::io;

use crate::buffer_pool::PooledBuffer;
use crate::device::DiskDevice;
use crate::utility::{align_down, align_up};

/// Write `data` at an arbitrary byte offset of a device that may require
/// page alignment.
///
/// For aligned devices the write is widened to page boundaries: the partial
/// leading page is read back, patched and rewritten, and the tail is
/// zero-padded. `scratch` must hold at least one page more than `data`.
pub(crate) fn write_unaligned(
    device: &dyn DiskDevice,
    offset: u64,
    data: &[u8],
    scratch: &mut PooledBuffer,
) -> io::Result<()> {
    let alignment = device.alignment();
    if alignment <= 1 {
        return device.write_at(offset, data);
    }

    let start = align_down(offset as usize, alignment) as u64;
    let lead = (offset - start) as usize;
    let total = align_up(lead + data.len(), alignment);
    debug_assert!(total <= scratch.len());

    let buf = scratch.as_mut_slice();
    if lead > 0 {
        device.read_at(start, &mut buf[..alignment])?;
    }
    buf[lead..lead + data.len()].copy_from_slice(data);
    buf[lead + data.len()..total].fill(0);

    device.write_at(start, &buf[..total])
}
