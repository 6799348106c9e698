//! Payload checksums.
//!
//! CRC-32 over payload bytes only; the header itself is not covered. A
//! mismatch during recovery or reorganization marks the entry as corrupt and
//! skips it, it is never fatal.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::header::codec::{EntryInfo, RingView};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a contiguous payload.
pub fn payload_crc(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// CRC-32 of a possibly wrapped payload range.
pub fn payload_crc_view(view: &RingView<'_>, start: usize, len: usize) -> u32 {
    let (first, second) = view.slices(start, len);
    let mut digest = CRC32.digest();
    digest.update(first);
    digest.update(second);
    digest.finalize()
}

/// Compute the payload CRC of the entry at `entry_offset` in a contiguous
/// buffer and write it at the header's checksum offset. Returns the CRC.
pub fn add_checksum(
    buf: &mut [u8],
    entry_offset: usize,
    header_size: usize,
    payload_len: usize,
    crc_offset: usize,
) -> u32 {
    let payload_start = entry_offset + header_size;
    let crc = payload_crc(&buf[payload_start..payload_start + payload_len]);
    buf[entry_offset + crc_offset..entry_offset + crc_offset + 4]
        .copy_from_slice(&crc.to_le_bytes());
    crc
}

/// Verify the payload of a parsed entry whose header starts at logical
/// offset 0 of `view`. Entries without a stored checksum verify trivially.
pub fn verify_checksum(view: &RingView<'_>, info: &EntryInfo) -> bool {
    match info.checksum {
        Some(stored) => {
            payload_crc_view(view, info.header_size(), info.payload_len() as usize) == stored
        }
        None => true,
    }
}
