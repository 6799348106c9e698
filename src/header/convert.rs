//! In-place conversion of primary entries to secondary format.
//!
//! A primary entry becomes a secondary entry by keeping its Type byte and
//! copying everything from the conversion offset onward: the NodeID offset
//! for migrated entries (the secondary header keeps the creator node id) or
//! the LocalID offset otherwise (the node id is implied by the log's owner).
//! The payload is carried over verbatim. The source may wrap; the copy
//! handles the entry lying entirely before the wrap, bisected by it, or
//! starting past it.

use crate::header::codec::RingView;
use crate::header::MIGRATED_FLAG;

const PRIMARY_NID_OFFSET: usize = 3;
const PRIMARY_LID_OFFSET: usize = 5;

/// Logical offset within a primary entry where the secondary copy starts.
#[inline]
pub fn conversion_offset(type_byte: u8) -> usize {
    if type_byte & MIGRATED_FLAG != 0 {
        PRIMARY_NID_OFFSET
    } else {
        PRIMARY_LID_OFFSET
    }
}

/// Size of the secondary entry produced from a primary entry of
/// `entry_size` bytes (header plus payload).
#[inline]
pub fn converted_size(type_byte: u8, entry_size: usize) -> usize {
    entry_size - conversion_offset(type_byte) + 1
}

/// Convert the primary entry at the start of `view` into secondary format,
/// writing into `out`. `entry_size` is the primary header plus payload size.
/// Returns the number of bytes written.
pub fn convert_to_secondary(view: &RingView<'_>, entry_size: usize, out: &mut [u8]) -> usize {
    let type_byte = view.byte(0);
    let conv = conversion_offset(type_byte);
    let out_len = converted_size(type_byte, entry_size);
    debug_assert!(out.len() >= out_len);

    out[0] = type_byte;
    view.copy_to(conv, &mut out[1..out_len]);
    out_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::header::codec::{parse, serialize_primary, EntrySpec};
    use crate::header::{payload_crc, Dialect};
    use crate::ids::{ChunkId, Version};

    fn codec() -> CodecConfig {
        CodecConfig {
            segment_size: 8 << 20,
            flash_page_size: 4096,
            timestamp_size: 0,
            checksum_size: 4,
        }
    }

    fn primary_entry(cid: ChunkId, range_owner: u16, payload: &[u8]) -> Vec<u8> {
        let spec = EntrySpec {
            cid,
            range_id: 11,
            range_owner,
            payload_len: payload.len() as u32,
            version: Version::new(0, 3),
            timestamp: 0,
            chain: None,
            checksum: Some(payload_crc(payload)),
        };
        let header = serialize_primary(&spec, &codec());
        let mut entry = header.as_slice().to_vec();
        entry.extend_from_slice(payload);
        entry
    }

    fn check_converted(secondary: &[u8], cid: ChunkId, owner: u16, payload: &[u8]) {
        let codec = codec();
        let view = RingView::contiguous(secondary, 0);
        let info = parse(Dialect::Secondary, &view, &codec, owner)
            .unwrap()
            .unwrap();
        assert_eq!(info.cid, cid);
        assert_eq!(info.range_id, 0);
        assert_eq!(info.length, Some(payload.len() as u32));
        assert_eq!(info.version, Version::new(0, 3));
        assert_eq!(info.checksum, Some(payload_crc(payload)));
        assert_eq!(
            &secondary[info.header_size()..info.entry_size()],
            payload,
            "payload must be carried verbatim"
        );
    }

    #[test]
    fn test_convert_local_drops_rid_and_nid() {
        let cid = ChunkId::new(2, 0x0505);
        let payload = vec![0x5u8; 64];
        let entry = primary_entry(cid, 2, &payload);

        let mut out = vec![0u8; entry.len()];
        let view = RingView::contiguous(&entry, 0);
        let written = convert_to_secondary(&view, entry.len(), &mut out);

        assert_eq!(written, entry.len() - 4); // rid (2) + nid (2) dropped
        check_converted(&out[..written], cid, 2, &payload);
    }

    #[test]
    fn test_convert_migrated_keeps_nid() {
        let cid = ChunkId::new(2, 0x0505);
        let payload = vec![0x7u8; 32];
        let entry = primary_entry(cid, 9, &payload); // owner 9 != creator 2

        let mut out = vec![0u8; entry.len()];
        let view = RingView::contiguous(&entry, 0);
        let written = convert_to_secondary(&view, entry.len(), &mut out);

        assert_eq!(written, entry.len() - 2); // only rid dropped
        // Context owner must be ignored for migrated entries.
        check_converted(&out[..written], cid, 0xFFFF, &payload);
    }

    fn place_in_ring(ring: &mut [u8], offset: usize, entry: &[u8]) {
        for (i, byte) in entry.iter().enumerate() {
            let pos = (offset + i) % ring.len();
            ring[pos] = *byte;
        }
    }

    #[test]
    fn test_convert_entry_bisected_at_wrap() {
        let cid = ChunkId::new(3, 0xBEEF);
        let payload: Vec<u8> = (0u8..50).collect();
        let entry = primary_entry(cid, 3, &payload);

        let mut ring = vec![0u8; 128];
        // Wrap point lands inside the header.
        let offset = 128 - 4;
        place_in_ring(&mut ring, offset, &entry);

        let mut out = vec![0u8; entry.len()];
        let view = RingView::wrapping(&ring, offset);
        let written = convert_to_secondary(&view, entry.len(), &mut out);
        check_converted(&out[..written], cid, 3, &payload);
    }

    #[test]
    fn test_convert_start_past_wrap() {
        let cid = ChunkId::new(3, 0xBEEF);
        let payload: Vec<u8> = (0u8..50).collect();
        let entry = primary_entry(cid, 3, &payload);

        let mut ring = vec![0u8; 128];
        // The entry begins exactly at the wrap point, so every byte the
        // conversion copies lies past it.
        let offset = 128;
        place_in_ring(&mut ring, offset, &entry);

        let mut out = vec![0u8; entry.len()];
        let view = RingView::wrapping(&ring, offset);
        let written = convert_to_secondary(&view, entry.len(), &mut out);
        check_converted(&out[..written], cid, 3, &payload);
    }

    #[test]
    fn test_convert_wrap_inside_payload() {
        let cid = ChunkId::new(3, 0x22);
        let payload: Vec<u8> = (0u8..80).collect();
        let entry = primary_entry(cid, 3, &payload);

        let mut ring = vec![0u8; 128];
        let offset = 100; // header fits, payload crosses the wrap
        place_in_ring(&mut ring, offset, &entry);

        let mut out = vec![0u8; entry.len()];
        let view = RingView::wrapping(&ring, offset);
        let written = convert_to_secondary(&view, entry.len(), &mut out);
        check_converted(&out[..written], cid, 3, &payload);
    }
}
