//! Log entry header codec.
//!
//! Two dialects share one Type byte: primary entries (written to the write
//! buffer and the primary log) additionally carry the range id and the
//! creator node id; secondary entries drop the range id and, unless the
//! entry is migrated, the node id as well. All field widths are derived from
//! the Type byte and the immutable [`CodecConfig`], so header size is a pure
//! function of the two — there is no virtual dispatch and no mutable global
//! state.
//!
//! Field order (all integers little-endian):
//!
//! ```text
//! primary:             Type | RangeID | NodeID | LocalID | Length | Timestamp | Epoch | Version | Chaining | Checksum
//! secondary, migrated: Type |          NodeID | LocalID | Length | Timestamp | Epoch | Version | Chaining | Checksum
//! secondary, default:  Type |                   LocalID | Length | Timestamp | Epoch | Version | Chaining | Checksum
//! ```
//!
//! Keeping RangeID and NodeID directly behind the Type byte makes the
//! primary-to-secondary conversion a single tail copy starting at the NodeID
//! offset (migrated) or the LocalID offset (default).
//!
//! Headers are read and written with explicit offsets only; a parse never
//! moves a cursor, so one buffer can be scanned from many threads. Buffers
//! that wrap (the write buffer ring) are handled through [`RingView`] and
//! its `bytes_until_end` invariant.

mod checksum;
mod codec;
mod convert;

pub use checksum::{add_checksum, payload_crc, payload_crc_view, verify_checksum};
pub use codec::{parse, serialize_primary, EntryInfo, EntrySpec, HeaderBuf, RingView};
pub use convert::{convert_to_secondary, conversion_offset, converted_size};

use crate::config::CodecConfig;

/// Largest possible header: primary dialect, 6-byte LocalID, 3-byte length,
/// 4-byte version, timestamp, chaining and checksum all present (30 bytes),
/// rounded up.
pub const MAX_HEADER_SIZE: usize = 32;

/// Dialect of a serialized header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Write buffer and primary log format.
    Primary,
    /// Secondary log format (migrated-ness encoded in the Type byte).
    Secondary,
}

/// Chain position of one part of a split chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    /// Zero-based index of this part.
    pub index: u8,
    /// Total number of parts in the chain.
    pub count: u8,
}

pub(crate) const MIGRATED_FLAG: u8 = 0x01;
pub(crate) const CHAIN_FLAG: u8 = 0x80;

const LID_SHIFT: u32 = 1;
const LEN_SHIFT: u32 = 3;
const VER_SHIFT: u32 = 5;
const SELECTOR_MASK: u8 = 0b11;

const RID_SIZE: usize = 2;
const NID_SIZE: usize = 2;
const EPOCH_SIZE: usize = 2;
const CHAIN_SIZE: usize = 2;

#[inline]
pub(crate) fn lid_width(type_byte: u8) -> usize {
    match (type_byte >> LID_SHIFT) & SELECTOR_MASK {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 6,
    }
}

#[inline]
pub(crate) fn lid_selector(local_id: u64) -> u8 {
    if local_id < 1 << 8 {
        0
    } else if local_id < 1 << 16 {
        1
    } else if local_id < 1 << 32 {
        2
    } else {
        3
    }
}

#[inline]
pub(crate) fn len_width(type_byte: u8) -> usize {
    ((type_byte >> LEN_SHIFT) & SELECTOR_MASK) as usize
}

#[inline]
pub(crate) fn len_selector(payload_len: u32) -> u8 {
    debug_assert!(payload_len < 1 << 24);
    if payload_len < 1 << 8 {
        1
    } else if payload_len < 1 << 16 {
        2
    } else {
        3
    }
}

#[inline]
pub(crate) fn ver_width(type_byte: u8) -> usize {
    match (type_byte >> VER_SHIFT) & SELECTOR_MASK {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 4,
    }
}

#[inline]
pub(crate) fn ver_selector(version: u32) -> u8 {
    if version == 1 {
        0
    } else if version < 1 << 8 {
        1
    } else if version < 1 << 16 {
        2
    } else {
        3
    }
}

/// Assemble a Type byte from its components.
#[inline]
pub(crate) fn make_type_byte(
    migrated: bool,
    lid_sel: u8,
    len_sel: u8,
    ver_sel: u8,
    chained: bool,
) -> u8 {
    let mut type_byte = 0u8;
    if migrated {
        type_byte |= MIGRATED_FLAG;
    }
    type_byte |= (lid_sel & SELECTOR_MASK) << LID_SHIFT;
    type_byte |= (len_sel & SELECTOR_MASK) << LEN_SHIFT;
    type_byte |= (ver_sel & SELECTOR_MASK) << VER_SHIFT;
    if chained {
        type_byte |= CHAIN_FLAG;
    }
    type_byte
}

/// Derived field offsets of one header. Offsets of absent fields point at
/// where the field would start; their width is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Offset of the NodeID field, if the dialect/variant carries one.
    pub nid_offset: Option<usize>,
    /// Offset of the LocalID field.
    pub lid_offset: usize,
    /// Offset of the length field.
    pub len_offset: usize,
    /// Offset of the timestamp field.
    pub tsp_offset: usize,
    /// Offset of the epoch field.
    pub epoch_offset: usize,
    /// Offset of the version counter field.
    pub ver_offset: usize,
    /// Offset of the chaining pair.
    pub chain_offset: usize,
    /// Offset of the checksum field.
    pub crc_offset: usize,
    /// Total header size in bytes.
    pub header_size: usize,
}

/// Compute the layout of a header from its Type byte.
pub fn layout(dialect: Dialect, type_byte: u8, codec: &CodecConfig) -> HeaderLayout {
    let migrated = type_byte & MIGRATED_FLAG != 0;

    let (nid_offset, lid_offset) = match dialect {
        Dialect::Primary => (Some(1 + RID_SIZE), 1 + RID_SIZE + NID_SIZE),
        Dialect::Secondary if migrated => (Some(1), 1 + NID_SIZE),
        Dialect::Secondary => (None, 1),
    };

    let len_offset = lid_offset + lid_width(type_byte);
    let tsp_offset = len_offset + len_width(type_byte);
    let epoch_offset = tsp_offset + codec.timestamp_size as usize;
    let ver_offset = epoch_offset + EPOCH_SIZE;
    let chain_offset = ver_offset + ver_width(type_byte);
    let crc_offset = if type_byte & CHAIN_FLAG != 0 {
        chain_offset + CHAIN_SIZE
    } else {
        chain_offset
    };
    let header_size = crc_offset + codec.checksum_size as usize;

    HeaderLayout {
        nid_offset,
        lid_offset,
        len_offset,
        tsp_offset,
        epoch_offset,
        ver_offset,
        chain_offset,
        crc_offset,
        header_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(checksums: bool, timestamps: bool) -> CodecConfig {
        CodecConfig {
            segment_size: 8 << 20,
            flash_page_size: 4096,
            timestamp_size: if timestamps { 4 } else { 0 },
            checksum_size: if checksums { 4 } else { 0 },
        }
    }

    #[test]
    fn test_selectors_roundtrip() {
        for (value, sel, width) in [(0u64, 0u8, 1), (255, 0, 1), (256, 1, 2), (1 << 20, 2, 4)] {
            assert_eq!(lid_selector(value), sel);
            let type_byte = make_type_byte(false, sel, 1, 0, false);
            assert_eq!(lid_width(type_byte), width);
        }
        assert_eq!(lid_selector(1 << 40), 3);
        assert_eq!(lid_width(make_type_byte(false, 3, 1, 0, false)), 6);

        assert_eq!(len_selector(64), 1);
        assert_eq!(len_selector(300), 2);
        assert_eq!(len_selector(1 << 20), 3);

        assert_eq!(ver_selector(1), 0);
        assert_eq!(ver_selector(2), 1);
        assert_eq!(ver_selector(300), 2);
        assert_eq!(ver_selector(1 << 20), 3);
    }

    #[test]
    fn test_type_byte_flags() {
        let type_byte = make_type_byte(true, 2, 1, 3, true);
        assert!(type_byte & MIGRATED_FLAG != 0);
        assert!(type_byte & CHAIN_FLAG != 0);
        assert_eq!(lid_width(type_byte), 4);
        assert_eq!(len_width(type_byte), 1);
        assert_eq!(ver_width(type_byte), 4);
    }

    #[test]
    fn test_layout_primary_vs_secondary() {
        let codec = codec(true, false);
        let type_byte = make_type_byte(false, 0, 1, 0, false);

        let prim = layout(Dialect::Primary, type_byte, &codec);
        assert_eq!(prim.nid_offset, Some(3));
        assert_eq!(prim.lid_offset, 5);
        // 1 type + 2 rid + 2 nid + 1 lid + 1 len + 0 tsp + 2 epoch + 0 ver + 4 crc
        assert_eq!(prim.header_size, 13);

        let sec = layout(Dialect::Secondary, type_byte, &codec);
        assert_eq!(sec.nid_offset, None);
        assert_eq!(sec.lid_offset, 1);
        assert_eq!(sec.header_size, 9);

        let migrated = make_type_byte(true, 0, 1, 0, false);
        let sec_mig = layout(Dialect::Secondary, migrated, &codec);
        assert_eq!(sec_mig.nid_offset, Some(1));
        assert_eq!(sec_mig.lid_offset, 3);
        assert_eq!(sec_mig.header_size, 11);
    }

    #[test]
    fn test_layout_full_width_fits_max() {
        let codec = codec(true, true);
        let type_byte = make_type_byte(true, 3, 3, 3, true);
        let prim = layout(Dialect::Primary, type_byte, &codec);
        // 1 + 2 + 2 + 6 + 3 + 4 + 2 + 4 + 2 + 4
        assert_eq!(prim.header_size, 30);
        assert!(prim.header_size <= MAX_HEADER_SIZE);
    }

    #[test]
    fn test_timestamp_shifts_epoch() {
        let with = layout(
            Dialect::Secondary,
            make_type_byte(false, 0, 1, 0, false),
            &codec(false, true),
        );
        let without = layout(
            Dialect::Secondary,
            make_type_byte(false, 0, 1, 0, false),
            &codec(false, false),
        );
        assert_eq!(with.epoch_offset, without.epoch_offset + 4);
    }
}
