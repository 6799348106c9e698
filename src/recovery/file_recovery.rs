//! Standalone recovery from a secondary log file.
//!
//! Used when the engine that wrote the log is gone: no catalog entry, no
//! version log. Current versions are derived from the entries themselves in
//! a first pass (the highest version of each chunk wins), then surviving
//! entries are collected in a second pass.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

use crate::config::CodecConfig;
use crate::error::Result;
use crate::header::{parse, verify_checksum, ChainInfo, Dialect, EntryInfo, RingView};
use crate::ids::{ChunkId, Version};
use crate::recovery::{RecoveredChunk, RecoveryMetadata};

#[derive(Default)]
struct WalkStats {
    checksum_errors: u64,
    corrupt_segments: u64,
}

/// Walk all whole entries in one segment buffer.
fn walk_segment(
    data: &[u8],
    codec: &CodecConfig,
    owner: u16,
    stats: &mut WalkStats,
    mut visit: impl FnMut(&EntryInfo, &[u8]),
) {
    let mut offset = 0usize;
    while offset < data.len() {
        let view = RingView::contiguous(data, offset);
        let info = match parse(Dialect::Secondary, &view, codec, owner) {
            Ok(Some(info)) => info,
            Ok(None) => break,
            Err(_) => {
                stats.corrupt_segments += 1;
                break;
            }
        };

        let size = info.entry_size();
        if offset + size > data.len() {
            stats.corrupt_segments += 1;
            break;
        }

        if !verify_checksum(&view, &info) {
            stats.checksum_errors += 1;
            offset += size;
            continue;
        }

        visit(&info, &data[offset + info.header_size()..offset + size]);
        offset += size;
    }
}

/// Owner node id encoded in a `<owner>_<range>.sec` file name; 0 when the
/// name does not follow the layout.
fn owner_from_filename(path: &Path) -> u16 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.split('_').next())
        .and_then(|owner| u16::from_str_radix(owner, 16).ok())
        .unwrap_or(0)
}

struct FileChain {
    version: Version,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Recover all surviving chunks from a standalone secondary log file.
pub fn recover_from_file(
    path: impl AsRef<Path>,
    codec: &CodecConfig,
) -> Result<(RecoveryMetadata, Vec<RecoveredChunk>)> {
    let path = path.as_ref();
    let owner = owner_from_filename(path);
    let start = Instant::now();

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let segment_size = codec.segment_size as u64;
    let segment_count = file_len.div_ceil(segment_size) as usize;

    let mut read_segment = |file: &mut File, index: usize| -> Result<Vec<u8>> {
        let offset = index as u64 * segment_size;
        let len = segment_size.min(file_len - offset) as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    };

    // Pass 1: the highest version seen per chunk is its current version.
    let mut current: HashMap<ChunkId, Version> = HashMap::new();
    let mut throwaway = WalkStats::default();
    for index in 0..segment_count {
        let data = read_segment(&mut file, index)?;
        walk_segment(&data, codec, owner, &mut throwaway, |info, _| {
            current
                .entry(info.cid)
                .and_modify(|version| *version = (*version).max(info.version))
                .or_insert(info.version);
        });
    }

    // Pass 2: collect entries at their current version, assembling chains.
    let mut stats = WalkStats::default();
    let mut chains: HashMap<ChunkId, FileChain> = HashMap::new();
    let mut emitted: HashMap<ChunkId, Version> = HashMap::new();
    let mut chunks: Vec<RecoveredChunk> = Vec::new();

    for index in 0..segment_count {
        let data = read_segment(&mut file, index)?;
        walk_segment(&data, codec, owner, &mut stats, |info, payload| {
            if info.version < current[&info.cid] {
                return;
            }

            let complete = match info.chain {
                None => Some(payload.to_vec()),
                Some(ChainInfo { index, count }) => {
                    let slot = chains.entry(info.cid).or_insert_with(|| FileChain {
                        version: info.version,
                        parts: vec![None; count as usize],
                        received: 0,
                    });
                    if info.version > slot.version {
                        *slot = FileChain {
                            version: info.version,
                            parts: vec![None; count as usize],
                            received: 0,
                        };
                    }
                    let index = index as usize;
                    if index < slot.parts.len() && slot.parts[index].is_none() {
                        slot.received += 1;
                        slot.parts[index] = Some(payload.to_vec());
                    }
                    if slot.received == slot.parts.len() {
                        let slot = chains.remove(&info.cid).expect("slot present");
                        let mut assembled = Vec::new();
                        for part in slot.parts {
                            assembled.extend_from_slice(&part.expect("complete chain"));
                        }
                        Some(assembled)
                    } else {
                        None
                    }
                }
            };

            if let Some(payload) = complete {
                match emitted.get(&info.cid) {
                    Some(version) if *version >= info.version => {}
                    _ => {
                        emitted.insert(info.cid, info.version);
                        chunks.push(RecoveredChunk {
                            cid: info.cid,
                            version: info.version,
                            payload,
                        });
                    }
                }
            }
        });
    }

    let dangling: u64 = chains.values().map(|slot| slot.received as u64).sum();
    if dangling > 0 {
        tracing::warn!(path = %path.display(), parts = dangling,
            "incomplete chains discarded during file recovery");
    }

    let metadata = RecoveryMetadata {
        chunks: chunks.len() as u64,
        bytes: chunks.iter().map(|c| c.payload.len() as u64).sum(),
        first_cid: chunks.iter().map(|c| c.cid).min(),
        last_cid: chunks.iter().map(|c| c.cid).max(),
        checksum_errors: stats.checksum_errors,
        corrupt_segments: stats.corrupt_segments,
        dangling_chain_parts: dangling,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    Ok((metadata, chunks))
}
