//! The write-buffer ingestion pipeline.
//!
//! Callers post chunk batches from many network threads; entries are
//! serialized in primary format into one shared byte ring ([`WriteBuffer`])
//! and a single drainer worker routes them onward: small sub-streams go
//! through the circular primary log and the per-range staging buffers, large
//! ones straight to their secondary log.

mod handler;
mod ring;

pub use handler::WriteBufferHandler;
pub use ring::{BatchDescriptor, WriteBuffer};
