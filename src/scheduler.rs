//! Worker coordination.
//!
//! The scheduler mediates between the drainer and the reorganization worker
//! without holding references to either: it owns the command channel into
//! the reorganization thread, and the per-log exclusive tokens live on each
//! [`SecondaryLog`](crate::log::SecondaryLog) (`io_token`), held across one
//! buffer flush or one segment copy. A secondary log is therefore always in
//! one of three states: idle, being written, or being reorganized.
//!
//! Priorities: the drainer raises a high-priority request when a log runs
//! low on free segments; the reorganization worker preempts its low-priority
//! queue at segment boundaries when such a request arrives.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::ids::RangeKey;

/// Commands delivered to the reorganization worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgCommand {
    /// A log is short on space; compact it before anything else.
    HighPriority(RangeKey),
    /// Stop the worker.
    Shutdown,
}

/// Hands requests to the reorganization worker.
pub struct Scheduler {
    tx: Sender<ReorgCommand>,
}

impl Scheduler {
    /// Create a scheduler and the receiving end for the worker.
    pub fn channel() -> (Scheduler, Receiver<ReorgCommand>) {
        let (tx, rx) = unbounded();
        (Scheduler { tx }, rx)
    }

    /// Request urgent compaction of one range.
    pub fn request_high_priority(&self, key: RangeKey) {
        let _ = self.tx.send(ReorgCommand::HighPriority(key));
    }

    /// Ask the worker to stop after the current segment.
    pub fn request_shutdown(&self) {
        let _ = self.tx.send(ReorgCommand::Shutdown);
    }
}
