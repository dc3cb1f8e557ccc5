use crate::task::types::{SeqId, Task};
use serde::{Deserialize, Serialize};

/// Delivery state of one task for one destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Appended, not attempted yet.
    Pending,
    /// Handed to the transport; outcome not known yet.
    InFlight,
    /// Delivered and applied by the destination. Terminal.
    Acknowledged,
    /// Last attempt failed; carries the number of failed attempts so far.
    Failed(u32),
    /// Given up on (retry ceiling, cancelled group, disabled destination). Terminal.
    Dead,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Acknowledged | DeliveryStatus::Dead)
    }
}

/// A task that reached `Dead`, kept for manual inspection and replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub destination: String,
    pub task: Task,
    pub retries: u32,
    pub reason: String,
    pub died_at: u64,
}

/// Per-destination status bookkeeping for one sequence number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct EntryState {
    pub status: DeliveryStatus,
    pub retries: u32,
}

/// Read-only view of a destination's backlog in one log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogDepth {
    pub log: String,
    pub destination: String,
    pub cursor: SeqId,
    /// Non-terminal tasks at or beyond the cursor.
    pub depth: usize,
    /// Age (ms) of the oldest task still waiting, if any.
    pub oldest_pending_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub tasks_removed: usize,
    pub dead_letters_removed: usize,
}

/// One durable mutation of a log. Replaying the records in order rebuilds the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JournalRecord {
    /// Written first by a compaction snapshot.
    Snapshot { next_seq: SeqId },
    Appended(Task),
    Subscribed { destination: String, cursor: SeqId },
    Unsubscribed { destination: String },
    Status {
        destination: String,
        seq: SeqId,
        status: DeliveryStatus,
        retries: u32,
    },
    DeadLettered(DeadLetter),
}
