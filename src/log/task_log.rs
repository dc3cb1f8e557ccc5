//! Task Log
//!
//! A strictly ordered, append-only store of tasks for one destination class
//! (the web-farm broadcast log, or the outbound log of one staging server).
//!
//! ## Responsibilities
//! - **Append**: Stamps drafts with gap-free sequence numbers inside a single-writer
//!   section and journals them before returning.
//! - **Cursors**: Every subscribed destination drains the log independently; its
//!   cursor only moves past tasks that reached a terminal status.
//! - **Dead letters**: Tasks given up on are recorded for inspection and replay.
//! - **Compaction**: Tasks every destination has passed are garbage-collected and
//!   the journal is rewritten as a snapshot.

use super::journal::{Journal, MemoryJournal};
use super::types::*;
use crate::error::LogError;
use crate::task::types::{LogName, NodeId, SeqId, Task, TaskDraft, TaskGroupId, now_ms};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Where one destination stands in the log.
#[derive(Debug, Clone, Default)]
struct DestinationCursor {
    /// Lowest sequence number that is not terminal yet.
    cursor: SeqId,
    /// Status of every retained entry this destination has touched.
    /// Missing entries are `Pending` at/after the cursor and `Acknowledged` before it.
    entries: BTreeMap<SeqId, EntryState>,
}

impl DestinationCursor {
    fn starting_at(cursor: SeqId) -> Self {
        Self {
            cursor,
            entries: BTreeMap::new(),
        }
    }

    fn state(&self, seq: SeqId) -> EntryState {
        match self.entries.get(&seq) {
            Some(state) => *state,
            None if seq < self.cursor => EntryState {
                status: DeliveryStatus::Acknowledged,
                retries: 0,
            },
            None => EntryState {
                status: DeliveryStatus::Pending,
                retries: 0,
            },
        }
    }

    /// Moves the cursor past every terminal entry at its head.
    fn advance(&mut self, next_seq: SeqId) {
        while self.cursor < next_seq && self.state(self.cursor).status.is_terminal() {
            self.cursor += 1;
        }
    }
}

struct LogState {
    next_seq: SeqId,
    tasks: BTreeMap<SeqId, Task>,
    cursors: HashMap<String, DestinationCursor>,
    dead_letters: Vec<DeadLetter>,
    journal: Box<dyn Journal>,
}

impl LogState {
    fn empty(journal: Box<dyn Journal>) -> Self {
        Self {
            next_seq: 1,
            tasks: BTreeMap::new(),
            cursors: HashMap::new(),
            dead_letters: Vec::new(),
            journal,
        }
    }

    /// Applies a record to the in-memory state. Shared by live writes and replay.
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Snapshot { next_seq } => {
                self.next_seq = next_seq;
            }
            JournalRecord::Appended(task) => {
                self.next_seq = self.next_seq.max(task.id + 1);
                self.tasks.insert(task.id, task);
            }
            JournalRecord::Subscribed {
                destination,
                cursor,
            } => {
                self.cursors
                    .entry(destination)
                    .or_insert_with(|| DestinationCursor::starting_at(cursor));
            }
            JournalRecord::Unsubscribed { destination } => {
                self.cursors.remove(&destination);
            }
            JournalRecord::Status {
                destination,
                seq,
                status,
                retries,
            } => {
                if let Some(cursor) = self.cursors.get_mut(&destination) {
                    cursor.entries.insert(seq, EntryState { status, retries });
                }
            }
            JournalRecord::DeadLettered(letter) => {
                self.dead_letters.push(letter);
            }
        }
    }

    fn cursor(&self, log: &str, destination: &str) -> Result<&DestinationCursor, LogError> {
        self.cursors
            .get(destination)
            .ok_or_else(|| LogError::UnknownDestination {
                log: log.to_string(),
                destination: destination.to_string(),
            })
    }

    fn snapshot(&self) -> Vec<JournalRecord> {
        let mut records = vec![JournalRecord::Snapshot {
            next_seq: self.next_seq,
        }];

        for (destination, cursor) in &self.cursors {
            records.push(JournalRecord::Subscribed {
                destination: destination.clone(),
                cursor: cursor.cursor,
            });
        }
        for task in self.tasks.values() {
            records.push(JournalRecord::Appended(task.clone()));
        }
        for (destination, cursor) in &self.cursors {
            for (seq, state) in &cursor.entries {
                records.push(JournalRecord::Status {
                    destination: destination.clone(),
                    seq: *seq,
                    status: state.status,
                    retries: state.retries,
                });
            }
        }
        for letter in &self.dead_letters {
            records.push(JournalRecord::DeadLettered(letter.clone()));
        }

        records
    }
}

/// An ordered, durable log of tasks with per-destination delivery status.
pub struct TaskLog {
    name: LogName,
    local_node: NodeId,
    state: Mutex<LogState>,
    appended: watch::Sender<SeqId>,
}

impl TaskLog {
    /// Opens a log over `journal`, replaying whatever it already holds.
    ///
    /// Tasks that were `InFlight` when the process stopped come back as pending
    /// (or failed, if they had failed before), so they are delivered again.
    pub fn open(
        name: impl Into<LogName>,
        mut journal: Box<dyn Journal>,
        local_node: NodeId,
    ) -> Result<Arc<Self>, LogError> {
        let name = name.into();
        let records = journal.replay().map_err(|e| LogError::Journal {
            log: name.clone(),
            message: e.to_string(),
        })?;
        let record_count = records.len();

        let mut state = LogState::empty(journal);
        for record in records {
            state.apply(record);
        }

        let next_seq = state.next_seq;
        for cursor in state.cursors.values_mut() {
            cursor.advance(next_seq);
            for entry in cursor.entries.values_mut() {
                if entry.status == DeliveryStatus::InFlight {
                    entry.status = if entry.retries > 0 {
                        DeliveryStatus::Failed(entry.retries)
                    } else {
                        DeliveryStatus::Pending
                    };
                }
            }
        }

        if record_count > 0 {
            tracing::info!(
                "Recovered task log '{}' from {} journal records ({} tasks, next seq {})",
                name,
                record_count,
                state.tasks.len(),
                state.next_seq
            );
        }

        let (appended, _) = watch::channel(state.next_seq);

        Ok(Arc::new(Self {
            name,
            local_node,
            state: Mutex::new(state),
            appended,
        }))
    }

    /// A log backed by a fresh in-memory journal.
    pub fn in_memory(name: impl Into<LogName>, local_node: NodeId) -> Arc<Self> {
        let name = name.into();
        let state = LogState::empty(Box::new(MemoryJournal::new()));
        let (appended, _) = watch::channel(state.next_seq);

        Arc::new(Self {
            name,
            local_node,
            state: Mutex::new(state),
            appended,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn journal_error(&self, e: anyhow::Error) -> LogError {
        LogError::Journal {
            log: self.name.clone(),
            message: e.to_string(),
        }
    }

    fn out_of_order(&self, destination: &str, expected: SeqId, got: SeqId) -> LogError {
        LogError::OutOfOrder {
            log: self.name.clone(),
            destination: destination.to_string(),
            expected,
            got,
        }
    }

    /// Appends a task. Returns once the task is durable.
    pub fn append(&self, draft: TaskDraft) -> Result<SeqId, LogError> {
        let mut state = self.state.lock();

        let seq = state.next_seq;
        let task = draft.into_task(seq, &self.local_node);
        let record = JournalRecord::Appended(task);

        if let Err(e) = state.journal.append(&record) {
            tracing::error!("Task log '{}' failed to append seq {}: {}", self.name, seq, e);
            return Err(LogError::AppendFailed {
                log: self.name.clone(),
                message: e.to_string(),
            });
        }
        state.apply(record);
        drop(state);

        self.appended.send_replace(seq + 1);
        tracing::debug!("Appended task {} to log '{}'", seq, self.name);

        Ok(seq)
    }

    /// Signal that fires whenever a task is appended (value = next sequence number).
    pub fn watch_appends(&self) -> watch::Receiver<SeqId> {
        self.appended.subscribe()
    }

    /// Number of live append watchers, one per running dispatcher.
    pub fn watcher_count(&self) -> usize {
        self.appended.receiver_count()
    }

    /// Registers a destination. New destinations start at the log tail.
    ///
    /// Subscribing an existing destination is a no-op returning its cursor.
    pub fn subscribe(&self, destination: &str) -> Result<SeqId, LogError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.cursors.get(destination) {
            return Ok(existing.cursor);
        }

        let record = JournalRecord::Subscribed {
            destination: destination.to_string(),
            cursor: state.next_seq,
        };
        state
            .journal
            .append(&record)
            .map_err(|e| self.journal_error(e))?;
        let cursor = state.next_seq;
        state.apply(record);

        tracing::info!(
            "Destination '{}' subscribed to log '{}' at seq {}",
            destination,
            self.name,
            cursor
        );
        Ok(cursor)
    }

    /// Removes a destination, returning the tasks it still had to receive.
    pub fn unsubscribe(&self, destination: &str) -> Result<Vec<Task>, LogError> {
        let mut state = self.state.lock();
        let cursor = state.cursor(&self.name, destination)?.clone();

        let pending: Vec<Task> = state
            .tasks
            .range(cursor.cursor..)
            .filter(|(seq, _)| !cursor.state(**seq).status.is_terminal())
            .map(|(_, task)| task.clone())
            .collect();

        let record = JournalRecord::Unsubscribed {
            destination: destination.to_string(),
        };
        state
            .journal
            .append(&record)
            .map_err(|e| self.journal_error(e))?;
        state.apply(record);

        tracing::info!(
            "Destination '{}' unsubscribed from log '{}' with {} pending tasks",
            destination,
            self.name,
            pending.len()
        );
        Ok(pending)
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().cursors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn next_seq(&self) -> SeqId {
        self.state.lock().next_seq
    }

    /// Number of retained tasks (not yet garbage-collected).
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First retained task with `id >= cursor`. Does not move any cursor.
    pub fn peek_from(&self, cursor: SeqId) -> Option<Task> {
        self.state
            .lock()
            .tasks
            .range(cursor..)
            .next()
            .map(|(_, task)| task.clone())
    }

    pub fn cursor(&self, destination: &str) -> Result<SeqId, LogError> {
        Ok(self.state.lock().cursor(&self.name, destination)?.cursor)
    }

    /// The task at `destination`'s cursor and its status, if the destination
    /// has anything left to receive.
    pub fn head(&self, destination: &str) -> Result<Option<(Task, DeliveryStatus)>, LogError> {
        let state = self.state.lock();
        let cursor = state.cursor(&self.name, destination)?;

        Ok(state
            .tasks
            .get(&cursor.cursor)
            .map(|task| (task.clone(), cursor.state(cursor.cursor).status)))
    }

    pub fn status(&self, destination: &str, seq: SeqId) -> Result<DeliveryStatus, LogError> {
        let state = self.state.lock();
        Ok(state.cursor(&self.name, destination)?.state(seq).status)
    }

    /// Journals and applies a status change for the entry at the cursor.
    fn set_head_status(
        &self,
        state: &mut LogState,
        destination: &str,
        seq: SeqId,
        status: DeliveryStatus,
        retries: u32,
    ) -> Result<(), LogError> {
        let record = JournalRecord::Status {
            destination: destination.to_string(),
            seq,
            status,
            retries,
        };
        state
            .journal
            .append(&record)
            .map_err(|e| self.journal_error(e))?;
        state.apply(record);
        Ok(())
    }

    /// Checks that `seq` is at the destination's cursor and returns its state.
    fn head_state(
        &self,
        state: &LogState,
        destination: &str,
        seq: SeqId,
    ) -> Result<EntryState, LogError> {
        let cursor = state.cursor(&self.name, destination)?;
        if cursor.cursor != seq {
            return Err(self.out_of_order(destination, cursor.cursor, seq));
        }
        if !state.tasks.contains_key(&seq) {
            return Err(LogError::TaskNotFound {
                log: self.name.clone(),
                seq,
            });
        }
        Ok(cursor.state(seq))
    }

    /// Marks the head task as handed to the transport.
    ///
    /// Returns `false` when the entry already reached a terminal status (its
    /// group was cancelled in the meantime); the caller must not deliver it.
    pub fn mark_in_flight(&self, destination: &str, seq: SeqId) -> Result<bool, LogError> {
        let mut state = self.state.lock();
        let current = self.head_state(&state, destination, seq)?;
        if current.status.is_terminal() {
            return Ok(false);
        }
        self.set_head_status(
            &mut state,
            destination,
            seq,
            DeliveryStatus::InFlight,
            current.retries,
        )?;
        Ok(true)
    }

    /// Acknowledges the head task and advances the cursor.
    pub fn ack(&self, destination: &str, seq: SeqId) -> Result<(), LogError> {
        let mut state = self.state.lock();
        let current = self.head_state(&state, destination, seq)?;
        if current.status == DeliveryStatus::Dead {
            tracing::debug!(
                "Ack for dead task {} on '{}' ignored, advancing",
                seq,
                destination
            );
        } else {
            self.set_head_status(
                &mut state,
                destination,
                seq,
                DeliveryStatus::Acknowledged,
                current.retries,
            )?;
        }

        let next_seq = state.next_seq;
        if let Some(cursor) = state.cursors.get_mut(destination) {
            cursor.advance(next_seq);
        }
        Ok(())
    }

    /// Records a failed attempt on the head task and returns the new retry count.
    pub fn fail(&self, destination: &str, seq: SeqId) -> Result<u32, LogError> {
        let mut state = self.state.lock();
        let current = self.head_state(&state, destination, seq)?;
        if current.status.is_terminal() {
            return Ok(current.retries);
        }
        let retries = current.retries + 1;
        self.set_head_status(
            &mut state,
            destination,
            seq,
            DeliveryStatus::Failed(retries),
            retries,
        )?;
        Ok(retries)
    }

    /// Gives up on the head task: marks it `Dead`, records a dead letter and
    /// advances the cursor so the rest of the log is not blocked.
    pub fn mark_dead(&self, destination: &str, seq: SeqId, reason: &str) -> Result<(), LogError> {
        let mut state = self.state.lock();
        let current = self.head_state(&state, destination, seq)?;
        if current.status != DeliveryStatus::Dead {
            self.kill(&mut state, destination, seq, current.retries, reason)?;
        }

        let next_seq = state.next_seq;
        if let Some(cursor) = state.cursors.get_mut(destination) {
            cursor.advance(next_seq);
        }
        Ok(())
    }

    fn kill(
        &self,
        state: &mut LogState,
        destination: &str,
        seq: SeqId,
        retries: u32,
        reason: &str,
    ) -> Result<(), LogError> {
        self.set_head_status(state, destination, seq, DeliveryStatus::Dead, retries)?;

        let Some(task) = state.tasks.get(&seq).cloned() else {
            return Ok(());
        };
        let record = JournalRecord::DeadLettered(DeadLetter {
            destination: destination.to_string(),
            task,
            retries,
            reason: reason.to_string(),
            died_at: now_ms(),
        });
        state
            .journal
            .append(&record)
            .map_err(|e| self.journal_error(e))?;
        state.apply(record);

        tracing::error!(
            "Task {} on log '{}' is dead for '{}' after {} retries: {}",
            seq,
            self.name,
            destination,
            retries,
            reason
        );
        Ok(())
    }

    /// Skips terminal entries at the head (e.g. tasks of a cancelled group).
    pub fn advance(&self, destination: &str) -> Result<SeqId, LogError> {
        let mut state = self.state.lock();
        let next_seq = state.next_seq;
        let cursor = state
            .cursors
            .get_mut(destination)
            .ok_or_else(|| LogError::UnknownDestination {
                log: self.name.clone(),
                destination: destination.to_string(),
            })?;
        cursor.advance(next_seq);
        Ok(cursor.cursor)
    }

    /// Lazy, finite, restartable walk over `(task, status)` from `from`, as seen
    /// by `destination`.
    pub fn iterate(&self, destination: &str, from: SeqId) -> Result<LogIter<'_>, LogError> {
        self.state.lock().cursor(&self.name, destination)?;
        Ok(LogIter {
            log: self,
            destination: destination.to_string(),
            next: from,
        })
    }

    /// Marks every waiting task of `group` as `Dead` for every destination.
    ///
    /// Acknowledged tasks are left untouched and in-flight tasks complete normally.
    /// Cursors are not moved here; each dispatcher skips the dead entries itself.
    pub fn cancel_group(&self, group: &TaskGroupId) -> Result<usize, LogError> {
        let mut state = self.state.lock();

        let mut victims = Vec::new();
        for (destination, cursor) in &state.cursors {
            for (seq, task) in state.tasks.range(cursor.cursor..) {
                if task.group.as_ref() != Some(group) {
                    continue;
                }
                let entry = cursor.state(*seq);
                if entry.status.is_terminal() || entry.status == DeliveryStatus::InFlight {
                    continue;
                }
                victims.push((destination.clone(), *seq, entry.retries));
            }
        }

        for (destination, seq, retries) in &victims {
            self.kill(&mut state, destination, *seq, *retries, "task group cancelled")?;
        }

        if !victims.is_empty() {
            tracing::info!(
                "Cancelled {} pending deliveries of group {} on log '{}'",
                victims.len(),
                group,
                self.name
            );
        }
        Ok(victims.len())
    }

    /// Retained tasks belonging to `group`, in log order.
    pub fn tasks_in_group(&self, group: &TaskGroupId) -> Vec<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|task| task.group.as_ref() == Some(group))
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    /// Number of non-terminal tasks at or beyond the destination's cursor.
    pub fn depth(&self, destination: &str) -> Result<usize, LogError> {
        let state = self.state.lock();
        let cursor = state.cursor(&self.name, destination)?;
        Ok(state
            .tasks
            .range(cursor.cursor..)
            .filter(|(seq, _)| !cursor.state(**seq).status.is_terminal())
            .count())
    }

    /// Age (ms) of the oldest task the destination still has to receive.
    pub fn oldest_pending_age(&self, destination: &str, now: u64) -> Result<Option<u64>, LogError> {
        let state = self.state.lock();
        let cursor = state.cursor(&self.name, destination)?;
        Ok(state
            .tasks
            .range(cursor.cursor..)
            .find(|(seq, _)| !cursor.state(**seq).status.is_terminal())
            .map(|(_, task)| now.saturating_sub(task.created_at)))
    }

    pub fn stats(&self, destination: &str, now: u64) -> Result<LogDepth, LogError> {
        Ok(LogDepth {
            log: self.name.clone(),
            destination: destination.to_string(),
            cursor: self.cursor(destination)?,
            depth: self.depth(destination)?,
            oldest_pending_age_ms: self.oldest_pending_age(destination, now)?,
        })
    }

    /// Drops tasks every destination has moved past and dead letters older than
    /// `dead_retention`, then rewrites the journal as a snapshot.
    pub fn compact(&self, now: u64, dead_retention: Duration) -> Result<CompactionReport, LogError> {
        let mut state = self.state.lock();

        let low_water = state
            .cursors
            .values()
            .map(|cursor| cursor.cursor)
            .min()
            .unwrap_or(state.next_seq);

        let before_tasks = state.tasks.len();
        let retained = state.tasks.split_off(&low_water);
        state.tasks = retained;
        for cursor in state.cursors.values_mut() {
            let retained = cursor.entries.split_off(&low_water);
            cursor.entries = retained;
        }

        let retention_ms = dead_retention.as_millis() as u64;
        let before_letters = state.dead_letters.len();
        state
            .dead_letters
            .retain(|letter| now.saturating_sub(letter.died_at) < retention_ms);

        let report = CompactionReport {
            tasks_removed: before_tasks - state.tasks.len(),
            dead_letters_removed: before_letters - state.dead_letters.len(),
        };

        if report != CompactionReport::default() {
            let snapshot = state.snapshot();
            state
                .journal
                .rewrite(&snapshot)
                .map_err(|e| self.journal_error(e))?;
            tracing::info!(
                "Compacted log '{}': removed {} tasks and {} dead letters",
                self.name,
                report.tasks_removed,
                report.dead_letters_removed
            );
        }

        Ok(report)
    }
}

/// Iterator returned by [`TaskLog::iterate`]. Takes the lock once per item, so
/// producers are never blocked for the whole walk.
pub struct LogIter<'a> {
    log: &'a TaskLog,
    destination: String,
    next: SeqId,
}

impl Iterator for LogIter<'_> {
    type Item = (Task, DeliveryStatus);

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.log.state.lock();
        let cursor = state.cursors.get(&self.destination)?;
        let (seq, task) = state.tasks.range(self.next..).next()?;
        self.next = seq + 1;
        Some((task.clone(), cursor.state(*seq).status))
    }
}
