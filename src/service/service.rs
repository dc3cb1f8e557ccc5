//! Sync Service
//!
//! Wires the registries, task logs, health tracker and transport together and
//! exposes the producer contract (`on_change`) plus the administrative actions.
//!
//! ## Lifecycle
//! 1. Construct with [`SyncComponents`] and [`ServiceSettings`].
//! 2. Open logs and add destinations (subscribing them to logs).
//! 3. `start()` spawns one dispatcher per (log, destination), the probe loop,
//!    the compaction loop and the health-event listener.

use crate::dispatch::dispatcher::{DispatchSettings, Dispatcher};
use crate::dispatch::transport::Transport;
use crate::error::{LogError, SyncError, SyncResult};
use crate::health::probe::{Prober, spawn_probe_loop};
use crate::health::tracker::HealthTracker;
use crate::health::types::{Destination, DestinationKind, HealthState};
use crate::hooks::registry::{HookOutcome, HookRegistry, HookSubject};
use crate::log::journal::FileJournal;
use crate::log::task_log::TaskLog;
use crate::log::types::{DeadLetter, LogDepth};
use crate::policy::registry::{ChangeContext, LoggingPolicyRegistry};
use crate::task::types::{LogName, NodeId, SeqId, Task, TaskDraft, TaskGroup, TaskGroupId, now_ms};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub dispatch: DispatchSettings,
    pub probe_interval: Duration,
    pub compact_interval: Duration,
    /// How long dead letters are kept for inspection and replay.
    pub dead_retention: Duration,
    /// Directory of the file journals. `None` keeps every log in memory.
    pub journal_dir: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            probe_interval: Duration::from_secs(10),
            compact_interval: Duration::from_secs(60),
            dead_retention: Duration::from_secs(7 * 24 * 3600),
            journal_dir: None,
        }
    }
}

/// The collaborators a service is built from.
pub struct SyncComponents {
    pub policies: Arc<LoggingPolicyRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub tracker: Arc<HealthTracker>,
    pub transport: Arc<dyn Transport>,
    pub prober: Arc<dyn Prober>,
}

/// What happens to the pending tasks of a removed destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RemovalPolicy {
    Discard,
    /// Re-append the still-pending tasks to another log.
    Reassign { log: LogName },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendedTask {
    pub log: LogName,
    pub seq: SeqId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationStats {
    pub name: String,
    pub display_name: String,
    pub kind: DestinationKind,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub logs: Vec<LogDepth>,
    pub dead: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub log: LogName,
    pub dead: DeadLetter,
}

pub struct SyncService {
    local_node: NodeId,
    components: SyncComponents,
    settings: ServiceSettings,
    logs: Arc<DashMap<LogName, Arc<TaskLog>>>,
    groups: DashMap<TaskGroupId, TaskGroup>,
    dispatchers: DashMap<(LogName, String), JoinHandle<()>>,
    wakers: Arc<DashMap<String, Arc<Notify>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncService {
    pub fn new(
        local_node: NodeId,
        components: SyncComponents,
        settings: ServiceSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            components,
            settings,
            logs: Arc::new(DashMap::new()),
            groups: DashMap::new(),
            dispatchers: DashMap::new(),
            wakers: Arc::new(DashMap::new()),
            background: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.components.tracker
    }

    pub fn policies(&self) -> &Arc<LoggingPolicyRegistry> {
        &self.components.policies
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.components.hooks
    }

    // --- Logs ---

    /// Opens (or returns the already open) log `name`, replaying its journal
    /// when the service is configured with a journal directory.
    pub fn open_log(&self, name: &str) -> SyncResult<Arc<TaskLog>> {
        match self.logs.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let log = match &self.settings.journal_dir {
                    Some(dir) => {
                        let path = dir.join(journal_file_name(name));
                        let journal = FileJournal::open(&path).map_err(|e| LogError::Journal {
                            log: name.to_string(),
                            message: e.to_string(),
                        })?;
                        TaskLog::open(name, Box::new(journal), self.local_node.clone())?
                    }
                    None => TaskLog::in_memory(name, self.local_node.clone()),
                };
                tracing::info!("Opened task log '{}'", name);
                vacant.insert(log.clone());
                Ok(log)
            }
        }
    }

    /// Adds a log opened elsewhere (e.g. over a custom journal).
    pub fn attach_log(&self, log: Arc<TaskLog>) {
        tracing::info!("Attached task log '{}'", log.name());
        self.logs.insert(log.name().to_string(), log);
    }

    pub fn log(&self, name: &str) -> Option<Arc<TaskLog>> {
        self.logs.get(name).map(|log| log.value().clone())
    }

    pub fn log_names(&self) -> Vec<LogName> {
        let mut names: Vec<LogName> = self.logs.iter().map(|log| log.key().clone()).collect();
        names.sort();
        names
    }

    // --- Producer contract ---

    /// Runs the logging policies for one change and appends the resulting tasks.
    ///
    /// Policy failures are isolated and logged. An append failure is returned:
    /// the caller must not assume the change was propagated.
    pub fn on_change(&self, context: &ChangeContext) -> SyncResult<Vec<AppendedTask>> {
        let hooks = &self.components.hooks;
        let mut appended = Vec::new();

        for planned in self.components.policies.evaluate(context) {
            let subject = HookSubject::LogTask {
                context,
                log: &planned.log,
                draft: &planned.draft,
            };
            let decision = hooks.run_before(&subject);
            if !decision.proceed {
                tracing::debug!(
                    "Hook cancelled '{}' task from policy '{}'",
                    planned.draft.task_type,
                    planned.policy
                );
                hooks.run_after(&subject, HookOutcome::CANCEL);
                continue;
            }

            let log = self.open_log(&planned.log)?;
            let seq = log.append(planned.draft.clone()).map_err(|e| {
                tracing::error!(
                    "Change to {} '{}' could not be logged: {}",
                    context.object_type,
                    context.object_id,
                    e
                );
                e
            })?;
            hooks.run_after(&subject, decision);

            appended.push(AppendedTask {
                log: planned.log.clone(),
                seq,
            });
        }

        Ok(appended)
    }

    // --- Destinations ---

    /// Registers `destination` with the health tracker and subscribes it to `logs`.
    ///
    /// Adding a known destination to further logs is allowed; re-adding it with a
    /// different address or kind is not.
    pub fn add_destination(&self, destination: Destination, logs: &[LogName]) -> SyncResult<()> {
        if let Some(existing) = self.components.tracker.health(&destination.name)
            && (existing.destination.url != destination.url
                || existing.destination.kind != destination.kind)
        {
            return Err(SyncError::DuplicateDestination(destination.name));
        }

        self.components.tracker.register(destination.clone());
        self.wakers
            .entry(destination.name.clone())
            .or_insert_with(|| Arc::new(Notify::new()));

        for name in logs {
            let log = self.open_log(name)?;
            log.subscribe(&destination.name)?;
            if self.started.load(Ordering::SeqCst) {
                self.spawn_dispatcher(&log, &destination);
            }
        }

        tracing::info!(
            "Destination '{}' ({}) receives logs {:?}",
            destination.name,
            destination.url,
            logs
        );
        Ok(())
    }

    /// Unsubscribes `name` from every log and forgets it.
    ///
    /// Returns the number of still-pending tasks that were discarded or reassigned.
    pub fn remove_destination(&self, name: &str, policy: RemovalPolicy) -> SyncResult<usize> {
        let target = match &policy {
            RemovalPolicy::Discard => None,
            RemovalPolicy::Reassign { log } => Some(
                self.log(log)
                    .ok_or_else(|| SyncError::UnknownLog(log.clone()))?,
            ),
        };

        let subscribed: Vec<Arc<TaskLog>> = self
            .logs
            .iter()
            .filter(|log| log.destinations().iter().any(|d| d == name))
            .map(|log| log.value().clone())
            .collect();

        if subscribed.is_empty() && self.components.tracker.health(name).is_none() {
            return Err(SyncError::UnknownDestination(name.to_string()));
        }

        let mut pending: Vec<Task> = Vec::new();
        for log in &subscribed {
            if let Some((_, handle)) = self.dispatchers.remove(&(log.name().to_string(), name.to_string())) {
                handle.abort();
            }
            pending.extend(log.unsubscribe(name)?);
        }

        if let Some(target) = &target {
            for task in &pending {
                target.append(TaskDraft::from(task))?;
            }
            tracing::info!(
                "Reassigned {} pending tasks of '{}' to log '{}'",
                pending.len(),
                name,
                target.name()
            );
        } else if !pending.is_empty() {
            tracing::warn!("Discarded {} pending tasks of removed destination '{}'", pending.len(), name);
        }

        self.components.tracker.remove(name);
        self.wakers.remove(name);
        Ok(pending.len())
    }

    pub fn enable_destination(&self, name: &str) -> SyncResult<()> {
        if !self.components.tracker.enable(name) {
            return Err(SyncError::UnknownDestination(name.to_string()));
        }
        if let Some(waker) = self.wakers.get(name) {
            waker.notify_waiters();
        }
        Ok(())
    }

    pub fn disable_destination(&self, name: &str) -> SyncResult<()> {
        if !self.components.tracker.disable(name) {
            return Err(SyncError::UnknownDestination(name.to_string()));
        }
        Ok(())
    }

    /// Health and backlog of every destination.
    pub fn destination_stats(&self) -> Vec<DestinationStats> {
        let now = now_ms();
        let mut dead_per_destination: BTreeMap<String, usize> = BTreeMap::new();
        for log in self.logs.iter() {
            for letter in log.dead_letters() {
                *dead_per_destination.entry(letter.destination).or_default() += 1;
            }
        }

        let mut stats: Vec<DestinationStats> = self
            .components
            .tracker
            .snapshot()
            .into_iter()
            .map(|health| {
                let name = health.destination.name.clone();
                let logs = self
                    .logs
                    .iter()
                    .filter_map(|log| log.stats(&name, now).ok())
                    .collect();
                DestinationStats {
                    dead: dead_per_destination.get(&name).copied().unwrap_or(0),
                    display_name: health.destination.display_name,
                    kind: health.destination.kind,
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    last_error: health.last_error,
                    logs,
                    name,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> = self
            .logs
            .iter()
            .flat_map(|log| {
                let name = log.key().clone();
                log.dead_letters()
                    .into_iter()
                    .map(move |dead| DeadLetterEntry {
                        log: name.clone(),
                        dead,
                    })
            })
            .collect();
        entries.sort_by_key(|entry| entry.dead.died_at);
        entries
    }

    // --- Task groups ---

    pub fn create_group(&self, code_name: &str, description: &str) -> TaskGroup {
        let group = TaskGroup::new(code_name, description);
        self.groups.insert(group.id.clone(), group.clone());
        tracing::info!("Created task group '{}' ({})", group.code_name, group.id);
        group
    }

    pub fn group(&self, id: &TaskGroupId) -> Option<TaskGroup> {
        self.groups.get(id).map(|group| group.value().clone())
    }

    pub fn groups(&self) -> Vec<TaskGroup> {
        let mut groups: Vec<TaskGroup> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by_key(|group| group.created_at);
        groups
    }

    /// Marks every waiting task of the group dead on every log.
    pub fn cancel_group(&self, id: &TaskGroupId) -> SyncResult<usize> {
        self.ensure_group(id)?;
        let mut cancelled = 0;
        for log in self.all_logs() {
            cancelled += log.cancel_group(id)?;
        }
        Ok(cancelled)
    }

    /// Re-appends the group's tasks still held by each log, plus its dead-lettered
    /// tasks, as new tasks. Handlers are idempotent, so destinations that already
    /// applied a task are unaffected.
    pub fn replay_group(&self, id: &TaskGroupId) -> SyncResult<usize> {
        self.ensure_group(id)?;
        let mut replayed = 0;

        for log in self.all_logs() {
            let mut tasks: BTreeMap<SeqId, Task> = log
                .tasks_in_group(id)
                .into_iter()
                .map(|task| (task.id, task))
                .collect();
            for letter in log.dead_letters() {
                if letter.task.group.as_ref() == Some(id) {
                    tasks.entry(letter.task.id).or_insert(letter.task);
                }
            }

            for task in tasks.values() {
                log.append(TaskDraft::from(task))?;
                replayed += 1;
            }
        }

        tracing::info!("Replayed {} tasks of group {}", replayed, id);
        Ok(replayed)
    }

    fn ensure_group(&self, id: &TaskGroupId) -> SyncResult<()> {
        if self.groups.contains_key(id) {
            Ok(())
        } else {
            Err(SyncError::UnknownGroup(id.clone()))
        }
    }

    fn all_logs(&self) -> Vec<Arc<TaskLog>> {
        self.logs.iter().map(|log| log.value().clone()).collect()
    }

    // --- Background work ---

    /// Spawns dispatchers and background loops. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for log in self.all_logs() {
            for name in log.destinations() {
                match self.components.tracker.health(&name) {
                    Some(health) => self.spawn_dispatcher(&log, &health.destination),
                    None => tracing::warn!(
                        "Log '{}' has subscriber '{}' with no registered destination",
                        log.name(),
                        name
                    ),
                }
            }
        }

        let mut background = self.background.lock();
        background.push(spawn_probe_loop(
            self.components.tracker.clone(),
            self.components.prober.clone(),
            self.settings.probe_interval,
        ));
        background.push(self.spawn_compaction_loop());
        background.push(self.spawn_health_listener());

        tracing::info!(
            "Sync service started on node {} ({} dispatchers)",
            self.local_node,
            self.dispatchers.len()
        );
    }

    /// Stops every dispatcher and background loop.
    pub fn shutdown(&self) {
        for entry in self.dispatchers.iter() {
            entry.value().abort();
        }
        self.dispatchers.clear();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Sync service stopped");
    }

    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    fn spawn_dispatcher(&self, log: &Arc<TaskLog>, destination: &Destination) {
        let key = (log.name().to_string(), destination.name.clone());
        // One worker per (log, destination) pair.
        let Entry::Vacant(slot) = self.dispatchers.entry(key) else {
            return;
        };

        let wake = self
            .wakers
            .entry(destination.name.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        let handle = Dispatcher::new(
            log.clone(),
            destination.clone(),
            self.components.tracker.clone(),
            self.components.transport.clone(),
            self.settings.dispatch.clone(),
        )
        .with_wake(wake)
        .spawn();

        slot.insert(handle);
    }

    fn spawn_compaction_loop(&self) -> JoinHandle<()> {
        let logs = self.logs.clone();
        let interval = self.settings.compact_interval;
        let retention = self.settings.dead_retention;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let open: Vec<Arc<TaskLog>> = logs.iter().map(|log| log.value().clone()).collect();
                for log in open {
                    if let Err(e) = log.compact(now_ms(), retention) {
                        tracing::error!("Compaction of log '{}' failed: {}", log.name(), e);
                    }
                }
            }
        })
    }

    /// Wakes a destination's dispatchers as soon as it becomes healthy again.
    fn spawn_health_listener(&self) -> JoinHandle<()> {
        let mut events = self.components.tracker.subscribe();
        let wakers = self.wakers.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::debug!(
                            "Health event for '{}': {:?} -> {:?}",
                            event.destination,
                            event.from,
                            event.to
                        );
                        if event.to == HealthState::Healthy
                            && let Some(waker) = wakers.get(&event.destination)
                        {
                            waker.notify_waiters();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Health listener missed {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// File name of a log's journal. Bytes other than ASCII alphanumerics and `-` are
/// written as `_xx` hex escapes, so distinct log names never share a file.
pub fn journal_file_name(log: &str) -> String {
    let mut name = String::with_capacity(log.len() + 8);
    for byte in log.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name.push_str(".journal");
    name
}
