//! Built-in web-farm handlers
//!
//! Each farm node keeps named in-memory cache groups plus a session table. Peers
//! never ship data here, only instructions to drop local state so that the next
//! read goes back to the shared store.

use super::registry::{RegistryError, TaskHandlerRegistry};
use crate::task::types::{FieldValue, Task};

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Named cache groups and the session table of one node.
#[derive(Default)]
pub struct LocalCaches {
    groups: DashMap<String, DashMap<String, FieldValue>>,
    sessions: DashMap<String, String>,
}

impl LocalCaches {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, group: &str, key: &str, value: impl Into<FieldValue>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, group: &str, key: &str) -> Option<FieldValue> {
        self.groups
            .get(group)
            .and_then(|entries| entries.get(key).map(|value| value.value().clone()))
    }

    pub fn group_len(&self, group: &str) -> usize {
        self.groups.get(group).map(|entries| entries.len()).unwrap_or(0)
    }

    /// Removes one key from a group. Returns whether it was present.
    pub fn clear_key(&self, group: &str, key: &str) -> bool {
        self.groups
            .get(group)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Empties a group. Returns the number of entries dropped.
    pub fn clear_group(&self, group: &str) -> usize {
        self.groups
            .remove(group)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }

    pub fn clear_all(&self) -> usize {
        let dropped = self.groups.iter().map(|entries| entries.len()).sum();
        self.groups.clear();
        dropped
    }

    pub fn open_session(&self, session_id: &str, user: &str) {
        self.sessions.insert(session_id.to_string(), user.to_string());
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drops every session of `user`. Returns the number removed.
    pub fn remove_user_sessions(&self, user: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, owner| owner != user);
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn required_text<'a>(task: &'a Task, field: &str) -> Result<&'a str> {
    task.payload.text(field).ok_or_else(|| {
        anyhow::anyhow!(
            "task {} ({}) is missing text field '{}'",
            task.id,
            task.task_type,
            field
        )
    })
}

fn clear_cache(caches: &LocalCaches, task: &Task) -> Result<()> {
    let group = required_text(task, "cache")?;
    match task.payload.text("key") {
        Some(key) => {
            caches.clear_key(group, key);
            tracing::debug!("Cleared cache key {}/{}", group, key);
        }
        None => {
            let dropped = caches.clear_group(group);
            tracing::debug!("Cleared cache group {} ({} entries)", group, dropped);
        }
    }
    Ok(())
}

fn invalidate_object(caches: &LocalCaches, task: &Task) -> Result<()> {
    let object_type = required_text(task, "object_type")?;
    let object_id = required_text(task, "object_id")?;
    caches.clear_key(object_type, object_id);
    tracing::debug!("Invalidated {} '{}'", object_type, object_id);
    Ok(())
}

fn remove_session(caches: &LocalCaches, task: &Task) -> Result<()> {
    if let Some(session_id) = task.payload.text("session_id") {
        caches.remove_session(session_id);
        return Ok(());
    }
    if let Some(user) = task.payload.text("user") {
        caches.remove_user_sessions(user);
        return Ok(());
    }
    anyhow::bail!(
        "task {} (remove-session) names neither 'session_id' nor 'user'",
        task.id
    )
}

/// Registers `clear-cache`, `clear-all-caches`, `invalidate-object` and
/// `remove-session` over `caches`.
pub fn register_farm_handlers(
    registry: &TaskHandlerRegistry,
    caches: Arc<LocalCaches>,
) -> Result<(), RegistryError> {
    let c = caches.clone();
    registry.register("clear-cache", move |task| {
        let caches = c.clone();
        async move { clear_cache(&caches, &task) }
    })?;

    let c = caches.clone();
    registry.register("clear-all-caches", move |_task| {
        let caches = c.clone();
        async move {
            let dropped = caches.clear_all();
            tracing::debug!("Cleared all caches ({} entries)", dropped);
            Ok(())
        }
    })?;

    let c = caches.clone();
    registry.register("invalidate-object", move |task| {
        let caches = c.clone();
        async move { invalidate_object(&caches, &task) }
    })?;

    registry.register("remove-session", move |task| {
        let caches = caches.clone();
        async move { remove_session(&caches, &task) }
    })?;

    Ok(())
}
