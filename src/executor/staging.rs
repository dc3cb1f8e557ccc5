//! Built-in staging handlers
//!
//! A staging target keeps its own copy of every staged object. Changes are
//! applied last-writer-wins on `(created_at, source_node, seq)`; deletes leave a
//! tombstone so that a late, older upsert cannot resurrect the object.

use super::registry::{RegistryError, TaskHandlerRegistry};
use crate::task::types::{FieldValue, NodeId, SeqId, Task};

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordering key of a staged write.
///
/// Fields compare in declaration order. `seq` orders writes from one source that
/// share a millisecond; the log delivers them in sequence order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub created_at: u64,
    pub source: String,
    pub seq: SeqId,
}

impl Version {
    pub fn of(task: &Task) -> Self {
        Self::new(task.created_at, &task.source_node, task.id)
    }

    pub fn new(created_at: u64, source: &NodeId, seq: SeqId) -> Self {
        Self {
            created_at,
            source: source.0.clone(),
            seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedObject {
    pub fields: BTreeMap<String, FieldValue>,
    pub binary: Option<Vec<u8>>,
    pub version: Version,
}

#[derive(Debug, Clone)]
enum Slot {
    Live(StagedObject),
    Tombstone(Version),
}

impl Slot {
    fn version(&self) -> &Version {
        match self {
            Slot::Live(object) => &object.version,
            Slot::Tombstone(version) => version,
        }
    }
}

#[derive(Default)]
pub struct StagedObjectStore {
    objects: DashMap<(String, String), Slot>,
}

impl StagedObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `object` unless a newer write is already present.
    ///
    /// Returns whether the store changed.
    pub fn upsert(&self, object_type: &str, object_id: &str, object: StagedObject) -> bool {
        let version = object.version.clone();
        self.write(object_type, object_id, version, Slot::Live(object))
    }

    /// Replaces the object with a tombstone unless a newer write is present.
    pub fn delete(&self, object_type: &str, object_id: &str, version: Version) -> bool {
        self.write(object_type, object_id, version.clone(), Slot::Tombstone(version))
    }

    fn write(&self, object_type: &str, object_id: &str, version: Version, slot: Slot) -> bool {
        match self
            .objects
            .entry((object_type.to_string(), object_id.to_string()))
        {
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
            Entry::Occupied(mut occupied) => {
                if version > *occupied.get().version() {
                    occupied.insert(slot);
                    true
                } else {
                    tracing::debug!(
                        "Ignoring older write to {} '{}' (version {}/{})",
                        object_type,
                        object_id,
                        version.created_at,
                        version.seq
                    );
                    false
                }
            }
        }
    }

    /// Live object, `None` when absent or deleted.
    pub fn get(&self, object_type: &str, object_id: &str) -> Option<StagedObject> {
        let key = (object_type.to_string(), object_id.to_string());
        match self.objects.get(&key).as_deref() {
            Some(Slot::Live(object)) => Some(object.clone()),
            _ => None,
        }
    }

    pub fn is_tombstoned(&self, object_type: &str, object_id: &str) -> bool {
        let key = (object_type.to_string(), object_id.to_string());
        matches!(self.objects.get(&key).as_deref(), Some(Slot::Tombstone(_)))
    }

    pub fn live_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .count()
    }
}

fn object_id(task: &Task) -> Result<&str> {
    let object_id = task
        .payload
        .text("object_id")
        .ok_or_else(|| anyhow::anyhow!("task {} is missing 'object_id'", task.id))?;
    Ok(object_id)
}

fn object_type(task: &Task) -> Result<&str> {
    task.object_type
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("task {} has no object type", task.id))
}

fn upsert_object(store: &StagedObjectStore, task: &Task) -> Result<()> {
    let object_type = object_type(task)?;
    let object_id = object_id(task)?;
    let fields = match task.payload.get("fields") {
        Some(FieldValue::Map(fields)) => fields.clone(),
        None => BTreeMap::new(),
        Some(other) => anyhow::bail!(
            "task {} carries non-map 'fields' value {:?}",
            task.id,
            other
        ),
    };

    let changed = store.upsert(
        object_type,
        object_id,
        StagedObject {
            fields,
            binary: task.binary_payload.clone(),
            version: Version::of(task),
        },
    );
    tracing::debug!("Upsert {} '{}' applied={}", object_type, object_id, changed);
    Ok(())
}

fn delete_object(store: &StagedObjectStore, task: &Task) -> Result<()> {
    let object_type = object_type(task)?;
    let object_id = object_id(task)?;
    let changed = store.delete(object_type, object_id, Version::of(task));
    tracing::debug!("Delete {} '{}' applied={}", object_type, object_id, changed);
    Ok(())
}

/// Registers `upsert-object` and `delete-object` over `store`.
pub fn register_staging_handlers(
    registry: &TaskHandlerRegistry,
    store: Arc<StagedObjectStore>,
) -> Result<(), RegistryError> {
    let s = store.clone();
    registry.register("upsert-object", move |task| {
        let store = s.clone();
        async move { upsert_object(&store, &task) }
    })?;

    registry.register("delete-object", move |task| {
        let store = store.clone();
        async move { delete_object(&store, &task) }
    })?;

    Ok(())
}
