use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Log-local sequence number. Gap-free and monotonically increasing per log.
pub type SeqId = u64;

/// Name of a task log (`webfarm`, `staging:<server>`).
pub type LogName = String;

/// Identity of the node that produced a task.
///
/// Receivers compare it against their own id to avoid re-applying their own changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generates a random UUID v4-based NodeId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identifier of a task group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskGroupId(pub String);

impl TaskGroupId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single typed value inside a [`TaskPayload`].
///
/// Externally tagged so that both JSON and bincode can carry it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// Schema-less structured payload: named, typed fields.
///
/// Field order is stable (sorted by name), which keeps encoded tasks byte-identical
/// across nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub fields: BTreeMap<String, FieldValue>,
}

impl TaskPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The atomic unit of propagation.
///
/// A `Task` is immutable once it has been appended to a log. Its delivery status
/// lives in the log, per destination, never in the task itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Sequence number assigned by the log on append.
    pub id: SeqId,
    /// Selects the handler on the receiving side (e.g. "clear-cache").
    pub task_type: String,
    /// Entity kind this task concerns, if any.
    pub object_type: Option<String>,
    /// Primary business data.
    pub payload: TaskPayload,
    /// Large content (files, blobs) kept out of the structured payload.
    pub binary_payload: Option<Vec<u8>>,
    /// Diagnostic label only.
    pub title: String,
    /// Timestamp (ms) when the change was captured.
    pub created_at: u64,
    pub source_node: NodeId,
    pub group: Option<TaskGroupId>,
}

impl Task {
    pub fn binary_len(&self) -> usize {
        self.binary_payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// A task that has not been appended yet.
///
/// Logging factories build drafts; the log stamps the sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub task_type: String,
    pub object_type: Option<String>,
    pub payload: TaskPayload,
    pub binary_payload: Option<Vec<u8>>,
    pub title: String,
    pub created_at: u64,
    pub source_node: Option<NodeId>,
    pub group: Option<TaskGroupId>,
}

impl TaskDraft {
    pub fn new(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        Self {
            title: task_type.clone(),
            task_type,
            object_type: None,
            payload: TaskPayload::new(),
            binary_payload: None,
            created_at: now_ms(),
            source_node: None,
            group: None,
        }
    }

    pub fn object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = Some(object_type.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(name, value);
        self
    }

    pub fn payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn binary(mut self, bytes: Vec<u8>) -> Self {
        self.binary_payload = Some(bytes);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn source(mut self, node: NodeId) -> Self {
        self.source_node = Some(node);
        self
    }

    pub fn group(mut self, group: TaskGroupId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Stamps the draft with its sequence number.
    ///
    /// Drafts without an explicit source are attributed to `local`.
    pub fn into_task(self, id: SeqId, local: &NodeId) -> Task {
        Task {
            id,
            task_type: self.task_type,
            object_type: self.object_type,
            payload: self.payload,
            binary_payload: self.binary_payload,
            title: self.title,
            created_at: self.created_at,
            source_node: self.source_node.unwrap_or_else(|| local.clone()),
            group: self.group,
        }
    }
}

impl From<&Task> for TaskDraft {
    fn from(task: &Task) -> Self {
        Self {
            task_type: task.task_type.clone(),
            object_type: task.object_type.clone(),
            payload: task.payload.clone(),
            binary_payload: task.binary_payload.clone(),
            title: task.title.clone(),
            created_at: task.created_at,
            source_node: Some(task.source_node.clone()),
            group: task.group.clone(),
        }
    }
}

/// Named batch of related staging tasks, replayed or cancelled as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub code_name: String,
    pub description: String,
    pub created_at: u64,
}

impl TaskGroup {
    pub fn new(code_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: TaskGroupId::new(),
            code_name: code_name.into(),
            description: description.into(),
            created_at: now_ms(),
        }
    }
}

/// What travels over the transport: the task plus the log it was drained from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub log: LogName,
    pub task: Task,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
