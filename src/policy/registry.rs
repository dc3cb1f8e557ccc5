//! Logging Policy Registry
//!
//! Decides, per object change, whether tasks should be produced and builds them.
//! Every policy whose predicate matches contributes its tasks (fan-out). A factory
//! that fails, or panics, loses only its own contribution.
//!
//! This is a pure decision/construction step: no I/O happens here.

use crate::task::types::{LogName, TaskDraft, TaskGroupId, TaskPayload};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// Describes one object mutation, as reported by the producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeContext {
    pub object_type: String,
    pub object_id: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub fields: TaskPayload,
    #[serde(default)]
    pub binary: Option<Vec<u8>>,
    /// Task group the producer is currently working in, if any.
    #[serde(default)]
    pub group: Option<TaskGroupId>,
}

impl ChangeContext {
    pub fn new(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        kind: ChangeKind,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            kind,
            fields: TaskPayload::new(),
            binary: None,
            group: None,
        }
    }

    pub fn with_fields(mut self, fields: TaskPayload) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn in_group(mut self, group: TaskGroupId) -> Self {
        self.group = Some(group);
        self
    }
}

pub type PolicyPredicate = Arc<dyn Fn(&ChangeContext) -> bool + Send + Sync>;
pub type TaskFactory = Arc<dyn Fn(&ChangeContext) -> anyhow::Result<Vec<TaskDraft>> + Send + Sync>;

struct LoggingPolicy {
    name: String,
    log: LogName,
    predicate: PolicyPredicate,
    factory: TaskFactory,
}

/// A task a policy wants appended to `log`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub policy: String,
    pub log: LogName,
    pub draft: TaskDraft,
}

#[derive(Default)]
pub struct LoggingPolicyRegistry {
    policies: RwLock<Vec<LoggingPolicy>>,
}

impl LoggingPolicyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a policy whose tasks go to `log`.
    ///
    /// # Arguments
    /// * `name` - Identifier used in diagnostics.
    /// * `predicate` - Decides whether the change is eligible.
    /// * `factory` - Builds zero or more tasks for an eligible change.
    pub fn register<P, F>(&self, name: &str, log: impl Into<LogName>, predicate: P, factory: F)
    where
        P: Fn(&ChangeContext) -> bool + Send + Sync + 'static,
        F: Fn(&ChangeContext) -> anyhow::Result<Vec<TaskDraft>> + Send + Sync + 'static,
    {
        let log = log.into();
        tracing::info!("Registered logging policy '{}' -> log '{}'", name, log);
        self.policies.write().push(LoggingPolicy {
            name: name.to_string(),
            log,
            predicate: Arc::new(predicate),
            factory: Arc::new(factory),
        });
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().len()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies
            .read()
            .iter()
            .map(|policy| policy.name.clone())
            .collect()
    }

    /// Runs every matching policy and collects the tasks they produce, in
    /// registration order.
    pub fn evaluate(&self, context: &ChangeContext) -> Vec<PlannedTask> {
        let policies: Vec<(String, LogName, PolicyPredicate, TaskFactory)> = self
            .policies
            .read()
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    p.log.clone(),
                    p.predicate.clone(),
                    p.factory.clone(),
                )
            })
            .collect();

        let mut planned = Vec::new();

        for (name, log, predicate, factory) in policies {
            let eligible = match std::panic::catch_unwind(AssertUnwindSafe(|| predicate(context))) {
                Ok(eligible) => eligible,
                Err(_) => {
                    tracing::error!(
                        "Logging policy '{}' predicate panicked for {} '{}'",
                        name,
                        context.object_type,
                        context.object_id
                    );
                    continue;
                }
            };
            if !eligible {
                continue;
            }

            let drafts = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(context))) {
                Ok(Ok(drafts)) => drafts,
                Ok(Err(e)) => {
                    tracing::error!(
                        "Logging policy '{}' failed for {} '{}': {}",
                        name,
                        context.object_type,
                        context.object_id,
                        e
                    );
                    continue;
                }
                Err(_) => {
                    tracing::error!(
                        "Logging policy '{}' panicked for {} '{}'",
                        name,
                        context.object_type,
                        context.object_id
                    );
                    continue;
                }
            };

            for mut draft in drafts {
                if draft.group.is_none() {
                    draft.group = context.group.clone();
                }
                planned.push(PlannedTask {
                    policy: name.clone(),
                    log: log.clone(),
                    draft,
                });
            }
        }

        tracing::debug!(
            "{} {} '{}' produced {} tasks",
            context.kind.as_str(),
            context.object_type,
            context.object_id,
            planned.len()
        );

        planned
    }
}
