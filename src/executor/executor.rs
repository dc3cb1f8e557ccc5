//! Local Task Executor
//!
//! Applies a received task on this node: loop prevention, staleness check,
//! apply hooks, handler lookup, then the handler itself under a timeout.
//!
//! ## Outcomes
//! Everything except a failing or timed-out handler counts as success for the
//! sender. Unknown task types are acknowledged so newer peers can talk to older
//! ones.

use super::registry::TaskHandlerRegistry;
use crate::hooks::registry::{HookOutcome, HookRegistry, HookSubject};
use crate::task::types::{NodeId, Task, now_ms};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// No handler for the task type; acknowledged without effect.
    UnknownType,
    /// The task originated on this node.
    OwnTask,
    /// Older than the configured maximum task age.
    Stale,
    /// A before-apply hook vetoed the task.
    Cancelled,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("handler for '{task_type}' failed: {message}")]
    HandlerFailed { task_type: String, message: String },

    #[error("handler for '{task_type}' timed out after {timeout_ms}ms")]
    TimedOut { task_type: String, timeout_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub apply_timeout: Duration,
    pub max_task_age: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(30),
            max_task_age: None,
        }
    }
}

pub struct LocalTaskExecutor {
    local_node: NodeId,
    handlers: Arc<TaskHandlerRegistry>,
    hooks: Arc<HookRegistry>,
    settings: ExecutorSettings,
}

impl LocalTaskExecutor {
    pub fn new(
        local_node: NodeId,
        handlers: Arc<TaskHandlerRegistry>,
        hooks: Arc<HookRegistry>,
        settings: ExecutorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            handlers,
            hooks,
            settings,
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn handlers(&self) -> &Arc<TaskHandlerRegistry> {
        &self.handlers
    }

    pub async fn apply(&self, task: &Task) -> Result<ApplyOutcome, ApplyError> {
        if task.source_node == self.local_node {
            tracing::debug!("Skipping own task {} ({})", task.id, task.task_type);
            return Ok(ApplyOutcome::OwnTask);
        }

        if let Some(max_age) = self.settings.max_task_age {
            let age_ms = now_ms().saturating_sub(task.created_at);
            if u128::from(age_ms) > max_age.as_millis() {
                tracing::warn!(
                    "Skipping stale task {} ({}), age {}ms",
                    task.id,
                    task.task_type,
                    age_ms
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let subject = HookSubject::ApplyTask { task };
        let decision = self.hooks.run_before(&subject);
        if !decision.proceed {
            tracing::info!("Apply of task {} ({}) cancelled by hook", task.id, task.task_type);
            self.hooks.run_after(&subject, HookOutcome::CANCEL);
            return Ok(ApplyOutcome::Cancelled);
        }

        let result = self.run_handler(task).await;
        self.hooks.run_after(&subject, decision);
        result
    }

    async fn run_handler(&self, task: &Task) -> Result<ApplyOutcome, ApplyError> {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            tracing::warn!(
                "No handler for task type '{}', acknowledging task {}",
                task.task_type,
                task.id
            );
            return Ok(ApplyOutcome::UnknownType);
        };

        tracing::debug!(
            "Applying task {} ({}) from {} ({} payload fields, {} binary bytes)",
            task.id,
            task.task_type,
            task.source_node,
            task.payload.len(),
            task.binary_len()
        );

        // Spawned so that a panicking handler surfaces as a join error.
        let mut running = tokio::spawn(handler(task.clone()));

        match tokio::time::timeout(self.settings.apply_timeout, &mut running).await {
            Ok(Ok(Ok(()))) => Ok(ApplyOutcome::Applied),
            Ok(Ok(Err(e))) => {
                tracing::error!("Handler '{}' failed on task {}: {}", task.task_type, task.id, e);
                Err(ApplyError::HandlerFailed {
                    task_type: task.task_type.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Err(join_error)) => {
                tracing::error!(
                    "Handler '{}' panicked on task {}: {}",
                    task.task_type,
                    task.id,
                    join_error
                );
                Err(ApplyError::HandlerFailed {
                    task_type: task.task_type.clone(),
                    message: join_error.to_string(),
                })
            }
            Err(_) => {
                running.abort();
                let timeout_ms = self.settings.apply_timeout.as_millis() as u64;
                tracing::error!(
                    "Handler '{}' timed out on task {} after {}ms",
                    task.task_type,
                    task.id,
                    timeout_ms
                );
                Err(ApplyError::TimedOut {
                    task_type: task.task_type.clone(),
                    timeout_ms,
                })
            }
        }
    }
}
