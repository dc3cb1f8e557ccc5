//! Task Handler Registry
//!
//! Maps task types (e.g. "clear-cache") to the async closures that apply them
//! locally. The table is built explicitly at start-up and sealed before the node
//! starts receiving tasks; tests may still add handlers through `hot_register`.

use crate::task::types::Task;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes a `Task` and returns a Future that resolves to a `Result<()>`.
pub type TaskHandlerFn =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler registry is sealed, cannot register '{0}'")]
    Sealed(String),
}

/// Registry holding the mapping between task types and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
    sealed: AtomicBool,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a handler for `task_type`, replacing any earlier one.
    ///
    /// # Arguments
    /// * `task_type` - The identifier carried by tasks (e.g., "clear-cache").
    /// * `handler` - The closure that applies the task. Must be idempotent.
    pub fn register<F, Fut>(&self, task_type: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_sealed() {
            return Err(RegistryError::Sealed(task_type.to_string()));
        }
        self.insert(task_type, handler);
        Ok(())
    }

    /// Registers a handler even after the registry was sealed.
    pub fn hot_register<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(task_type, handler);
    }

    fn insert<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so every handler fits one map.
        let handler_fn: TaskHandlerFn = Arc::new(move |task: Task| {
            Box::pin(handler(task)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        self.handlers.insert(task_type.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", task_type);
    }

    /// Freezes the table. Further `register` calls fail.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        tracing::info!("Task handler registry sealed with {} handlers", self.handler_count());
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn get(&self, task_type: &str) -> Option<TaskHandlerFn> {
        self.handlers.get(task_type).map(|entry| entry.value().clone())
    }

    /// Returns a sorted list of all registered task types.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
            sealed: AtomicBool::new(false),
        }
    }
}
