//! Hook Registry
//!
//! Before/after interception points around "decide to log" and "apply locally".
//! Other subsystems register hooks here instead of the core depending on them.
//!
//! Before hooks run in registration order and return a [`HookOutcome`]; the first
//! hook that does not proceed short-circuits the rest and cancels the default
//! action. After hooks always run, with the final outcome, so observers also see
//! cancelled events.

use crate::policy::registry::ChangeContext;
use crate::task::types::{LogName, Task, TaskDraft};

use parking_lot::RwLock;
use std::sync::Arc;

/// Interception point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// A logging policy produced a task that is about to be appended.
    LogTask,
    /// A received task is about to be applied by a local handler.
    ApplyTask,
}

/// What a hook is looking at.
#[derive(Debug, Clone, Copy)]
pub enum HookSubject<'a> {
    LogTask {
        context: &'a ChangeContext,
        log: &'a LogName,
        draft: &'a TaskDraft,
    },
    ApplyTask {
        task: &'a Task,
    },
}

impl HookSubject<'_> {
    pub fn point(&self) -> HookPoint {
        match self {
            HookSubject::LogTask { .. } => HookPoint::LogTask,
            HookSubject::ApplyTask { .. } => HookPoint::ApplyTask,
        }
    }

    pub fn task_type(&self) -> &str {
        match self {
            HookSubject::LogTask { draft, .. } => &draft.task_type,
            HookSubject::ApplyTask { task } => &task.task_type,
        }
    }
}

/// Result of a before hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOutcome {
    pub proceed: bool,
}

impl HookOutcome {
    pub const PROCEED: HookOutcome = HookOutcome { proceed: true };
    pub const CANCEL: HookOutcome = HookOutcome { proceed: false };

    pub fn and(self, other: HookOutcome) -> HookOutcome {
        HookOutcome {
            proceed: self.proceed && other.proceed,
        }
    }
}

pub type BeforeHookFn = Arc<dyn Fn(&HookSubject<'_>) -> HookOutcome + Send + Sync>;
pub type AfterHookFn = Arc<dyn Fn(&HookSubject<'_>, HookOutcome) + Send + Sync>;

struct Registered<F> {
    point: HookPoint,
    name: String,
    hook: F,
}

#[derive(Default)]
pub struct HookRegistry {
    before: RwLock<Vec<Registered<BeforeHookFn>>>,
    after: RwLock<Vec<Registered<AfterHookFn>>>,
}

impl HookRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn before<F>(&self, point: HookPoint, name: &str, hook: F)
    where
        F: Fn(&HookSubject<'_>) -> HookOutcome + Send + Sync + 'static,
    {
        self.before.write().push(Registered {
            point,
            name: name.to_string(),
            hook: Arc::new(hook),
        });
        tracing::debug!("Registered before-hook '{}' on {:?}", name, point);
    }

    pub fn after<F>(&self, point: HookPoint, name: &str, hook: F)
    where
        F: Fn(&HookSubject<'_>, HookOutcome) + Send + Sync + 'static,
    {
        self.after.write().push(Registered {
            point,
            name: name.to_string(),
            hook: Arc::new(hook),
        });
        tracing::debug!("Registered after-hook '{}' on {:?}", name, point);
    }

    /// Runs the before hooks of the subject's point, short-circuiting on the first cancel.
    pub fn run_before(&self, subject: &HookSubject<'_>) -> HookOutcome {
        let point = subject.point();
        // Clone the handles so hooks may register further hooks without deadlocking.
        let hooks: Vec<(String, BeforeHookFn)> = self
            .before
            .read()
            .iter()
            .filter(|registered| registered.point == point)
            .map(|registered| (registered.name.clone(), registered.hook.clone()))
            .collect();

        let mut outcome = HookOutcome::PROCEED;
        for (name, hook) in hooks {
            outcome = outcome.and(hook(subject));
            if !outcome.proceed {
                tracing::debug!(
                    "Hook '{}' cancelled {:?} for task type '{}'",
                    name,
                    point,
                    subject.task_type()
                );
                break;
            }
        }
        outcome
    }

    pub fn run_after(&self, subject: &HookSubject<'_>, outcome: HookOutcome) {
        let point = subject.point();
        let hooks: Vec<AfterHookFn> = self
            .after
            .read()
            .iter()
            .filter(|registered| registered.point == point)
            .map(|registered| registered.hook.clone())
            .collect();

        for hook in hooks {
            hook(subject, outcome);
        }
    }

    pub fn hook_count(&self, point: HookPoint) -> usize {
        self.before.read().iter().filter(|r| r.point == point).count()
            + self.after.read().iter().filter(|r| r.point == point).count()
    }
}
