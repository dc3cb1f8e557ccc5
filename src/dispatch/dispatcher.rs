//! Dispatcher
//!
//! Drains one task log towards one destination, strictly in append order. Task
//! N+1 is never handed to the transport before task N reached a terminal status
//! (acknowledged or dead) for this destination.
//!
//! ## Step cycle
//! 1. Ask the health tracker whether the destination may receive (`Hold` pauses,
//!    `Drop` kills the head task).
//! 2. Read the head task at the destination's cursor; skip it if it is already
//!    terminal (its group was cancelled).
//! 3. Mark it in flight and deliver it.
//! 4. Ack on success; on failure count a retry, and kill the task once the
//!    retry ceiling is exceeded.

use super::transport::{DeliveryError, Transport};
use crate::error::LogError;
use crate::health::tracker::HealthTracker;
use crate::health::types::{Destination, Eligibility};
use crate::log::task_log::TaskLog;
use crate::task::types::{SeqId, TaskEnvelope};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Retries allowed before a task is declared dead.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Upper bound on how long an idle dispatcher sleeps without an append signal.
    pub idle_poll: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base: Duration::from_millis(150),
            retry_max: Duration::from_secs(30),
            idle_poll: Duration::from_secs(1),
        }
    }
}

/// What one `step` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Delivered(SeqId),
    Retried { seq: SeqId, retries: u32 },
    Dead(SeqId),
    /// Destination not eligible right now; nothing was touched.
    Held,
    /// Destination disabled under the drop policy; the head task was killed.
    Dropped(SeqId),
    /// Head task was already terminal; the cursor moved past it.
    Skipped(SeqId),
    Idle,
}

pub struct Dispatcher {
    log: Arc<TaskLog>,
    destination: Destination,
    tracker: Arc<HealthTracker>,
    transport: Arc<dyn Transport>,
    settings: DispatchSettings,
    /// Cuts a hold/retry backoff short, e.g. when the destination recovers.
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        log: Arc<TaskLog>,
        destination: Destination,
        tracker: Arc<HealthTracker>,
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            log,
            destination,
            tracker,
            transport,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn log(&self) -> &Arc<TaskLog> {
        &self.log
    }

    /// Performs one iteration of the delivery cycle.
    pub async fn step(&self) -> Result<Step, LogError> {
        let name = self.destination.name.as_str();

        match self.tracker.eligibility(name) {
            Eligibility::Deliver => {}
            Eligibility::Hold => return Ok(Step::Held),
            Eligibility::Drop => return self.drop_head(),
        }

        let Some((task, status)) = self.log.head(name)? else {
            return Ok(Step::Idle);
        };
        let seq = task.id;

        if status.is_terminal() || !self.log.mark_in_flight(name, seq)? {
            self.log.advance(name)?;
            tracing::debug!("Skipped terminal task {} on '{}' for '{}'", seq, self.log.name(), name);
            return Ok(Step::Skipped(seq));
        }

        let envelope = TaskEnvelope {
            log: self.log.name().to_string(),
            task,
        };

        match self.transport.deliver(&self.destination, &envelope).await {
            Ok(()) => {
                self.log.ack(name, seq)?;
                self.tracker.report_success(name);
                tracing::debug!("Delivered task {} on '{}' to '{}'", seq, self.log.name(), name);
                Ok(Step::Delivered(seq))
            }
            Err(e) => self.handle_failure(seq, e),
        }
    }

    fn handle_failure(&self, seq: SeqId, error: DeliveryError) -> Result<Step, LogError> {
        let name = self.destination.name.as_str();
        let retries = self.log.fail(name, seq)?;
        self.tracker.report_failure(name, &error.to_string());

        if retries > self.settings.max_retries {
            self.log.mark_dead(name, seq, &error.to_string())?;
            return Ok(Step::Dead(seq));
        }

        tracing::warn!(
            "Delivery of task {} on '{}' to '{}' failed (retry {}/{}): {}",
            seq,
            self.log.name(),
            name,
            retries,
            self.settings.max_retries,
            error
        );
        Ok(Step::Retried { seq, retries })
    }

    fn drop_head(&self) -> Result<Step, LogError> {
        let name = self.destination.name.as_str();
        let Some((task, status)) = self.log.head(name)? else {
            return Ok(Step::Idle);
        };

        if status.is_terminal() {
            self.log.advance(name)?;
            return Ok(Step::Skipped(task.id));
        }

        self.log.mark_dead(name, task.id, "destination disabled")?;
        Ok(Step::Dropped(task.id))
    }

    /// Exponential backoff with jitter, capped at `retry_max`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self
            .settings
            .retry_base
            .saturating_mul(factor)
            .min(self.settings.retry_max);
        let jitter = Duration::from_millis(rand::random::<u64>() % 50);
        delay + jitter
    }

    /// Loops `step` until the destination is unsubscribed from the log or the
    /// log is dropped.
    pub async fn run(self) {
        let name = self.destination.name.clone();
        let mut appends = self.log.watch_appends();
        let mut backoff_attempt = 0u32;

        tracing::info!("Dispatcher started: log '{}' -> '{}'", self.log.name(), name);

        loop {
            appends.borrow_and_update();

            match self.step().await {
                Ok(Step::Idle) => {
                    backoff_attempt = 0;
                    tokio::select! {
                        changed = appends.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.settings.idle_poll) => {}
                    }
                }
                Ok(Step::Held) | Ok(Step::Retried { .. }) => {
                    let delay = self.backoff(backoff_attempt);
                    backoff_attempt = backoff_attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => {
                            backoff_attempt = 0;
                        }
                    }
                }
                Ok(_) => {
                    backoff_attempt = 0;
                }
                Err(LogError::UnknownDestination { .. }) => {
                    tracing::info!(
                        "Destination '{}' left log '{}', dispatcher stopping",
                        name,
                        self.log.name()
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!("Dispatcher for '{}' on '{}' failed: {}", name, self.log.name(), e);
                    let delay = self.backoff(backoff_attempt);
                    backoff_attempt = backoff_attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
