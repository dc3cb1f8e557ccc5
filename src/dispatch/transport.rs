//! Transport contract
//!
//! Moves one encoded task envelope to one destination and reports the outcome.
//! The dispatcher never sees anything but [`DeliveryError`].
//!
//! ## Implementations
//! - **`HttpTransport`**: posts envelopes to a peer's receive endpoint with reqwest.
//! - **`LoopbackTransport`**: hands envelopes to in-process executors; used for
//!   single-process setups and tests.

use crate::executor::executor::LocalTaskExecutor;
use crate::executor::protocol::{ENDPOINT_APPLY, ENDPOINT_HEALTH};
use crate::health::probe::Prober;
use crate::health::types::Destination;
use crate::task::codec::{CONTENT_TYPE, CodecError, decode_envelope, encode_envelope};
use crate::task::types::TaskEnvelope;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The destination could not be reached at all.
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// The destination answered but refused or failed to apply the task.
    #[error("destination rejected task (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("delivery timed out")]
    Timeout,

    #[error("failed to encode task: {0}")]
    Encode(#[from] CodecError),
}

impl DeliveryError {
    /// Maps a non-success HTTP answer.
    ///
    /// Gateway and throttling statuses come from whatever sits in front of the
    /// peer while the peer itself is not serving, so they count as unreachable.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 => DeliveryError::Timeout,
            429 | 502 | 503 | 504 => {
                DeliveryError::Unreachable(format!("status {}: {}", status, message))
            }
            _ => DeliveryError::Rejected { status, message },
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        destination: &Destination,
        envelope: &TaskEnvelope,
    ) -> Result<(), DeliveryError>;

    /// Delivers one envelope to several destinations, collecting each outcome.
    async fn deliver_all(
        &self,
        destinations: &[Destination],
        envelope: &TaskEnvelope,
    ) -> Vec<(String, Result<(), DeliveryError>)> {
        let mut results = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let result = self.deliver(destination, envelope).await;
            results.push((destination.name.clone(), result));
        }
        results
    }
}

/// Posts envelopes to `<url>/internal/sync/apply`.
pub struct HttpTransport {
    http_client: reqwest::Client,
    request_timeout: Duration,
    connect_attempts: usize,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            request_timeout,
            connect_attempts: 3,
        }
    }

    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    fn endpoint(destination: &Destination, path: &str) -> String {
        format!("{}{}", destination.url.trim_end_matches('/'), path)
    }

    // --- HTTP Helpers with Backoff ---

    /// Retries only connection failures; anything the peer answered is final.
    async fn post_with_retry(
        &self,
        url: String,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = self
                .http_client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
                .body(body.clone())
                .timeout(self.request_timeout)
                .send()
                .await;

            match response {
                Err(e) if e.is_connect() && attempt < self.connect_attempts => {
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
                other => return other,
            }
        }
    }
}

fn map_request_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(
        &self,
        destination: &Destination,
        envelope: &TaskEnvelope,
    ) -> Result<(), DeliveryError> {
        let body = encode_envelope(envelope)?;
        let url = Self::endpoint(destination, ENDPOINT_APPLY);

        tracing::debug!(
            "Posting task {} ({} bytes) to '{}'",
            envelope.task.id,
            body.len(),
            destination.name
        );

        let response = self
            .post_with_retry(url, body)
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(DeliveryError::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl Prober for HttpTransport {
    async fn probe(&self, destination: &Destination) -> anyhow::Result<()> {
        let url = Self::endpoint(destination, ENDPOINT_HEALTH);
        let response = self
            .http_client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("health endpoint returned {}", response.status());
        }
        Ok(())
    }
}

/// Routes envelopes to executors living in the same process, by destination name.
///
/// Envelopes still go through the wire codec so both ends see exactly what an
/// HTTP peer would.
#[derive(Default)]
pub struct LoopbackTransport {
    peers: DashMap<String, Arc<LocalTaskExecutor>>,
    reachable: DashMap<String, bool>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(&self, destination: &str, executor: Arc<LocalTaskExecutor>) {
        self.peers.insert(destination.to_string(), executor);
        self.reachable.insert(destination.to_string(), true);
    }

    /// Simulates a network partition towards `destination`.
    pub fn set_reachable(&self, destination: &str, reachable: bool) {
        self.reachable.insert(destination.to_string(), reachable);
    }

    fn peer(&self, destination: &Destination) -> Result<Arc<LocalTaskExecutor>, DeliveryError> {
        let reachable = self
            .reachable
            .get(&destination.name)
            .map(|flag| *flag)
            .unwrap_or(false);
        if !reachable {
            return Err(DeliveryError::Unreachable(format!(
                "no route to '{}'",
                destination.name
            )));
        }
        self.peers
            .get(&destination.name)
            .map(|peer| peer.value().clone())
            .ok_or_else(|| DeliveryError::Unreachable(format!("unknown peer '{}'", destination.name)))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn deliver(
        &self,
        destination: &Destination,
        envelope: &TaskEnvelope,
    ) -> Result<(), DeliveryError> {
        let peer = self.peer(destination)?;
        let bytes = encode_envelope(envelope)?;
        let received = decode_envelope(&bytes).map_err(|e| DeliveryError::Rejected {
            status: 400,
            message: e.to_string(),
        })?;

        match peer.apply(&received.task).await {
            Ok(outcome) => {
                tracing::debug!(
                    "Loopback delivery of task {} to '{}': {:?}",
                    received.task.id,
                    destination.name,
                    outcome
                );
                Ok(())
            }
            Err(e) => Err(DeliveryError::Rejected {
                status: 500,
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Prober for LoopbackTransport {
    async fn probe(&self, destination: &Destination) -> anyhow::Result<()> {
        self.peer(destination)?;
        Ok(())
    }
}
