//! Run outcome reporting
//!
//! Every flow reports exactly one [`InstallationEvent`]. Delivery problems
//! are logged and never change the outcome of the run.

use async_trait::async_trait;
use gitops_pilot_core::{InstallationEvent, Outcome};
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::account::CodefreshClient;
use crate::error::EventError;

/// Account endpoint receiving controller events
pub const EVENTS_PATH: &str = "/api/gitops/events";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn report(&self, event: &InstallationEvent) -> Result<(), EventError>;
}

/// Report an event, logging a delivery failure instead of returning it
pub async fn emit(sink: &dyn EventSink, event: &InstallationEvent) {
    if let Err(e) = sink.report(event).await {
        warn!(phase = %event.phase, error = %e, "failed to deliver event");
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    event_type: &'static str,
    status: Outcome,
    message: &'a str,
    timestamp: String,
}

impl<'a> From<&'a InstallationEvent> for EventBody<'a> {
    fn from(event: &'a InstallationEvent) -> Self {
        Self {
            event_type: event.phase.event_type(),
            status: event.outcome,
            message: &event.message,
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

/// Posts events to the account
pub struct CodefreshEventSink {
    client: CodefreshClient,
}

impl CodefreshEventSink {
    pub fn new(client: CodefreshClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for CodefreshEventSink {
    async fn report(&self, event: &InstallationEvent) -> Result<(), EventError> {
        let response = self
            .client
            .request(Method::POST, EVENTS_PATH)
            .json(&EventBody::from(event))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EventError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Sink used when no account is configured. The orchestrator already logs
/// each outcome, so events are only traced at debug level here.
#[derive(Debug, Default, Clone)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn report(&self, event: &InstallationEvent) -> Result<(), EventError> {
        debug!(
            phase = %event.phase,
            outcome = ?event.outcome,
            "event not reported: {}",
            event.message
        );
        Ok(())
    }
}
