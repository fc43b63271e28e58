//! Notification dispatcher collaborator.
//!
//! The engine only emits a structured [`NotificationRequest`]; delivery is
//! up to the dispatcher implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{CorrelationId, EntityInstanceId, RuleId};

/// A request to notify someone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Rule that requested it.
    pub rule_id: RuleId,
    /// Instance the rule was evaluated against.
    pub instance_id: Option<EntityInstanceId>,
    /// Recipient hint (address, group or role name).
    pub recipient: String,
    /// Template hint.
    pub template: String,
    /// Template payload.
    pub payload: serde_json::Value,
    /// Cycle the request belongs to.
    pub correlation_id: CorrelationId,
}

/// Delivers notification requests.
#[async_trait::async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver one request.
    async fn dispatch(&self, request: NotificationRequest) -> Result<()>;
}

/// Fire-and-forget dispatch bounded by `timeout`.
///
/// Runs on a spawned task so the caller never waits on delivery; failures
/// and timeouts are logged.
pub fn spawn_dispatch(
    dispatcher: Arc<dyn NotificationDispatcher>,
    request: NotificationRequest,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let rule_id = request.rule_id;
        match tokio::time::timeout(timeout, dispatcher.dispatch(request)).await {
            Ok(Ok(())) => tracing::debug!(rule_id = %rule_id, "Notification dispatched"),
            Ok(Err(e)) => tracing::warn!(rule_id = %rule_id, error = %e, "Notification dispatch failed"),
            Err(_) => tracing::warn!(
                rule_id = %rule_id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Notification dispatch timed out"
            ),
        }
    })
}

/// Dispatcher that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait::async_trait]
impl NotificationDispatcher for LoggingDispatcher {
    async fn dispatch(&self, request: NotificationRequest) -> Result<()> {
        tracing::info!(
            rule_id = %request.rule_id,
            recipient = %request.recipient,
            template = %request.template,
            "Notification requested"
        );
        Ok(())
    }
}

/// Records requests for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryNotificationDispatcher {
    sent: Arc<Mutex<Vec<NotificationRequest>>>,
}

impl InMemoryNotificationDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far.
    pub async fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for InMemoryNotificationDispatcher {
    async fn dispatch(&self, request: NotificationRequest) -> Result<()> {
        self.sent.lock().await.push(request);
        Ok(())
    }
}
