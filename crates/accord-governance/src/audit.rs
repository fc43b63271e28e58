//! Audit/Sync Recorder.
//!
//! Append-only record of every mutation (who, what, when, before/after
//! snapshot, correlation id), every rule execution and every
//! synchronization run.
//!
//! # Example
//!
//! ```rust,ignore
//! use accord_governance::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject, InMemoryAuditStore};
//! use accord_governance::types::Actor;
//! use uuid::Uuid;
//!
//! let store = InMemoryAuditStore::new();
//! let event = store
//!     .log_event(AuditEventInput {
//!         subject: AuditSubject::EntityInstance,
//!         subject_id: Uuid::new_v4(),
//!         action: AuditAction::Created,
//!         actor: Actor::System,
//!         ..Default::default()
//!     })
//!     .await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    Actor, CorrelationId, EntityDefinitionId, EntityInstanceId, RuleId, SyncStatus, TriggerType,
};

/// Kind of record an audit event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditSubject {
    /// An entity definition.
    #[default]
    EntityDefinition,
    /// A property definition.
    PropertyDefinition,
    /// An entity instance.
    EntityInstance,
    /// A property value row.
    PropertyValue,
    /// An access assignment.
    Assignment,
    /// An access rule.
    Rule,
}

impl std::fmt::Display for AuditSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityDefinition => write!(f, "entity_definition"),
            Self::PropertyDefinition => write!(f, "property_definition"),
            Self::EntityInstance => write!(f, "entity_instance"),
            Self::PropertyValue => write!(f, "property_value"),
            Self::Assignment => write!(f, "assignment"),
            Self::Rule => write!(f, "rule"),
        }
    }
}

/// Action performed on the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Record was created.
    #[default]
    Created,
    /// Record was updated.
    Updated,
    /// Record was soft-deleted.
    Retired,
    /// A new open value row replaced the previous one.
    ValueSet,
    /// An open value row was closed without replacement.
    ValueExpired,
    /// Assignment was reactivated.
    Activated,
    /// Assignment was suspended.
    Suspended,
    /// Assignment was approved.
    Approved,
    /// Assignment was linked to a rule.
    RuleLinked,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Retired => write!(f, "retired"),
            Self::ValueSet => write!(f, "value_set"),
            Self::ValueExpired => write!(f, "value_expired"),
            Self::Activated => write!(f, "activated"),
            Self::Suspended => write!(f, "suspended"),
            Self::Approved => write!(f, "approved"),
            Self::RuleLinked => write!(f, "rule_linked"),
        }
    }
}

/// An audit event for a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for the event.
    pub id: Uuid,
    /// Kind of record changed.
    pub subject: AuditSubject,
    /// Identifier of the record changed.
    pub subject_id: Uuid,
    /// Action performed.
    pub action: AuditAction,
    /// Who performed the action.
    pub actor: Actor,
    /// State before the change (JSON).
    pub before_state: Option<serde_json::Value>,
    /// State after the change (JSON).
    pub after_state: Option<serde_json::Value>,
    /// Request or rule cycle the change belongs to.
    pub correlation_id: Option<CorrelationId>,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Additional metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Input for creating an audit event.
#[derive(Debug, Clone, Default)]
pub struct AuditEventInput {
    /// Kind of record changed.
    pub subject: AuditSubject,
    /// Identifier of the record changed.
    pub subject_id: Uuid,
    /// Action performed.
    pub action: AuditAction,
    /// Who performed the action.
    pub actor: Actor,
    /// State before the change (JSON).
    pub before_state: Option<serde_json::Value>,
    /// State after the change (JSON).
    pub after_state: Option<serde_json::Value>,
    /// Request or rule cycle the change belongs to.
    pub correlation_id: Option<CorrelationId>,
    /// Additional metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Filter for querying audit events.
#[derive(Debug, Clone, Default)]
pub struct AuditEventFilter {
    /// Filter by subject kind.
    pub subject: Option<AuditSubject>,
    /// Filter by subject id.
    pub subject_id: Option<Uuid>,
    /// Filter by action.
    pub action: Option<AuditAction>,
    /// Filter by actor.
    pub actor: Option<Actor>,
    /// Filter by correlation id.
    pub correlation_id: Option<CorrelationId>,
    /// Filter by events at or after this instant.
    pub from_date: Option<DateTime<Utc>>,
    /// Filter by events at or before this instant.
    pub to_date: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of results to skip.
    pub offset: Option<usize>,
}

// ============================================================================
// Rule executions
// ============================================================================

/// Coarse outcome class of one rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The action ran (possibly as a no-op).
    Succeeded,
    /// The rule matched but its action was not attempted.
    Skipped,
    /// Condition evaluation or the action failed.
    Failed,
}

/// One rule evaluation appended by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecutionRecord {
    /// Unique identifier for the record.
    pub id: Uuid,
    /// Rule evaluated.
    pub rule_id: RuleId,
    /// Cycle the evaluation belongs to.
    pub correlation_id: CorrelationId,
    /// Trigger kind of the cycle.
    pub trigger: TriggerType,
    /// Instance the cycle was evaluated against.
    pub instance_id: Option<EntityInstanceId>,
    /// Outcome class.
    pub outcome: ExecutionOutcome,
    /// Human-readable result, as stored on the rule.
    pub detail: String,
    /// Whether the ledger or attribute store changed.
    pub changed: bool,
    /// When evaluation of this rule started.
    pub started_at: DateTime<Utc>,
    /// Evaluation duration in milliseconds.
    pub duration_ms: u64,
}

// ============================================================================
// Sync runs
// ============================================================================

/// One synchronization batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    /// Unique identifier for the run.
    pub id: Uuid,
    /// Definition the batch was applied to.
    pub entity_definition_id: EntityDefinitionId,
    /// Correlates every mutation of the run.
    pub correlation_id: CorrelationId,
    /// Who started the run.
    pub actor: Actor,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Records in the batch.
    pub records_received: usize,
    /// Instances created.
    pub created: usize,
    /// Instances whose values changed.
    pub updated: usize,
    /// Instances left untouched.
    pub unchanged: usize,
    /// Records that failed.
    pub failed: usize,
    /// Final status of the run.
    pub status: SyncStatus,
    /// Per-record failure messages.
    pub errors: Vec<String>,
}

/// Filter for listing sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncRunFilter {
    /// Filter by entity definition.
    pub entity_definition_id: Option<EntityDefinitionId>,
    /// Filter by final status.
    pub status: Option<SyncStatus>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

/// Trait for audit storage backends.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Log an audit event.
    async fn log_event(&self, input: AuditEventInput) -> Result<AuditEvent>;

    /// Query audit events, most recent first.
    async fn query_events(&self, filter: AuditEventFilter) -> Result<Vec<AuditEvent>>;

    /// Append a rule execution record.
    async fn record_rule_execution(&self, record: RuleExecutionRecord) -> Result<()>;

    /// List execution records of a rule in append order.
    async fn list_rule_executions(&self, rule_id: RuleId) -> Result<Vec<RuleExecutionRecord>>;

    /// Append a sync run.
    async fn record_sync_run(&self, run: SyncRun) -> Result<()>;

    /// List sync runs, most recent first.
    async fn list_sync_runs(&self, filter: SyncRunFilter) -> Result<Vec<SyncRun>>;
}

/// In-memory audit store for testing.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    executions: Arc<RwLock<Vec<RuleExecutionRecord>>>,
    sync_runs: Arc<RwLock<Vec<SyncRun>>>,
}

impl InMemoryAuditStore {
    /// Create a new in-memory audit store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the count of events in the store.
    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Clear all records (for testing).
    pub async fn clear(&self) {
        self.events.write().await.clear();
        self.executions.write().await.clear();
        self.sync_runs.write().await.clear();
    }
}

#[async_trait::async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn log_event(&self, input: AuditEventInput) -> Result<AuditEvent> {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            subject: input.subject,
            subject_id: input.subject_id,
            action: input.action,
            actor: input.actor,
            before_state: input.before_state,
            after_state: input.after_state,
            correlation_id: input.correlation_id,
            timestamp: Utc::now(),
            metadata: input.metadata,
        };

        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn query_events(&self, filter: AuditEventFilter) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        let mut results: Vec<_> = events
            .iter()
            .filter(|e| filter.subject.is_none_or(|s| e.subject == s))
            .filter(|e| filter.subject_id.is_none_or(|id| e.subject_id == id))
            .filter(|e| filter.action.is_none_or(|a| e.action == a))
            .filter(|e| filter.actor.is_none_or(|a| e.actor == a))
            .filter(|e| {
                filter
                    .correlation_id
                    .is_none_or(|c| e.correlation_id == Some(c))
            })
            .filter(|e| filter.from_date.is_none_or(|d| e.timestamp >= d))
            .filter(|e| filter.to_date.is_none_or(|d| e.timestamp <= d))
            .cloned()
            .collect();

        // Most recent first; append order breaks timestamp ties.
        results.reverse();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn record_rule_execution(&self, record: RuleExecutionRecord) -> Result<()> {
        self.executions.write().await.push(record);
        Ok(())
    }

    async fn list_rule_executions(&self, rule_id: RuleId) -> Result<Vec<RuleExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .filter(|r| r.rule_id == rule_id)
            .cloned()
            .collect())
    }

    async fn record_sync_run(&self, run: SyncRun) -> Result<()> {
        self.sync_runs.write().await.push(run);
        Ok(())
    }

    async fn list_sync_runs(&self, filter: SyncRunFilter) -> Result<Vec<SyncRun>> {
        let runs = self.sync_runs.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(runs
            .iter()
            .rev()
            .filter(|r| {
                filter
                    .entity_definition_id
                    .is_none_or(|id| r.entity_definition_id == id)
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
