//! Access rules.
//!
//! A rule pairs a trigger with a condition and one typed action. Condition
//! text is parsed when the rule is written, so a stored rule always carries
//! a valid [`Expression`] (or none, meaning "always matches").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::error::{FieldError, GovernanceError, Result};
use crate::expression::{parse_condition, Expression};
use crate::integration::{require_system, IntegrationRegistry};
use crate::record::{replace_checked, retry_on_conflict, RecordMeta, RetryPolicy, Versioned};
use crate::services::assignment::AssignmentStore;
use crate::types::{
    ActionType, Actor, AssignmentType, CorrelationId, EntityDefinitionId, EntityInstanceId,
    IntegrationSystemId, PropertyDefinitionId, RuleId, TriggerType,
};

const MAX_NAME_LENGTH: usize = 200;

/// Priority given to rules created without one.
pub const DEFAULT_PRIORITY: i32 = 100;

// ============================================================================
// Domain Types
// ============================================================================

fn automatic() -> AssignmentType {
    AssignmentType::Automatic
}

/// Parameters of a rule's action.
///
/// Serialized with an `action` tag, e.g.
/// `{"action": "assign_role", "role_id": "...", "target_system_id": "..."}`.
/// Where a `user_id` is omitted the triggering instance is the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Grant a role.
    AssignRole {
        /// Role instance.
        role_id: EntityInstanceId,
        /// Target system.
        target_system_id: IntegrationSystemId,
        /// Type of the created assignment.
        #[serde(default = "automatic")]
        assignment_type: AssignmentType,
        /// Explicit user instance.
        #[serde(default)]
        user_id: Option<EntityInstanceId>,
        /// Validity of the created assignment in days.
        #[serde(default)]
        valid_for_days: Option<u32>,
    },
    /// Revoke a role.
    RemoveRole {
        /// Role instance.
        role_id: EntityInstanceId,
        /// Target system.
        target_system_id: IntegrationSystemId,
        /// Explicit user instance.
        #[serde(default)]
        user_id: Option<EntityInstanceId>,
    },
    /// Set an attribute on the triggering instance.
    UpdateProperty {
        /// Property to set.
        property_id: PropertyDefinitionId,
        /// Raw value, parsed against the property's type.
        value: JsonValue,
    },
    /// Create an instance of another definition.
    CreateEntity {
        /// Definition of the new instance.
        entity_definition_id: EntityDefinitionId,
        /// External id template; `{external_id}` and `{Property}` are
        /// substituted from the triggering instance.
        external_id: String,
        /// Display name template.
        #[serde(default)]
        display_name: Option<String>,
        /// Initial attribute values by property name.
        #[serde(default)]
        values: HashMap<String, JsonValue>,
    },
    /// Retire an instance.
    DeleteEntity {
        /// Instance to retire; the triggering instance when omitted.
        #[serde(default)]
        instance_id: Option<EntityInstanceId>,
    },
    /// Request a notification.
    SendNotification {
        /// Recipient hint.
        recipient: String,
        /// Template hint.
        template: String,
        /// Extra payload merged into the request.
        #[serde(default)]
        payload: JsonValue,
    },
}

impl ActionConfig {
    /// The action type this configuration belongs to.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::AssignRole { .. } => ActionType::AssignRole,
            Self::RemoveRole { .. } => ActionType::RemoveRole,
            Self::UpdateProperty { .. } => ActionType::UpdateProperty,
            Self::CreateEntity { .. } => ActionType::CreateEntity,
            Self::DeleteEntity { .. } => ActionType::DeleteEntity,
            Self::SendNotification { .. } => ActionType::SendNotification,
        }
    }

    fn check(&self, errors: &mut Vec<FieldError>) {
        match self {
            Self::AssignRole {
                assignment_type,
                valid_for_days,
                ..
            } => {
                if *valid_for_days == Some(0) {
                    errors.push(FieldError::new("valid_for_days", "must be positive"));
                }
                if *assignment_type == AssignmentType::Temporary && valid_for_days.is_none() {
                    errors.push(FieldError::new(
                        "valid_for_days",
                        "is required for temporary assignments",
                    ));
                }
            }
            Self::CreateEntity { external_id, .. } if external_id.trim().is_empty() => {
                errors.push(FieldError::new("external_id", "must not be empty"));
            }
            Self::SendNotification { recipient, .. } if recipient.trim().is_empty() => {
                errors.push(FieldError::new("recipient", "must not be empty"));
            }
            _ => {}
        }
    }
}

/// An access rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Unique identifier.
    pub id: RuleId,
    /// Unique name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Owning integration system; `None` for global rules.
    pub integration_system_id: Option<IntegrationSystemId>,
    /// Event kind the rule reacts to.
    pub trigger_type: TriggerType,
    /// Condition as authored.
    pub condition_text: String,
    /// Parsed condition; `None` always matches.
    pub condition: Option<Expression>,
    /// Derived from `action`.
    pub action_type: ActionType,
    /// Action parameters.
    pub action: ActionConfig,
    /// Lower runs first.
    pub priority: i32,
    /// Inactive rules are skipped.
    pub is_active: bool,
    /// When the rule last ran.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Result text of the last run.
    pub last_execution_result: Option<String>,
    /// Number of recorded runs.
    pub execution_count: u64,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl Versioned for AccessRule {
    const ENTITY: &'static str = "AccessRule";

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Input for creating a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleInput {
    /// Name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Owning integration system.
    pub integration_system_id: Option<IntegrationSystemId>,
    /// Trigger.
    pub trigger_type: TriggerType,
    /// Condition text; blank always matches.
    pub condition: String,
    /// Action.
    pub action: ActionConfig,
    /// Priority.
    pub priority: i32,
    /// Initial active flag.
    pub is_active: bool,
}

impl CreateRuleInput {
    /// An active global rule with default priority and no condition.
    #[must_use]
    pub fn new(name: impl Into<String>, trigger_type: TriggerType, action: ActionConfig) -> Self {
        Self {
            name: name.into(),
            description: None,
            integration_system_id: None,
            trigger_type,
            condition: String::new(),
            action,
            priority: DEFAULT_PRIORITY,
            is_active: true,
        }
    }

    /// Set the condition text.
    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Input for updating a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRuleInput {
    /// Version the caller read.
    pub expected_version: u64,
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New owning system; `Some(None)` makes the rule global.
    pub integration_system_id: Option<Option<IntegrationSystemId>>,
    /// New trigger.
    pub trigger_type: Option<TriggerType>,
    /// New condition text.
    pub condition: Option<String>,
    /// New action.
    pub action: Option<ActionConfig>,
    /// New priority.
    pub priority: Option<i32>,
    /// New active flag.
    pub is_active: Option<bool>,
}

/// Filter for listing rules.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    /// Filter by trigger.
    pub trigger_type: Option<TriggerType>,
    /// Filter by active flag.
    pub is_active: Option<bool>,
    /// Filter by action type.
    pub action_type: Option<ActionType>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for rule storage backends.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// Get a live rule by ID.
    async fn get(&self, id: RuleId) -> Result<Option<AccessRule>>;

    /// Insert a rule; names are unique case-insensitively among live rules.
    async fn insert(&self, rule: AccessRule) -> Result<AccessRule>;

    /// Replace a rule after a version check.
    async fn replace(&self, next: AccessRule, expected_version: u64, actor: Actor)
        -> Result<AccessRule>;

    /// List live rules ordered by `(priority, name)`.
    async fn list(&self, filter: &RuleFilter) -> Result<Vec<AccessRule>>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

/// In-memory rule store for testing.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: Arc<RwLock<HashMap<RuleId, AccessRule>>>,
}

impl InMemoryRuleStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(rows: &HashMap<RuleId, AccessRule>, candidate: &AccessRule) -> bool {
    rows.values().any(|r| {
        r.id != candidate.id && r.meta.is_live() && r.name.eq_ignore_ascii_case(&candidate.name)
    })
}

#[async_trait::async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn get(&self, id: RuleId) -> Result<Option<AccessRule>> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id).filter(|r| r.meta.is_live()).cloned())
    }

    async fn insert(&self, rule: AccessRule) -> Result<AccessRule> {
        let mut rules = self.rules.write().await;
        if name_taken(&rules, &rule) {
            return Err(GovernanceError::NameExists(rule.name));
        }
        rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn replace(
        &self,
        next: AccessRule,
        expected_version: u64,
        actor: Actor,
    ) -> Result<AccessRule> {
        let mut rules = self.rules.write().await;
        if next.meta.is_live() && name_taken(&rules, &next) {
            return Err(GovernanceError::NameExists(next.name));
        }
        let id = next.id;
        replace_checked(&mut rules, &id, next, expected_version, actor)
    }

    async fn list(&self, filter: &RuleFilter) -> Result<Vec<AccessRule>> {
        let rules = self.rules.read().await;
        let mut results: Vec<_> = rules
            .values()
            .filter(|r| r.meta.is_live())
            .filter(|r| filter.trigger_type.is_none_or(|t| r.trigger_type == t))
            .filter(|r| filter.is_active.is_none_or(|active| r.is_active == active))
            .filter(|r| filter.action_type.is_none_or(|a| r.action_type == a))
            .cloned()
            .collect();

        results.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(results)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service for managing access rules.
pub struct RuleService {
    store: Arc<dyn RuleStore>,
    assignments: Arc<dyn AssignmentStore>,
    integrations: Arc<dyn IntegrationRegistry>,
    audit_store: Arc<dyn AuditStore>,
    retry: RetryPolicy,
}

impl RuleService {
    /// Create a new rule service.
    pub fn new(
        store: Arc<dyn RuleStore>,
        assignments: Arc<dyn AssignmentStore>,
        integrations: Arc<dyn IntegrationRegistry>,
        audit_store: Arc<dyn AuditStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            assignments,
            integrations,
            audit_store,
            retry,
        }
    }

    /// Create a rule.
    ///
    /// Fails with `InvalidCondition` when the condition does not parse.
    pub async fn create(
        &self,
        input: CreateRuleInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessRule> {
        let mut errors = Vec::new();
        check_name(&input.name, &mut errors);
        input.action.check(&mut errors);
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }
        let condition = parse(&input.condition)?;
        if let Some(system) = input.integration_system_id {
            require_system(self.integrations.as_ref(), system).await?;
        }

        let rule = AccessRule {
            id: RuleId::new(),
            name: input.name.trim().to_string(),
            description: input.description,
            integration_system_id: input.integration_system_id,
            trigger_type: input.trigger_type,
            condition_text: input.condition,
            condition,
            action_type: input.action.action_type(),
            action: input.action,
            priority: input.priority,
            is_active: input.is_active,
            last_executed_at: None,
            last_execution_result: None,
            execution_count: 0,
            meta: RecordMeta::new(actor),
        };
        let rule = self.store.insert(rule).await?;

        tracing::info!(
            rule_id = %rule.id,
            name = %rule.name,
            trigger = %rule.trigger_type,
            action = %rule.action_type,
            priority = rule.priority,
            "Access rule created"
        );

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::Rule,
                subject_id: rule.id.into_inner(),
                action: AuditAction::Created,
                actor,
                after_state: Some(serde_json::to_value(&rule).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        Ok(rule)
    }

    /// Get a live rule by ID.
    pub async fn get(&self, id: RuleId) -> Result<Option<AccessRule>> {
        self.store.get(id).await
    }

    /// Get a live rule by ID or fail with `NotFound`.
    pub async fn require(&self, id: RuleId) -> Result<AccessRule> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(AccessRule::ENTITY, id))
    }

    /// Update a rule.
    pub async fn update(
        &self,
        id: RuleId,
        input: UpdateRuleInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessRule> {
        let before = self.require(id).await?;
        let mut next = before.clone();

        let mut errors = Vec::new();
        if let Some(name) = &input.name {
            check_name(name, &mut errors);
        }
        if let Some(action) = &input.action {
            action.check(&mut errors);
        }
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }

        if let Some(name) = input.name {
            next.name = name.trim().to_string();
        }
        if let Some(description) = input.description {
            next.description = Some(description);
        }
        if let Some(system) = input.integration_system_id {
            if let Some(system) = system {
                require_system(self.integrations.as_ref(), system).await?;
            }
            next.integration_system_id = system;
        }
        if let Some(trigger_type) = input.trigger_type {
            next.trigger_type = trigger_type;
        }
        if let Some(condition) = input.condition {
            next.condition = parse(&condition)?;
            next.condition_text = condition;
        }
        if let Some(action) = input.action {
            next.action_type = action.action_type();
            next.action = action;
        }
        if let Some(priority) = input.priority {
            next.priority = priority;
        }
        if let Some(is_active) = input.is_active {
            next.is_active = is_active;
        }

        let updated = self
            .store
            .replace(next, input.expected_version, actor)
            .await?;

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::Rule,
                subject_id: id.into_inner(),
                action: AuditAction::Updated,
                actor,
                before_state: Some(serde_json::to_value(&before).unwrap_or_default()),
                after_state: Some(serde_json::to_value(&updated).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        Ok(updated)
    }

    /// Soft-delete a rule no live assignment is linked to.
    pub async fn retire(
        &self,
        id: RuleId,
        expected_version: u64,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessRule> {
        let before = self.require(id).await?;

        let dependents = self.assignments.count_linked_to_rule(id).await?;
        if dependents > 0 {
            return Err(GovernanceError::DependencyConflict {
                entity: AccessRule::ENTITY,
                id: id.to_string(),
                dependents,
                dependent: "assignments",
            });
        }

        let mut next = before.clone();
        next.meta.mark_deleted(actor);
        let retired = self.store.replace(next, expected_version, actor).await?;

        tracing::info!(rule_id = %id, "Access rule retired");

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::Rule,
                subject_id: id.into_inner(),
                action: AuditAction::Retired,
                actor,
                before_state: Some(serde_json::to_value(&before).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        Ok(retired)
    }

    /// List live rules ordered by `(priority, name)`.
    pub async fn list(&self, filter: &RuleFilter) -> Result<Vec<AccessRule>> {
        self.store.list(filter).await
    }

    /// Active rules for one trigger, in execution order.
    pub async fn active_for_trigger(&self, trigger_type: TriggerType) -> Result<Vec<AccessRule>> {
        self.store
            .list(&RuleFilter {
                trigger_type: Some(trigger_type),
                is_active: Some(true),
                ..Default::default()
            })
            .await
    }

    /// Stamp the last execution on a rule and bump its counter.
    ///
    /// Concurrent cycles race on the rule's version; lost races are retried.
    pub async fn record_execution(
        &self,
        id: RuleId,
        at: DateTime<Utc>,
        result: &str,
    ) -> Result<AccessRule> {
        retry_on_conflict(self.retry, || self.record_once(id, at, result)).await
    }

    async fn record_once(&self, id: RuleId, at: DateTime<Utc>, result: &str) -> Result<AccessRule> {
        let current = self.require(id).await?;
        let version = current.meta.version;
        let mut next = current;
        next.last_executed_at = Some(at);
        next.last_execution_result = Some(result.to_string());
        next.execution_count += 1;
        self.store.replace(next, version, Actor::Rule(id)).await
    }
}

fn check_name(name: &str, errors: &mut Vec<FieldError>) {
    if name.trim().is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    } else if name.len() > MAX_NAME_LENGTH {
        errors.push(FieldError::new(
            "name",
            format!("must be at most {MAX_NAME_LENGTH} characters"),
        ));
    }
}

fn parse(condition: &str) -> Result<Option<Expression>> {
    parse_condition(condition).map_err(|err| GovernanceError::InvalidCondition(err.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
