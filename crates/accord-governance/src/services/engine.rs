//! Rule engine.
//!
//! An evaluation cycle takes the rules relevant to one trigger, orders them
//! by `(priority, name)` and runs them one at a time against a single
//! instance:
//!
//! ```text
//! Idle -> Matched -> Executing -> Recorded
//!      -> Matched -> Skipped(Inactive | HigherPriorityWon)
//! ```
//!
//! Rules whose scope or condition does not match leave no trace. When two
//! matched rules in one cycle target the same assignment triple with opposite
//! effects, the first one (lower priority number) claims the triple and the
//! other is skipped without being attempted. A failing rule is recorded as
//! failed and the cycle moves on.
//!
//! Cycles are independent and may run concurrently; the ledger's per-triple
//! locking keeps their assignment writes consistent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditStore, ExecutionOutcome, RuleExecutionRecord};
use crate::config::GovernanceConfig;
use crate::error::{GovernanceError, Result};
use crate::events::ChangeEvent;
use crate::expression::{matches, EvalContext, FunctionContext};
use crate::notify::{spawn_dispatch, NotificationDispatcher, NotificationRequest};
use crate::services::assignment::{AssignmentFilter, AssignmentService, AssignmentTriple, Grant};
use crate::services::entity_definition::EntityDefinitionStore;
use crate::services::entity_instance::{
    CreateEntityInstanceInput, EntityInstance, EntityInstanceFilter, EntityInstanceService,
};
use crate::services::property_value::PropertyValueService;
use crate::services::rule::{AccessRule, ActionConfig, RuleService};
use crate::types::{
    Actor, CorrelationId, EntityInstanceId, IntegrationSystemId, RuleId, TriggerType,
};
use crate::value::AttributeValue;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("PLACEHOLDER is a valid regex pattern"));

// ============================================================================
// Outcomes
// ============================================================================

/// Why a matched rule did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The rule is inactive.
    Inactive,
    /// An earlier rule in the cycle took the opposite action on the same triple.
    HigherPriorityWon {
        /// The rule that claimed the triple.
        winner: RuleId,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::HigherPriorityWon { winner } => write!(f, "higher priority rule {winner} won"),
        }
    }
}

/// Result of one rule in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RuleOutcomeStatus {
    /// The action ran; `changed` is false when it was already satisfied.
    Succeeded {
        /// Whether the action changed any state.
        changed: bool,
    },
    /// The rule matched but was not executed.
    Skipped(SkipReason),
    /// Condition evaluation or the action failed.
    Failed(String),
}

impl RuleOutcomeStatus {
    /// The recorder's outcome class.
    #[must_use]
    pub fn execution_outcome(&self) -> ExecutionOutcome {
        match self {
            Self::Succeeded { .. } => ExecutionOutcome::Succeeded,
            Self::Skipped(_) => ExecutionOutcome::Skipped,
            Self::Failed(_) => ExecutionOutcome::Failed,
        }
    }

    /// Whether the action changed state.
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Succeeded { changed: true })
    }
}

impl fmt::Display for RuleOutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { changed: true } => write!(f, "succeeded"),
            Self::Succeeded { changed: false } => write!(f, "succeeded (already satisfied)"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// One rule's entry in a cycle report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    /// Rule.
    pub rule_id: RuleId,
    /// Rule name at execution time.
    pub rule_name: String,
    /// Rule priority at execution time.
    pub priority: i32,
    /// What happened.
    pub status: RuleOutcomeStatus,
    /// When evaluation of the rule started.
    pub started_at: DateTime<Utc>,
    /// Wall time spent on the rule.
    pub duration_ms: u64,
}

/// Everything one evaluation cycle did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// Correlation id stamped on every write of the cycle.
    pub correlation_id: CorrelationId,
    /// Trigger the cycle ran for.
    pub trigger: TriggerType,
    /// Instance the cycle evaluated.
    pub instance_id: Option<EntityInstanceId>,
    /// Triggering event, for event-driven cycles.
    pub event: Option<ChangeEvent>,
    /// Outcomes of matched rules in execution order.
    pub outcomes: Vec<RuleOutcome>,
    /// Whether the cycle stopped early on cancellation.
    pub cancelled: bool,
}

impl CycleReport {
    /// Outcome of a rule, if it matched.
    #[must_use]
    pub fn outcome(&self, rule_id: RuleId) -> Option<&RuleOutcome> {
        self.outcomes.iter().find(|o| o.rule_id == rule_id)
    }

    /// Rule ids in execution order.
    #[must_use]
    pub fn order(&self) -> Vec<RuleId> {
        self.outcomes.iter().map(|o| o.rule_id).collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleEffect {
    Grant,
    Revoke,
}

fn role_target(
    action: &ActionConfig,
    subject: Option<EntityInstanceId>,
) -> Option<(AssignmentTriple, RoleEffect)> {
    let (role_id, target_system_id, user_id, effect) = match action {
        ActionConfig::AssignRole {
            role_id,
            target_system_id,
            user_id,
            ..
        } => (role_id, target_system_id, user_id, RoleEffect::Grant),
        ActionConfig::RemoveRole {
            role_id,
            target_system_id,
            user_id,
        } => (role_id, target_system_id, user_id, RoleEffect::Revoke),
        _ => return None,
    };
    let user = user_id.or(subject)?;
    Some((AssignmentTriple::new(user, *role_id, *target_system_id), effect))
}

struct Cycle<'a> {
    trigger: TriggerType,
    instance: Option<EntityInstance>,
    definition_name: Option<String>,
    scope: Option<IntegrationSystemId>,
    event: Option<&'a ChangeEvent>,
    correlation_id: CorrelationId,
    now: DateTime<Utc>,
    actor: Option<Actor>,
    bypass_matching: bool,
}

/// Evaluates access rules against change events, schedules and manual calls.
pub struct RuleEngine {
    rules: Arc<RuleService>,
    definitions: Arc<dyn EntityDefinitionStore>,
    instances: Arc<EntityInstanceService>,
    values: Arc<PropertyValueService>,
    assignments: Arc<AssignmentService>,
    notifier: Arc<dyn NotificationDispatcher>,
    audit_store: Arc<dyn AuditStore>,
    config: GovernanceConfig,
}

impl RuleEngine {
    /// Create a new rule engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: Arc<RuleService>,
        definitions: Arc<dyn EntityDefinitionStore>,
        instances: Arc<EntityInstanceService>,
        values: Arc<PropertyValueService>,
        assignments: Arc<AssignmentService>,
        notifier: Arc<dyn NotificationDispatcher>,
        audit_store: Arc<dyn AuditStore>,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            rules,
            definitions,
            instances,
            values,
            assignments,
            notifier,
            audit_store,
            config,
        }
    }

    /// Run one cycle for a change event.
    ///
    /// Actions that mutate attributes publish events of their own; those are
    /// not processed here.
    #[tracing::instrument(
        skip_all,
        fields(event_id = %event.id, trigger = %event.trigger_type(), instance_id = %event.instance_id)
    )]
    pub async fn process_event(&self, event: &ChangeEvent) -> Result<CycleReport> {
        let trigger = event.trigger_type();
        let candidates = self.rules.active_for_trigger(trigger).await?;
        let instance = self
            .instances
            .get_including_retired(event.instance_id)
            .await?;
        let mut cycle = self.cycle(trigger, instance, None, false).await?;
        cycle.event = Some(event);
        if let Some(correlation_id) = event.correlation_id {
            cycle.correlation_id = correlation_id;
        }
        self.run_cycle(cycle, candidates, &CancellationToken::new())
            .await
    }

    /// Evaluate every active scheduled rule against every live instance,
    /// one cycle per instance.
    ///
    /// Cancellation is honored between rules; the rule being executed is
    /// always finished first.
    #[tracing::instrument(skip_all)]
    pub async fn run_scheduled(&self, cancel: &CancellationToken) -> Result<Vec<CycleReport>> {
        let candidates = self.rules.active_for_trigger(TriggerType::Schedule).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let instances = self
            .instances
            .list(&EntityInstanceFilter::default())
            .await?;

        let mut reports = Vec::with_capacity(instances.len());
        for instance in instances {
            if cancel.is_cancelled() {
                tracing::info!(completed = reports.len(), "Scheduled run cancelled");
                break;
            }
            let cycle = self
                .cycle(TriggerType::Schedule, Some(instance), None, false)
                .await?;
            let report = self.run_cycle(cycle, candidates.clone(), cancel).await?;
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }

        tracing::info!(
            rules = candidates.len(),
            cycles = reports.len(),
            "Scheduled run finished"
        );
        Ok(reports)
    }

    /// Execute the given rules out of band.
    ///
    /// Trigger and condition matching are bypassed; ordering, conflict
    /// resolution and recording are not. Writes are attributed to `actor`.
    #[tracing::instrument(
        skip_all,
        fields(rules = rule_ids.len(), instance_id = ?instance_id, actor = %actor)
    )]
    pub async fn execute_manual(
        &self,
        rule_ids: &[RuleId],
        instance_id: Option<EntityInstanceId>,
        actor: Actor,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let mut candidates = Vec::with_capacity(rule_ids.len());
        for id in rule_ids {
            if !candidates.iter().any(|r: &AccessRule| r.id == *id) {
                candidates.push(self.rules.require(*id).await?);
            }
        }
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let instance = match instance_id {
            Some(id) => Some(self.instances.require(id).await?),
            None => None,
        };
        let cycle = self
            .cycle(TriggerType::Manual, instance, Some(actor), true)
            .await?;
        self.run_cycle(cycle, candidates, cancel).await
    }

    async fn cycle<'a>(
        &self,
        trigger: TriggerType,
        instance: Option<EntityInstance>,
        actor: Option<Actor>,
        bypass_matching: bool,
    ) -> Result<Cycle<'a>> {
        let definition = match &instance {
            Some(instance) => self.definitions.get(instance.entity_definition_id).await?,
            None => None,
        };
        Ok(Cycle {
            trigger,
            instance,
            scope: definition.as_ref().map(|d| d.integration_system_id),
            definition_name: definition.map(|d| d.name),
            event: None,
            correlation_id: CorrelationId::new(),
            now: Utc::now(),
            actor,
            bypass_matching,
        })
    }

    async fn run_cycle(
        &self,
        cycle: Cycle<'_>,
        mut candidates: Vec<AccessRule>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        if candidates.len() > self.config.max_cycle_rules {
            tracing::warn!(
                candidates = candidates.len(),
                limit = self.config.max_cycle_rules,
                "Rule cycle truncated"
            );
            candidates.truncate(self.config.max_cycle_rules);
        }

        let mut report = CycleReport {
            correlation_id: cycle.correlation_id,
            trigger: cycle.trigger,
            instance_id: cycle.instance.as_ref().map(|i| i.id),
            event: cycle.event.cloned(),
            outcomes: Vec::new(),
            cancelled: false,
        };
        let mut claimed = HashMap::new();

        for (index, rule) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    correlation_id = %cycle.correlation_id,
                    remaining = candidates.len() - index,
                    "Rule cycle cancelled"
                );
                report.cancelled = true;
                break;
            }

            let started = Instant::now();
            let started_at = Utc::now();
            let Some(status) = self.evaluate_rule(&cycle, rule, &mut claimed).await else {
                continue;
            };
            let outcome = RuleOutcome {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                priority: rule.priority,
                status,
                started_at,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            if outcome.status != RuleOutcomeStatus::Skipped(SkipReason::Inactive) {
                self.record(&cycle, &outcome).await;
            }
            report.outcomes.push(outcome);
        }

        tracing::debug!(
            correlation_id = %cycle.correlation_id,
            matched = report.outcomes.len(),
            "Rule cycle finished"
        );
        Ok(report)
    }

    /// `None` when the rule does not match.
    async fn evaluate_rule(
        &self,
        cycle: &Cycle<'_>,
        rule: &AccessRule,
        claimed: &mut HashMap<AssignmentTriple, (RoleEffect, RuleId)>,
    ) -> Option<RuleOutcomeStatus> {
        if !rule.is_active {
            return Some(RuleOutcomeStatus::Skipped(SkipReason::Inactive));
        }
        let subject = cycle.instance.as_ref();

        if !cycle.bypass_matching {
            if rule
                .integration_system_id
                .is_some_and(|system| cycle.scope != Some(system))
            {
                return None;
            }
            let matched = match self.context(cycle, subject).await {
                Ok(ctx) => matches(rule.condition.as_ref(), &ctx)
                    .map_err(|e| format!("condition evaluation failed: {e}")),
                Err(e) => Err(format!("could not build evaluation context: {e}")),
            };
            match matched {
                Ok(true) => {}
                Ok(false) => return None,
                Err(message) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        trigger = %cycle.trigger,
                        instance_id = ?subject.map(|i| i.id),
                        error = %message,
                        "Rule condition failed"
                    );
                    return Some(RuleOutcomeStatus::Failed(message));
                }
            }
        }

        if let Some((triple, effect)) = role_target(&rule.action, subject.map(|i| i.id)) {
            match claimed.get(&triple) {
                Some(&(held, winner)) if held != effect => {
                    tracing::info!(
                        rule_id = %rule.id,
                        winner = %winner,
                        triple = %triple,
                        "Rule skipped, higher priority rule won"
                    );
                    return Some(RuleOutcomeStatus::Skipped(SkipReason::HigherPriorityWon {
                        winner,
                    }));
                }
                Some(_) => {}
                None => {
                    claimed.insert(triple, (effect, rule.id));
                }
            }
        }

        let actor = cycle.actor.unwrap_or(Actor::Rule(rule.id));
        match self.execute(cycle, rule, subject, actor).await {
            Ok(changed) => Some(RuleOutcomeStatus::Succeeded { changed }),
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    action = %rule.action_type,
                    trigger = %cycle.trigger,
                    instance_id = ?subject.map(|i| i.id),
                    error = %e,
                    "Rule action failed"
                );
                Some(RuleOutcomeStatus::Failed(e.to_string()))
            }
        }
    }

    async fn context(
        &self,
        cycle: &Cycle<'_>,
        subject: Option<&EntityInstance>,
    ) -> Result<EvalContext> {
        let mut ctx = EvalContext::new();
        let mut functions = FunctionContext::new().at(cycle.now);

        if let Some(instance) = subject {
            ctx = ctx
                .with_attribute("external_id", instance.external_id.clone())
                .with_attribute("display_name", instance.display_name.clone())
                .with_attribute("is_active", instance.is_active);
            if let Some(name) = &cycle.definition_name {
                ctx = ctx.with_attribute("entity_definition", name.clone());
            }
            if instance.meta.is_live() {
                for (name, value) in self.values.named_values(instance).await? {
                    ctx = ctx.with_attribute(name, value.to_json());
                }
            }
            functions = functions.with_roles(self.role_names(instance.id, cycle.now).await?);
        }

        if let Some(change) = cycle.event.and_then(ChangeEvent::property_change) {
            let old_value = change.old_value.as_ref().map_or(JsonValue::Null, AttributeValue::to_json);
            let new_value = change.new_value.as_ref().map_or(JsonValue::Null, AttributeValue::to_json);
            ctx = ctx
                .with_attribute("changed_property", change.property_name.clone())
                .with_attribute("old_value", old_value)
                .with_attribute("new_value", new_value);
            functions = functions.with_changed([change.property_name.as_str()]);
        }

        Ok(ctx.with_functions(functions))
    }

    async fn role_names(&self, user_id: EntityInstanceId, at: DateTime<Utc>) -> Result<Vec<String>> {
        let held = self
            .assignments
            .list(&AssignmentFilter {
                user_id: Some(user_id),
                is_active: Some(true),
                ..Default::default()
            })
            .await?;

        let mut names = Vec::new();
        for assignment in held.into_iter().filter(|a| a.is_effective_at(at)) {
            if let Some(role) = self.instances.get(assignment.role_id).await? {
                names.push(role.display_name);
                names.push(role.external_id);
            }
        }
        Ok(names)
    }

    async fn execute(
        &self,
        cycle: &Cycle<'_>,
        rule: &AccessRule,
        subject: Option<&EntityInstance>,
        actor: Actor,
    ) -> Result<bool> {
        let correlation_id = Some(cycle.correlation_id);
        let no_subject = || {
            GovernanceError::Failed(format!("Rule '{}' needs an instance to act on", rule.name))
        };

        match &rule.action {
            ActionConfig::AssignRole {
                role_id,
                target_system_id,
                assignment_type,
                user_id,
                valid_for_days,
            } => {
                let user = user_id.or(subject.map(|i| i.id)).ok_or_else(no_subject)?;
                let grant = Grant {
                    assignment_type: *assignment_type,
                    valid_for: valid_for_days.map(|days| Duration::days(i64::from(days))),
                    reason: Some(format!("Granted by rule '{}'", rule.name)),
                };
                self.assignments
                    .ensure_assigned(
                        AssignmentTriple::new(user, *role_id, *target_system_id),
                        &grant,
                        rule.id,
                        actor,
                        correlation_id,
                    )
                    .await
            }
            ActionConfig::RemoveRole {
                role_id,
                target_system_id,
                user_id,
            } => {
                let user = user_id.or(subject.map(|i| i.id)).ok_or_else(no_subject)?;
                self.assignments
                    .ensure_removed(
                        AssignmentTriple::new(user, *role_id, *target_system_id),
                        rule.id,
                        actor,
                        correlation_id,
                    )
                    .await
            }
            ActionConfig::UpdateProperty { property_id, value } => {
                let instance = subject.ok_or_else(no_subject)?;
                let write = self
                    .values
                    .upsert_value(instance.id, *property_id, value, actor, correlation_id)
                    .await?;
                Ok(write.changed)
            }
            ActionConfig::CreateEntity {
                entity_definition_id,
                external_id,
                display_name,
                values,
            } => {
                let attributes = match subject {
                    Some(instance) if instance.meta.is_live() => {
                        self.values.named_values(instance).await?
                    }
                    _ => HashMap::new(),
                };
                let external_id = render(external_id, subject, &attributes)?;
                if self
                    .instances
                    .find_by_external_id(*entity_definition_id, &external_id)
                    .await?
                    .is_some()
                {
                    return Ok(false);
                }
                let display_name = display_name
                    .as_deref()
                    .map(|template| render(template, subject, &attributes))
                    .transpose()?;
                self.instances
                    .create_instance(
                        CreateEntityInstanceInput {
                            entity_definition_id: *entity_definition_id,
                            external_id,
                            display_name,
                            values: values.clone(),
                            ..Default::default()
                        },
                        actor,
                        correlation_id,
                    )
                    .await?;
                Ok(true)
            }
            ActionConfig::DeleteEntity { instance_id } => {
                let target = instance_id.or(subject.map(|i| i.id)).ok_or_else(no_subject)?;
                match self.instances.get(target).await? {
                    Some(instance) => {
                        self.instances
                            .retire_instance(target, instance.meta.version, actor, correlation_id)
                            .await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            ActionConfig::SendNotification {
                recipient,
                template,
                payload,
            } => {
                let request = NotificationRequest {
                    rule_id: rule.id,
                    instance_id: subject.map(|i| i.id),
                    recipient: recipient.clone(),
                    template: template.clone(),
                    payload: payload.clone(),
                    correlation_id: cycle.correlation_id,
                };
                spawn_dispatch(
                    self.notifier.clone(),
                    request,
                    self.config.notification_timeout,
                );
                Ok(false)
            }
        }
    }

    async fn record(&self, cycle: &Cycle<'_>, outcome: &RuleOutcome) {
        let detail = outcome.status.to_string();
        if let Err(e) = self
            .rules
            .record_execution(outcome.rule_id, outcome.started_at, &detail)
            .await
        {
            tracing::warn!(rule_id = %outcome.rule_id, error = %e, "Failed to stamp rule execution");
        }

        let record = RuleExecutionRecord {
            id: Uuid::new_v4(),
            rule_id: outcome.rule_id,
            correlation_id: cycle.correlation_id,
            trigger: cycle.trigger,
            instance_id: cycle.instance.as_ref().map(|i| i.id),
            outcome: outcome.status.execution_outcome(),
            detail,
            changed: outcome.status.changed(),
            started_at: outcome.started_at,
            duration_ms: outcome.duration_ms,
        };
        if let Err(e) = self.audit_store.record_rule_execution(record).await {
            tracing::warn!(rule_id = %outcome.rule_id, error = %e, "Failed to record rule execution");
        }
    }
}

/// Substitute `{external_id}`, `{display_name}` and `{Property}` placeholders.
fn render(
    template: &str,
    subject: Option<&EntityInstance>,
    attributes: &HashMap<String, AttributeValue>,
) -> Result<String> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let key = caps[1].trim();
        let value = match (key, subject) {
            ("external_id", Some(instance)) => Some(instance.external_id.clone()),
            ("display_name", Some(instance)) => Some(instance.display_name.clone()),
            _ => attributes.get(key).map(AttributeValue::display_value),
        };
        value.unwrap_or_else(|| {
            missing.get_or_insert_with(|| key.to_string());
            String::new()
        })
    });
    match missing {
        Some(key) => Err(GovernanceError::Failed(format!(
            "No value for placeholder '{{{key}}}'"
        ))),
        None => Ok(rendered.into_owned()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::events::{ChangeKind, InMemoryEventSink};
    use crate::integration::{InMemoryIntegrationRegistry, IntegrationSystem};
    use crate::notify::InMemoryNotificationDispatcher;
    use crate::services::entity_definition::CreateEntityDefinitionInput;
    use crate::services::property_definition::{CreatePropertyDefinitionInput, PropertyDefinition};
    use crate::services::rule::{CreateRuleInput, UpdateRuleInput};
    use crate::services::{Backends, Collaborators, GovernanceServices};
    use crate::types::{AssignmentType, EntityDefinitionId};
    use crate::value::DataType;
    use serde_json::json;

    struct Fixture {
        services: GovernanceServices,
        registry: Arc<InMemoryIntegrationRegistry>,
        events: Arc<InMemoryEventSink>,
        notifications: Arc<InMemoryNotificationDispatcher>,
        audit: Arc<InMemoryAuditStore>,
        system: IntegrationSystemId,
        employees: EntityDefinitionId,
        department: PropertyDefinition,
        it_staff: EntityInstance,
        admin: EntityInstance,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryIntegrationRegistry::new());
        let system = registry
            .register(IntegrationSystem::new("Active Directory", "active_directory"))
            .await;
        let events = Arc::new(InMemoryEventSink::new());
        let notifications = Arc::new(InMemoryNotificationDispatcher::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let services = GovernanceServices::new(
            Backends::in_memory(audit.clone()),
            Collaborators {
                integrations: registry.clone(),
                events: events.clone(),
                notifier: notifications.clone(),
            },
            GovernanceConfig::default(),
        );

        let employees = services
            .entity_definitions
            .create(
                CreateEntityDefinitionInput {
                    integration_system_id: system,
                    name: "Employee".into(),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        let roles = services
            .entity_definitions
            .create(
                CreateEntityDefinitionInput {
                    integration_system_id: system,
                    name: "Role".into(),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        let department = services
            .property_definitions
            .create(
                CreatePropertyDefinitionInput::new(employees.id, "Department", DataType::String),
                Actor::System,
                None,
            )
            .await
            .unwrap();

        let role = |external_id: &str| CreateEntityInstanceInput {
            entity_definition_id: roles.id,
            external_id: external_id.into(),
            ..Default::default()
        };
        let it_staff = services
            .entity_instances
            .create_instance(role("ITStaff"), Actor::System, None)
            .await
            .unwrap();
        let admin = services
            .entity_instances
            .create_instance(role("Admin"), Actor::System, None)
            .await
            .unwrap();
        events.drain().await;

        Fixture {
            services,
            registry,
            events,
            notifications,
            audit,
            system,
            employees: employees.id,
            department,
            it_staff,
            admin,
        }
    }

    impl Fixture {
        async fn employee(&self, external_id: &str, department: &str) -> EntityInstance {
            self.services
                .entity_instances
                .create_instance(
                    CreateEntityInstanceInput {
                        entity_definition_id: self.employees,
                        external_id: external_id.into(),
                        values: HashMap::from([("Department".to_string(), json!(department))]),
                        ..Default::default()
                    },
                    Actor::System,
                    None,
                )
                .await
                .unwrap()
        }

        async fn rule(&self, input: CreateRuleInput) -> AccessRule {
            self.services
                .rules
                .create(input, Actor::System, None)
                .await
                .unwrap()
        }

        fn assign(&self, role: &EntityInstance) -> ActionConfig {
            ActionConfig::AssignRole {
                role_id: role.id,
                target_system_id: self.system,
                assignment_type: AssignmentType::Automatic,
                user_id: None,
                valid_for_days: None,
            }
        }

        fn remove(&self, role: &EntityInstance) -> ActionConfig {
            ActionConfig::RemoveRole {
                role_id: role.id,
                target_system_id: self.system,
                user_id: None,
            }
        }

        async fn created_event(&self) -> ChangeEvent {
            self.events
                .drain()
                .await
                .into_iter()
                .find(|e| e.kind == ChangeKind::EntityCreated)
                .unwrap()
        }

        async fn active(&self, user: &EntityInstance, role: &EntityInstance) -> usize {
            self.services
                .assignments
                .active_for_triple(AssignmentTriple::new(user.id, role.id, self.system))
                .await
                .unwrap()
                .len()
        }
    }

    #[tokio::test]
    async fn test_new_entity_auto_provisioning() {
        let f = fixture().await;
        let rule = f
            .rule(
                CreateRuleInput::new("IT staff", TriggerType::NewEntity, f.assign(&f.it_staff))
                    .when("Department == 'IT'")
                    .priority(1),
            )
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert_eq!(
            report.outcome(rule.id).unwrap().status,
            RuleOutcomeStatus::Succeeded { changed: true }
        );
        assert_eq!(f.active(&emp, &f.it_staff).await, 1);

        let assignment = &f
            .services
            .assignments
            .active_for_triple(AssignmentTriple::new(emp.id, f.it_staff.id, f.system))
            .await
            .unwrap()[0];
        assert_eq!(assignment.rule_ids, vec![rule.id]);
        assert_eq!(assignment.assignment_type, AssignmentType::Automatic);

        let stamped = f.services.rules.require(rule.id).await.unwrap();
        assert_eq!(stamped.last_execution_result.as_deref(), Some("succeeded"));
        assert_eq!(stamped.execution_count, 1);
        assert_eq!(
            f.audit.list_rule_executions(rule.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let f = fixture().await;
        let rule = f
            .rule(
                CreateRuleInput::new("IT staff", TriggerType::NewEntity, f.assign(&f.it_staff))
                    .when("Department == 'IT'"),
            )
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        f.services.engine.process_event(&event).await.unwrap();
        let again = f.services.engine.process_event(&event).await.unwrap();
        assert_eq!(
            again.outcome(rule.id).unwrap().status,
            RuleOutcomeStatus::Succeeded { changed: false }
        );
        assert_eq!(f.active(&emp, &f.it_staff).await, 1);
    }

    #[tokio::test]
    async fn test_condition_mismatch_leaves_no_trace() {
        let f = fixture().await;
        let rule = f
            .rule(
                CreateRuleInput::new("IT staff", TriggerType::NewEntity, f.assign(&f.it_staff))
                    .when("Department == 'IT'"),
            )
            .await;
        let emp = f.employee("EMP200", "HR").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(f.active(&emp, &f.it_staff).await, 0);
        let untouched = f.services.rules.require(rule.id).await.unwrap();
        assert!(untouched.last_executed_at.is_none());
    }

    #[tokio::test]
    async fn test_conflicting_rules_higher_priority_wins() {
        let f = fixture().await;
        let grant = f
            .rule(
                CreateRuleInput::new("grant admin", TriggerType::NewEntity, f.assign(&f.admin))
                    .priority(1),
            )
            .await;
        let revoke = f
            .rule(
                CreateRuleInput::new("revoke admin", TriggerType::NewEntity, f.remove(&f.admin))
                    .priority(2),
            )
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert_eq!(report.order(), vec![grant.id, revoke.id]);
        assert_eq!(
            report.outcome(revoke.id).unwrap().status,
            RuleOutcomeStatus::Skipped(SkipReason::HigherPriorityWon { winner: grant.id })
        );
        assert_eq!(f.active(&emp, &f.admin).await, 1);

        let loser = f.services.rules.require(revoke.id).await.unwrap();
        assert!(loser
            .last_execution_result
            .unwrap()
            .starts_with("skipped"));
    }

    #[tokio::test]
    async fn test_failed_condition_does_not_abort_cycle() {
        let f = fixture().await;
        let broken = f
            .rule(
                CreateRuleInput::new("broken", TriggerType::NewEntity, f.assign(&f.admin))
                    .when("Department > 5")
                    .priority(1),
            )
            .await;
        let healthy = f
            .rule(
                CreateRuleInput::new("healthy", TriggerType::NewEntity, f.assign(&f.it_staff))
                    .priority(2),
            )
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert!(matches!(
            report.outcome(broken.id).unwrap().status,
            RuleOutcomeStatus::Failed(_)
        ));
        assert_eq!(
            report.outcome(healthy.id).unwrap().status,
            RuleOutcomeStatus::Succeeded { changed: true }
        );
        assert_eq!(f.active(&emp, &f.admin).await, 0);
        assert_eq!(f.active(&emp, &f.it_staff).await, 1);
    }

    #[tokio::test]
    async fn test_property_change_context() {
        let f = fixture().await;
        let rule = f
            .rule(
                CreateRuleInput::new(
                    "moved to IT",
                    TriggerType::PropertyChange,
                    f.assign(&f.it_staff),
                )
                .when("changed('Department') AND new_value = 'IT' AND old_value = 'HR'"),
            )
            .await;
        let emp = f.employee("EMP100", "HR").await;
        f.events.drain().await;

        f.services
            .property_values
            .upsert_value(emp.id, f.department.id, &json!("IT"), Actor::System, None)
            .await
            .unwrap();
        let events = f.events.drain().await;
        assert_eq!(events.len(), 1);

        let report = f.services.engine.process_event(&events[0]).await.unwrap();
        assert!(report.outcome(rule.id).unwrap().status.changed());
        assert_eq!(f.active(&emp, &f.it_staff).await, 1);
    }

    #[tokio::test]
    async fn test_has_role_sees_earlier_rules_in_cycle() {
        let f = fixture().await;
        f.rule(
            CreateRuleInput::new("IT staff", TriggerType::NewEntity, f.assign(&f.it_staff))
                .priority(1),
        )
        .await;
        let escalate = f
            .rule(
                CreateRuleInput::new("escalate", TriggerType::NewEntity, f.assign(&f.admin))
                    .when("has_role('ITStaff')")
                    .priority(2),
            )
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert!(report.outcome(escalate.id).is_some());
        assert_eq!(f.active(&emp, &f.admin).await, 1);
    }

    #[tokio::test]
    async fn test_scoped_rule_ignores_other_systems() {
        let f = fixture().await;
        let hr = f
            .registry
            .register(IntegrationSystem::new("HR", "workday"))
            .await;
        let scoped = |name: &str, system| {
            let mut input =
                CreateRuleInput::new(name, TriggerType::NewEntity, f.assign(&f.it_staff));
            input.integration_system_id = Some(system);
            input
        };
        let elsewhere = f.rule(scoped("hr only", hr)).await;
        let here = f.rule(scoped("ad only", f.system)).await;

        f.employee("EMP100", "IT").await;
        let event = f.created_event().await;
        let report = f.services.engine.process_event(&event).await.unwrap();
        assert!(report.outcome(elsewhere.id).is_none());
        assert!(report.outcome(here.id).is_some());
    }

    #[tokio::test]
    async fn test_manual_execution_bypasses_matching() {
        let f = fixture().await;
        let emp = f.employee("EMP100", "HR").await;
        let rule = f
            .rule(
                CreateRuleInput::new("IT staff", TriggerType::NewEntity, f.assign(&f.it_staff))
                    .when("Department == 'IT'"),
            )
            .await;
        let inactive = f
            .rule(CreateRuleInput::new(
                "dormant",
                TriggerType::Manual,
                f.assign(&f.admin),
            ))
            .await;
        f.services
            .rules
            .update(
                inactive.id,
                UpdateRuleInput {
                    expected_version: 1,
                    is_active: Some(false),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();

        let report = f
            .services
            .engine
            .execute_manual(
                &[inactive.id, rule.id, rule.id],
                Some(emp.id),
                Actor::System,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            report.outcome(inactive.id).unwrap().status,
            RuleOutcomeStatus::Skipped(SkipReason::Inactive)
        );
        assert_eq!(f.active(&emp, &f.it_staff).await, 1);
        assert!(f
            .audit
            .list_rule_executions(inactive.id)
            .await
            .unwrap()
            .is_empty());
        let stamped = f.services.rules.require(rule.id).await.unwrap();
        assert!(stamped.last_executed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_before_next_rule() {
        let f = fixture().await;
        f.rule(CreateRuleInput::new(
            "IT staff",
            TriggerType::Schedule,
            f.assign(&f.it_staff),
        ))
        .await;
        let emp = f.employee("EMP100", "IT").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let reports = f.services.engine.run_scheduled(&cancel).await.unwrap();
        assert!(reports.is_empty());
        assert_eq!(f.active(&emp, &f.it_staff).await, 0);
    }

    #[tokio::test]
    async fn test_scheduled_run_visits_every_instance() {
        let f = fixture().await;
        f.rule(
            CreateRuleInput::new("IT staff", TriggerType::Schedule, f.assign(&f.it_staff))
                .when("entity_definition = 'Employee' AND Department = 'IT'"),
        )
        .await;
        let first = f.employee("EMP100", "IT").await;
        let second = f.employee("EMP101", "IT").await;
        let other = f.employee("EMP102", "HR").await;

        let reports = f
            .services
            .engine
            .run_scheduled(&CancellationToken::new())
            .await
            .unwrap();
        // Two roles plus three employees.
        assert_eq!(reports.len(), 5);
        assert_eq!(f.active(&first, &f.it_staff).await, 1);
        assert_eq!(f.active(&second, &f.it_staff).await, 1);
        assert_eq!(f.active(&other, &f.it_staff).await, 0);
    }

    #[tokio::test]
    async fn test_create_entity_renders_template_once() {
        let f = fixture().await;
        let accounts = f
            .services
            .entity_definitions
            .create(
                CreateEntityDefinitionInput {
                    integration_system_id: f.system,
                    name: "Account".into(),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        let rule = f
            .rule(CreateRuleInput::new(
                "provision account",
                TriggerType::NewEntity,
                ActionConfig::CreateEntity {
                    entity_definition_id: accounts.id,
                    external_id: "acct-{external_id}".into(),
                    display_name: Some("{Department} account".into()),
                    values: HashMap::new(),
                },
            ))
            .await;
        f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        f.services.engine.process_event(&event).await.unwrap();
        let account = f
            .services
            .entity_instances
            .find_by_external_id(accounts.id, "acct-EMP100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.display_name, "IT account");

        let again = f.services.engine.process_event(&event).await.unwrap();
        assert_eq!(
            again.outcome(rule.id).unwrap().status,
            RuleOutcomeStatus::Succeeded { changed: false }
        );
    }

    #[tokio::test]
    async fn test_notification_is_dispatched_in_background() {
        let f = fixture().await;
        let rule = f
            .rule(CreateRuleInput::new(
                "welcome",
                TriggerType::NewEntity,
                ActionConfig::SendNotification {
                    recipient: "it-onboarding@example.com".into(),
                    template: "welcome".into(),
                    payload: json!({"priority": "low"}),
                },
            ))
            .await;
        let emp = f.employee("EMP100", "IT").await;
        let event = f.created_event().await;

        let report = f.services.engine.process_event(&event).await.unwrap();
        assert_eq!(
            report.outcome(rule.id).unwrap().status,
            RuleOutcomeStatus::Succeeded { changed: false }
        );

        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                let sent = f.notifications.sent().await;
                if !sent.is_empty() {
                    return sent;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sent[0].instance_id, Some(emp.id));
        assert_eq!(sent[0].correlation_id, report.correlation_id);
    }

    #[test]
    fn test_render_reports_unknown_placeholder() {
        let attributes = HashMap::from([(
            "Department".to_string(),
            AttributeValue::String("IT".into()),
        )]);
        assert_eq!(
            render("team-{Department}", None, &attributes).unwrap(),
            "team-IT"
        );
        assert!(render("{Missing}", None, &attributes).is_err());
    }
}
