//! Access assignment ledger.
//!
//! An [`AccessAssignment`] binds a user instance to a role instance within a
//! target integration system over a validity window. At most one active,
//! non-deleted assignment may exist per [`AssignmentTriple`] over any
//! overlapping window; the store enforces this atomically and every service
//! write to a triple is serialized by a keyed lock.
//!
//! Deactivation closes the window instead of erasing it, so
//! [`AssignmentService::effective_at`] can answer what access a user held at
//! any past instant.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::error::{GovernanceError, Result};
use crate::integration::{require_system, IntegrationRegistry};
use crate::locks::{KeyedLocks, KeyedRwLocks};
use crate::record::{check_version, replace_checked, retry_on_conflict, RecordMeta, RetryPolicy, Versioned};
use crate::services::entity_instance::{EntityInstance, EntityInstanceStore};
use crate::types::{
    Actor, AssignmentId, AssignmentType, CorrelationId, EntityDefinitionId, EntityInstanceId,
    IntegrationSystemId, RuleId,
};

// ============================================================================
// Domain Types
// ============================================================================

/// The key of the active-uniqueness invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssignmentTriple {
    /// User instance.
    pub user_id: EntityInstanceId,
    /// Role instance.
    pub role_id: EntityInstanceId,
    /// Target integration system.
    pub target_system_id: IntegrationSystemId,
}

impl AssignmentTriple {
    /// Create a triple.
    #[must_use]
    pub fn new(
        user_id: EntityInstanceId,
        role_id: EntityInstanceId,
        target_system_id: IntegrationSystemId,
    ) -> Self {
        Self {
            user_id,
            role_id,
            target_system_id,
        }
    }
}

impl fmt::Display for AssignmentTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.user_id, self.role_id, self.target_system_id)
    }
}

/// A user's role in a target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAssignment {
    /// Unique identifier.
    pub id: AssignmentId,
    /// User instance.
    pub user_id: EntityInstanceId,
    /// Role instance.
    pub role_id: EntityInstanceId,
    /// Target integration system.
    pub target_system_id: IntegrationSystemId,
    /// How the assignment came about.
    pub assignment_type: AssignmentType,
    /// Free-text reason.
    pub reason: Option<String>,
    /// Active flag; false while suspended or after deactivation.
    pub is_active: bool,
    /// Start of validity (inclusive).
    pub effective_from: DateTime<Utc>,
    /// End of validity (exclusive); `None` for open-ended.
    pub effective_to: Option<DateTime<Utc>>,
    /// Who approved the assignment.
    pub approved_by: Option<Uuid>,
    /// When it was approved.
    pub approved_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// Rules that created or affected the assignment.
    pub rule_ids: Vec<RuleId>,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl AccessAssignment {
    /// A new active, open-ended assignment effective now.
    #[must_use]
    pub fn new(triple: AssignmentTriple, assignment_type: AssignmentType, actor: Actor) -> Self {
        let meta = RecordMeta::new(actor);
        Self {
            id: AssignmentId::new(),
            user_id: triple.user_id,
            role_id: triple.role_id,
            target_system_id: triple.target_system_id,
            assignment_type,
            reason: None,
            is_active: true,
            effective_from: meta.created_at,
            effective_to: None,
            approved_by: None,
            approved_at: None,
            metadata: serde_json::Value::Null,
            rule_ids: Vec::new(),
            meta,
        }
    }

    /// The uniqueness key.
    #[must_use]
    pub fn triple(&self) -> AssignmentTriple {
        AssignmentTriple::new(self.user_id, self.role_id, self.target_system_id)
    }

    /// Whether the window contains `at`.
    #[must_use]
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.is_none_or(|to| at < to)
    }

    /// Whether the windows of two assignments overlap.
    #[must_use]
    pub fn overlaps(&self, other: &AccessAssignment) -> bool {
        let before_end = |from: DateTime<Utc>, to: Option<DateTime<Utc>>| to.is_none_or(|to| from < to);
        before_end(self.effective_from, other.effective_to)
            && before_end(other.effective_from, self.effective_to)
    }

    /// Whether the row occupies its triple's uniqueness slot.
    #[must_use]
    pub fn holds_slot(&self) -> bool {
        self.meta.is_live() && self.is_active
    }

    /// Whether `other` would violate the invariant alongside `self`.
    #[must_use]
    pub fn conflicts_with(&self, other: &AccessAssignment) -> bool {
        self.id != other.id
            && self.holds_slot()
            && other.holds_slot()
            && self.triple() == other.triple()
            && self.overlaps(other)
    }

    fn link(&mut self, rule_id: RuleId) -> bool {
        if self.rule_ids.contains(&rule_id) {
            false
        } else {
            self.rule_ids.push(rule_id);
            true
        }
    }

    fn close(&mut self, at: DateTime<Utc>, actor: Actor) {
        self.is_active = false;
        if self.effective_to.is_none_or(|to| to > at) {
            self.effective_to = Some(at.max(self.effective_from));
        }
        self.meta.mark_deleted(actor);
    }
}

impl Versioned for AccessAssignment {
    const ENTITY: &'static str = "AccessAssignment";

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

/// Input for creating an assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateAssignmentInput {
    /// User instance.
    pub user_id: EntityInstanceId,
    /// Role instance.
    pub role_id: EntityInstanceId,
    /// Target integration system.
    pub target_system_id: IntegrationSystemId,
    /// Assignment type.
    #[serde(default)]
    pub assignment_type: AssignmentType,
    /// Reason.
    pub reason: Option<String>,
    /// Start of validity, defaults to now.
    pub effective_from: Option<DateTime<Utc>>,
    /// End of validity; required for temporary assignments.
    pub effective_to: Option<DateTime<Utc>>,
    /// Free-form metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Input for updating an assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAssignmentInput {
    /// Version the caller read.
    pub expected_version: u64,
    /// New user instance.
    pub user_id: Option<EntityInstanceId>,
    /// New role instance.
    pub role_id: Option<EntityInstanceId>,
    /// New target system.
    pub target_system_id: Option<IntegrationSystemId>,
    /// New assignment type.
    pub assignment_type: Option<AssignmentType>,
    /// New reason.
    pub reason: Option<String>,
    /// New start of validity.
    pub effective_from: Option<DateTime<Utc>>,
    /// New end of validity; `Some(None)` makes it open-ended.
    pub effective_to: Option<Option<DateTime<Utc>>>,
    /// New metadata.
    pub metadata: Option<serde_json::Value>,
}

impl UpdateAssignmentInput {
    /// The assignment after applying this update to `current`.
    fn apply_to(&self, current: &AccessAssignment) -> AccessAssignment {
        let mut next = current.clone();
        if let Some(user_id) = self.user_id {
            next.user_id = user_id;
        }
        if let Some(role_id) = self.role_id {
            next.role_id = role_id;
        }
        if let Some(target_system_id) = self.target_system_id {
            next.target_system_id = target_system_id;
        }
        if let Some(assignment_type) = self.assignment_type {
            next.assignment_type = assignment_type;
        }
        if let Some(reason) = &self.reason {
            next.reason = Some(reason.clone());
        }
        if let Some(from) = self.effective_from {
            next.effective_from = from;
        }
        if let Some(to) = self.effective_to {
            next.effective_to = to;
        }
        if let Some(metadata) = &self.metadata {
            next.metadata = metadata.clone();
        }
        next
    }
}

/// Filter for listing assignments.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    /// Filter by user.
    pub user_id: Option<EntityInstanceId>,
    /// Filter by role.
    pub role_id: Option<EntityInstanceId>,
    /// Filter by target system.
    pub target_system_id: Option<IntegrationSystemId>,
    /// Filter by active flag.
    pub is_active: Option<bool>,
    /// Only assignments linked to this rule.
    pub rule_id: Option<RuleId>,
    /// Include deactivated (soft-deleted) rows.
    pub include_deleted: bool,
}

impl AssignmentFilter {
    /// Active rows of one triple.
    #[must_use]
    pub fn active_triple(triple: AssignmentTriple) -> Self {
        Self {
            user_id: Some(triple.user_id),
            role_id: Some(triple.role_id),
            target_system_id: Some(triple.target_system_id),
            is_active: Some(true),
            ..Default::default()
        }
    }
}

/// Parameters of a rule-driven grant.
#[derive(Debug, Clone, Default)]
pub struct Grant {
    /// Assignment type of a new row.
    pub assignment_type: AssignmentType,
    /// Validity of a new row, open-ended when `None`.
    pub valid_for: Option<Duration>,
    /// Reason recorded on a new row.
    pub reason: Option<String>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for assignment storage backends.
///
/// `insert_unique` and `replace` must check the active-uniqueness invariant
/// and write in one atomic step.
#[async_trait::async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Get a live assignment by ID.
    async fn get(&self, id: AssignmentId) -> Result<Option<AccessAssignment>>;

    /// Insert an assignment unless it conflicts with an active one.
    async fn insert_unique(&self, assignment: AccessAssignment) -> Result<AccessAssignment>;

    /// Replace an assignment after a version check unless the result
    /// conflicts with another active one.
    async fn replace(
        &self,
        next: AccessAssignment,
        expected_version: u64,
        actor: Actor,
    ) -> Result<AccessAssignment>;

    /// List assignments ordered by `effective_from`.
    async fn list(&self, filter: &AssignmentFilter) -> Result<Vec<AccessAssignment>>;

    /// Number of live, active assignments naming the instance as user or role.
    async fn count_live_referencing(&self, instance_id: EntityInstanceId) -> Result<usize>;

    /// Number of live assignments linked to a rule.
    async fn count_linked_to_rule(&self, rule_id: RuleId) -> Result<usize>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

/// In-memory assignment store for testing.
#[derive(Debug, Default)]
pub struct InMemoryAssignmentStore {
    assignments: Arc<RwLock<HashMap<AssignmentId, AccessAssignment>>>,
}

impl InMemoryAssignmentStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live, active rows of a triple, whatever their windows.
    pub async fn active_count(&self, triple: AssignmentTriple) -> usize {
        self.assignments
            .read()
            .await
            .values()
            .filter(|a| a.holds_slot() && a.triple() == triple)
            .count()
    }
}

fn duplicate_error(assignment: &AccessAssignment) -> GovernanceError {
    GovernanceError::DuplicateActiveAssignment {
        user_id: assignment.user_id.to_string(),
        role_id: assignment.role_id.to_string(),
        target_system_id: assignment.target_system_id.to_string(),
    }
}

#[async_trait::async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get(&self, id: AssignmentId) -> Result<Option<AccessAssignment>> {
        let assignments = self.assignments.read().await;
        Ok(assignments.get(&id).filter(|a| a.meta.is_live()).cloned())
    }

    async fn insert_unique(&self, assignment: AccessAssignment) -> Result<AccessAssignment> {
        let mut assignments = self.assignments.write().await;
        if assignments.values().any(|a| a.conflicts_with(&assignment)) {
            return Err(duplicate_error(&assignment));
        }
        assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    async fn replace(
        &self,
        next: AccessAssignment,
        expected_version: u64,
        actor: Actor,
    ) -> Result<AccessAssignment> {
        let mut assignments = self.assignments.write().await;
        if assignments.values().any(|a| a.conflicts_with(&next)) {
            return Err(duplicate_error(&next));
        }
        let id = next.id;
        replace_checked(&mut assignments, &id, next, expected_version, actor)
    }

    async fn list(&self, filter: &AssignmentFilter) -> Result<Vec<AccessAssignment>> {
        let assignments = self.assignments.read().await;
        let mut results: Vec<_> = assignments
            .values()
            .filter(|a| filter.include_deleted || a.meta.is_live())
            .filter(|a| filter.user_id.is_none_or(|id| a.user_id == id))
            .filter(|a| filter.role_id.is_none_or(|id| a.role_id == id))
            .filter(|a| {
                filter
                    .target_system_id
                    .is_none_or(|id| a.target_system_id == id)
            })
            .filter(|a| filter.is_active.is_none_or(|active| a.is_active == active))
            .filter(|a| filter.rule_id.is_none_or(|id| a.rule_ids.contains(&id)))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            a.effective_from
                .cmp(&b.effective_from)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    async fn count_live_referencing(&self, instance_id: EntityInstanceId) -> Result<usize> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .values()
            .filter(|a| a.holds_slot() && (a.user_id == instance_id || a.role_id == instance_id))
            .count())
    }

    async fn count_linked_to_rule(&self, rule_id: RuleId) -> Result<usize> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .values()
            .filter(|a| a.meta.is_live() && a.rule_ids.contains(&rule_id))
            .count())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Restricts which entity definitions may act as users and as roles.
#[derive(Debug, Clone, Default)]
pub struct DisjointScoping {
    /// Definitions whose instances may be assigned roles.
    pub user_definitions: HashSet<EntityDefinitionId>,
    /// Definitions whose instances may be assigned as roles.
    pub role_definitions: HashSet<EntityDefinitionId>,
}

/// Service for the assignment ledger.
pub struct AssignmentService {
    store: Arc<dyn AssignmentStore>,
    instances: Arc<dyn EntityInstanceStore>,
    integrations: Arc<dyn IntegrationRegistry>,
    audit_store: Arc<dyn AuditStore>,
    triple_locks: KeyedLocks<AssignmentTriple>,
    instance_gate: Arc<KeyedRwLocks<EntityInstanceId>>,
    scoping: Option<DisjointScoping>,
    retry: RetryPolicy,
}

impl AssignmentService {
    /// Create a new assignment service.
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        instances: Arc<dyn EntityInstanceStore>,
        integrations: Arc<dyn IntegrationRegistry>,
        audit_store: Arc<dyn AuditStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            instances,
            integrations,
            audit_store,
            triple_locks: KeyedLocks::new(),
            instance_gate: Arc::new(KeyedRwLocks::new()),
            scoping: None,
            retry,
        }
    }

    /// Share the per-instance gate that instance retirement holds, so no
    /// grant is written for an instance being retired.
    #[must_use]
    pub fn with_instance_gate(mut self, gate: Arc<KeyedRwLocks<EntityInstanceId>>) -> Self {
        self.instance_gate = gate;
        self
    }

    /// Only allow instances of `user_definitions` as users and instances of
    /// `role_definitions` as roles.
    #[must_use]
    pub fn with_disjoint_scoping(
        mut self,
        user_definitions: impl IntoIterator<Item = EntityDefinitionId>,
        role_definitions: impl IntoIterator<Item = EntityDefinitionId>,
    ) -> Self {
        self.scoping = Some(DisjointScoping {
            user_definitions: user_definitions.into_iter().collect(),
            role_definitions: role_definitions.into_iter().collect(),
        });
        self
    }

    async fn live_instance(&self, id: EntityInstanceId) -> Result<EntityInstance> {
        self.instances
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(EntityInstance::ENTITY, id))
    }

    async fn validate_refs(&self, triple: AssignmentTriple) -> Result<()> {
        let user = self.live_instance(triple.user_id).await?;
        let role = self.live_instance(triple.role_id).await?;
        require_system(self.integrations.as_ref(), triple.target_system_id).await?;

        if let Some(scoping) = &self.scoping {
            if !scoping.user_definitions.contains(&user.entity_definition_id) {
                return Err(GovernanceError::Validation(format!(
                    "Instance '{}' cannot be assigned roles",
                    user.external_id
                )));
            }
            if !scoping.role_definitions.contains(&role.entity_definition_id) {
                return Err(GovernanceError::Validation(format!(
                    "Instance '{}' is not a role",
                    role.external_id
                )));
            }
        }
        Ok(())
    }

    /// Hold the user and role of `triple` against retirement and check
    /// they are live.
    async fn hold_refs(&self, triple: AssignmentTriple) -> Result<Vec<OwnedRwLockReadGuard<()>>> {
        let guards = self
            .instance_gate
            .read_all(vec![triple.user_id, triple.role_id])
            .await;
        self.validate_refs(triple).await?;
        Ok(guards)
    }

    async fn lock_triples(
        &self,
        first: AssignmentTriple,
        second: AssignmentTriple,
    ) -> Vec<OwnedMutexGuard<()>> {
        let (low, high) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        let mut guards = vec![self.triple_locks.lock(low).await];
        if high != low {
            guards.push(self.triple_locks.lock(high).await);
        }
        guards
    }

    async fn audit(
        &self,
        action: AuditAction,
        before: Option<&AccessAssignment>,
        after: Option<&AccessAssignment>,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<()> {
        let subject_id = after.or(before).map(|a| a.id.into_inner()).unwrap_or_default();
        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::Assignment,
                subject_id,
                action,
                actor,
                before_state: before.map(|a| serde_json::to_value(a).unwrap_or_default()),
                after_state: after.map(|a| serde_json::to_value(a).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Create an assignment.
    ///
    /// Fails with a conflict when an active assignment of the same triple
    /// overlaps the requested window.
    pub async fn create(
        &self,
        input: CreateAssignmentInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let triple = AssignmentTriple::new(input.user_id, input.role_id, input.target_system_id);
        let refs = self.hold_refs(triple).await?;

        let mut assignment = AccessAssignment::new(triple, input.assignment_type, actor);
        if let Some(from) = input.effective_from {
            assignment.effective_from = from;
        }
        assignment.effective_to = input.effective_to;
        assignment.reason = input.reason;
        assignment.metadata = input.metadata.unwrap_or(serde_json::Value::Null);
        validate_window(&assignment)?;

        let stored = {
            let _guard = self.triple_locks.lock(triple).await;
            self.store.insert_unique(assignment).await?
        };
        drop(refs);

        tracing::info!(
            assignment_id = %stored.id,
            triple = %triple,
            assignment_type = %stored.assignment_type,
            "Assignment created"
        );
        self.audit(AuditAction::Created, None, Some(&stored), actor, correlation_id)
            .await?;
        Ok(stored)
    }

    /// Get a live assignment by ID.
    pub async fn get(&self, id: AssignmentId) -> Result<Option<AccessAssignment>> {
        self.store.get(id).await
    }

    /// Get a live assignment by ID or fail with `NotFound`.
    pub async fn require(&self, id: AssignmentId) -> Result<AccessAssignment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(AccessAssignment::ENTITY, id))
    }

    /// Update an assignment, re-checking uniqueness for the resulting triple
    /// and window.
    pub async fn update(
        &self,
        id: AssignmentId,
        input: UpdateAssignmentInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let before = self.require(id).await?;
        let target = input.apply_to(&before).triple();
        let refs = if target == before.triple() {
            None
        } else {
            Some(self.hold_refs(target).await?)
        };

        let (before, updated) = {
            let _guards = self.lock_triples(before.triple(), target).await;
            let current = self.require(id).await?;
            check_version(&current, input.expected_version)?;
            if current.triple() != before.triple() {
                return Err(GovernanceError::Conflict(format!(
                    "Assignment {id} was moved to another triple concurrently"
                )));
            }
            let next = input.apply_to(&current);
            validate_window(&next)?;
            let updated = self
                .store
                .replace(next, input.expected_version, actor)
                .await?;
            (current, updated)
        };
        drop(refs);

        self.audit(
            AuditAction::Updated,
            Some(&before),
            Some(&updated),
            actor,
            correlation_id,
        )
        .await?;
        Ok(updated)
    }

    /// Deactivate an assignment: mark it inactive and deleted, and close its
    /// window at the current instant.
    pub async fn deactivate(
        &self,
        id: AssignmentId,
        expected_version: u64,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let before = self.require(id).await?;
        let mut next = before.clone();
        next.close(Utc::now(), actor);

        let deactivated = {
            let _guard = self.triple_locks.lock(before.triple()).await;
            self.store.replace(next, expected_version, actor).await?
        };

        tracing::info!(assignment_id = %id, triple = %before.triple(), "Assignment deactivated");
        self.audit(
            AuditAction::Retired,
            Some(&before),
            Some(&deactivated),
            actor,
            correlation_id,
        )
        .await?;
        Ok(deactivated)
    }

    /// Suspend or resume an assignment without touching its window.
    ///
    /// Resuming re-checks the uniqueness invariant.
    pub async fn set_active(
        &self,
        id: AssignmentId,
        expected_version: u64,
        active: bool,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let before = self.require(id).await?;
        if before.is_active == active {
            check_version(&before, expected_version)?;
            return Ok(before);
        }
        let mut next = before.clone();
        next.is_active = active;

        let refs = if active {
            Some(self.hold_refs(before.triple()).await?)
        } else {
            None
        };
        let updated = {
            let _guard = self.triple_locks.lock(before.triple()).await;
            self.store.replace(next, expected_version, actor).await?
        };
        drop(refs);

        let action = if active {
            AuditAction::Activated
        } else {
            AuditAction::Suspended
        };
        tracing::info!(assignment_id = %id, active, "Assignment status toggled");
        self.audit(action, Some(&before), Some(&updated), actor, correlation_id)
            .await?;
        Ok(updated)
    }

    /// Record who approved an assignment.
    pub async fn approve(
        &self,
        id: AssignmentId,
        expected_version: u64,
        approver: Uuid,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let before = self.require(id).await?;
        let mut next = before.clone();
        next.approved_by = Some(approver);
        next.approved_at = Some(Utc::now());

        let approved = {
            let _guard = self.triple_locks.lock(before.triple()).await;
            self.store.replace(next, expected_version, actor).await?
        };

        self.audit(
            AuditAction::Approved,
            Some(&before),
            Some(&approved),
            actor,
            correlation_id,
        )
        .await?;
        Ok(approved)
    }

    /// Link an assignment to a rule that created or affected it.
    ///
    /// Linking twice is a no-op. Lost version races are retried.
    pub async fn link_rule(
        &self,
        id: AssignmentId,
        rule_id: RuleId,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<AccessAssignment> {
        let (linked, changed) =
            retry_on_conflict(self.retry, || self.link_once(id, rule_id, actor)).await?;

        if changed {
            self.audit(AuditAction::RuleLinked, None, Some(&linked), actor, correlation_id)
                .await?;
        }
        Ok(linked)
    }

    async fn link_once(
        &self,
        id: AssignmentId,
        rule_id: RuleId,
        actor: Actor,
    ) -> Result<(AccessAssignment, bool)> {
        let current = self.require(id).await?;
        let mut next = current.clone();
        if !next.link(rule_id) {
            return Ok((current, false));
        }
        let _guard = self.triple_locks.lock(current.triple()).await;
        let stored = self.store.replace(next, current.meta.version, actor).await?;
        Ok((stored, true))
    }

    /// List assignments.
    pub async fn list(&self, filter: &AssignmentFilter) -> Result<Vec<AccessAssignment>> {
        self.store.list(filter).await
    }

    /// Active assignments of a triple effective now.
    pub async fn active_for_triple(
        &self,
        triple: AssignmentTriple,
    ) -> Result<Vec<AccessAssignment>> {
        let now = Utc::now();
        Ok(self
            .store
            .list(&AssignmentFilter::active_triple(triple))
            .await?
            .into_iter()
            .filter(|a| a.is_effective_at(now))
            .collect())
    }

    /// Assignments whose window contained `at`, including since-deactivated
    /// ones.
    pub async fn effective_at(
        &self,
        user_id: EntityInstanceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<AccessAssignment>> {
        Ok(self
            .store
            .list(&AssignmentFilter {
                user_id: Some(user_id),
                include_deleted: true,
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|a| a.is_effective_at(at))
            .collect())
    }

    /// Make sure the triple holds an active assignment linked to `rule_id`.
    ///
    /// Returns false when one was already in place.
    pub async fn ensure_assigned(
        &self,
        triple: AssignmentTriple,
        grant: &Grant,
        rule_id: RuleId,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<bool> {
        let refs = self.hold_refs(triple).await?;

        let created = {
            let _guard = self.triple_locks.lock(triple).await;
            let now = Utc::now();
            let current = self
                .store
                .list(&AssignmentFilter::active_triple(triple))
                .await?
                .into_iter()
                .find(|a| a.is_effective_at(now));

            match current {
                Some(existing) => Err(existing.id),
                None => {
                    let mut assignment =
                        AccessAssignment::new(triple, grant.assignment_type, actor);
                    assignment.effective_to = grant.valid_for.map(|d| assignment.effective_from + d);
                    assignment.reason = grant.reason.clone();
                    assignment.rule_ids.push(rule_id);
                    validate_window(&assignment)?;
                    Ok(self.store.insert_unique(assignment).await?)
                }
            }
        };
        drop(refs);

        match created {
            Ok(stored) => {
                tracing::info!(
                    assignment_id = %stored.id,
                    rule_id = %rule_id,
                    triple = %triple,
                    "Assignment granted by rule"
                );
                self.audit(AuditAction::Created, None, Some(&stored), actor, correlation_id)
                    .await?;
                Ok(true)
            }
            Err(existing) => {
                self.link_rule(existing, rule_id, actor, correlation_id)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Deactivate every active assignment of the triple, linking `rule_id`.
    ///
    /// Returns false when there was nothing to remove.
    pub async fn ensure_removed(
        &self,
        triple: AssignmentTriple,
        rule_id: RuleId,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<bool> {
        let removed = {
            let _guard = self.triple_locks.lock(triple).await;
            let now = Utc::now();
            let current: Vec<_> = self
                .store
                .list(&AssignmentFilter::active_triple(triple))
                .await?
                .into_iter()
                .filter(|a| a.is_effective_at(now))
                .collect();

            let mut removed = Vec::with_capacity(current.len());
            for before in current {
                let mut next = before.clone();
                next.link(rule_id);
                next.close(now, actor);
                let stored = self.store.replace(next, before.meta.version, actor).await?;
                removed.push((before, stored));
            }
            removed
        };

        for (before, after) in &removed {
            tracing::info!(
                assignment_id = %after.id,
                rule_id = %rule_id,
                triple = %triple,
                "Assignment removed by rule"
            );
            self.audit(AuditAction::Retired, Some(before), Some(after), actor, correlation_id)
                .await?;
        }
        Ok(!removed.is_empty())
    }
}

fn validate_window(assignment: &AccessAssignment) -> Result<()> {
    match assignment.effective_to {
        Some(to) if to <= assignment.effective_from => Err(GovernanceError::Validation(
            "effective_to must be after effective_from".to_string(),
        )),
        None if assignment.assignment_type == AssignmentType::Temporary => Err(
            GovernanceError::Validation("temporary assignments require effective_to".to_string()),
        ),
        _ => Ok(()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::error::ErrorKind;
    use crate::integration::{InMemoryIntegrationRegistry, IntegrationSystem};
    use crate::services::entity_instance::InMemoryEntityInstanceStore;

    struct Fixture {
        service: AssignmentService,
        store: Arc<InMemoryAssignmentStore>,
        instances: Arc<InMemoryEntityInstanceStore>,
        employees: EntityDefinitionId,
        roles: EntityDefinitionId,
        triple: AssignmentTriple,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryIntegrationRegistry::new());
        let system = registry
            .register(IntegrationSystem::new("Active Directory", "active_directory"))
            .await;
        let instances = Arc::new(InMemoryEntityInstanceStore::new());
        let (employees, roles) = (EntityDefinitionId::new(), EntityDefinitionId::new());
        let user = instances
            .insert(EntityInstance::new(employees, "EMP100", Actor::System))
            .await
            .unwrap();
        let role = instances
            .insert(EntityInstance::new(roles, "ITStaff", Actor::System))
            .await
            .unwrap();
        let store = Arc::new(InMemoryAssignmentStore::new());
        let service = AssignmentService::new(
            store.clone(),
            instances.clone(),
            registry,
            Arc::new(InMemoryAuditStore::new()),
            RetryPolicy::default(),
        );
        Fixture {
            service,
            store,
            instances,
            employees,
            roles,
            triple: AssignmentTriple::new(user.id, role.id, system),
        }
    }

    fn input(triple: AssignmentTriple) -> CreateAssignmentInput {
        CreateAssignmentInput {
            user_id: triple.user_id,
            role_id: triple.role_id,
            target_system_id: triple.target_system_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_assignment_conflicts() {
        let f = fixture().await;
        f.service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let err = f
            .service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::DuplicateActiveAssignment { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.store.active_count(f.triple).await, 1);
    }

    #[tokio::test]
    async fn test_non_overlapping_windows_coexist() {
        let f = fixture().await;
        let now = Utc::now();
        let mut first = input(f.triple);
        first.effective_to = Some(now + Duration::days(10));
        f.service.create(first, Actor::System, None).await.unwrap();

        let mut later = input(f.triple);
        later.effective_from = Some(now + Duration::days(10));
        f.service.create(later, Actor::System, None).await.unwrap();

        let mut overlapping = input(f.triple);
        overlapping.effective_from = Some(now + Duration::days(5));
        overlapping.effective_to = Some(now + Duration::days(6));
        let err = f
            .service
            .create(overlapping, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_references_are_validated() {
        let f = fixture().await;
        let mut unknown_user = input(f.triple);
        unknown_user.user_id = EntityInstanceId::new();
        let err = f
            .service
            .create(unknown_user, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut unknown_system = input(f.triple);
        unknown_system.target_system_id = IntegrationSystemId::new();
        let err = f
            .service
            .create(unknown_system, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_temporary_requires_end() {
        let f = fixture().await;
        let mut temporary = input(f.triple);
        temporary.assignment_type = AssignmentType::Temporary;
        let err = f
            .service
            .create(temporary.clone(), Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        temporary.effective_to = Some(Utc::now() + Duration::days(1));
        f.service.create(temporary, Actor::System, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_reactivation_rechecks_uniqueness() {
        let f = fixture().await;
        let first = f
            .service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let suspended = f
            .service
            .set_active(first.id, 1, false, Actor::System, None)
            .await
            .unwrap();
        assert!(!suspended.is_active);
        assert!(suspended.effective_to.is_none());

        f.service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let err = f
            .service
            .set_active(first.id, suspended.meta.version, true, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.store.active_count(f.triple).await, 1);
    }

    #[tokio::test]
    async fn test_update_into_taken_triple_conflicts() {
        let f = fixture().await;
        let other_role = f
            .instances
            .insert(EntityInstance::new(f.roles, "Admin", Actor::System))
            .await
            .unwrap();
        f.service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let mut admin = input(f.triple);
        admin.role_id = other_role.id;
        let admin = f.service.create(admin, Actor::System, None).await.unwrap();

        let own = f
            .service
            .update(
                admin.id,
                UpdateAssignmentInput {
                    expected_version: 1,
                    reason: Some("audit finding".into()),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();

        let err = f
            .service
            .update(
                admin.id,
                UpdateAssignmentInput {
                    expected_version: own.meta.version,
                    role_id: Some(f.triple.role_id),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_deactivation_preserves_history() {
        let f = fixture().await;
        let created = f
            .service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let while_held = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let deactivated = f
            .service
            .deactivate(created.id, 1, Actor::System, None)
            .await
            .unwrap();
        assert!(!deactivated.is_active);
        assert!(!deactivated.meta.is_live());
        assert!(deactivated.effective_to.is_some());

        assert!(f.service.active_for_triple(f.triple).await.unwrap().is_empty());
        let held = f
            .service
            .effective_at(f.triple.user_id, while_held)
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
        assert!(f
            .service
            .effective_at(f.triple.user_id, Utc::now())
            .await
            .unwrap()
            .is_empty());

        f.service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_rule_deduplicates() {
        let f = fixture().await;
        let created = f
            .service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let rule = RuleId::new();
        let linked = f
            .service
            .link_rule(created.id, rule, Actor::System, None)
            .await
            .unwrap();
        let again = f
            .service
            .link_rule(created.id, rule, Actor::System, None)
            .await
            .unwrap();
        assert_eq!(linked.rule_ids, vec![rule]);
        assert_eq!(again.meta.version, linked.meta.version);
        assert_eq!(f.store.count_linked_to_rule(rule).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_approve_stamps_approver() {
        let f = fixture().await;
        let created = f
            .service
            .create(input(f.triple), Actor::System, None)
            .await
            .unwrap();
        let approver = Uuid::new_v4();
        let approved = f
            .service
            .approve(created.id, 1, approver, Actor::User(approver), None)
            .await
            .unwrap();
        assert_eq!(approved.approved_by, Some(approver));
        assert!(approved.approved_at.is_some());
    }

    #[tokio::test]
    async fn test_disjoint_scoping() {
        let f = fixture().await;
        let scoped = AssignmentService::new(
            f.store.clone(),
            f.instances.clone(),
            Arc::new({
                let registry = InMemoryIntegrationRegistry::new();
                registry
                    .register(IntegrationSystem {
                        id: f.triple.target_system_id,
                        ..IntegrationSystem::new("Active Directory", "active_directory")
                    })
                    .await;
                registry
            }),
            Arc::new(InMemoryAuditStore::new()),
            RetryPolicy::default(),
        )
        .with_disjoint_scoping([f.employees], [f.roles]);

        let mut swapped = input(f.triple);
        swapped.user_id = f.triple.role_id;
        swapped.role_id = f.triple.user_id;
        let err = scoped.create(swapped, Actor::System, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        scoped.create(input(f.triple), Actor::System, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_assigned_is_idempotent() {
        let f = fixture().await;
        let rule = RuleId::new();
        let grant = Grant {
            assignment_type: AssignmentType::Automatic,
            ..Default::default()
        };
        assert!(f
            .service
            .ensure_assigned(f.triple, &grant, rule, Actor::Rule(rule), None)
            .await
            .unwrap());
        assert!(!f
            .service
            .ensure_assigned(f.triple, &grant, rule, Actor::Rule(rule), None)
            .await
            .unwrap());
        assert_eq!(f.store.active_count(f.triple).await, 1);

        assert!(f
            .service
            .ensure_removed(f.triple, rule, Actor::Rule(rule), None)
            .await
            .unwrap());
        assert!(!f
            .service
            .ensure_removed(f.triple, rule, Actor::Rule(rule), None)
            .await
            .unwrap());
        assert_eq!(f.store.active_count(f.triple).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_keeps_concurrent_rule_link() {
        let f = fixture().await;
        let triple = f.triple;
        let service = Arc::new(f.service);

        for round in 0..32 {
            let created = service.create(input(triple), Actor::System, None).await.unwrap();
            let (id, version) = (created.id, created.meta.version);
            let rule_id = RuleId::new();
            let linker = {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .link_rule(id, rule_id, Actor::Rule(rule_id), None)
                        .await
                })
            };
            let updater = {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .update(
                            id,
                            UpdateAssignmentInput {
                                expected_version: version + 1,
                                reason: Some(format!("round {round}")),
                                ..Default::default()
                            },
                            Actor::System,
                            None,
                        )
                        .await
                })
            };
            linker.await.unwrap().unwrap();
            let updated = updater.await.unwrap();

            let stored = service.require(id).await.unwrap();
            assert!(stored.rule_ids.contains(&rule_id), "rule link lost in round {round}");
            match updated {
                Ok(_) => assert_eq!(stored.reason, Some(format!("round {round}"))),
                Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
            }
            service
                .deactivate(id, stored.meta.version, Actor::System, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_waits_for_retirement_of_user() {
        let f = fixture().await;
        let gate = Arc::new(KeyedRwLocks::new());
        let service = Arc::new(f.service.with_instance_gate(gate.clone()));

        let retiring = gate.write(f.triple.user_id).await;
        let pending = {
            let service = service.clone();
            let triple = f.triple;
            tokio::spawn(async move { service.create(input(triple), Actor::System, None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let mut user = f.instances.get(f.triple.user_id).await.unwrap().unwrap();
        let version = user.meta.version;
        user.meta.mark_deleted(Actor::System);
        f.instances.replace(user, version, Actor::System).await.unwrap();
        drop(retiring);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(f.store.active_count(f.triple).await, 0);
    }
}
