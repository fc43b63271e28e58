//! Entity instance service.
//!
//! An [`EntityInstance`] is one concrete record of an entity definition,
//! identified by its external id within that definition. Its attributes are
//! stored as [`PropertyValue`](super::property_value::PropertyValue)s.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::error::{FieldError, GovernanceError, Result};
use crate::events::{ChangeEvent, ChangeKind, EventSink};
use crate::record::{replace_checked, RecordMeta, Versioned};
use crate::services::assignment::AssignmentStore;
use crate::services::entity_definition::{EntityDefinition, EntityDefinitionStore};
use crate::services::property_value::PropertyValueService;
use crate::types::{Actor, CorrelationId, EntityDefinitionId, EntityInstanceId, SyncStatus};

// ============================================================================
// Domain Types
// ============================================================================

/// One record of an entity definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInstance {
    /// Unique identifier.
    pub id: EntityInstanceId,
    /// Definition this is a record of.
    pub entity_definition_id: EntityDefinitionId,
    /// Identifier in the source system, unique per definition.
    pub external_id: String,
    /// Display name.
    pub display_name: String,
    /// Active flag.
    pub is_active: bool,
    /// When last synchronized.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Synchronization status.
    pub sync_status: SyncStatus,
    /// Raw source payload as last received.
    pub raw_data: JsonValue,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl EntityInstance {
    /// A new active instance pending synchronization.
    #[must_use]
    pub fn new(
        entity_definition_id: EntityDefinitionId,
        external_id: impl Into<String>,
        actor: Actor,
    ) -> Self {
        let external_id = external_id.into();
        Self {
            id: EntityInstanceId::new(),
            entity_definition_id,
            display_name: external_id.clone(),
            external_id,
            is_active: true,
            last_synced_at: None,
            sync_status: SyncStatus::Pending,
            raw_data: JsonValue::Null,
            meta: RecordMeta::new(actor),
        }
    }
}

impl Versioned for EntityInstance {
    const ENTITY: &'static str = "EntityInstance";

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

/// Input for creating an entity instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEntityInstanceInput {
    /// Definition to create a record of.
    pub entity_definition_id: EntityDefinitionId,
    /// Identifier in the source system.
    pub external_id: String,
    /// Display name, defaults to the external id.
    pub display_name: Option<String>,
    /// Active flag, defaults to true.
    pub is_active: Option<bool>,
    /// Raw source payload.
    pub raw_data: Option<JsonValue>,
    /// Initial attribute values keyed by property name.
    #[serde(default)]
    pub values: HashMap<String, JsonValue>,
}

/// Input for updating an entity instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEntityInstanceInput {
    /// Version the caller read.
    pub expected_version: u64,
    /// New display name.
    pub display_name: Option<String>,
    /// New active flag.
    pub is_active: Option<bool>,
    /// New raw payload.
    pub raw_data: Option<JsonValue>,
    /// New synchronization status.
    pub sync_status: Option<SyncStatus>,
    /// New last-synchronized timestamp.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Filter for listing entity instances.
#[derive(Debug, Clone, Default)]
pub struct EntityInstanceFilter {
    /// Filter by definition.
    pub entity_definition_id: Option<EntityDefinitionId>,
    /// Filter by active flag.
    pub is_active: Option<bool>,
    /// Filter by synchronization status.
    pub sync_status: Option<SyncStatus>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for entity instance storage backends.
#[async_trait::async_trait]
pub trait EntityInstanceStore: Send + Sync {
    /// Get a live instance by ID.
    async fn get(&self, id: EntityInstanceId) -> Result<Option<EntityInstance>>;

    /// Get an instance by ID, retired or not.
    async fn get_including_retired(&self, id: EntityInstanceId) -> Result<Option<EntityInstance>>;

    /// Find a live instance by external id within a definition.
    async fn find_by_external_id(
        &self,
        entity_definition_id: EntityDefinitionId,
        external_id: &str,
    ) -> Result<Option<EntityInstance>>;

    /// Insert an instance, rejecting a duplicate live external id.
    async fn insert(&self, instance: EntityInstance) -> Result<EntityInstance>;

    /// Replace an instance after a version check.
    async fn replace(
        &self,
        next: EntityInstance,
        expected_version: u64,
        actor: Actor,
    ) -> Result<EntityInstance>;

    /// Remove an instance whose creation could not be completed.
    async fn purge(&self, id: EntityInstanceId) -> Result<()>;

    /// List live instances ordered by external id.
    async fn list(&self, filter: &EntityInstanceFilter) -> Result<Vec<EntityInstance>>;

    /// Number of live instances of a definition.
    async fn count_live_for_definition(
        &self,
        entity_definition_id: EntityDefinitionId,
    ) -> Result<usize>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

/// In-memory entity instance store for testing.
#[derive(Debug, Default)]
pub struct InMemoryEntityInstanceStore {
    instances: Arc<RwLock<HashMap<EntityInstanceId, EntityInstance>>>,
}

impl InMemoryEntityInstanceStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EntityInstanceStore for InMemoryEntityInstanceStore {
    async fn get(&self, id: EntityInstanceId) -> Result<Option<EntityInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id).filter(|i| i.meta.is_live()).cloned())
    }

    async fn get_including_retired(&self, id: EntityInstanceId) -> Result<Option<EntityInstance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn find_by_external_id(
        &self,
        entity_definition_id: EntityDefinitionId,
        external_id: &str,
    ) -> Result<Option<EntityInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|i| {
                i.meta.is_live()
                    && i.entity_definition_id == entity_definition_id
                    && i.external_id == external_id
            })
            .cloned())
    }

    async fn insert(&self, instance: EntityInstance) -> Result<EntityInstance> {
        let mut instances = self.instances.write().await;
        let duplicate = instances.values().any(|i| {
            i.meta.is_live()
                && i.entity_definition_id == instance.entity_definition_id
                && i.external_id == instance.external_id
        });
        if duplicate {
            return Err(GovernanceError::Conflict(format!(
                "Instance with external id '{}' already exists",
                instance.external_id
            )));
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn replace(
        &self,
        next: EntityInstance,
        expected_version: u64,
        actor: Actor,
    ) -> Result<EntityInstance> {
        let mut instances = self.instances.write().await;
        let id = next.id;
        replace_checked(&mut instances, &id, next, expected_version, actor)
    }

    async fn purge(&self, id: EntityInstanceId) -> Result<()> {
        self.instances.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self, filter: &EntityInstanceFilter) -> Result<Vec<EntityInstance>> {
        let instances = self.instances.read().await;
        let mut results: Vec<_> = instances
            .values()
            .filter(|i| i.meta.is_live())
            .filter(|i| {
                filter
                    .entity_definition_id
                    .is_none_or(|id| i.entity_definition_id == id)
            })
            .filter(|i| filter.is_active.is_none_or(|a| i.is_active == a))
            .filter(|i| filter.sync_status.is_none_or(|s| i.sync_status == s))
            .cloned()
            .collect();

        results.sort_by(|a, b| a.external_id.cmp(&b.external_id).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }

    async fn count_live_for_definition(
        &self,
        entity_definition_id: EntityDefinitionId,
    ) -> Result<usize> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.meta.is_live() && i.entity_definition_id == entity_definition_id)
            .count())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service for the lifecycle of entity instances.
pub struct EntityInstanceService {
    store: Arc<dyn EntityInstanceStore>,
    definitions: Arc<dyn EntityDefinitionStore>,
    values: Arc<PropertyValueService>,
    assignments: Arc<dyn AssignmentStore>,
    events: Arc<dyn EventSink>,
    audit_store: Arc<dyn AuditStore>,
}

impl EntityInstanceService {
    /// Create a new entity instance service.
    pub fn new(
        store: Arc<dyn EntityInstanceStore>,
        definitions: Arc<dyn EntityDefinitionStore>,
        values: Arc<PropertyValueService>,
        assignments: Arc<dyn AssignmentStore>,
        events: Arc<dyn EventSink>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            store,
            definitions,
            values,
            assignments,
            events,
            audit_store,
        }
    }

    /// Create an instance together with its initial values.
    ///
    /// Either the instance and every initial value are stored, or nothing is.
    pub async fn create_instance(
        &self,
        input: CreateEntityInstanceInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityInstance> {
        let definition = self
            .definitions
            .get(input.entity_definition_id)
            .await?
            .ok_or_else(|| {
                GovernanceError::not_found(EntityDefinition::ENTITY, input.entity_definition_id)
            })?;

        let external_id = input.external_id.trim().to_string();
        if external_id.is_empty() {
            return Err(GovernanceError::ValidationFailed(vec![FieldError::new(
                "external_id",
                "must not be empty",
            )]));
        }
        let prepared = self
            .values
            .prepare_initial(definition.id, &input.values)
            .await?;

        let mut instance = EntityInstance::new(definition.id, external_id, actor);
        if let Some(display_name) = input.display_name {
            instance.display_name = display_name;
        }
        instance.is_active = input.is_active.unwrap_or(true);
        instance.raw_data = input.raw_data.unwrap_or(JsonValue::Null);
        let instance = self.store.insert(instance).await?;

        let values = match self
            .values
            .insert_initial(&instance, prepared, actor, correlation_id)
            .await
        {
            Ok(values) => values,
            Err(err) => {
                self.store.purge(instance.id).await?;
                return Err(err);
            }
        };

        tracing::info!(
            instance_id = %instance.id,
            entity_definition = %definition.name,
            external_id = %instance.external_id,
            values = values.len(),
            "Entity instance created"
        );

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityInstance,
                subject_id: instance.id.into_inner(),
                action: AuditAction::Created,
                actor,
                after_state: Some(serde_json::to_value(&instance).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        self.publish(ChangeKind::EntityCreated, &instance, actor, correlation_id)
            .await;

        Ok(instance)
    }

    async fn publish(
        &self,
        kind: ChangeKind,
        instance: &EntityInstance,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) {
        let event = ChangeEvent::new(kind, instance.id, instance.entity_definition_id, actor)
            .with_correlation(correlation_id);
        self.events.publish(event).await;
    }

    /// Get a live instance by ID.
    pub async fn get(&self, id: EntityInstanceId) -> Result<Option<EntityInstance>> {
        self.store.get(id).await
    }

    /// Get a live instance by ID or fail with `NotFound`.
    pub async fn require(&self, id: EntityInstanceId) -> Result<EntityInstance> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(EntityInstance::ENTITY, id))
    }

    /// Get an instance by ID, retired or not.
    pub async fn get_including_retired(
        &self,
        id: EntityInstanceId,
    ) -> Result<Option<EntityInstance>> {
        self.store.get_including_retired(id).await
    }

    /// Find a live instance by external id.
    pub async fn find_by_external_id(
        &self,
        entity_definition_id: EntityDefinitionId,
        external_id: &str,
    ) -> Result<Option<EntityInstance>> {
        self.store
            .find_by_external_id(entity_definition_id, external_id)
            .await
    }

    /// Update an instance's own fields.
    pub async fn update_instance(
        &self,
        id: EntityInstanceId,
        input: UpdateEntityInstanceInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityInstance> {
        let before = self.require(id).await?;

        let mut next = before.clone();
        if let Some(display_name) = input.display_name {
            next.display_name = display_name;
        }
        if let Some(is_active) = input.is_active {
            next.is_active = is_active;
        }
        if let Some(raw_data) = input.raw_data {
            next.raw_data = raw_data;
        }
        if let Some(sync_status) = input.sync_status {
            next.sync_status = sync_status;
        }
        if let Some(last_synced_at) = input.last_synced_at {
            next.last_synced_at = Some(last_synced_at);
        }

        let updated = self
            .store
            .replace(next, input.expected_version, actor)
            .await?;

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityInstance,
                subject_id: id.into_inner(),
                action: AuditAction::Updated,
                actor,
                before_state: Some(serde_json::to_value(&before).unwrap_or_default()),
                after_state: Some(serde_json::to_value(&updated).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        self.publish(ChangeKind::EntityUpdated, &updated, actor, correlation_id)
            .await;

        Ok(updated)
    }

    /// Retire an instance no live assignment references.
    ///
    /// Closes and soft-deletes every value of the instance. Holds the
    /// instance gate exclusively, so no value or grant can be written for
    /// the instance between the dependency check and the retirement.
    pub async fn retire_instance(
        &self,
        id: EntityInstanceId,
        expected_version: u64,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityInstance> {
        let gate = self.values.instance_gate().write(id).await;
        let before = self.require(id).await?;

        let dependents = self.assignments.count_live_referencing(id).await?;
        if dependents > 0 {
            return Err(GovernanceError::DependencyConflict {
                entity: EntityInstance::ENTITY,
                id: id.to_string(),
                dependents,
                dependent: "active assignments",
            });
        }

        let mut next = before.clone();
        next.meta.mark_deleted(actor);
        let retired = self.store.replace(next, expected_version, actor).await?;
        let values = self.values.retire_instance_values(id, actor).await?;
        drop(gate);

        tracing::info!(instance_id = %id, values, "Entity instance retired");

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityInstance,
                subject_id: id.into_inner(),
                action: AuditAction::Retired,
                actor,
                before_state: Some(serde_json::to_value(&before).unwrap_or_default()),
                correlation_id,
                metadata: Some(serde_json::json!({ "retired_values": values })),
                ..Default::default()
            })
            .await?;

        self.publish(ChangeKind::EntityDeleted, &retired, actor, correlation_id)
            .await;

        Ok(retired)
    }

    /// List live instances.
    pub async fn list(&self, filter: &EntityInstanceFilter) -> Result<Vec<EntityInstance>> {
        self.store.list(filter).await
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
    use crate::events::InMemoryEventSink;
    use crate::services::assignment::{AccessAssignment, AssignmentTriple, InMemoryAssignmentStore};
    use crate::services::entity_definition::InMemoryEntityDefinitionStore;
    use crate::services::property_definition::{
        InMemoryPropertyDefinitionStore, PropertyDefinition, PropertyDefinitionStore,
    };
    use crate::services::property_value::InMemoryPropertyValueStore;
    use crate::types::{AssignmentType, IntegrationSystemId, PropertyDefinitionId};
    use crate::value::{AttributeValue, DataType};
    use serde_json::json;

    struct Fixture {
        service: EntityInstanceService,
        values: Arc<PropertyValueService>,
        assignments: Arc<InMemoryAssignmentStore>,
        events: Arc<InMemoryEventSink>,
        definition: EntityDefinitionId,
        department: PropertyDefinitionId,
    }

    fn property(definition: EntityDefinitionId, name: &str, data_type: DataType) -> PropertyDefinition {
        PropertyDefinition {
            id: PropertyDefinitionId::new(),
            entity_definition_id: definition,
            name: name.into(),
            display_name: name.into(),
            description: None,
            data_type,
            source_field: None,
            is_required: false,
            is_unique: false,
            is_searchable: true,
            is_displayed: true,
            is_editable: true,
            sort_order: 0,
            default_value: None,
            validation_rule: None,
            ui_metadata: JsonValue::Null,
            meta: RecordMeta::new(Actor::System),
        }
    }

    async fn fixture() -> Fixture {
        let definitions = Arc::new(InMemoryEntityDefinitionStore::new());
        let definition = definitions
            .insert(EntityDefinition {
                id: EntityDefinitionId::new(),
                integration_system_id: IntegrationSystemId::new(),
                name: "Employee".into(),
                display_name: "Employee".into(),
                description: None,
                source_table: "employees".into(),
                source_primary_key: "id".into(),
                sort_order: 0,
                metadata: JsonValue::Null,
                meta: RecordMeta::new(Actor::System),
            })
            .await
            .unwrap()
            .id;

        let properties = Arc::new(InMemoryPropertyDefinitionStore::new());
        let department = properties
            .insert(property(definition, "Department", DataType::String))
            .await
            .unwrap()
            .id;
        let mut level = property(definition, "Level", DataType::Integer);
        level.default_value = Some(AttributeValue::Integer(1));
        properties.insert(level).await.unwrap();

        let instances = Arc::new(InMemoryEntityInstanceStore::new());
        let assignments = Arc::new(InMemoryAssignmentStore::new());
        let events = Arc::new(InMemoryEventSink::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let values = Arc::new(PropertyValueService::new(
            Arc::new(InMemoryPropertyValueStore::new()),
            properties,
            instances.clone(),
            events.clone(),
            audit.clone(),
        ));
        let service = EntityInstanceService::new(
            instances,
            definitions,
            values.clone(),
            assignments.clone(),
            events.clone(),
            audit,
        );
        Fixture {
            service,
            values,
            assignments,
            events,
            definition,
            department,
        }
    }

    fn emp(definition: EntityDefinitionId, external_id: &str) -> CreateEntityInstanceInput {
        CreateEntityInstanceInput {
            entity_definition_id: definition,
            external_id: external_id.into(),
            values: HashMap::from([("Department".to_string(), json!("IT"))]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_stores_values_and_defaults() {
        let f = fixture().await;
        let instance = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
        assert_eq!(instance.sync_status, SyncStatus::Pending);
        assert_eq!(instance.display_name, "EMP100");

        let values = f.values.named_values(&instance).await.unwrap();
        assert_eq!(values["Department"], AttributeValue::String("IT".into()));
        assert_eq!(values["Level"], AttributeValue::Integer(1));

        let events = f.events.drain().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::EntityCreated);
    }

    #[tokio::test]
    async fn test_create_with_invalid_value_stores_nothing() {
        let f = fixture().await;
        let mut input = emp(f.definition, "EMP100");
        input.values.insert("Level".into(), json!("senior"));

        let err = f
            .service
            .create_instance(input, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(f
            .service
            .find_by_external_id(f.definition, "EMP100")
            .await
            .unwrap()
            .is_none());
        assert!(f.events.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_external_id_conflicts() {
        let f = fixture().await;
        f.service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
        let err = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_update_is_version_checked() {
        let f = fixture().await;
        let instance = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
        f.events.drain().await;

        let updated = f
            .service
            .update_instance(
                instance.id,
                UpdateEntityInstanceInput {
                    expected_version: 1,
                    display_name: Some("Ada Lovelace".into()),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name, "Ada Lovelace");
        assert_eq!(f.events.drain().await[0].kind, ChangeKind::EntityUpdated);

        let err = f
            .service
            .update_instance(
                instance.id,
                UpdateEntityInstanceInput {
                    expected_version: 1,
                    is_active: Some(false),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_retire_blocked_by_active_assignment() {
        let f = fixture().await;
        let user = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
        let role = f
            .service
            .create_instance(emp(f.definition, "ITStaff"), Actor::System, None)
            .await
            .unwrap();
        f.assignments
            .insert_unique(AccessAssignment::new(
                AssignmentTriple::new(user.id, role.id, IntegrationSystemId::new()),
                AssignmentType::Direct,
                Actor::System,
            ))
            .await
            .unwrap();

        let err = f
            .service
            .retire_instance(role.id, 1, Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyConflict);
        assert!(f.service.get(role.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retire_closes_values_and_frees_external_id() {
        let f = fixture().await;
        let instance = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
        f.events.drain().await;

        f.service
            .retire_instance(instance.id, 1, Actor::System, None)
            .await
            .unwrap();
        assert!(f.service.get(instance.id).await.unwrap().is_none());
        assert!(f
            .values
            .value_history(instance.id, f.department)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.events.drain().await[0].kind, ChangeKind::EntityDeleted);

        f.service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retire_waits_for_in_flight_writes() {
        let f = fixture().await;
        let instance = f
            .service
            .create_instance(emp(f.definition, "EMP100"), Actor::System, None)
            .await
            .unwrap();

        let writing = f.values.instance_gate().read(instance.id).await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            f.service.retire_instance(instance.id, 1, Actor::System, None),
        )
        .await;
        assert!(blocked.is_err());
        assert!(f.service.get(instance.id).await.unwrap().is_some());
        drop(writing);

        f.service
            .retire_instance(instance.id, 1, Actor::System, None)
            .await
            .unwrap();
        let err = f
            .values
            .upsert_value(instance.id, f.department, &json!("HR"), Actor::System, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.values.current_values(instance.id).await.unwrap().is_empty());
    }
}
