//! Entity definition service.
//!
//! An [`EntityDefinition`] describes one entity "table" sourced from one
//! integration system: what the external collection is called, which field
//! identifies a record, and how the definition is presented. Its typed
//! attributes live in [`PropertyDefinition`](super::property_definition::PropertyDefinition)s.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::error::{FieldError, GovernanceError, Result};
use crate::integration::{require_system, IntegrationRegistry};
use crate::record::{replace_checked, RecordMeta, Versioned};
use crate::services::entity_instance::EntityInstanceStore;
use crate::types::{Actor, CorrelationId, EntityDefinitionId, IntegrationSystemId};

const MAX_NAME_LENGTH: usize = 100;

// ============================================================================
// Domain Types
// ============================================================================

/// Structural metadata for one external entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Unique identifier.
    pub id: EntityDefinitionId,
    /// Integration system the records come from.
    pub integration_system_id: IntegrationSystemId,
    /// Name, unique per integration system.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Description.
    pub description: Option<String>,
    /// Source table or collection name.
    pub source_table: String,
    /// Source field holding the record identifier.
    pub source_primary_key: String,
    /// Position in listings.
    pub sort_order: i32,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl Versioned for EntityDefinition {
    const ENTITY: &'static str = "EntityDefinition";

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

/// Input for creating an entity definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEntityDefinitionInput {
    /// Owning integration system.
    pub integration_system_id: IntegrationSystemId,
    /// Name.
    pub name: String,
    /// Display name, defaults to the name.
    pub display_name: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Source table or collection name, defaults to the name.
    pub source_table: Option<String>,
    /// Source primary-key field, defaults to `id`.
    pub source_primary_key: Option<String>,
    /// Position in listings.
    #[serde(default)]
    pub sort_order: i32,
    /// Free-form metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Input for updating an entity definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEntityDefinitionInput {
    /// Version the caller read.
    pub expected_version: u64,
    /// New name.
    pub name: Option<String>,
    /// New display name.
    pub display_name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New source table.
    pub source_table: Option<String>,
    /// New source primary-key field.
    pub source_primary_key: Option<String>,
    /// New sort position.
    pub sort_order: Option<i32>,
    /// New metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Filter for listing entity definitions.
#[derive(Debug, Clone, Default)]
pub struct EntityDefinitionFilter {
    /// Filter by integration system.
    pub integration_system_id: Option<IntegrationSystemId>,
    /// Case-insensitive name substring.
    pub name_contains: Option<String>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for entity definition storage backends.
#[async_trait::async_trait]
pub trait EntityDefinitionStore: Send + Sync {
    /// Get a live definition by ID.
    async fn get(&self, id: EntityDefinitionId) -> Result<Option<EntityDefinition>>;

    /// Find a live definition by name (ASCII case-insensitive) within an
    /// integration system.
    async fn find_by_name(
        &self,
        integration_system_id: IntegrationSystemId,
        name: &str,
    ) -> Result<Option<EntityDefinition>>;

    /// Insert a definition, rejecting a duplicate live name in the same system.
    async fn insert(&self, definition: EntityDefinition) -> Result<EntityDefinition>;

    /// Replace a definition after a version check, keeping names unique.
    async fn replace(
        &self,
        next: EntityDefinition,
        expected_version: u64,
        actor: Actor,
    ) -> Result<EntityDefinition>;

    /// List live definitions ordered by sort position then name.
    async fn list(&self, filter: &EntityDefinitionFilter) -> Result<Vec<EntityDefinition>>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

/// In-memory entity definition store for testing.
#[derive(Debug, Default)]
pub struct InMemoryEntityDefinitionStore {
    definitions: Arc<RwLock<HashMap<EntityDefinitionId, EntityDefinition>>>,
}

impl InMemoryEntityDefinitionStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(
    rows: &HashMap<EntityDefinitionId, EntityDefinition>,
    candidate: &EntityDefinition,
) -> bool {
    rows.values().any(|d| {
        d.id != candidate.id
            && d.meta.is_live()
            && d.integration_system_id == candidate.integration_system_id
            && d.name.eq_ignore_ascii_case(&candidate.name)
    })
}

#[async_trait::async_trait]
impl EntityDefinitionStore for InMemoryEntityDefinitionStore {
    async fn get(&self, id: EntityDefinitionId) -> Result<Option<EntityDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id).filter(|d| d.meta.is_live()).cloned())
    }

    async fn find_by_name(
        &self,
        integration_system_id: IntegrationSystemId,
        name: &str,
    ) -> Result<Option<EntityDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .find(|d| {
                d.meta.is_live()
                    && d.integration_system_id == integration_system_id
                    && d.name.eq_ignore_ascii_case(name)
            })
            .cloned())
    }

    async fn insert(&self, definition: EntityDefinition) -> Result<EntityDefinition> {
        let mut definitions = self.definitions.write().await;
        if name_taken(&definitions, &definition) {
            return Err(GovernanceError::NameExists(definition.name));
        }
        definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn replace(
        &self,
        next: EntityDefinition,
        expected_version: u64,
        actor: Actor,
    ) -> Result<EntityDefinition> {
        let mut definitions = self.definitions.write().await;
        if next.meta.is_live() && name_taken(&definitions, &next) {
            return Err(GovernanceError::NameExists(next.name));
        }
        let id = next.id;
        replace_checked(&mut definitions, &id, next, expected_version, actor)
    }

    async fn list(&self, filter: &EntityDefinitionFilter) -> Result<Vec<EntityDefinition>> {
        let definitions = self.definitions.read().await;
        let mut results: Vec<_> = definitions
            .values()
            .filter(|d| d.meta.is_live())
            .filter(|d| {
                filter
                    .integration_system_id
                    .is_none_or(|id| d.integration_system_id == id)
            })
            .filter(|d| {
                filter
                    .name_contains
                    .as_ref()
                    .is_none_or(|s| d.name.to_lowercase().contains(&s.to_lowercase()))
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(results)
    }
}

// ============================================================================
// Service
// ============================================================================

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

/// Service for managing entity definitions.
pub struct EntityDefinitionService {
    store: Arc<dyn EntityDefinitionStore>,
    instances: Arc<dyn EntityInstanceStore>,
    integrations: Arc<dyn IntegrationRegistry>,
    audit_store: Arc<dyn AuditStore>,
}

impl EntityDefinitionService {
    /// Create a new entity definition service.
    pub fn new(
        store: Arc<dyn EntityDefinitionStore>,
        instances: Arc<dyn EntityInstanceStore>,
        integrations: Arc<dyn IntegrationRegistry>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            store,
            instances,
            integrations,
            audit_store,
        }
    }

    /// Create a new entity definition.
    pub async fn create(
        &self,
        input: CreateEntityDefinitionInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityDefinition> {
        let mut errors = Vec::new();
        check_name(&input.name, &mut errors);
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }
        require_system(self.integrations.as_ref(), input.integration_system_id).await?;

        let name = input.name.trim().to_string();
        let definition = EntityDefinition {
            id: EntityDefinitionId::new(),
            integration_system_id: input.integration_system_id,
            display_name: input.display_name.unwrap_or_else(|| name.clone()),
            description: input.description,
            source_table: input.source_table.unwrap_or_else(|| name.clone()),
            source_primary_key: input.source_primary_key.unwrap_or_else(|| "id".to_string()),
            sort_order: input.sort_order,
            metadata: input.metadata.unwrap_or(serde_json::Value::Null),
            name,
            meta: RecordMeta::new(actor),
        };
        let definition = self.store.insert(definition).await?;

        tracing::info!(
            entity_definition_id = %definition.id,
            name = %definition.name,
            "Entity definition created"
        );

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityDefinition,
                subject_id: definition.id.into_inner(),
                action: AuditAction::Created,
                actor,
                after_state: Some(serde_json::to_value(&definition).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        Ok(definition)
    }

    /// Get a live definition by ID.
    pub async fn get(&self, id: EntityDefinitionId) -> Result<Option<EntityDefinition>> {
        self.store.get(id).await
    }

    /// Get a live definition by ID or fail with `NotFound`.
    pub async fn require(&self, id: EntityDefinitionId) -> Result<EntityDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(EntityDefinition::ENTITY, id))
    }

    /// Update an entity definition.
    pub async fn update(
        &self,
        id: EntityDefinitionId,
        input: UpdateEntityDefinitionInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityDefinition> {
        let before = self.require(id).await?;

        let mut next = before.clone();
        if let Some(name) = input.name {
            let mut errors = Vec::new();
            check_name(&name, &mut errors);
            if !errors.is_empty() {
                return Err(GovernanceError::ValidationFailed(errors));
            }
            next.name = name.trim().to_string();
        }
        if let Some(display_name) = input.display_name {
            next.display_name = display_name;
        }
        if let Some(description) = input.description {
            next.description = Some(description);
        }
        if let Some(source_table) = input.source_table {
            next.source_table = source_table;
        }
        if let Some(source_primary_key) = input.source_primary_key {
            next.source_primary_key = source_primary_key;
        }
        if let Some(sort_order) = input.sort_order {
            next.sort_order = sort_order;
        }
        if let Some(metadata) = input.metadata {
            next.metadata = metadata;
        }

        let updated = self
            .store
            .replace(next, input.expected_version, actor)
            .await?;

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityDefinition,
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

    /// Soft-delete a definition that no live instance references.
    pub async fn retire(
        &self,
        id: EntityDefinitionId,
        expected_version: u64,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EntityDefinition> {
        let before = self.require(id).await?;

        let dependents = self.instances.count_live_for_definition(id).await?;
        if dependents > 0 {
            return Err(GovernanceError::DependencyConflict {
                entity: EntityDefinition::ENTITY,
                id: id.to_string(),
                dependents,
                dependent: "entity instances",
            });
        }

        let mut next = before.clone();
        next.meta.mark_deleted(actor);
        let retired = self.store.replace(next, expected_version, actor).await?;

        tracing::info!(entity_definition_id = %id, "Entity definition retired");

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::EntityDefinition,
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

    /// List live definitions.
    pub async fn list(&self, filter: &EntityDefinitionFilter) -> Result<Vec<EntityDefinition>> {
        self.store.list(filter).await
    }

    /// List the live definitions of one integration system.
    pub async fn list_by_system(
        &self,
        integration_system_id: IntegrationSystemId,
    ) -> Result<Vec<EntityDefinition>> {
        self.store
            .list(&EntityDefinitionFilter {
                integration_system_id: Some(integration_system_id),
                ..Default::default()
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
