//! Property definition service.
//!
//! A [`PropertyDefinition`] declares one typed attribute of an entity
//! definition. Values written to the attribute store are coerced into the
//! declared [`DataType`] and checked against the optional
//! [`ValidationRule`]. Changing the type, the rule, or the required/unique
//! flags re-validates the values currently stored before the change is
//! committed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::config::GovernanceConfig;
use crate::error::{FieldError, GovernanceError, Result};
use crate::record::{replace_checked, RecordMeta, Versioned};
use crate::services::entity_definition::{EntityDefinition, EntityDefinitionStore};
use crate::services::entity_instance::{EntityInstanceFilter, EntityInstanceStore};
use crate::services::property_value::PropertyValueService;
use crate::types::{Actor, CorrelationId, EntityDefinitionId, PropertyDefinitionId};
use crate::value::{parse_value, AttributeValue, DataType, ValidationRule};

const MAX_NAME_LENGTH: usize = 100;

// ============================================================================
// Domain Types
// ============================================================================

/// One typed attribute of an entity definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Unique identifier.
    pub id: PropertyDefinitionId,
    /// Owning entity definition.
    pub entity_definition_id: EntityDefinitionId,
    /// Name, unique per entity definition.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Description.
    pub description: Option<String>,
    /// Declared data type.
    pub data_type: DataType,
    /// Field of the external record this attribute is read from.
    pub source_field: Option<String>,
    /// Every live instance must hold a value.
    pub is_required: bool,
    /// No two live instances may hold equal values.
    pub is_unique: bool,
    /// Offered in search.
    pub is_searchable: bool,
    /// Shown in listings.
    pub is_displayed: bool,
    /// Editable by administrators.
    pub is_editable: bool,
    /// Position in listings.
    pub sort_order: i32,
    /// Value filled in when a new instance does not supply one.
    pub default_value: Option<AttributeValue>,
    /// Additional constraint on values.
    pub validation_rule: Option<ValidationRule>,
    /// Free-form presentation metadata.
    pub ui_metadata: JsonValue,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl PropertyDefinition {
    /// Coerce and validate a raw value for this property.
    pub fn parse(&self, raw: &JsonValue) -> Result<AttributeValue> {
        parse_value(self.data_type, self.validation_rule.as_ref(), raw).map_err(|message| {
            GovernanceError::ValidationFailed(vec![FieldError::new(&self.name, message)])
        })
    }

    /// Key of this attribute in an external record.
    #[must_use]
    pub fn source_key(&self) -> &str {
        self.source_field.as_deref().unwrap_or(&self.name)
    }
}

impl Versioned for PropertyDefinition {
    const ENTITY: &'static str = "PropertyDefinition";

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

/// Input for creating a property definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePropertyDefinitionInput {
    /// Owning entity definition.
    pub entity_definition_id: EntityDefinitionId,
    /// Name.
    pub name: String,
    /// Display name, defaults to the name.
    pub display_name: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Declared data type.
    pub data_type: DataType,
    /// Source field, defaults to the name.
    pub source_field: Option<String>,
    /// Required flag.
    #[serde(default)]
    pub is_required: bool,
    /// Unique flag.
    #[serde(default)]
    pub is_unique: bool,
    /// Searchable flag.
    #[serde(default = "default_true")]
    pub is_searchable: bool,
    /// Displayed flag.
    #[serde(default = "default_true")]
    pub is_displayed: bool,
    /// Editable flag.
    #[serde(default = "default_true")]
    pub is_editable: bool,
    /// Position in listings.
    #[serde(default)]
    pub sort_order: i32,
    /// Raw default value.
    pub default_value: Option<JsonValue>,
    /// Validation rule.
    pub validation_rule: Option<ValidationRule>,
    /// Presentation metadata.
    pub ui_metadata: Option<JsonValue>,
}

fn default_true() -> bool {
    true
}

impl CreatePropertyDefinitionInput {
    /// Input for an optional, searchable, displayed, editable property.
    #[must_use]
    pub fn new(
        entity_definition_id: EntityDefinitionId,
        name: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        Self {
            entity_definition_id,
            name: name.into(),
            display_name: None,
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
            ui_metadata: None,
        }
    }
}

/// Input for updating a property definition.
///
/// `Some(None)` clears the default value or validation rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePropertyDefinitionInput {
    /// Version the caller read.
    pub expected_version: u64,
    /// New name.
    pub name: Option<String>,
    /// New display name.
    pub display_name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New data type.
    pub data_type: Option<DataType>,
    /// New source field.
    pub source_field: Option<String>,
    /// New required flag.
    pub is_required: Option<bool>,
    /// New unique flag.
    pub is_unique: Option<bool>,
    /// New searchable flag.
    pub is_searchable: Option<bool>,
    /// New displayed flag.
    pub is_displayed: Option<bool>,
    /// New editable flag.
    pub is_editable: Option<bool>,
    /// New sort position.
    pub sort_order: Option<i32>,
    /// New raw default value.
    pub default_value: Option<Option<JsonValue>>,
    /// New validation rule.
    pub validation_rule: Option<Option<ValidationRule>>,
    /// New presentation metadata.
    pub ui_metadata: Option<JsonValue>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for property definition storage backends.
#[async_trait::async_trait]
pub trait PropertyDefinitionStore: Send + Sync {
    /// Get a live property by ID.
    async fn get(&self, id: PropertyDefinitionId) -> Result<Option<PropertyDefinition>>;

    /// Find a live property by name (ASCII case-insensitive).
    async fn find_by_name(
        &self,
        entity_definition_id: EntityDefinitionId,
        name: &str,
    ) -> Result<Option<PropertyDefinition>>;

    /// Insert a property, rejecting a duplicate live name in the same definition.
    async fn insert(&self, property: PropertyDefinition) -> Result<PropertyDefinition>;

    /// Replace a property after a version check, keeping names unique.
    async fn replace(
        &self,
        next: PropertyDefinition,
        expected_version: u64,
        actor: Actor,
    ) -> Result<PropertyDefinition>;

    /// Live properties of a definition ordered by sort position then name.
    async fn list_for_definition(
        &self,
        entity_definition_id: EntityDefinitionId,
    ) -> Result<Vec<PropertyDefinition>>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

/// In-memory property definition store for testing.
#[derive(Debug, Default)]
pub struct InMemoryPropertyDefinitionStore {
    properties: Arc<RwLock<HashMap<PropertyDefinitionId, PropertyDefinition>>>,
}

impl InMemoryPropertyDefinitionStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(
    rows: &HashMap<PropertyDefinitionId, PropertyDefinition>,
    candidate: &PropertyDefinition,
) -> bool {
    rows.values().any(|p| {
        p.id != candidate.id
            && p.meta.is_live()
            && p.entity_definition_id == candidate.entity_definition_id
            && p.name.eq_ignore_ascii_case(&candidate.name)
    })
}

#[async_trait::async_trait]
impl PropertyDefinitionStore for InMemoryPropertyDefinitionStore {
    async fn get(&self, id: PropertyDefinitionId) -> Result<Option<PropertyDefinition>> {
        let properties = self.properties.read().await;
        Ok(properties.get(&id).filter(|p| p.meta.is_live()).cloned())
    }

    async fn find_by_name(
        &self,
        entity_definition_id: EntityDefinitionId,
        name: &str,
    ) -> Result<Option<PropertyDefinition>> {
        let properties = self.properties.read().await;
        Ok(properties
            .values()
            .find(|p| {
                p.meta.is_live()
                    && p.entity_definition_id == entity_definition_id
                    && p.name.eq_ignore_ascii_case(name)
            })
            .cloned())
    }

    async fn insert(&self, property: PropertyDefinition) -> Result<PropertyDefinition> {
        let mut properties = self.properties.write().await;
        if name_taken(&properties, &property) {
            return Err(GovernanceError::NameExists(property.name));
        }
        properties.insert(property.id, property.clone());
        Ok(property)
    }

    async fn replace(
        &self,
        next: PropertyDefinition,
        expected_version: u64,
        actor: Actor,
    ) -> Result<PropertyDefinition> {
        let mut properties = self.properties.write().await;
        if next.meta.is_live() && name_taken(&properties, &next) {
            return Err(GovernanceError::NameExists(next.name));
        }
        let id = next.id;
        replace_checked(&mut properties, &id, next, expected_version, actor)
    }

    async fn list_for_definition(
        &self,
        entity_definition_id: EntityDefinitionId,
    ) -> Result<Vec<PropertyDefinition>> {
        let properties = self.properties.read().await;
        let mut results: Vec<_> = properties
            .values()
            .filter(|p| p.meta.is_live() && p.entity_definition_id == entity_definition_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(results)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service for managing property definitions.
pub struct PropertyDefinitionService {
    store: Arc<dyn PropertyDefinitionStore>,
    definitions: Arc<dyn EntityDefinitionStore>,
    instances: Arc<dyn EntityInstanceStore>,
    values: Arc<PropertyValueService>,
    audit_store: Arc<dyn AuditStore>,
    config: GovernanceConfig,
}

impl PropertyDefinitionService {
    /// Create a new property definition service.
    pub fn new(
        store: Arc<dyn PropertyDefinitionStore>,
        definitions: Arc<dyn EntityDefinitionStore>,
        instances: Arc<dyn EntityInstanceStore>,
        values: Arc<PropertyValueService>,
        audit_store: Arc<dyn AuditStore>,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            instances,
            values,
            audit_store,
            config,
        }
    }

    /// Create a new property definition.
    pub async fn create(
        &self,
        input: CreatePropertyDefinitionInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<PropertyDefinition> {
        let definition = self
            .definitions
            .get(input.entity_definition_id)
            .await?
            .ok_or_else(|| {
                GovernanceError::not_found(EntityDefinition::ENTITY, input.entity_definition_id)
            })?;

        let mut errors = Vec::new();
        check_name(&input.name, &mut errors);
        let default_value = check_schema(
            input.data_type,
            input.validation_rule.as_ref(),
            input.default_value.as_ref(),
            &mut errors,
        );
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }

        if input.is_required {
            let existing = self
                .instances
                .count_live_for_definition(definition.id)
                .await?;
            if existing > 0 {
                return Err(GovernanceError::Validation(format!(
                    "Cannot add required property '{}': {existing} existing instances of '{}' hold no value",
                    input.name, definition.name
                )));
            }
        }

        let name = input.name.trim().to_string();
        let property = PropertyDefinition {
            id: PropertyDefinitionId::new(),
            entity_definition_id: definition.id,
            display_name: input.display_name.unwrap_or_else(|| name.clone()),
            description: input.description,
            data_type: input.data_type,
            source_field: input.source_field,
            is_required: input.is_required,
            is_unique: input.is_unique,
            is_searchable: input.is_searchable,
            is_displayed: input.is_displayed,
            is_editable: input.is_editable,
            sort_order: input.sort_order,
            default_value,
            validation_rule: input.validation_rule,
            ui_metadata: input.ui_metadata.unwrap_or(JsonValue::Null),
            name,
            meta: RecordMeta::new(actor),
        };
        let property = self.store.insert(property).await?;

        tracing::info!(
            property_definition_id = %property.id,
            entity_definition_id = %property.entity_definition_id,
            name = %property.name,
            data_type = %property.data_type,
            "Property definition created"
        );

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::PropertyDefinition,
                subject_id: property.id.into_inner(),
                action: AuditAction::Created,
                actor,
                after_state: Some(serde_json::to_value(&property).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        Ok(property)
    }

    /// Get a live property by ID.
    pub async fn get(&self, id: PropertyDefinitionId) -> Result<Option<PropertyDefinition>> {
        self.store.get(id).await
    }

    /// Get a live property by ID or fail with `NotFound`.
    pub async fn require(&self, id: PropertyDefinitionId) -> Result<PropertyDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(PropertyDefinition::ENTITY, id))
    }

    /// Find a live property of a definition by name.
    pub async fn find_by_name(
        &self,
        entity_definition_id: EntityDefinitionId,
        name: &str,
    ) -> Result<Option<PropertyDefinition>> {
        self.store.find_by_name(entity_definition_id, name).await
    }

    /// Update a property definition.
    ///
    /// A change of data type, validation rule, or required/unique flag is
    /// checked against the values currently stored; a data type change then
    /// rewrites those values into the new type.
    pub async fn update(
        &self,
        id: PropertyDefinitionId,
        input: UpdatePropertyDefinitionInput,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<PropertyDefinition> {
        let before = self.require(id).await?;
        let mut next = before.clone();
        let mut errors = Vec::new();

        if let Some(name) = input.name {
            check_name(&name, &mut errors);
            next.name = name.trim().to_string();
        }
        if let Some(display_name) = input.display_name {
            next.display_name = display_name;
        }
        if let Some(description) = input.description {
            next.description = Some(description);
        }
        if let Some(data_type) = input.data_type {
            next.data_type = data_type;
        }
        if let Some(source_field) = input.source_field {
            next.source_field = Some(source_field);
        }
        if let Some(is_required) = input.is_required {
            next.is_required = is_required;
        }
        if let Some(is_unique) = input.is_unique {
            next.is_unique = is_unique;
        }
        if let Some(is_searchable) = input.is_searchable {
            next.is_searchable = is_searchable;
        }
        if let Some(is_displayed) = input.is_displayed {
            next.is_displayed = is_displayed;
        }
        if let Some(is_editable) = input.is_editable {
            next.is_editable = is_editable;
        }
        if let Some(sort_order) = input.sort_order {
            next.sort_order = sort_order;
        }
        if let Some(rule) = input.validation_rule {
            next.validation_rule = rule;
        }
        if let Some(ui_metadata) = input.ui_metadata {
            next.ui_metadata = ui_metadata;
        }

        let schema_changed = next.data_type != before.data_type
            || next.validation_rule != before.validation_rule;
        next.default_value = match input.default_value {
            Some(raw) => check_schema(
                next.data_type,
                next.validation_rule.as_ref(),
                raw.as_ref(),
                &mut errors,
            ),
            None if schema_changed => check_schema(
                next.data_type,
                next.validation_rule.as_ref(),
                before.default_value.as_ref().map(AttributeValue::to_raw).as_ref(),
                &mut errors,
            ),
            None => before.default_value.clone(),
        };
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }

        self.revalidate(&before, &next).await?;

        let updated = self
            .store
            .replace(next, input.expected_version, actor)
            .await?;

        let migrated = if updated.data_type == before.data_type {
            0
        } else {
            self.values
                .migrate_property(&updated, actor, correlation_id)
                .await?
        };
        if migrated > 0 {
            tracing::info!(
                property_definition_id = %id,
                data_type = %updated.data_type,
                migrated,
                "Stored values rewritten into new data type"
            );
        }

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::PropertyDefinition,
                subject_id: id.into_inner(),
                action: AuditAction::Updated,
                actor,
                before_state: Some(serde_json::to_value(&before).unwrap_or_default()),
                after_state: Some(serde_json::to_value(&updated).unwrap_or_default()),
                correlation_id,
                metadata: (migrated > 0).then(|| serde_json::json!({ "migrated_values": migrated })),
                ..Default::default()
            })
            .await?;

        Ok(updated)
    }

    /// Check the stored values against a changed definition.
    async fn revalidate(&self, before: &PropertyDefinition, next: &PropertyDefinition) -> Result<()> {
        let type_changed = before.data_type != next.data_type;
        let rule_changed = before.validation_rule != next.validation_rule;
        let turning_required = next.is_required && !before.is_required;
        let turning_unique = next.is_unique && !before.is_unique;
        if !(type_changed || rule_changed || turning_required || turning_unique) {
            return Ok(());
        }

        let open = self.values.open_for_property(before.id).await?;

        if type_changed || rule_changed {
            let sample = match self.config.type_change_sample_limit {
                0 => open.len(),
                limit => limit,
            };
            let mut errors = Vec::new();
            for (index, stored) in open.iter().enumerate() {
                let reparsed = parse_value(
                    next.data_type,
                    next.validation_rule.as_ref(),
                    &stored.value.to_raw(),
                );
                match reparsed {
                    Ok(_) => {}
                    Err(_) if index >= sample => {
                        tracing::warn!(
                            property_definition_id = %before.id,
                            instance_id = %stored.instance_id,
                            "Stored value outside the revalidation sample does not fit the new definition"
                        );
                    }
                    Err(message) => errors.push(FieldError::new(
                        format!("{}[{}]", before.name, stored.instance_id),
                        message,
                    )),
                }
            }
            if !errors.is_empty() {
                return Err(GovernanceError::ValidationFailed(errors));
            }
        }

        if turning_required {
            let holders: HashSet<_> = open.iter().map(|v| v.instance_id).collect();
            let missing = self
                .instances
                .list(&EntityInstanceFilter {
                    entity_definition_id: Some(before.entity_definition_id),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .filter(|instance| !holders.contains(&instance.id))
                .count();
            if missing > 0 {
                return Err(GovernanceError::Validation(format!(
                    "Cannot make '{}' required: {missing} instances hold no value",
                    before.name
                )));
            }
        }

        if turning_unique {
            let mut seen = HashSet::new();
            for stored in &open {
                if !seen.insert(stored.value.to_raw().to_string()) {
                    return Err(GovernanceError::Conflict(format!(
                        "Cannot make '{}' unique: value '{}' is held by more than one instance",
                        before.name, stored.display_value
                    )));
                }
            }
        }

        Ok(())
    }

    /// Soft-delete a property no stored value references.
    pub async fn retire(
        &self,
        id: PropertyDefinitionId,
        expected_version: u64,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<PropertyDefinition> {
        let before = self.require(id).await?;

        let dependents = self.values.count_live_for_property(id).await?;
        if dependents > 0 {
            return Err(GovernanceError::DependencyConflict {
                entity: PropertyDefinition::ENTITY,
                id: id.to_string(),
                dependents,
                dependent: "property values",
            });
        }

        let mut next = before.clone();
        next.meta.mark_deleted(actor);
        let retired = self.store.replace(next, expected_version, actor).await?;

        tracing::info!(property_definition_id = %id, "Property definition retired");

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::PropertyDefinition,
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

    /// Live properties of a definition ordered by sort position then name.
    pub async fn list(
        &self,
        entity_definition_id: EntityDefinitionId,
    ) -> Result<Vec<PropertyDefinition>> {
        self.store.list_for_definition(entity_definition_id).await
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

/// Check the rule against the type, then parse the default under both.
fn check_schema(
    data_type: DataType,
    rule: Option<&ValidationRule>,
    raw_default: Option<&JsonValue>,
    errors: &mut Vec<FieldError>,
) -> Option<AttributeValue> {
    if let Some(rule) = rule {
        if let Err(message) = rule.check_applicable(data_type) {
            errors.push(FieldError::new("validation_rule", message));
            return None;
        }
    }
    let raw = raw_default.filter(|raw| !raw.is_null() || data_type == DataType::Json)?;
    match parse_value(data_type, rule, raw) {
        Ok(value) => Some(value),
        Err(message) => {
            errors.push(FieldError::new("default_value", message));
            None
        }
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
    use crate::services::entity_definition::InMemoryEntityDefinitionStore;
    use crate::services::entity_instance::{EntityInstance, InMemoryEntityInstanceStore};
    use crate::services::property_value::{
        InMemoryPropertyValueStore, PropertyValue, PropertyValueStore,
    };
    use crate::types::{EntityInstanceId, IntegrationSystemId};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    struct Fixture {
        service: PropertyDefinitionService,
        instances: Arc<InMemoryEntityInstanceStore>,
        values: Arc<InMemoryPropertyValueStore>,
        events: Arc<InMemoryEventSink>,
        audit: Arc<InMemoryAuditStore>,
        definition: EntityDefinitionId,
    }

    async fn fixture_with(config: GovernanceConfig) -> Fixture {
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
        let instances = Arc::new(InMemoryEntityInstanceStore::new());
        let values = Arc::new(InMemoryPropertyValueStore::new());
        let events = Arc::new(InMemoryEventSink::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let value_service = Arc::new(PropertyValueService::new(
            values.clone(),
            properties.clone(),
            instances.clone(),
            events.clone(),
            audit.clone(),
        ));
        let service = PropertyDefinitionService::new(
            properties,
            definitions,
            instances.clone(),
            value_service,
            audit.clone(),
            config,
        );
        Fixture {
            service,
            instances,
            values,
            events,
            audit,
            definition,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(GovernanceConfig::default()).await
    }

    impl Fixture {
        async fn property(&self, name: &str, data_type: DataType) -> PropertyDefinition {
            self.service
                .create(
                    CreatePropertyDefinitionInput::new(self.definition, name, data_type),
                    Actor::System,
                    None,
                )
                .await
                .unwrap()
        }

        async fn instance_with(
            &self,
            external_id: &str,
            property: &PropertyDefinition,
            value: AttributeValue,
        ) -> EntityInstanceId {
            let instance = self
                .instances
                .insert(EntityInstance::new(self.definition, external_id, Actor::System))
                .await
                .unwrap();
            self.values
                .supersede(
                    PropertyValue::new(instance.id, property.id, value, Utc::now(), Actor::System),
                    Actor::System,
                )
                .await
                .unwrap();
            instance.id
        }
    }

    #[tokio::test]
    async fn test_create_parses_default() {
        let f = fixture().await;
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Level", DataType::Integer);
        input.default_value = Some(json!("3"));
        input.validation_rule = Some("range:1..5".parse().unwrap());
        let property = f.service.create(input, Actor::System, None).await.unwrap();
        assert_eq!(property.default_value, Some(AttributeValue::Integer(3)));
        assert_eq!(property.source_key(), "Level");
    }

    #[tokio::test]
    async fn test_create_rejects_default_outside_rule() {
        let f = fixture().await;
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Level", DataType::Integer);
        input.default_value = Some(json!(9));
        input.validation_rule = Some("range:1..5".parse().unwrap());
        let err = f.service.create(input, Actor::System, None).await.unwrap_err();
        assert!(matches!(err, GovernanceError::ValidationFailed(ref e) if e[0].field == "default_value"));
    }

    #[tokio::test]
    async fn test_create_rejects_inapplicable_rule() {
        let f = fixture().await;
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Active", DataType::Boolean);
        input.validation_rule = Some("range:0..1".parse().unwrap());
        let err = f.service.create(input, Actor::System, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_create_unknown_definition() {
        let f = fixture().await;
        let input =
            CreatePropertyDefinitionInput::new(EntityDefinitionId::new(), "Dept", DataType::String);
        let err = f.service.create(input, Actor::System, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_name_ignores_case() {
        let f = fixture().await;
        f.property("Department", DataType::String).await;
        let err = f
            .service
            .create(
                CreatePropertyDefinitionInput::new(f.definition, "department", DataType::String),
                Actor::System,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::NameExists(_)));
    }

    #[tokio::test]
    async fn test_required_property_rejected_when_instances_exist() {
        let f = fixture().await;
        f.instances
            .insert(EntityInstance::new(f.definition, "EMP1", Actor::System))
            .await
            .unwrap();
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Badge", DataType::String);
        input.is_required = true;
        let err = f.service.create(input, Actor::System, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_type_change_migrates_values() {
        let f = fixture().await;
        let property = f.property("Age", DataType::String).await;
        let instance = f
            .instance_with("EMP1", &property, AttributeValue::String("42".into()))
            .await;

        let updated = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    data_type: Some(DataType::Integer),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.data_type, DataType::Integer);

        let open = f.values.open_value(instance, property.id).await.unwrap().unwrap();
        assert_eq!(open.value, AttributeValue::Integer(42));
        assert_eq!(f.values.history(instance, property.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_incompatible_type_change_rejected() {
        let f = fixture().await;
        let property = f.property("Age", DataType::String).await;
        f.instance_with("EMP1", &property, AttributeValue::String("forty".into()))
            .await;

        let err = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    data_type: Some(DataType::Integer),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        let current = f.service.require(property.id).await.unwrap();
        assert_eq!(current.data_type, DataType::String);
        assert_eq!(current.meta.version, 1);
    }

    #[tokio::test]
    async fn test_sample_limit_bounds_revalidation() {
        let f = fixture_with(GovernanceConfig {
            type_change_sample_limit: 1,
            ..Default::default()
        })
        .await;
        let property = f.property("Code", DataType::String).await;
        f.instance_with("A", &property, AttributeValue::String("abc".into()))
            .await;
        f.instance_with("B", &property, AttributeValue::String("toolong".into()))
            .await;

        let result = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    validation_rule: Some(Some("length:..3".parse().unwrap())),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_turning_unique_requires_distinct_values() {
        let f = fixture().await;
        let property = f.property("Email", DataType::Email).await;
        let shared = AttributeValue::Email("a@example.com".into());
        f.instance_with("A", &property, shared.clone()).await;
        f.instance_with("B", &property, shared).await;

        let err = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    is_unique: Some(true),
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
    async fn test_turning_required_checks_every_instance() {
        let f = fixture().await;
        let property = f.property("Dept", DataType::String).await;
        f.instance_with("A", &property, AttributeValue::String("IT".into()))
            .await;
        f.instances
            .insert(EntityInstance::new(f.definition, "B", Actor::System))
            .await
            .unwrap();

        let err = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    is_required: Some(true),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_retire_blocked_by_values() {
        let f = fixture().await;
        let property = f.property("Dept", DataType::String).await;
        f.instance_with("A", &property, AttributeValue::String("IT".into()))
            .await;

        let err = f
            .service
            .retire(property.id, 1, Actor::System, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::DependencyConflict { dependents: 1, .. }
        ));
        assert!(f.service.get(property.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_ordered_by_sort_then_name() {
        let f = fixture().await;
        for (name, order) in [("Title", 2), ("Email", 1), ("Dept", 1)] {
            let mut input = CreatePropertyDefinitionInput::new(f.definition, name, DataType::String);
            input.sort_order = order;
            f.service.create(input, Actor::System, None).await.unwrap();
        }
        let names: Vec<_> = f
            .service
            .list(f.definition)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["Dept", "Email", "Title"]);
    }

    fn decimal(text: &str) -> AttributeValue {
        AttributeValue::Decimal(Decimal::from_str(text).unwrap())
    }

    #[tokio::test]
    async fn test_unrelated_update_keeps_exact_default() {
        let f = fixture().await;
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Budget", DataType::Decimal);
        input.default_value = Some(json!("12345678901234567.89"));
        let property = f.service.create(input, Actor::System, None).await.unwrap();
        assert_eq!(property.default_value, Some(decimal("12345678901234567.89")));

        let updated = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    display_name: Some("Annual budget".into()),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.default_value, Some(decimal("12345678901234567.89")));
    }

    #[tokio::test]
    async fn test_decimal_to_string_keeps_every_digit() {
        let f = fixture().await;
        let mut input = CreatePropertyDefinitionInput::new(f.definition, "Rate", DataType::Decimal);
        input.default_value = Some(json!("12345678901234567.89"));
        let property = f.service.create(input, Actor::System, None).await.unwrap();
        let instance = f
            .instance_with("EMP1", &property, decimal("0.1000000000000000055511151231"))
            .await;

        let updated = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    data_type: Some(DataType::String),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            updated.default_value,
            Some(AttributeValue::String("12345678901234567.89".into()))
        );
        let open = f.values.open_value(instance, property.id).await.unwrap().unwrap();
        assert_eq!(
            open.value,
            AttributeValue::String("0.1000000000000000055511151231".into())
        );
    }

    #[tokio::test]
    async fn test_type_change_is_audited_and_published() {
        let f = fixture().await;
        let property = f.property("Age", DataType::String).await;
        let instance = f
            .instance_with("EMP1", &property, AttributeValue::String("42".into()))
            .await;

        f.service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    data_type: Some(DataType::Integer),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();

        let events = f.events.drain().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance_id, instance);
        let change = events[0].property_change().unwrap();
        assert_eq!(change.new_value, Some(AttributeValue::Integer(42)));

        let value_sets = f
            .audit
            .query_events(crate::audit::AuditEventFilter {
                action: Some(AuditAction::ValueSet),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(value_sets.len(), 1);
    }

    #[tokio::test]
    async fn test_turning_unique_compares_exact_decimals() {
        let f = fixture().await;
        let property = f.property("Serial", DataType::Decimal).await;
        f.instance_with("A", &property, decimal("12345678901234567.89"))
            .await;
        f.instance_with("B", &property, decimal("12345678901234567.88"))
            .await;

        let updated = f
            .service
            .update(
                property.id,
                UpdatePropertyDefinitionInput {
                    expected_version: 1,
                    is_unique: Some(true),
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        assert!(updated.is_unique);
    }
}
