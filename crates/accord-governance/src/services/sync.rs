//! Synchronization ingestion.
//!
//! Applies a batch of records pulled from an external system to the
//! attribute store: instances are found or created by external id, each
//! property's source field is mapped out of the raw payload, and only
//! changed values are written. Every batch is appended to the recorder as a
//! [`SyncRun`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::audit::{AuditStore, SyncRun};
use crate::error::{GovernanceError, Result};
use crate::services::entity_definition::{EntityDefinition, EntityDefinitionStore};
use crate::services::entity_instance::{
    CreateEntityInstanceInput, EntityInstance, EntityInstanceService, UpdateEntityInstanceInput,
};
use crate::services::property_definition::{PropertyDefinition, PropertyDefinitionStore};
use crate::services::property_value::PropertyValueService;
use crate::record::Versioned;
use crate::types::{Actor, CorrelationId, EntityDefinitionId, SyncStatus};
use crate::value::AttributeValue;

/// One record as delivered by a source system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Identifier in the source system.
    pub external_id: String,
    /// Display name, if the source provides one.
    pub display_name: Option<String>,
    /// Raw payload; property values are read from its top-level fields.
    pub raw_data: JsonValue,
}

impl SyncRecord {
    /// A record with the given payload.
    #[must_use]
    pub fn new(external_id: impl Into<String>, raw_data: JsonValue) -> Self {
        Self {
            external_id: external_id.into(),
            display_name: None,
            raw_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Service applying synchronization batches.
pub struct SyncService {
    definitions: Arc<dyn EntityDefinitionStore>,
    properties: Arc<dyn PropertyDefinitionStore>,
    instances: Arc<EntityInstanceService>,
    values: Arc<PropertyValueService>,
    audit_store: Arc<dyn AuditStore>,
}

impl SyncService {
    /// Create a new sync service.
    pub fn new(
        definitions: Arc<dyn EntityDefinitionStore>,
        properties: Arc<dyn PropertyDefinitionStore>,
        instances: Arc<EntityInstanceService>,
        values: Arc<PropertyValueService>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            definitions,
            properties,
            instances,
            values,
            audit_store,
        }
    }

    /// Apply a batch of records to one entity definition.
    ///
    /// A failing record marks its instance `Failed` and is counted; it never
    /// aborts the batch. The run ends `Failed` only when every record failed.
    #[tracing::instrument(skip_all, fields(entity_definition_id = %entity_definition_id, records = records.len()))]
    pub async fn apply_batch(
        &self,
        entity_definition_id: EntityDefinitionId,
        records: Vec<SyncRecord>,
        actor: Actor,
    ) -> Result<SyncRun> {
        let definition = self
            .definitions
            .get(entity_definition_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(EntityDefinition::ENTITY, entity_definition_id))?;
        let properties = self
            .properties
            .list_for_definition(entity_definition_id)
            .await?;

        let correlation_id = CorrelationId::new();
        let mut run = SyncRun {
            id: Uuid::new_v4(),
            entity_definition_id,
            correlation_id,
            actor,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            records_received: records.len(),
            created: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            status: SyncStatus::InProgress,
            errors: Vec::new(),
        };

        for record in records {
            let external_id = record.external_id.clone();
            match self
                .apply_record(&definition, &properties, record, actor, correlation_id)
                .await
            {
                Ok(RecordOutcome::Created) => run.created += 1,
                Ok(RecordOutcome::Updated) => run.updated += 1,
                Ok(RecordOutcome::Unchanged) => run.unchanged += 1,
                Err(e) => {
                    tracing::warn!(external_id = %external_id, error = %e, "Sync record failed");
                    run.failed += 1;
                    run.errors.push(format!("{external_id}: {e}"));
                    self.mark_failed(&definition, &external_id, actor, correlation_id)
                        .await;
                }
            }
        }

        run.finished_at = Utc::now();
        run.status = if run.failed > 0 && run.failed == run.records_received {
            SyncStatus::Failed
        } else {
            SyncStatus::Success
        };

        tracing::info!(
            sync_run_id = %run.id,
            created = run.created,
            updated = run.updated,
            unchanged = run.unchanged,
            failed = run.failed,
            status = %run.status,
            "Sync batch applied"
        );
        self.audit_store.record_sync_run(run.clone()).await?;
        Ok(run)
    }

    async fn apply_record(
        &self,
        definition: &EntityDefinition,
        properties: &[PropertyDefinition],
        record: SyncRecord,
        actor: Actor,
        correlation_id: CorrelationId,
    ) -> Result<RecordOutcome> {
        if record.external_id.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "external_id must not be empty".to_string(),
            ));
        }
        let mapped = map_fields(properties, &record.raw_data);
        let synced = UpdateEntityInstanceInput {
            sync_status: Some(SyncStatus::Success),
            last_synced_at: Some(Utc::now()),
            raw_data: Some(record.raw_data.clone()),
            ..Default::default()
        };

        let existing = self
            .instances
            .find_by_external_id(definition.id, &record.external_id)
            .await?;
        let Some(instance) = existing else {
            let created = self
                .instances
                .create_instance(
                    CreateEntityInstanceInput {
                        entity_definition_id: definition.id,
                        external_id: record.external_id,
                        display_name: record.display_name,
                        is_active: None,
                        raw_data: Some(record.raw_data),
                        values: mapped,
                    },
                    actor,
                    Some(correlation_id),
                )
                .await?;
            self.instances
                .update_instance(
                    created.id,
                    UpdateEntityInstanceInput {
                        expected_version: created.meta.version,
                        ..synced
                    },
                    actor,
                    Some(correlation_id),
                )
                .await?;
            return Ok(RecordOutcome::Created);
        };

        // Parse everything first so a bad field leaves the instance untouched.
        let mut parsed = Vec::new();
        let mut errors = Vec::new();
        for property in properties {
            if let Some(raw) = mapped.get(&property.name) {
                match property.parse(raw) {
                    Ok(value) => parsed.push((property.clone(), value)),
                    Err(GovernanceError::ValidationFailed(mut field_errors)) => {
                        errors.append(&mut field_errors);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if !errors.is_empty() {
            return Err(GovernanceError::ValidationFailed(errors));
        }

        let mut changed = self
            .values
            .write_all(&instance, parsed, actor, Some(correlation_id))
            .await?
            .iter()
            .any(|write| write.changed);

        let display_name = record
            .display_name
            .filter(|name| *name != instance.display_name);
        changed |= display_name.is_some() || instance.raw_data != record.raw_data;

        self.instances
            .update_instance(
                instance.id,
                UpdateEntityInstanceInput {
                    expected_version: instance.meta.version,
                    display_name,
                    ..synced
                },
                actor,
                Some(correlation_id),
            )
            .await?;

        Ok(if changed {
            RecordOutcome::Updated
        } else {
            RecordOutcome::Unchanged
        })
    }

    async fn mark_failed(
        &self,
        definition: &EntityDefinition,
        external_id: &str,
        actor: Actor,
        correlation_id: CorrelationId,
    ) {
        let instance: Option<EntityInstance> = match self
            .instances
            .find_by_external_id(definition.id, external_id)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(external_id = %external_id, error = %e, "Failed to look up instance");
                None
            }
        };
        let Some(instance) = instance else {
            return;
        };
        let update = UpdateEntityInstanceInput {
            expected_version: instance.meta.version,
            sync_status: Some(SyncStatus::Failed),
            ..Default::default()
        };
        if let Err(e) = self
            .instances
            .update_instance(instance.id, update, actor, Some(correlation_id))
            .await
        {
            tracing::warn!(external_id = %external_id, error = %e, "Failed to mark instance failed");
        }
    }

    /// Current values of an instance as they would be mapped back to source
    /// fields.
    pub async fn export_values(
        &self,
        instance: &EntityInstance,
    ) -> Result<HashMap<String, AttributeValue>> {
        let properties = self
            .properties
            .list_for_definition(instance.entity_definition_id)
            .await?;
        let mut by_name = self.values.named_values(instance).await?;
        Ok(properties
            .iter()
            .filter_map(|p| {
                by_name
                    .remove(&p.name)
                    .map(|value| (p.source_key().to_string(), value))
            })
            .collect())
    }
}

/// Values keyed by property name, read from each property's source field.
/// Absent and null fields are skipped.
fn map_fields(properties: &[PropertyDefinition], raw: &JsonValue) -> HashMap<String, JsonValue> {
    properties
        .iter()
        .filter_map(|p| {
            raw.get(p.source_key())
                .filter(|v| !v.is_null())
                .map(|v| (p.name.clone(), v.clone()))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
