//! Temporally versioned attribute values.
//!
//! A [`PropertyValue`] is one cell of the attribute store: the value of one
//! property for one instance over the window `[effective_from, effective_to)`.
//! A cell has at most one open row (`effective_to = None`). Writing a new
//! value closes the open row at the write instant and opens a replacement
//! starting at that same instant, so the history of a cell is a gapless,
//! non-overlapping chain and any past instant resolves to at most one row.
//!
//! # Concurrency
//!
//! Writes to one cell are serialized by a keyed lock, and the store closes
//! and inserts under a single write lock, so readers never observe a cell
//! with two open rows or with none mid-transition. Writes to a unique
//! property are additionally serialized per property. Every write holds the
//! instance gate shared and re-checks that the instance is live, so no value
//! lands on an instance retired mid-write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::audit::{AuditAction, AuditEventInput, AuditStore, AuditSubject};
use crate::error::{FieldError, GovernanceError, Result};
use crate::events::{ChangeEvent, ChangeKind, EventSink, PropertyChange};
use crate::locks::{KeyedLocks, KeyedRwLocks};
use crate::record::{RecordMeta, Versioned};
use crate::services::entity_instance::{EntityInstance, EntityInstanceStore};
use crate::services::property_definition::{PropertyDefinition, PropertyDefinitionStore};
use crate::types::{
    Actor, CorrelationId, EntityDefinitionId, EntityInstanceId, PropertyDefinitionId,
    PropertyValueId,
};
use crate::value::{parse_value, AttributeValue};

/// One attribute cell.
pub type Cell = (EntityInstanceId, PropertyDefinitionId);

// ============================================================================
// Domain Types
// ============================================================================

/// The value of one property of one instance over a validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Unique identifier.
    pub id: PropertyValueId,
    /// Instance the value belongs to.
    pub instance_id: EntityInstanceId,
    /// Property the value is for.
    pub property_definition_id: PropertyDefinitionId,
    /// Canonical value.
    pub value: AttributeValue,
    /// Formatted value for presentation.
    pub display_value: String,
    /// Filled in from the property default.
    pub is_default: bool,
    /// Start of validity (inclusive).
    pub effective_from: DateTime<Utc>,
    /// End of validity (exclusive); `None` while current.
    pub effective_to: Option<DateTime<Utc>>,
    /// Record metadata.
    pub meta: RecordMeta,
}

impl PropertyValue {
    /// A new open row effective from `effective_from`.
    #[must_use]
    pub fn new(
        instance_id: EntityInstanceId,
        property_definition_id: PropertyDefinitionId,
        value: AttributeValue,
        effective_from: DateTime<Utc>,
        actor: Actor,
    ) -> Self {
        Self {
            id: PropertyValueId::new(),
            instance_id,
            property_definition_id,
            display_value: value.display_value(),
            value,
            is_default: false,
            effective_from,
            effective_to: None,
            meta: RecordMeta::new_at(actor, effective_from),
        }
    }

    /// Set the default-value flag.
    #[must_use]
    pub fn with_default_flag(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    /// The cell this row belongs to.
    #[must_use]
    pub fn cell(&self) -> Cell {
        (self.instance_id, self.property_definition_id)
    }

    /// Whether this is the current row of its cell.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.effective_to.is_none()
    }

    /// Whether the window contains `at`.
    #[must_use]
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.is_none_or(|to| at < to)
    }
}

impl Versioned for PropertyValue {
    const ENTITY: &'static str = "PropertyValue";

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

/// Result of a value write.
#[derive(Debug, Clone)]
pub struct ValueWrite {
    /// The open row after the write.
    pub value: PropertyValue,
    /// The row that was closed, if any.
    pub previous: Option<PropertyValue>,
    /// False when the value was already current and nothing was written.
    pub changed: bool,
}

/// A validated initial value for a new instance.
#[derive(Debug, Clone)]
pub struct InitialValue {
    /// The property.
    pub property: PropertyDefinition,
    /// The coerced value.
    pub value: AttributeValue,
    /// Taken from the property default.
    pub is_default: bool,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for property value storage backends.
///
/// Implementations must index open rows by cell and perform
/// [`supersede`](PropertyValueStore::supersede) atomically.
#[async_trait::async_trait]
pub trait PropertyValueStore: Send + Sync {
    /// The open row of a cell.
    async fn open_value(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
    ) -> Result<Option<PropertyValue>>;

    /// Close the cell's open row at `row.effective_from` and insert `row` as
    /// the new open row, in one step. A replacement never starts before the
    /// row it closes. Returns the closed row and the inserted row.
    async fn supersede(
        &self,
        row: PropertyValue,
        actor: Actor,
    ) -> Result<(Option<PropertyValue>, PropertyValue)>;

    /// Close the cell's open row at `at` without a replacement.
    async fn close_open(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
        at: DateTime<Utc>,
        actor: Actor,
    ) -> Result<Option<PropertyValue>>;

    /// Insert open rows for cells that have none, all or nothing.
    async fn insert_open_batch(&self, rows: Vec<PropertyValue>) -> Result<()>;

    /// Every live row of a cell ordered by `effective_from`.
    async fn history(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
    ) -> Result<Vec<PropertyValue>>;

    /// Live rows of an instance whose window contains `at`.
    async fn effective_at(
        &self,
        instance_id: EntityInstanceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<PropertyValue>>;

    /// Open rows of an instance.
    async fn open_for_instance(&self, instance_id: EntityInstanceId) -> Result<Vec<PropertyValue>>;

    /// Open rows of a property, in insertion order.
    async fn open_for_property(&self, property_id: PropertyDefinitionId)
        -> Result<Vec<PropertyValue>>;

    /// Number of live (non-deleted) rows of a property, open or closed.
    async fn count_live_for_property(&self, property_id: PropertyDefinitionId) -> Result<usize>;

    /// Close every open row of an instance at `at` and soft-delete all of
    /// its rows. Returns the number of rows retired.
    async fn retire_instance(
        &self,
        instance_id: EntityInstanceId,
        at: DateTime<Utc>,
        actor: Actor,
    ) -> Result<usize>;
}

// ============================================================================
// In-Memory Store (for testing)
// ============================================================================

#[derive(Debug, Default)]
struct ValueTable {
    rows: HashMap<PropertyValueId, PropertyValue>,
    order: Vec<PropertyValueId>,
    open: HashMap<Cell, PropertyValueId>,
}

impl ValueTable {
    fn live(&self) -> impl Iterator<Item = &PropertyValue> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.rows.get(id))
            .filter(|row| row.meta.is_live())
    }

    fn insert(&mut self, row: PropertyValue) {
        self.open.insert(row.cell(), row.id);
        self.order.push(row.id);
        self.rows.insert(row.id, row);
    }
}

/// In-memory property value store for testing.
#[derive(Debug, Default)]
pub struct InMemoryPropertyValueStore {
    table: Arc<RwLock<ValueTable>>,
}

impl InMemoryPropertyValueStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open rows of a cell. Never more than one.
    pub async fn open_count(&self, cell: Cell) -> usize {
        self.table
            .read()
            .await
            .live()
            .filter(|row| row.cell() == cell && row.is_open())
            .count()
    }
}

#[async_trait::async_trait]
impl PropertyValueStore for InMemoryPropertyValueStore {
    async fn open_value(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
    ) -> Result<Option<PropertyValue>> {
        let table = self.table.read().await;
        Ok(table
            .open
            .get(&(instance_id, property_id))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn supersede(
        &self,
        mut row: PropertyValue,
        actor: Actor,
    ) -> Result<(Option<PropertyValue>, PropertyValue)> {
        let mut guard = self.table.write().await;
        let table = &mut *guard;

        let closed = match table.open.get(&row.cell()) {
            Some(open_id) => {
                let open = table.rows.get_mut(open_id).ok_or_else(|| {
                    GovernanceError::Failed(format!("open index points at missing row {open_id}"))
                })?;
                if row.effective_from < open.effective_from {
                    row.effective_from = open.effective_from;
                }
                open.effective_to = Some(row.effective_from);
                open.meta.touch(actor);
                Some(open.clone())
            }
            None => None,
        };

        table.insert(row.clone());
        Ok((closed, row))
    }

    async fn close_open(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
        at: DateTime<Utc>,
        actor: Actor,
    ) -> Result<Option<PropertyValue>> {
        let mut guard = self.table.write().await;
        let table = &mut *guard;

        let Some(open_id) = table.open.remove(&(instance_id, property_id)) else {
            return Ok(None);
        };
        let row = table.rows.get_mut(&open_id).ok_or_else(|| {
            GovernanceError::Failed(format!("open index points at missing row {open_id}"))
        })?;
        row.effective_to = Some(at.max(row.effective_from));
        row.meta.touch(actor);
        Ok(Some(row.clone()))
    }

    async fn insert_open_batch(&self, rows: Vec<PropertyValue>) -> Result<()> {
        let mut table = self.table.write().await;
        if let Some(taken) = rows.iter().find(|row| table.open.contains_key(&row.cell())) {
            return Err(GovernanceError::Conflict(format!(
                "property {} of instance {} already has a current value",
                taken.property_definition_id, taken.instance_id
            )));
        }
        for row in rows {
            table.insert(row);
        }
        Ok(())
    }

    async fn history(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
    ) -> Result<Vec<PropertyValue>> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table
            .live()
            .filter(|row| row.cell() == (instance_id, property_id))
            .cloned()
            .collect();
        // Zero-width rows share a start with their successor; closed sorts first.
        rows.sort_by_key(|row| (row.effective_from, row.effective_to.is_none(), row.effective_to));
        Ok(rows)
    }

    async fn effective_at(
        &self,
        instance_id: EntityInstanceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<PropertyValue>> {
        let table = self.table.read().await;
        Ok(table
            .live()
            .filter(|row| row.instance_id == instance_id && row.is_effective_at(at))
            .cloned()
            .collect())
    }

    async fn open_for_instance(&self, instance_id: EntityInstanceId) -> Result<Vec<PropertyValue>> {
        let table = self.table.read().await;
        Ok(table
            .live()
            .filter(|row| row.instance_id == instance_id && row.is_open())
            .cloned()
            .collect())
    }

    async fn open_for_property(
        &self,
        property_id: PropertyDefinitionId,
    ) -> Result<Vec<PropertyValue>> {
        let table = self.table.read().await;
        Ok(table
            .live()
            .filter(|row| row.property_definition_id == property_id && row.is_open())
            .cloned()
            .collect())
    }

    async fn count_live_for_property(&self, property_id: PropertyDefinitionId) -> Result<usize> {
        let table = self.table.read().await;
        Ok(table
            .live()
            .filter(|row| row.property_definition_id == property_id)
            .count())
    }

    async fn retire_instance(
        &self,
        instance_id: EntityInstanceId,
        at: DateTime<Utc>,
        actor: Actor,
    ) -> Result<usize> {
        let mut guard = self.table.write().await;
        let table = &mut *guard;

        table.open.retain(|(instance, _), _| *instance != instance_id);
        let mut retired = 0;
        for row in table.rows.values_mut() {
            if row.instance_id != instance_id || !row.meta.is_live() {
                continue;
            }
            if row.is_open() {
                row.effective_to = Some(at.max(row.effective_from));
            }
            row.meta.mark_deleted(actor);
            row.meta.touch(actor);
            retired += 1;
        }
        Ok(retired)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service for reading and writing attribute values.
pub struct PropertyValueService {
    store: Arc<dyn PropertyValueStore>,
    properties: Arc<dyn PropertyDefinitionStore>,
    instances: Arc<dyn EntityInstanceStore>,
    events: Arc<dyn EventSink>,
    audit_store: Arc<dyn AuditStore>,
    cell_locks: KeyedLocks<Cell>,
    unique_locks: KeyedLocks<PropertyDefinitionId>,
    instance_gate: Arc<KeyedRwLocks<EntityInstanceId>>,
}

/// A coerced value waiting to be stored.
struct PlannedWrite {
    property: PropertyDefinition,
    value: AttributeValue,
    current: Option<PropertyValue>,
}

impl PropertyValueService {
    /// Create a new property value service.
    pub fn new(
        store: Arc<dyn PropertyValueStore>,
        properties: Arc<dyn PropertyDefinitionStore>,
        instances: Arc<dyn EntityInstanceStore>,
        events: Arc<dyn EventSink>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            store,
            properties,
            instances,
            events,
            audit_store,
            cell_locks: KeyedLocks::new(),
            unique_locks: KeyedLocks::new(),
            instance_gate: Arc::new(KeyedRwLocks::new()),
        }
    }

    /// Per-instance gate. Value writes hold it shared; retiring the
    /// instance holds it exclusively.
    #[must_use]
    pub fn instance_gate(&self) -> Arc<KeyedRwLocks<EntityInstanceId>> {
        self.instance_gate.clone()
    }

    async fn live_instance(&self, id: EntityInstanceId) -> Result<EntityInstance> {
        self.instances
            .get(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(EntityInstance::ENTITY, id))
    }

    async fn property_of(
        &self,
        instance: &EntityInstance,
        property_id: PropertyDefinitionId,
    ) -> Result<PropertyDefinition> {
        let property = self
            .properties
            .get(property_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(PropertyDefinition::ENTITY, property_id))?;
        if property.entity_definition_id != instance.entity_definition_id {
            return Err(GovernanceError::Validation(format!(
                "Property '{}' does not belong to the definition of instance {}",
                property.name, instance.id
            )));
        }
        Ok(property)
    }

    /// Set the value of a cell.
    ///
    /// The raw value is coerced and validated before storage is touched. An
    /// unchanged value writes nothing and reports `changed: false`.
    pub async fn upsert_value(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
        raw: &JsonValue,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<ValueWrite> {
        let instance = self.live_instance(instance_id).await?;
        let property = self.property_of(&instance, property_id).await?;
        let value = property.parse(raw)?;
        self.write(&instance, &property, value, actor, correlation_id)
            .await
    }

    /// Set a value that has already been coerced for `property`.
    pub(crate) async fn write(
        &self,
        instance: &EntityInstance,
        property: &PropertyDefinition,
        value: AttributeValue,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<ValueWrite> {
        self.write_all(instance, vec![(property.clone(), value)], actor, correlation_id)
            .await?
            .pop()
            .ok_or_else(|| GovernanceError::Failed("value write produced no result".into()))
    }

    /// Set several coerced values of one instance, all or nothing.
    ///
    /// Every cell is locked and every uniqueness constraint is checked before
    /// the first row is written, so a rejected value leaves the other cells
    /// untouched. Results follow the order of `writes`.
    pub(crate) async fn write_all(
        &self,
        instance: &EntityInstance,
        writes: Vec<(PropertyDefinition, AttributeValue)>,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<ValueWrite>> {
        let mut unique: Vec<_> = writes
            .iter()
            .filter(|(property, _)| property.is_unique)
            .map(|(property, _)| property.id)
            .collect();
        unique.sort();
        unique.dedup();
        let mut cells: Vec<Cell> = writes
            .iter()
            .map(|(property, _)| (instance.id, property.id))
            .collect();
        cells.sort();
        cells.dedup();
        if cells.len() != writes.len() {
            return Err(GovernanceError::Validation(
                "A property may be written once per batch".into(),
            ));
        }

        let gate = self.instance_gate.read(instance.id).await;
        let mut guards = Vec::with_capacity(unique.len() + cells.len());
        for id in unique {
            guards.push(self.unique_locks.lock(id).await);
        }
        for cell in cells {
            guards.push(self.cell_locks.lock(cell).await);
        }

        self.live_instance(instance.id).await?;
        let mut planned = Vec::with_capacity(writes.len());
        for (property, value) in writes {
            self.ensure_current_schema(&property, &value).await?;
            let current = self.store.open_value(instance.id, property.id).await?;
            let unchanged = current.as_ref().is_some_and(|c| c.value == value);
            if property.is_unique && !unchanged {
                self.ensure_unique(&property, instance.id, &value).await?;
            }
            planned.push(PlannedWrite {
                property,
                value,
                current,
            });
        }

        let now = Utc::now();
        let mut results = Vec::with_capacity(planned.len());
        for plan in &planned {
            match &plan.current {
                Some(current) if current.value == plan.value => results.push(ValueWrite {
                    previous: Some(current.clone()),
                    value: current.clone(),
                    changed: false,
                }),
                _ => {
                    let row = PropertyValue::new(
                        instance.id,
                        plan.property.id,
                        plan.value.clone(),
                        now,
                        actor,
                    );
                    let (previous, stored) = self.store.supersede(row, actor).await?;
                    results.push(ValueWrite {
                        value: stored,
                        previous,
                        changed: true,
                    });
                }
            }
        }
        drop(guards);
        drop(gate);

        for (plan, write) in planned.iter().zip(&results) {
            if write.changed {
                self.record_write(instance, &plan.property, write, actor, correlation_id)
                    .await?;
            }
        }
        Ok(results)
    }

    async fn record_write(
        &self,
        instance: &EntityInstance,
        property: &PropertyDefinition,
        write: &ValueWrite,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<()> {
        tracing::debug!(
            instance_id = %instance.id,
            property = %property.name,
            value = %write.value.display_value,
            "Property value set"
        );

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::PropertyValue,
                subject_id: write.value.id.into_inner(),
                action: AuditAction::ValueSet,
                actor,
                before_state: write
                    .previous
                    .as_ref()
                    .map(|p| serde_json::to_value(p).unwrap_or_default()),
                after_state: Some(serde_json::to_value(&write.value).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        self.publish_change(
            instance,
            property,
            write.previous.as_ref().map(|p| p.value.clone()),
            Some(write.value.value.clone()),
            actor,
            correlation_id,
        )
        .await;
        Ok(())
    }

    /// Reject a value coerced under a definition that has since changed.
    async fn ensure_current_schema(
        &self,
        property: &PropertyDefinition,
        value: &AttributeValue,
    ) -> Result<()> {
        let current = self
            .properties
            .get(property.id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(PropertyDefinition::ENTITY, property.id))?;
        if current.data_type != value.data_type()
            || current.validation_rule != property.validation_rule
            || current.is_unique != property.is_unique
        {
            return Err(GovernanceError::Conflict(format!(
                "Property '{}' changed while a value was being written",
                current.name
            )));
        }
        Ok(())
    }

    /// Rewrite the open values of `property` into its current data type.
    ///
    /// Each cell is re-read under its lock, so a value written while the
    /// definition was changing is converted too. A value that no longer
    /// converts is left in place and logged. Returns the number of values
    /// rewritten.
    pub(crate) async fn migrate_property(
        &self,
        property: &PropertyDefinition,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<usize> {
        let mut migrated = 0;
        for stale in self.store.open_for_property(property.id).await? {
            if stale.value.data_type() == property.data_type {
                continue;
            }
            let Some(instance) = self.instances.get(stale.instance_id).await? else {
                continue;
            };
            let gate = self.instance_gate.read(instance.id).await;
            let cell = self.cell_locks.lock((instance.id, property.id)).await;
            let Some(current) = self.store.open_value(instance.id, property.id).await? else {
                continue;
            };
            if current.value.data_type() == property.data_type {
                continue;
            }
            let converted = match parse_value(
                property.data_type,
                property.validation_rule.as_ref(),
                &current.value.to_raw(),
            ) {
                Ok(converted) => converted,
                Err(message) => {
                    tracing::warn!(
                        property_definition_id = %property.id,
                        instance_id = %instance.id,
                        error = %message,
                        "Stored value does not convert into the new data type"
                    );
                    continue;
                }
            };
            let row = PropertyValue::new(instance.id, property.id, converted, Utc::now(), actor)
                .with_default_flag(current.is_default);
            let (previous, stored) = self.store.supersede(row, actor).await?;
            drop(cell);
            drop(gate);

            let write = ValueWrite {
                value: stored,
                previous,
                changed: true,
            };
            self.record_write(&instance, property, &write, actor, correlation_id)
                .await?;
            migrated += 1;
        }
        Ok(migrated)
    }

    async fn ensure_unique(
        &self,
        property: &PropertyDefinition,
        instance_id: EntityInstanceId,
        value: &AttributeValue,
    ) -> Result<()> {
        let clash = self
            .store
            .open_for_property(property.id)
            .await?
            .into_iter()
            .find(|row| row.instance_id != instance_id && &row.value == value);
        match clash {
            Some(row) => Err(GovernanceError::Conflict(format!(
                "Value '{}' of unique property '{}' is already held by instance {}",
                row.display_value, property.name, row.instance_id
            ))),
            None => Ok(()),
        }
    }

    async fn publish_change(
        &self,
        instance: &EntityInstance,
        property: &PropertyDefinition,
        old_value: Option<AttributeValue>,
        new_value: Option<AttributeValue>,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) {
        let event = ChangeEvent::new(
            ChangeKind::PropertyChanged(PropertyChange {
                property_definition_id: property.id,
                property_name: property.name.clone(),
                old_value,
                new_value,
            }),
            instance.id,
            instance.entity_definition_id,
            actor,
        )
        .with_correlation(correlation_id);
        self.events.publish(event).await;
    }

    /// Close the open value of a cell without a replacement.
    ///
    /// Returns the closed row, or `None` when the cell had no current value.
    pub async fn expire_value(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Option<PropertyValue>> {
        let instance = self.live_instance(instance_id).await?;
        let property = self.property_of(&instance, property_id).await?;
        if property.is_required {
            return Err(GovernanceError::ValidationFailed(vec![FieldError::new(
                &property.name,
                "is required and cannot be expired",
            )]));
        }

        let closed = {
            let _cell = self.cell_locks.lock((instance_id, property_id)).await;
            self.store
                .close_open(instance_id, property_id, Utc::now(), actor)
                .await?
        };
        let Some(closed) = closed else {
            return Ok(None);
        };

        tracing::debug!(instance_id = %instance_id, property = %property.name, "Property value expired");

        self.audit_store
            .log_event(AuditEventInput {
                subject: AuditSubject::PropertyValue,
                subject_id: closed.id.into_inner(),
                action: AuditAction::ValueExpired,
                actor,
                after_state: Some(serde_json::to_value(&closed).unwrap_or_default()),
                correlation_id,
                ..Default::default()
            })
            .await?;

        self.publish_change(
            &instance,
            &property,
            Some(closed.value.clone()),
            None,
            actor,
            correlation_id,
        )
        .await;

        Ok(Some(closed))
    }

    /// The value of a cell effective at `at`, if any.
    pub async fn value_at(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
        at: DateTime<Utc>,
    ) -> Result<Option<PropertyValue>> {
        Ok(self
            .store
            .history(instance_id, property_id)
            .await?
            .into_iter()
            .find(|row| row.is_effective_at(at)))
    }

    /// Every property value of an instance effective at `at`.
    pub async fn values_at(
        &self,
        instance_id: EntityInstanceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<PropertyValue>> {
        self.store.effective_at(instance_id, at).await
    }

    /// The current (open) values of an instance.
    pub async fn current_values(&self, instance_id: EntityInstanceId) -> Result<Vec<PropertyValue>> {
        self.store.open_for_instance(instance_id).await
    }

    /// The full value chain of a cell ordered by `effective_from`.
    pub async fn value_history(
        &self,
        instance_id: EntityInstanceId,
        property_id: PropertyDefinitionId,
    ) -> Result<Vec<PropertyValue>> {
        self.store.history(instance_id, property_id).await
    }

    /// Current values of an instance keyed by property name.
    pub async fn named_values(
        &self,
        instance: &EntityInstance,
    ) -> Result<HashMap<String, AttributeValue>> {
        let names: HashMap<_, _> = self
            .properties
            .list_for_definition(instance.entity_definition_id)
            .await?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        Ok(self
            .store
            .open_for_instance(instance.id)
            .await?
            .into_iter()
            .filter_map(|row| {
                names
                    .get(&row.property_definition_id)
                    .map(|name| (name.clone(), row.value))
            })
            .collect())
    }

    /// Validate the initial values of a new instance of `definition_id`.
    ///
    /// Keys are property names. Properties left out take their default;
    /// required properties without one are reported. Nothing is stored.
    pub async fn prepare_initial(
        &self,
        definition_id: EntityDefinitionId,
        raw: &HashMap<String, JsonValue>,
    ) -> Result<Vec<InitialValue>> {
        let properties = self.properties.list_for_definition(definition_id).await?;
        let mut errors = Vec::new();
        let mut prepared = Vec::new();

        for name in raw.keys() {
            if !properties.iter().any(|p| p.name.eq_ignore_ascii_case(name)) {
                errors.push(FieldError::new(name, "unknown property"));
            }
        }

        for property in properties {
            let supplied = raw
                .iter()
                .find(|(name, value)| property.name.eq_ignore_ascii_case(name) && !value.is_null())
                .map(|(_, value)| value);
            let default = property.default_value.clone();
            match (supplied, default) {
                (Some(value), _) => match property.parse(value) {
                    Ok(value) => prepared.push(InitialValue {
                        property,
                        value,
                        is_default: false,
                    }),
                    Err(GovernanceError::ValidationFailed(mut field_errors)) => {
                        errors.append(&mut field_errors);
                    }
                    Err(other) => return Err(other),
                },
                (None, Some(default)) => prepared.push(InitialValue {
                    value: default,
                    property,
                    is_default: true,
                }),
                (None, None) if property.is_required => {
                    errors.push(FieldError::new(&property.name, "is required"));
                }
                (None, None) => {}
            }
        }

        if errors.is_empty() {
            Ok(prepared)
        } else {
            Err(GovernanceError::ValidationFailed(errors))
        }
    }

    /// Store the prepared initial values of a freshly inserted instance.
    pub async fn insert_initial(
        &self,
        instance: &EntityInstance,
        prepared: Vec<InitialValue>,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<PropertyValue>> {
        let mut unique: Vec<_> = prepared
            .iter()
            .filter(|initial| initial.property.is_unique)
            .map(|initial| initial.property.id)
            .collect();
        unique.sort();
        let mut guards = Vec::with_capacity(unique.len());
        for id in unique {
            guards.push(self.unique_locks.lock(id).await);
        }
        for initial in prepared.iter().filter(|i| i.property.is_unique) {
            self.ensure_unique(&initial.property, instance.id, &initial.value)
                .await?;
        }

        let now = Utc::now();
        let rows: Vec<_> = prepared
            .into_iter()
            .map(|initial| {
                PropertyValue::new(instance.id, initial.property.id, initial.value, now, actor)
                    .with_default_flag(initial.is_default)
            })
            .collect();
        self.store.insert_open_batch(rows.clone()).await?;
        drop(guards);

        for row in &rows {
            self.audit_store
                .log_event(AuditEventInput {
                    subject: AuditSubject::PropertyValue,
                    subject_id: row.id.into_inner(),
                    action: AuditAction::ValueSet,
                    actor,
                    after_state: Some(serde_json::to_value(row).unwrap_or_default()),
                    correlation_id,
                    ..Default::default()
                })
                .await?;
        }
        Ok(rows)
    }

    /// Open values of a property.
    pub async fn open_for_property(
        &self,
        property_id: PropertyDefinitionId,
    ) -> Result<Vec<PropertyValue>> {
        self.store.open_for_property(property_id).await
    }

    /// Number of live rows of a property, open or closed.
    pub async fn count_live_for_property(&self, property_id: PropertyDefinitionId) -> Result<usize> {
        self.store.count_live_for_property(property_id).await
    }

    /// Close and soft-delete every value of a retired instance.
    pub async fn retire_instance_values(
        &self,
        instance_id: EntityInstanceId,
        actor: Actor,
    ) -> Result<usize> {
        self.store
            .retire_instance(instance_id, Utc::now(), actor)
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
