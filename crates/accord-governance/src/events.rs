//! Change events raised by the attribute store.
//!
//! Services publish a [`ChangeEvent`] for every instance lifecycle change and
//! every value mutation. The rule engine consumes them explicitly through
//! `RuleEngine::process_event`, so an action that itself mutates attributes
//! never re-enters the engine implicitly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{
    Actor, CorrelationId, EntityDefinitionId, EntityInstanceId, PropertyDefinitionId, TriggerType,
};
use crate::value::AttributeValue;

/// Old and new value of a changed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Changed property.
    pub property_definition_id: PropertyDefinitionId,
    /// Its name, as conditions refer to it.
    pub property_name: String,
    /// Value before the change; `None` when previously unset.
    pub old_value: Option<AttributeValue>,
    /// Value after the change; `None` when expired.
    pub new_value: Option<AttributeValue>,
}

/// What happened to the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Instance was created.
    EntityCreated,
    /// Instance fields were updated.
    EntityUpdated,
    /// Instance was retired.
    EntityDeleted,
    /// One attribute value was set or expired.
    PropertyChanged(PropertyChange),
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event identifier.
    pub id: Uuid,
    /// What happened.
    pub kind: ChangeKind,
    /// Instance concerned.
    pub instance_id: EntityInstanceId,
    /// Definition of that instance.
    pub entity_definition_id: EntityDefinitionId,
    /// Who caused it.
    pub actor: Actor,
    /// Request or cycle it belongs to.
    pub correlation_id: Option<CorrelationId>,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an event stamped now.
    #[must_use]
    pub fn new(
        kind: ChangeKind,
        instance_id: EntityInstanceId,
        entity_definition_id: EntityDefinitionId,
        actor: Actor,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            instance_id,
            entity_definition_id,
            actor,
            correlation_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Trigger type of rules this event can fire.
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        match self.kind {
            ChangeKind::EntityCreated => TriggerType::NewEntity,
            ChangeKind::EntityUpdated => TriggerType::EntityUpdate,
            ChangeKind::EntityDeleted => TriggerType::EntityDelete,
            ChangeKind::PropertyChanged(_) => TriggerType::PropertyChange,
        }
    }

    /// The property change, if this is one.
    #[must_use]
    pub fn property_change(&self) -> Option<&PropertyChange> {
        match &self.kind {
            ChangeKind::PropertyChanged(change) => Some(change),
            _ => None,
        }
    }
}

/// Destination for change events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event. Publishing never fails the originating mutation.
    async fn publish(&self, event: ChangeEvent);
}

/// Buffers events until drained.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl InMemoryEventSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every buffered event in publication order.
    pub async fn drain(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }

    /// Copy of the buffered events.
    pub async fn snapshot(&self) -> Vec<ChangeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, event: ChangeEvent) {
        tracing::debug!(
            event_id = %event.id,
            instance_id = %event.instance_id,
            trigger = %event.trigger_type(),
            "Change event published"
        );
        self.events.lock().await.push(event);
    }
}
