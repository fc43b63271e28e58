//! Service layer for attribute governance.
//!
//! One service per catalog (entity definitions, property definitions,
//! instances, values, assignments, rules), the rule engine that ties them
//! together, and synchronization ingestion. [`GovernanceServices`] wires a
//! complete set over a chosen storage backend.

pub mod assignment;
pub mod engine;
pub mod entity_definition;
pub mod entity_instance;
pub mod property_definition;
pub mod property_value;
pub mod rule;
pub mod sync;

use std::sync::Arc;

use crate::audit::AuditStore;
use crate::config::GovernanceConfig;
use crate::events::EventSink;
use crate::integration::IntegrationRegistry;
use crate::notify::NotificationDispatcher;

// Re-export commonly used types
pub use assignment::{
    AccessAssignment, AssignmentFilter, AssignmentService, AssignmentStore, AssignmentTriple,
    CreateAssignmentInput, Grant, InMemoryAssignmentStore, UpdateAssignmentInput,
};
pub use engine::{CycleReport, RuleEngine, RuleOutcome, RuleOutcomeStatus, SkipReason};
pub use entity_definition::{
    CreateEntityDefinitionInput, EntityDefinition, EntityDefinitionFilter,
    EntityDefinitionService, EntityDefinitionStore, InMemoryEntityDefinitionStore,
    UpdateEntityDefinitionInput,
};
pub use entity_instance::{
    CreateEntityInstanceInput, EntityInstance, EntityInstanceFilter, EntityInstanceService,
    EntityInstanceStore, InMemoryEntityInstanceStore, UpdateEntityInstanceInput,
};
pub use property_definition::{
    CreatePropertyDefinitionInput, InMemoryPropertyDefinitionStore, PropertyDefinition,
    PropertyDefinitionService, PropertyDefinitionStore, UpdatePropertyDefinitionInput,
};
pub use property_value::{
    InMemoryPropertyValueStore, PropertyValue, PropertyValueService, PropertyValueStore,
    ValueWrite,
};
pub use rule::{
    AccessRule, ActionConfig, CreateRuleInput, InMemoryRuleStore, RuleFilter, RuleService,
    RuleStore, UpdateRuleInput,
};
pub use sync::{SyncRecord, SyncService};

/// Storage backends for every catalog plus the audit recorder.
#[derive(Clone)]
pub struct Backends {
    pub entity_definitions: Arc<dyn EntityDefinitionStore>,
    pub property_definitions: Arc<dyn PropertyDefinitionStore>,
    pub entity_instances: Arc<dyn EntityInstanceStore>,
    pub property_values: Arc<dyn PropertyValueStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub rules: Arc<dyn RuleStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Backends {
    /// Fresh in-memory stores sharing the given audit recorder.
    #[must_use]
    pub fn in_memory(audit: Arc<dyn AuditStore>) -> Self {
        Self {
            entity_definitions: Arc::new(InMemoryEntityDefinitionStore::new()),
            property_definitions: Arc::new(InMemoryPropertyDefinitionStore::new()),
            entity_instances: Arc::new(InMemoryEntityInstanceStore::new()),
            property_values: Arc::new(InMemoryPropertyValueStore::new()),
            assignments: Arc::new(InMemoryAssignmentStore::new()),
            rules: Arc::new(InMemoryRuleStore::new()),
            audit,
        }
    }
}

/// External collaborators the services talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub integrations: Arc<dyn IntegrationRegistry>,
    pub events: Arc<dyn EventSink>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

/// A fully wired set of services.
pub struct GovernanceServices {
    pub entity_definitions: Arc<EntityDefinitionService>,
    pub property_definitions: Arc<PropertyDefinitionService>,
    pub entity_instances: Arc<EntityInstanceService>,
    pub property_values: Arc<PropertyValueService>,
    pub assignments: Arc<AssignmentService>,
    pub rules: Arc<RuleService>,
    pub engine: Arc<RuleEngine>,
    pub sync: Arc<SyncService>,
}

impl GovernanceServices {
    /// Wire every service over the given backends.
    pub fn new(backends: Backends, collaborators: Collaborators, config: GovernanceConfig) -> Self {
        let Backends {
            entity_definitions,
            property_definitions,
            entity_instances,
            property_values,
            assignments,
            rules,
            audit,
        } = backends;
        let Collaborators {
            integrations,
            events,
            notifier,
        } = collaborators;
        let retry = config.retry_policy();

        let definition_service = Arc::new(EntityDefinitionService::new(
            entity_definitions.clone(),
            entity_instances.clone(),
            integrations.clone(),
            audit.clone(),
        ));
        let value_service = Arc::new(PropertyValueService::new(
            property_values,
            property_definitions.clone(),
            entity_instances.clone(),
            events.clone(),
            audit.clone(),
        ));
        let property_service = Arc::new(PropertyDefinitionService::new(
            property_definitions.clone(),
            entity_definitions.clone(),
            entity_instances.clone(),
            value_service.clone(),
            audit.clone(),
            config.clone(),
        ));
        let instance_service = Arc::new(EntityInstanceService::new(
            entity_instances.clone(),
            entity_definitions.clone(),
            value_service.clone(),
            assignments.clone(),
            events,
            audit.clone(),
        ));
        let assignment_service = Arc::new(
            AssignmentService::new(
                assignments.clone(),
                entity_instances,
                integrations.clone(),
                audit.clone(),
                retry,
            )
            .with_instance_gate(value_service.instance_gate()),
        );
        let rule_service = Arc::new(RuleService::new(
            rules,
            assignments,
            integrations,
            audit.clone(),
            retry,
        ));
        let engine = Arc::new(RuleEngine::new(
            rule_service.clone(),
            entity_definitions.clone(),
            instance_service.clone(),
            value_service.clone(),
            assignment_service.clone(),
            notifier,
            audit.clone(),
            config,
        ));
        let sync = Arc::new(SyncService::new(
            entity_definitions,
            property_definitions,
            instance_service.clone(),
            value_service.clone(),
            audit,
        ));

        Self {
            entity_definitions: definition_service,
            property_definitions: property_service,
            entity_instances: instance_service,
            property_values: value_service,
            assignments: assignment_service,
            rules: rule_service,
            engine,
            sync,
        }
    }
}
