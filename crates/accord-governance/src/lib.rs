//! Attribute governance domain logic.
//!
//! This crate provides a schema-less attribute store for identities and
//! roles pulled from external systems, a temporal ledger of access
//! assignments, and a rule engine that turns attribute changes into access
//! decisions.
//!
//! # Features
//!
//! - Entity and property definitions per integration system
//! - Typed, validated, time-versioned property values
//! - Access assignments with effective windows and single-active-grant
//!   enforcement per (user, role, target system)
//! - Access rules with a small condition language and priority-ordered
//!   conflict resolution
//! - Batch synchronization ingestion with per-run accounting
//! - Audit logging for every change
//!
//! # Services
//!
//! The [`services`] module provides business logic for:
//! - [`services::EntityDefinitionService`] - Entity type catalog
//! - [`services::PropertyDefinitionService`] - Attribute schema per entity type
//! - [`services::EntityInstanceService`] - Concrete records
//! - [`services::PropertyValueService`] - Temporal attribute values
//! - [`services::AssignmentService`] - Access grants
//! - [`services::RuleService`] - Access rule catalog
//! - [`services::RuleEngine`] - Rule evaluation cycles
//! - [`services::SyncService`] - Source system ingestion
//!
//! # Audit
//!
//! The [`audit`] module provides the recorder:
//! - [`audit::AuditStore`] trait for pluggable storage backends
//! - [`audit::InMemoryAuditStore`] for testing

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod expression;
pub mod integration;
pub mod locks;
pub mod notify;
pub mod record;
pub mod services;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use config::{ConfigError, GovernanceConfig};
pub use error::{ErrorKind, FieldError, GovernanceError, Result};
pub use record::{RecordMeta, RetryPolicy, Versioned};
pub use types::{
    ActionType, Actor, AssignmentId, AssignmentType, CorrelationId, EntityDefinitionId,
    EntityInstanceId, IntegrationSystemId, PropertyDefinitionId, PropertyValueId, RuleId,
    SyncStatus, TriggerType,
};
pub use value::{AttributeValue, DataType, ValidationRule};

// Re-export service types
pub use services::{
    AccessAssignment, AccessRule, ActionConfig, AssignmentService, AssignmentTriple, Backends,
    Collaborators, CycleReport, EntityDefinition, EntityDefinitionService, EntityInstance,
    EntityInstanceService, GovernanceServices, PropertyDefinition, PropertyDefinitionService,
    PropertyValue, PropertyValueService, RuleEngine, RuleOutcomeStatus, RuleService, SyncRecord,
    SyncService,
};
