//! Common test utilities for accord-governance integration tests.
//!
//! All tests run against in-memory stores. [`TestContext`] keeps the
//! concrete stores next to the wired services so tests can inspect storage
//! directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Once};

use accord_governance::audit::InMemoryAuditStore;
use accord_governance::events::{ChangeEvent, ChangeKind, InMemoryEventSink};
use accord_governance::integration::{InMemoryIntegrationRegistry, IntegrationSystem};
use accord_governance::notify::InMemoryNotificationDispatcher;
use accord_governance::services::{
    AccessRule, ActionConfig, AssignmentTriple, Backends, Collaborators,
    CreateEntityDefinitionInput, CreateEntityInstanceInput, CreatePropertyDefinitionInput,
    CreateRuleInput, EntityInstance, GovernanceServices, InMemoryAssignmentStore,
    InMemoryEntityDefinitionStore, InMemoryEntityInstanceStore, InMemoryPropertyDefinitionStore,
    InMemoryPropertyValueStore, InMemoryRuleStore, PropertyDefinition,
};
use accord_governance::{
    Actor, AssignmentType, DataType, EntityDefinitionId, GovernanceConfig, IntegrationSystemId,
};
use serde_json::{json, Value as JsonValue};

static INIT: Once = Once::new();

/// Initialize logging for tests (once). Set `RUST_LOG` to see service logs.
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Concrete in-memory stores behind a [`TestContext`].
#[derive(Clone)]
pub struct TestStores {
    pub entity_definitions: Arc<InMemoryEntityDefinitionStore>,
    pub property_definitions: Arc<InMemoryPropertyDefinitionStore>,
    pub entity_instances: Arc<InMemoryEntityInstanceStore>,
    pub property_values: Arc<InMemoryPropertyValueStore>,
    pub assignments: Arc<InMemoryAssignmentStore>,
    pub rules: Arc<InMemoryRuleStore>,
    pub audit: Arc<InMemoryAuditStore>,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            entity_definitions: Arc::new(InMemoryEntityDefinitionStore::new()),
            property_definitions: Arc::new(InMemoryPropertyDefinitionStore::new()),
            entity_instances: Arc::new(InMemoryEntityInstanceStore::new()),
            property_values: Arc::new(InMemoryPropertyValueStore::new()),
            assignments: Arc::new(InMemoryAssignmentStore::new()),
            rules: Arc::new(InMemoryRuleStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
        }
    }

    fn backends(&self) -> Backends {
        Backends {
            entity_definitions: self.entity_definitions.clone(),
            property_definitions: self.property_definitions.clone(),
            entity_instances: self.entity_instances.clone(),
            property_values: self.property_values.clone(),
            assignments: self.assignments.clone(),
            rules: self.rules.clone(),
            audit: self.audit.clone(),
        }
    }
}

/// Services, stores and a small "Active Directory" catalog.
///
/// The catalog holds an `Employee` definition with a `Department` string
/// property and a `Role` definition with the roles `ITStaff` and `Admin`.
pub struct TestContext {
    pub stores: TestStores,
    pub services: GovernanceServices,
    pub registry: Arc<InMemoryIntegrationRegistry>,
    pub events: Arc<InMemoryEventSink>,
    pub notifications: Arc<InMemoryNotificationDispatcher>,
    pub system: IntegrationSystemId,
    pub employees: EntityDefinitionId,
    pub roles: EntityDefinitionId,
    pub department: PropertyDefinition,
    pub it_staff: EntityInstance,
    pub admin: EntityInstance,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(GovernanceConfig::default()).await
    }

    pub async fn with_config(config: GovernanceConfig) -> Self {
        init_test_logging();
        let stores = TestStores::new();
        let registry = Arc::new(InMemoryIntegrationRegistry::new());
        let system = registry
            .register(IntegrationSystem::new("Active Directory", "active_directory"))
            .await;
        let events = Arc::new(InMemoryEventSink::new());
        let notifications = Arc::new(InMemoryNotificationDispatcher::new());
        let services = GovernanceServices::new(
            stores.backends(),
            Collaborators {
                integrations: registry.clone(),
                events: events.clone(),
                notifier: notifications.clone(),
            },
            config,
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
            .expect("Failed to create Employee definition");
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
            .expect("Failed to create Role definition");
        let department = services
            .property_definitions
            .create(
                CreatePropertyDefinitionInput::new(employees.id, "Department", DataType::String),
                Actor::System,
                None,
            )
            .await
            .expect("Failed to create Department property");

        let mut role_instances = Vec::new();
        for external_id in ["ITStaff", "Admin"] {
            let role = services
                .entity_instances
                .create_instance(
                    CreateEntityInstanceInput {
                        entity_definition_id: roles.id,
                        external_id: external_id.into(),
                        ..Default::default()
                    },
                    Actor::System,
                    None,
                )
                .await
                .expect("Failed to create role instance");
            role_instances.push(role);
        }
        let admin = role_instances.pop().expect("two roles were created");
        let it_staff = role_instances.pop().expect("two roles were created");
        events.drain().await;

        Self {
            stores,
            services,
            registry,
            events,
            notifications,
            system,
            employees: employees.id,
            roles: roles.id,
            department,
            it_staff,
            admin,
        }
    }

    /// Create an employee with a department.
    pub async fn employee(&self, external_id: &str, department: &str) -> EntityInstance {
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
            .expect("Failed to create employee")
    }

    pub async fn rule(&self, input: CreateRuleInput) -> AccessRule {
        self.services
            .rules
            .create(input, Actor::System, None)
            .await
            .expect("Failed to create rule")
    }

    pub fn assign(&self, role: &EntityInstance) -> ActionConfig {
        ActionConfig::AssignRole {
            role_id: role.id,
            target_system_id: self.system,
            assignment_type: AssignmentType::Automatic,
            user_id: None,
            valid_for_days: None,
        }
    }

    pub fn remove(&self, role: &EntityInstance) -> ActionConfig {
        ActionConfig::RemoveRole {
            role_id: role.id,
            target_system_id: self.system,
            user_id: None,
        }
    }

    pub fn triple(&self, user: &EntityInstance, role: &EntityInstance) -> AssignmentTriple {
        AssignmentTriple::new(user.id, role.id, self.system)
    }

    /// Number of live, active assignments of a triple.
    pub async fn active(&self, user: &EntityInstance, role: &EntityInstance) -> usize {
        self.stores
            .assignments
            .active_count(self.triple(user, role))
            .await
    }

    /// Drain published events, keeping those of one kind.
    pub async fn drain_kind(&self, kind: fn(&ChangeKind) -> bool) -> Vec<ChangeEvent> {
        self.events
            .drain()
            .await
            .into_iter()
            .filter(|e| kind(&e.kind))
            .collect()
    }
}

/// A payload with the given department code.
pub fn payload(department: &str) -> JsonValue {
    json!({ "Department": department })
}
