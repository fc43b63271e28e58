//! Integration System registry.
//!
//! Integration systems (the sources and targets the platform connects to)
//! are managed elsewhere; the governance core only validates references to
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GovernanceError, Result};
use crate::types::IntegrationSystemId;

/// A connected source or target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSystem {
    /// Identifier.
    pub id: IntegrationSystemId,
    /// Display name.
    pub name: String,
    /// Free-form system kind, e.g. `active_directory`.
    pub system_type: String,
    /// Whether the system is enabled.
    pub is_active: bool,
    /// Opaque connection and display metadata.
    pub metadata: serde_json::Value,
}

impl IntegrationSystem {
    /// Active system with empty metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, system_type: impl Into<String>) -> Self {
        Self {
            id: IntegrationSystemId::new(),
            name: name.into(),
            system_type: system_type.into(),
            is_active: true,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Lookup of integration systems.
#[async_trait::async_trait]
pub trait IntegrationRegistry: Send + Sync {
    /// Fetch a system by id.
    async fn get(&self, id: IntegrationSystemId) -> Result<Option<IntegrationSystem>>;
}

/// Resolve `id` or fail with `NotFound`.
pub async fn require_system(
    registry: &dyn IntegrationRegistry,
    id: IntegrationSystemId,
) -> Result<IntegrationSystem> {
    registry
        .get(id)
        .await?
        .ok_or_else(|| GovernanceError::not_found("IntegrationSystem", id))
}

/// In-memory registry for testing.
#[derive(Debug, Default)]
pub struct InMemoryIntegrationRegistry {
    systems: Arc<RwLock<HashMap<IntegrationSystemId, IntegrationSystem>>>,
}

impl InMemoryIntegrationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a system.
    pub async fn register(&self, system: IntegrationSystem) -> IntegrationSystemId {
        let id = system.id;
        self.systems.write().await.insert(id, system);
        id
    }
}

#[async_trait::async_trait]
impl IntegrationRegistry for InMemoryIntegrationRegistry {
    async fn get(&self, id: IntegrationSystemId) -> Result<Option<IntegrationSystem>> {
        Ok(self.systems.read().await.get(&id).cloned())
    }
}
