//! Type definitions for the governance domain.
//!
//! Includes newtype wrappers for IDs, the acting principal, and enums for
//! domain values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::GovernanceError;

// ============================================================================
// ID Types (Newtype Pattern)
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the inner UUID.
            #[must_use]
            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of an external integration system (source or target).
    IntegrationSystemId
);
define_id!(
    /// Identifier of an entity definition.
    EntityDefinitionId
);
define_id!(
    /// Identifier of a property definition.
    PropertyDefinitionId
);
define_id!(
    /// Identifier of an entity instance.
    EntityInstanceId
);
define_id!(
    /// Identifier of a single property value row.
    PropertyValueId
);
define_id!(
    /// Identifier of an access assignment.
    AssignmentId
);
define_id!(
    /// Identifier of an access rule.
    RuleId
);
define_id!(
    /// Correlates every record produced by one request or rule cycle.
    CorrelationId
);

// ============================================================================
// Actor
// ============================================================================

/// The principal a mutation is attributed to.
///
/// Passed explicitly into every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// An administrator or API caller.
    User(Uuid),
    /// The platform itself (synchronization, scheduled jobs).
    #[default]
    System,
    /// An access rule acting during an evaluation cycle.
    Rule(RuleId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::System => write!(f, "system"),
            Self::Rule(id) => write!(f, "rule:{id}"),
        }
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Synchronization status of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not yet synchronized.
    #[default]
    Pending,
    /// A synchronization run is processing this record.
    InProgress,
    /// Last synchronization succeeded.
    Success,
    /// Last synchronization failed.
    Failed,
    /// Synchronization was cancelled.
    Cancelled,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The event kind that causes a rule to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// An attribute value was set or expired.
    PropertyChange,
    /// An entity instance was created.
    NewEntity,
    /// An entity instance was updated.
    EntityUpdate,
    /// An entity instance was retired.
    EntityDelete,
    /// A scheduled tick.
    Schedule,
    /// An explicit manual invocation.
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PropertyChange => write!(f, "property_change"),
            Self::NewEntity => write!(f, "new_entity"),
            Self::EntityUpdate => write!(f, "entity_update"),
            Self::EntityDelete => write!(f, "entity_delete"),
            Self::Schedule => write!(f, "schedule"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "property_change" => Ok(Self::PropertyChange),
            "new_entity" => Ok(Self::NewEntity),
            "entity_update" => Ok(Self::EntityUpdate),
            "entity_delete" => Ok(Self::EntityDelete),
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            other => Err(GovernanceError::Validation(format!(
                "Unknown trigger type '{other}'"
            ))),
        }
    }
}

/// The effect a rule applies once matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Grant a role in a target system.
    AssignRole,
    /// Revoke a role in a target system.
    RemoveRole,
    /// Set an attribute value.
    UpdateProperty,
    /// Create an entity instance.
    CreateEntity,
    /// Retire an entity instance.
    DeleteEntity,
    /// Request a notification.
    SendNotification,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AssignRole => write!(f, "assign_role"),
            Self::RemoveRole => write!(f, "remove_role"),
            Self::UpdateProperty => write!(f, "update_property"),
            Self::CreateEntity => write!(f, "create_entity"),
            Self::DeleteEntity => write!(f, "delete_entity"),
            Self::SendNotification => write!(f, "send_notification"),
        }
    }
}

/// How an access assignment came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    /// Granted directly by an administrator.
    #[default]
    Direct,
    /// Inherited through another grant.
    Inherited,
    /// Produced by an access rule.
    Automatic,
    /// Time-boxed grant; requires an end of validity.
    Temporary,
}

impl fmt::Display for AssignmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Inherited => write!(f, "inherited"),
            Self::Automatic => write!(f, "automatic"),
            Self::Temporary => write!(f, "temporary"),
        }
    }
}
