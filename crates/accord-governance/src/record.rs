//! Cross-cutting record metadata: soft delete, audit stamps and the
//! optimistic-concurrency version token.
//!
//! Every stored entity embeds a [`RecordMeta`] and implements [`Versioned`];
//! in-memory stores write through [`compare_and_swap`] so a stale writer is
//! always rejected with [`GovernanceError::VersionMismatch`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GovernanceError, Result};
use crate::types::Actor;

/// Metadata embedded in every entity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// When created.
    pub created_at: DateTime<Utc>,
    /// Who created the record.
    pub created_by: Actor,
    /// When last modified.
    pub modified_at: DateTime<Utc>,
    /// Who last modified the record.
    pub modified_by: Actor,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// When soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Who soft-deleted the record.
    pub deleted_by: Option<Actor>,
    /// Optimistic-concurrency token, incremented on every write.
    pub version: u64,
}

impl RecordMeta {
    /// Metadata for a record created now by `actor`.
    #[must_use]
    pub fn new(actor: Actor) -> Self {
        Self::new_at(actor, Utc::now())
    }

    /// Metadata for a record created at `at` by `actor`.
    #[must_use]
    pub fn new_at(actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            created_by: actor,
            modified_at: at,
            modified_by: actor,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            version: 1,
        }
    }

    /// Stamp a modification and bump the version.
    pub fn touch(&mut self, actor: Actor) {
        self.modified_at = Utc::now();
        self.modified_by = actor;
        self.version += 1;
    }

    /// Set the soft-delete stamps. The version is bumped by the write that
    /// persists the change.
    pub fn mark_deleted(&mut self, actor: Actor) {
        self.is_deleted = true;
        self.deleted_at = Some(Utc::now());
        self.deleted_by = Some(actor);
    }

    /// Whether the record has not been soft-deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

/// An entity carrying [`RecordMeta`].
pub trait Versioned {
    /// Entity name used in error messages.
    const ENTITY: &'static str;

    /// Embedded metadata.
    fn meta(&self) -> &RecordMeta;

    /// Mutable embedded metadata.
    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Identifier rendered for error messages.
    fn record_id(&self) -> String;
}

/// Reject a write when `expected` does not match the stored version.
pub fn check_version<T: Versioned>(current: &T, expected: u64) -> Result<()> {
    let actual = current.meta().version;
    if actual == expected {
        Ok(())
    } else {
        Err(GovernanceError::VersionMismatch {
            entity: T::ENTITY,
            id: current.record_id(),
            expected,
            actual,
        })
    }
}

/// The single compare-and-swap write path shared by the in-memory stores.
///
/// Looks up `key`, verifies `expected_version`, applies `mutate` to a copy,
/// stamps the modification, and only then replaces the stored row. A failing
/// `mutate` leaves the stored row untouched.
pub fn compare_and_swap<K, T, F>(
    rows: &mut HashMap<K, T>,
    key: &K,
    expected_version: u64,
    actor: Actor,
    mutate: F,
) -> Result<T>
where
    K: Eq + Hash + std::fmt::Display,
    T: Versioned + Clone,
    F: FnOnce(&mut T) -> Result<()>,
{
    let current = rows
        .get(key)
        .filter(|row| row.meta().is_live())
        .ok_or_else(|| GovernanceError::not_found(T::ENTITY, key))?;
    check_version(current, expected_version)?;

    let mut next = current.clone();
    mutate(&mut next)?;
    next.meta_mut().touch(actor);
    if let Some(slot) = rows.get_mut(key) {
        *slot = next.clone();
    }
    Ok(next)
}

/// Replace the row at `key` with `next`, a modified copy of the stored row.
///
/// The stored version is kept authoritative: `next` only contributes its
/// fields, and the version is bumped once by [`compare_and_swap`].
pub fn replace_checked<K, T>(
    rows: &mut HashMap<K, T>,
    key: &K,
    next: T,
    expected_version: u64,
    actor: Actor,
) -> Result<T>
where
    K: Eq + Hash + std::fmt::Display,
    T: Versioned + Clone,
{
    compare_and_swap(rows, key, expected_version, actor, |row| {
        let version = row.meta().version;
        *row = next;
        row.meta_mut().version = version;
        Ok(())
    })
}

/// Bounded retry policy for lost optimistic-concurrency races.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last `VersionMismatch` is surfaced as-is.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %err, "Retrying after version conflict");
                tokio::time::sleep(policy.backoff).await;
            }
            other => return other,
        }
    }
}
