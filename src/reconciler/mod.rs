//! Reconcilers - converge observed remote state toward declared state
//!
//! Each managed entity kind implements [`Reconciler`]. A reconciler holds no
//! client: the remote API is passed into every call, and the caller owns the
//! desired and observed records.
//!
//! ```text
//! Absent ──create──▶ Present ──update──▶ Present ──delete──▶ Absent
//!                      │  ▲
//!                      └──┘ read
//! ```

pub mod lookup;
pub mod sdc;
pub mod sdc_volume_mapping;
pub mod snapshot;
pub mod storage_pool;
pub mod volume;

pub use sdc::*;
pub use sdc_volume_mapping::*;
pub use snapshot::*;
pub use storage_pool::*;
pub use volume::*;

use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

// =============================================================================
// Entity State
// =============================================================================

/// Lifecycle state of a managed entity during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Absent,
    Creating,
    Present,
    Reading,
    Updating,
    Deleting,
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityState::Absent => write!(f, "absent"),
            EntityState::Creating => write!(f, "creating"),
            EntityState::Present => write!(f, "present"),
            EntityState::Reading => write!(f, "reading"),
            EntityState::Updating => write!(f, "updating"),
            EntityState::Deleting => write!(f, "deleting"),
        }
    }
}

pub(crate) fn transition(kind: &str, target: &str, from: EntityState, to: EntityState) {
    debug!("{} {}: {} -> {}", kind, target, from, to);
}

// =============================================================================
// Update Reporting
// =============================================================================

/// A single mutation call that failed during an update
#[derive(Debug)]
pub struct MutationFailure {
    pub mutation: &'static str,
    pub error: Error,
}

impl std::fmt::Display for MutationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.mutation, self.error)
    }
}

/// Outcome of an update: the re-read state plus any mutation failures
#[derive(Debug)]
pub struct UpdateReport<O> {
    /// State read back after the mutations, whether or not they all succeeded
    pub observed: O,
    /// Mutations that were applied successfully, in order
    pub applied: Vec<&'static str>,
    pub failures: Vec<MutationFailure>,
}

impl<O> UpdateReport<O> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into a plain result, turning any failure into [`Error::PartialUpdate`]
    pub fn into_result(self, kind: &str, id: &str) -> Result<O> {
        if self.failures.is_empty() {
            return Ok(self.observed);
        }
        Err(Error::PartialUpdate {
            kind: kind.to_string(),
            id: id.to_string(),
            applied: self.applied.iter().map(ToString::to_string).collect(),
            failures: self.failures.iter().map(ToString::to_string).collect(),
        })
    }

    /// Build the report from the re-read that follows the mutations
    ///
    /// Once any mutation has been attempted, a failed re-read is reported as
    /// [`Error::PartialUpdate`] carrying every mutation outcome and the read error.
    pub(crate) fn assemble(
        kind: &str,
        id: &str,
        refreshed: Result<O>,
        applied: Vec<&'static str>,
        failures: Vec<MutationFailure>,
    ) -> Result<Self> {
        match refreshed {
            Ok(observed) => Ok(Self {
                observed,
                applied,
                failures,
            }),
            Err(error) if applied.is_empty() && failures.is_empty() => Err(error),
            Err(error) => {
                warn!("{} {}: re-read after update failed: {}", kind, id, error);
                let mut reported: Vec<String> = failures.iter().map(ToString::to_string).collect();
                reported.push(format!("re-read: {error}"));
                Err(Error::PartialUpdate {
                    kind: kind.to_string(),
                    id: id.to_string(),
                    applied: applied.iter().map(ToString::to_string).collect(),
                    failures: reported,
                })
            }
        }
    }
}

/// A remote mutation computed from a delta
pub trait Mutation: std::fmt::Debug + Send + Sync {
    /// Name of the mutation endpoint, used in logs and failure reports
    fn name(&self) -> &'static str;
}

// =============================================================================
// Reconciler Port
// =============================================================================

/// CRUD and import over one entity kind
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Send + Sync;

    /// Remote entity kind, used in errors and logs
    const KIND: &'static str;

    /// Check a desired state without touching the remote system
    fn validate(&self, desired: &Self::Desired) -> Result<()>;

    /// Bring an absent entity into existence and read it back
    async fn create(&self, api: &dyn ClusterApi, desired: &Self::Desired) -> Result<Self::Observed>;

    /// Refresh the observed state; `None` when the entity no longer exists
    async fn read(
        &self,
        api: &dyn ClusterApi,
        observed: &Self::Observed,
    ) -> Result<Option<Self::Observed>>;

    /// Apply the delta between desired and observed state
    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<UpdateReport<Self::Observed>>;

    /// Remove the entity; an already absent entity is not an error
    async fn delete(&self, api: &dyn ClusterApi, observed: &Self::Observed) -> Result<()>;

    /// Start tracking an existing entity by its id
    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<Self::Observed>;
}

/// Map a remote not-found into `None`
pub(crate) fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Treat a remote not-found as success
pub(crate) fn absent_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotFound { .. }) => Ok(()),
        other => other,
    }
}
