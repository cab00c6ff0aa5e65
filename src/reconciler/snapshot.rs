//! Snapshot Reconciler
//!
//! Snapshots are volumes with an ancestor. They are created through the
//! system level `snapshotVolumes` action and afterwards mutated through the
//! same per-field endpoints as volumes, plus auto snapshot locking and secure
//! retention.

use super::lookup::{reference_matches, resolve_volume, system_id};
use super::{absent_ok, found, transition, EntityState, Mutation, MutationFailure, Reconciler, UpdateReport};
use crate::domain::ports::{AccessMode, ClusterApi, RemoveMode, SnapshotParams, Volume};
use crate::domain::units::{self, CapacityUnit, RetentionUnit};
use crate::domain::Reference;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn read_only() -> AccessMode {
    AccessMode::ReadOnly
}

/// Declared configuration of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDesired {
    pub name: String,
    /// Source volume
    pub volume: Reference,
    #[serde(default = "read_only")]
    pub access_mode: AccessMode,
    /// Grow the snapshot beyond the size of its source
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub capacity_unit: CapacityUnit,
    #[serde(default)]
    pub lock_auto_snapshot: bool,
    /// Secure retention period; once set it can only be extended
    #[serde(default)]
    pub desired_retention: Option<u64>,
    #[serde(default)]
    pub retention_unit: RetentionUnit,
    #[serde(default)]
    pub remove_mode: RemoveMode,
}

impl SnapshotDesired {
    pub fn new(name: impl Into<String>, volume: Reference) -> Self {
        Self {
            name: name.into(),
            volume,
            access_mode: read_only(),
            size: None,
            capacity_unit: CapacityUnit::default(),
            lock_auto_snapshot: false,
            desired_retention: None,
            retention_unit: RetentionUnit::default(),
            remove_mode: RemoveMode::default(),
        }
    }

    fn size_in_kb(&self) -> Result<Option<u64>> {
        self.size
            .map(|size| units::volume_size_kb(size, self.capacity_unit))
            .transpose()
    }

    fn retention_in_min(&self) -> Result<Option<u64>> {
        self.desired_retention
            .map(|value| units::retention_minutes(value, self.retention_unit))
            .transpose()
    }
}

/// Last known state of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotObserved {
    pub id: String,
    pub name: String,
    /// Source volume; `None` once the source has been removed
    pub volume_id: Option<String>,
    pub volume_name: Option<String>,
    pub access_mode: AccessMode,
    pub size: u64,
    pub capacity_unit: CapacityUnit,
    pub size_in_kb: u64,
    pub lock_auto_snapshot: bool,
    pub retention_in_min: Option<u64>,
    pub retention_unit: RetentionUnit,
    pub storage_pool_id: String,
    pub vtree_id: String,
    pub creation_time: i64,
    pub secure_snapshot_exp_time: i64,
    pub remove_mode: RemoveMode,
    pub last_updated: DateTime<Utc>,
}

/// Snapshot attributes held only locally, carried from one observation to the next
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotLocalAttrs {
    pub capacity_unit: CapacityUnit,
    pub retention_unit: RetentionUnit,
    pub remove_mode: RemoveMode,
}

impl From<&SnapshotDesired> for SnapshotLocalAttrs {
    fn from(desired: &SnapshotDesired) -> Self {
        Self {
            capacity_unit: desired.capacity_unit,
            retention_unit: desired.retention_unit,
            remove_mode: desired.remove_mode,
        }
    }
}

impl From<&SnapshotObserved> for SnapshotLocalAttrs {
    fn from(observed: &SnapshotObserved) -> Self {
        Self {
            capacity_unit: observed.capacity_unit,
            retention_unit: observed.retention_unit,
            remove_mode: observed.remove_mode,
        }
    }
}

/// Map a remote snapshot to observed state
pub fn snapshot_to_observed(
    snapshot: Volume,
    source: Option<&Volume>,
    local: &SnapshotLocalAttrs,
) -> Result<SnapshotObserved> {
    let (size, capacity_unit) = units::observed_size(snapshot.size_in_kb, local.capacity_unit);
    let retention_in_min =
        units::observed_retention_minutes(snapshot.secure_snapshot_exp_time, snapshot.creation_time)?;
    Ok(SnapshotObserved {
        size,
        capacity_unit,
        size_in_kb: snapshot.size_in_kb,
        retention_in_min,
        retention_unit: local.retention_unit,
        volume_id: snapshot.ancestor_volume_id,
        volume_name: source.map(|v| v.name.clone()),
        id: snapshot.id,
        name: snapshot.name,
        access_mode: snapshot.access_mode_limit,
        lock_auto_snapshot: snapshot.locked_auto_snapshot,
        storage_pool_id: snapshot.storage_pool_id,
        vtree_id: snapshot.vtree_id,
        creation_time: snapshot.creation_time,
        secure_snapshot_exp_time: snapshot.secure_snapshot_exp_time,
        remove_mode: local.remove_mode,
        last_updated: Utc::now(),
    })
}

pub fn snapshot_to_params(desired: &SnapshotDesired, volume_id: &str) -> Result<SnapshotParams> {
    Ok(SnapshotParams {
        volume_id: volume_id.to_string(),
        snapshot_name: desired.name.clone(),
        access_mode: desired.access_mode,
        retention_in_min: desired.retention_in_min()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotMutation {
    Rename(String),
    AccessMode(AccessMode),
    Resize { size_gb: u64 },
    AutoSnapshotLock(bool),
    Retention { minutes: u64 },
}

impl Mutation for SnapshotMutation {
    fn name(&self) -> &'static str {
        match self {
            SnapshotMutation::Rename(_) => "set_snapshot_name",
            SnapshotMutation::AccessMode(_) => "set_snapshot_access_mode",
            SnapshotMutation::Resize { .. } => "set_snapshot_size",
            SnapshotMutation::AutoSnapshotLock(_) => "set_auto_snapshot_lock",
            SnapshotMutation::Retention { .. } => "set_snapshot_retention",
        }
    }
}

pub fn snapshot_delta(desired: &SnapshotDesired, observed: &SnapshotObserved) -> Result<Vec<SnapshotMutation>> {
    if let (Some(volume_id), Some(volume_name)) = (&observed.volume_id, &observed.volume_name) {
        if !reference_matches(&desired.volume, volume_id, volume_name) {
            return Err(Error::validation(format!(
                "snapshot {} cannot change its source volume to {}",
                observed.id, desired.volume
            )));
        }
    }

    let mut mutations = Vec::new();
    if desired.name != observed.name {
        mutations.push(SnapshotMutation::Rename(desired.name.clone()));
    }
    if desired.access_mode != observed.access_mode {
        mutations.push(SnapshotMutation::AccessMode(desired.access_mode));
    }
    if let Some(size_in_kb) = desired.size_in_kb()? {
        if size_in_kb < observed.size_in_kb {
            return Err(Error::validation(format!(
                "snapshot {} cannot shrink from {} KB to {} KB",
                observed.id, observed.size_in_kb, size_in_kb
            )));
        }
        if size_in_kb > observed.size_in_kb {
            mutations.push(SnapshotMutation::Resize {
                size_gb: units::kb_to_gb(size_in_kb),
            });
        }
    }
    if desired.lock_auto_snapshot != observed.lock_auto_snapshot {
        mutations.push(SnapshotMutation::AutoSnapshotLock(desired.lock_auto_snapshot));
    }
    if let Some(minutes) = desired.retention_in_min()? {
        if observed.retention_in_min != Some(minutes) {
            mutations.push(SnapshotMutation::Retention { minutes });
        }
    }
    Ok(mutations)
}

async fn apply(api: &dyn ClusterApi, id: &str, mutation: &SnapshotMutation) -> Result<()> {
    match mutation {
        SnapshotMutation::Rename(name) => api.set_volume_name(id, name).await,
        SnapshotMutation::AccessMode(mode) => api.set_volume_access_mode(id, *mode).await,
        SnapshotMutation::Resize { size_gb } => api.set_volume_size_gb(id, *size_gb).await,
        SnapshotMutation::AutoSnapshotLock(locked) => api.set_auto_snapshot_lock(id, *locked).await,
        SnapshotMutation::Retention { minutes } => api.set_snapshot_retention(id, *minutes).await,
    }
}

/// Reconciler for snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotReconciler;

impl SnapshotReconciler {
    async fn fetch(&self, api: &dyn ClusterApi, id: &str, local: SnapshotLocalAttrs) -> Result<SnapshotObserved> {
        let snapshot = api.get_volume(id).await?;
        let source = match &snapshot.ancestor_volume_id {
            Some(source_id) => found(api.get_volume(source_id).await)?,
            None => None,
        };
        snapshot_to_observed(snapshot, source.as_ref(), &local)
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    type Desired = SnapshotDesired;
    type Observed = SnapshotObserved;

    const KIND: &'static str = "Snapshot";

    fn validate(&self, desired: &SnapshotDesired) -> Result<()> {
        if desired.name.trim().is_empty() {
            return Err(Error::validation("snapshot name must not be empty"));
        }
        desired.volume.validate("Volume")?;
        desired.size_in_kb()?;
        desired.retention_in_min()?;
        Ok(())
    }

    async fn create(&self, api: &dyn ClusterApi, desired: &SnapshotDesired) -> Result<SnapshotObserved> {
        self.validate(desired)?;
        transition(Self::KIND, &desired.name, EntityState::Absent, EntityState::Creating);

        let source = resolve_volume(api, &desired.volume).await?;
        if let Some(size_in_kb) = desired.size_in_kb()? {
            if size_in_kb < source.size_in_kb {
                return Err(Error::validation(format!(
                    "snapshot size {} KB is smaller than source volume {} ({} KB)",
                    size_in_kb, source.name, source.size_in_kb
                )));
            }
        }

        let system = system_id(api).await?;
        let params = snapshot_to_params(desired, &source.id)?;
        info!("Snapshotting volume {} as {}", source.name, params.snapshot_name);
        let id = api.snapshot_volume(&system, &params).await?;

        if let Some(size_in_kb) = desired.size_in_kb()? {
            if size_in_kb > source.size_in_kb {
                if let Err(e) = api.set_volume_size_gb(&id, units::kb_to_gb(size_in_kb)).await {
                    warn!("Snapshot {} created but could not be resized: {}", id, e);
                    return Err(e);
                }
            }
        }
        if desired.lock_auto_snapshot {
            if let Err(e) = api.set_auto_snapshot_lock(&id, true).await {
                warn!("Snapshot {} created but could not be locked: {}", id, e);
                return Err(e);
            }
        }

        let observed = self.fetch(api, &id, desired.into()).await?;
        transition(Self::KIND, &id, EntityState::Creating, EntityState::Present);
        Ok(observed)
    }

    async fn read(&self, api: &dyn ClusterApi, observed: &SnapshotObserved) -> Result<Option<SnapshotObserved>> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Reading);
        found(self.fetch(api, &observed.id, observed.into()).await)
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &SnapshotDesired,
        observed: &SnapshotObserved,
    ) -> Result<UpdateReport<SnapshotObserved>> {
        self.validate(desired)?;
        let mutations = snapshot_delta(desired, observed)?;
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Updating);

        let mut applied = Vec::new();
        let mut failures = Vec::new();
        for mutation in &mutations {
            info!("Snapshot {}: {:?}", observed.id, mutation);
            match apply(api, &observed.id, mutation).await {
                Ok(()) => applied.push(mutation.name()),
                Err(error) => {
                    warn!("Snapshot {}: {} failed: {}", observed.id, mutation.name(), error);
                    failures.push(MutationFailure {
                        mutation: mutation.name(),
                        error,
                    });
                }
            }
        }

        let refreshed = self.fetch(api, &observed.id, desired.into()).await;
        let report = UpdateReport::assemble(Self::KIND, &observed.id, refreshed, applied, failures)?;
        transition(Self::KIND, &observed.id, EntityState::Updating, EntityState::Present);
        Ok(report)
    }

    async fn delete(&self, api: &dyn ClusterApi, observed: &SnapshotObserved) -> Result<()> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Deleting);
        absent_ok(api.delete_volume(&observed.id, observed.remove_mode).await)?;
        transition(Self::KIND, &observed.id, EntityState::Deleting, EntityState::Absent);
        Ok(())
    }

    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<SnapshotObserved> {
        self.fetch(api, id, SnapshotLocalAttrs::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{VolumeApi, VolumeParams, VolumeType};
    use crate::backends::MemoryCluster;
    use assert_matches::assert_matches;

    async fn cluster_with_volume() -> (MemoryCluster, String) {
        let cluster = MemoryCluster::new();
        let pd = cluster.add_protection_domain("domain1");
        let pool = cluster.add_storage_pool(&pd, "pool1", "MediumGranularity");
        let volume = cluster
            .create_volume(&VolumeParams {
                name: "vol1".into(),
                protection_domain_id: pd,
                storage_pool_id: pool,
                volume_size_in_kb: 8 * units::GIB_IN_KB,
                volume_type: VolumeType::ThinProvisioned,
                use_rm_cache: false,
                compression_method: None,
            })
            .await
            .unwrap();
        cluster.reset_calls();
        (cluster, volume)
    }

    #[tokio::test]
    async fn test_create_defaults_to_read_only() {
        let (cluster, volume) = cluster_with_volume().await;
        let desired = SnapshotDesired::new("snap1", Reference::name("vol1"));

        let observed = SnapshotReconciler.create(&cluster, &desired).await.unwrap();
        assert_eq!(observed.volume_id.as_deref(), Some(volume.as_str()));
        assert_eq!(observed.volume_name.as_deref(), Some("vol1"));
        assert_eq!(observed.access_mode, AccessMode::ReadOnly);
        assert_eq!(observed.size, 8);
        assert_eq!(observed.retention_in_min, None);

        let read = SnapshotReconciler.read(&cluster, &observed).await.unwrap().unwrap();
        assert_eq!(read.id, observed.id);
    }

    #[tokio::test]
    async fn test_create_with_retention_size_and_lock() {
        let (cluster, _) = cluster_with_volume().await;
        let mut desired = SnapshotDesired::new("snap1", Reference::name("vol1"));
        desired.size = Some(16);
        desired.lock_auto_snapshot = true;
        desired.desired_retention = Some(2);
        desired.retention_unit = RetentionUnit::Days;

        let observed = SnapshotReconciler.create(&cluster, &desired).await.unwrap();
        assert_eq!(observed.size, 16);
        assert!(observed.lock_auto_snapshot);
        assert_eq!(observed.retention_in_min, Some(2 * 24 * 60));

        cluster.reset_calls();
        let report = SnapshotReconciler.update(&cluster, &desired, &observed).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_update_order() {
        let (cluster, _) = cluster_with_volume().await;
        let observed = SnapshotReconciler
            .create(&cluster, &SnapshotDesired::new("snap1", Reference::name("vol1")))
            .await
            .unwrap();

        let mut desired = SnapshotDesired::new("snap1-renamed", Reference::name("vol1"));
        desired.access_mode = AccessMode::ReadWrite;
        desired.size = Some(24);
        desired.lock_auto_snapshot = true;
        desired.desired_retention = Some(12);
        let report = SnapshotReconciler.update(&cluster, &desired, &observed).await.unwrap();

        assert_eq!(
            report.applied,
            vec![
                "set_snapshot_name",
                "set_snapshot_access_mode",
                "set_snapshot_size",
                "set_auto_snapshot_lock",
                "set_snapshot_retention",
            ]
        );
        assert_eq!(report.observed.retention_in_min, Some(12 * 60));
        assert_eq!(report.observed.size, 24);
    }

    #[tokio::test]
    async fn test_resize_outside_declared_unit_reads_back_in_gb() {
        let (cluster, _) = cluster_with_volume().await;
        let mut desired = SnapshotDesired::new("snap1", Reference::name("vol1"));
        desired.size = Some(1);
        desired.capacity_unit = CapacityUnit::TB;
        let observed = SnapshotReconciler.create(&cluster, &desired).await.unwrap();
        assert_eq!((observed.size, observed.capacity_unit), (1, CapacityUnit::TB));

        cluster.set_volume_size_gb(&observed.id, 1032).await.unwrap();

        let read = SnapshotReconciler.read(&cluster, &observed).await.unwrap().unwrap();
        assert_eq!((read.size, read.capacity_unit), (1032, CapacityUnit::GB));
        assert_eq!(read.size_in_kb, 1032 * units::GIB_IN_KB);
    }

    #[tokio::test]
    async fn test_failed_reread_still_reports_mutations() {
        let (cluster, _) = cluster_with_volume().await;
        let observed = SnapshotReconciler
            .create(&cluster, &SnapshotDesired::new("snap1", Reference::name("vol1")))
            .await
            .unwrap();
        cluster.fail_on("set_auto_snapshot_lock", "lock denied");
        cluster.fail_on("get_volume", "gateway busy");

        let mut desired = SnapshotDesired::new("snap1-renamed", Reference::name("vol1"));
        desired.lock_auto_snapshot = true;
        assert_matches!(
            SnapshotReconciler.update(&cluster, &desired, &observed).await,
            Err(Error::PartialUpdate { ref applied, ref failures, .. })
                if applied == &["set_snapshot_name"]
                    && failures.len() == 2
                    && failures[0].contains("lock denied")
        );
    }

    #[tokio::test]
    async fn test_source_is_immutable() {
        let (cluster, _) = cluster_with_volume().await;
        let observed = SnapshotReconciler
            .create(&cluster, &SnapshotDesired::new("snap1", Reference::name("vol1")))
            .await
            .unwrap();
        cluster.reset_calls();

        let desired = SnapshotDesired::new("snap1", Reference::name("vol2"));
        assert_matches!(
            SnapshotReconciler.update(&cluster, &desired, &observed).await,
            Err(Error::Validation(_))
        );
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_misaligned_size_rejected() {
        let (cluster, _) = cluster_with_volume().await;
        let mut desired = SnapshotDesired::new("snap1", Reference::name("vol1"));
        desired.size = Some(10);

        assert_matches!(
            SnapshotReconciler.create(&cluster, &desired).await,
            Err(Error::Validation(_))
        );
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_snapshot() {
        let (cluster, _) = cluster_with_volume().await;
        let observed = SnapshotReconciler
            .create(&cluster, &SnapshotDesired::new("snap1", Reference::name("vol1")))
            .await
            .unwrap();
        cluster.drop_volume(&observed.id);

        SnapshotReconciler.delete(&cluster, &observed).await.unwrap();
    }
}
