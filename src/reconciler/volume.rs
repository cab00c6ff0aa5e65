//! Volume Reconciler
//!
//! Manages block volumes inside a storage pool. Sizes are declared in GB or
//! TB and must fall on the 8 GB allocation granularity.

use super::lookup::{reference_matches, resolve_protection_domain, resolve_storage_pool};
use super::{absent_ok, found, transition, EntityState, Mutation, MutationFailure, Reconciler, UpdateReport};
use crate::domain::ports::{
    AccessMode, ClusterApi, CompressionMethod, MappedSdcInfo, ProtectionDomain, RemoveMode,
    StoragePool, Volume, VolumeParams, VolumeType, FINE_GRANULARITY_LAYOUT,
};
use crate::domain::units::{self, CapacityUnit};
use crate::domain::Reference;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Desired / Observed
// =============================================================================

/// Declared configuration of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDesired {
    pub name: String,
    pub protection_domain: Reference,
    pub storage_pool: Reference,
    pub size: u64,
    #[serde(default)]
    pub capacity_unit: CapacityUnit,
    #[serde(default)]
    pub volume_type: VolumeType,
    #[serde(default)]
    pub use_rm_cache: bool,
    #[serde(default)]
    pub compression_method: Option<CompressionMethod>,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub remove_mode: RemoveMode,
}

impl VolumeDesired {
    /// A thin, read-write volume with no cache or compression
    pub fn new(
        name: impl Into<String>,
        protection_domain: Reference,
        storage_pool: Reference,
        size: u64,
        capacity_unit: CapacityUnit,
    ) -> Self {
        Self {
            name: name.into(),
            protection_domain,
            storage_pool,
            size,
            capacity_unit,
            volume_type: VolumeType::default(),
            use_rm_cache: false,
            compression_method: None,
            access_mode: AccessMode::default(),
            remove_mode: RemoveMode::default(),
        }
    }

    /// Declared size in KiB
    pub fn size_in_kb(&self) -> Result<u64> {
        units::volume_size_kb(self.size, self.capacity_unit)
    }
}

/// Last known state of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeObserved {
    pub id: String,
    pub name: String,
    pub protection_domain_id: String,
    pub protection_domain_name: String,
    pub storage_pool_id: String,
    pub storage_pool_name: String,
    /// Size in `capacity_unit`
    pub size: u64,
    pub capacity_unit: CapacityUnit,
    pub size_in_kb: u64,
    pub volume_type: VolumeType,
    pub use_rm_cache: bool,
    pub compression_method: Option<CompressionMethod>,
    pub access_mode: AccessMode,
    pub data_layout: Option<String>,
    pub vtree_id: String,
    pub creation_time: i64,
    pub mapped_sdcs: Vec<MappedSdcInfo>,
    pub remove_mode: RemoveMode,
    pub last_updated: DateTime<Utc>,
}

/// Attributes that only exist locally and are carried from one observation to the next
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LocalAttrs {
    capacity_unit: CapacityUnit,
    remove_mode: RemoveMode,
}

// =============================================================================
// Attribute Mapper
// =============================================================================

/// Map a remote volume and its placement to observed state
pub fn volume_to_observed(
    volume: Volume,
    pool: &StoragePool,
    domain: &ProtectionDomain,
    capacity_unit: CapacityUnit,
    remove_mode: RemoveMode,
) -> VolumeObserved {
    let (size, capacity_unit) = units::observed_size(volume.size_in_kb, capacity_unit);
    VolumeObserved {
        size,
        capacity_unit,
        size_in_kb: volume.size_in_kb,
        id: volume.id,
        name: volume.name,
        protection_domain_id: domain.id.clone(),
        protection_domain_name: domain.name.clone(),
        storage_pool_id: pool.id.clone(),
        storage_pool_name: pool.name.clone(),
        volume_type: volume.volume_type,
        use_rm_cache: volume.use_rm_cache,
        compression_method: volume.compression_method,
        access_mode: volume.access_mode_limit,
        data_layout: volume.data_layout,
        vtree_id: volume.vtree_id,
        creation_time: volume.creation_time,
        mapped_sdcs: volume.mapped_sdc_info,
        remove_mode,
        last_updated: Utc::now(),
    }
}

/// Build create parameters from a desired state and its resolved placement
pub fn volume_to_params(
    desired: &VolumeDesired,
    protection_domain_id: &str,
    storage_pool_id: &str,
) -> Result<VolumeParams> {
    Ok(VolumeParams {
        name: desired.name.clone(),
        protection_domain_id: protection_domain_id.to_string(),
        storage_pool_id: storage_pool_id.to_string(),
        volume_size_in_kb: desired.size_in_kb()?,
        volume_type: desired.volume_type,
        use_rm_cache: desired.use_rm_cache,
        compression_method: desired.compression_method,
    })
}

// =============================================================================
// Delta
// =============================================================================

/// Mutation calls that converge a volume, in application order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMutation {
    Rename(String),
    Resize { size_gb: u64 },
    RmCache(bool),
    Compression(CompressionMethod),
    AccessMode(AccessMode),
}

impl Mutation for VolumeMutation {
    fn name(&self) -> &'static str {
        match self {
            VolumeMutation::Rename(_) => "set_volume_name",
            VolumeMutation::Resize { .. } => "set_volume_size",
            VolumeMutation::RmCache(_) => "set_volume_rm_cache",
            VolumeMutation::Compression(_) => "set_volume_compression",
            VolumeMutation::AccessMode(_) => "set_volume_access_mode",
        }
    }
}

/// Compute the mutations needed to move `observed` to `desired`
///
/// Changes the remote API cannot apply in place are rejected here, before
/// any call is made.
pub fn volume_delta(desired: &VolumeDesired, observed: &VolumeObserved) -> Result<Vec<VolumeMutation>> {
    if desired.volume_type != observed.volume_type {
        return Err(Error::validation(format!(
            "volume type cannot be changed after creation ({} -> {})",
            observed.volume_type, desired.volume_type
        )));
    }
    if !reference_matches(
        &desired.protection_domain,
        &observed.protection_domain_id,
        &observed.protection_domain_name,
    ) || !reference_matches(
        &desired.storage_pool,
        &observed.storage_pool_id,
        &observed.storage_pool_name,
    ) {
        return Err(Error::validation(format!(
            "volume {} cannot be moved to another storage pool",
            observed.id
        )));
    }

    let size_in_kb = desired.size_in_kb()?;
    if size_in_kb < observed.size_in_kb {
        return Err(Error::validation(format!(
            "volume {} cannot shrink from {} KB to {} KB",
            observed.id, observed.size_in_kb, size_in_kb
        )));
    }

    let mut mutations = Vec::new();
    if desired.name != observed.name {
        mutations.push(VolumeMutation::Rename(desired.name.clone()));
    }
    if size_in_kb != observed.size_in_kb {
        mutations.push(VolumeMutation::Resize {
            size_gb: units::kb_to_gb(size_in_kb),
        });
    }
    if desired.use_rm_cache != observed.use_rm_cache {
        mutations.push(VolumeMutation::RmCache(desired.use_rm_cache));
    }
    if let Some(method) = desired.compression_method {
        if observed.compression_method != Some(method) {
            mutations.push(VolumeMutation::Compression(method));
        }
    }
    if desired.access_mode != observed.access_mode {
        mutations.push(VolumeMutation::AccessMode(desired.access_mode));
    }
    Ok(mutations)
}

async fn apply(api: &dyn ClusterApi, id: &str, mutation: &VolumeMutation) -> Result<()> {
    match mutation {
        VolumeMutation::Rename(name) => api.set_volume_name(id, name).await,
        VolumeMutation::Resize { size_gb } => api.set_volume_size_gb(id, *size_gb).await,
        VolumeMutation::RmCache(enabled) => api.set_volume_rm_cache(id, *enabled).await,
        VolumeMutation::Compression(method) => api.set_volume_compression(id, *method).await,
        VolumeMutation::AccessMode(mode) => api.set_volume_access_mode(id, *mode).await,
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciler for volumes
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeReconciler;

impl VolumeReconciler {
    async fn fetch(&self, api: &dyn ClusterApi, id: &str, local: LocalAttrs) -> Result<VolumeObserved> {
        let volume = api.get_volume(id).await?;
        let pool = api.get_storage_pool(&volume.storage_pool_id).await?;
        let domain = api.get_protection_domain(&pool.protection_domain_id).await?;
        Ok(volume_to_observed(
            volume,
            &pool,
            &domain,
            local.capacity_unit,
            local.remove_mode,
        ))
    }
}

#[async_trait]
impl Reconciler for VolumeReconciler {
    type Desired = VolumeDesired;
    type Observed = VolumeObserved;

    const KIND: &'static str = "Volume";

    fn validate(&self, desired: &VolumeDesired) -> Result<()> {
        if desired.name.trim().is_empty() {
            return Err(Error::validation("volume name must not be empty"));
        }
        desired.protection_domain.validate("ProtectionDomain")?;
        desired.storage_pool.validate("StoragePool")?;
        desired.size_in_kb()?;
        Ok(())
    }

    async fn create(&self, api: &dyn ClusterApi, desired: &VolumeDesired) -> Result<VolumeObserved> {
        self.validate(desired)?;
        transition(Self::KIND, &desired.name, EntityState::Absent, EntityState::Creating);

        let domain = resolve_protection_domain(api, &desired.protection_domain).await?;
        let pool = resolve_storage_pool(api, &domain.id, &desired.storage_pool).await?;

        // The platform silently ignores compression on other layouts
        if desired.compression_method.is_some()
            && pool.data_layout.as_deref() != Some(FINE_GRANULARITY_LAYOUT)
        {
            return Err(Error::validation(format!(
                "compression may only be set on volumes in a {} storage pool; {} has layout {}",
                FINE_GRANULARITY_LAYOUT,
                pool.name,
                pool.data_layout.as_deref().unwrap_or("unknown")
            )));
        }

        let params = volume_to_params(desired, &domain.id, &pool.id)?;
        info!(
            "Creating volume {} ({} KB) in pool {}",
            params.name, params.volume_size_in_kb, pool.name
        );
        let id = api.create_volume(&params).await?;

        if desired.access_mode != AccessMode::ReadWrite {
            if let Err(e) = api.set_volume_access_mode(&id, desired.access_mode).await {
                warn!("Volume {} created but access mode could not be set: {}", id, e);
                return Err(e);
            }
        }

        let observed = self
            .fetch(
                api,
                &id,
                LocalAttrs {
                    capacity_unit: desired.capacity_unit,
                    remove_mode: desired.remove_mode,
                },
            )
            .await?;
        transition(Self::KIND, &id, EntityState::Creating, EntityState::Present);
        Ok(observed)
    }

    async fn read(&self, api: &dyn ClusterApi, observed: &VolumeObserved) -> Result<Option<VolumeObserved>> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Reading);
        let local = LocalAttrs {
            capacity_unit: observed.capacity_unit,
            remove_mode: observed.remove_mode,
        };
        let refreshed = found(self.fetch(api, &observed.id, local).await)?;
        if refreshed.is_none() {
            info!("Volume {} no longer exists", observed.id);
        }
        Ok(refreshed)
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &VolumeDesired,
        observed: &VolumeObserved,
    ) -> Result<UpdateReport<VolumeObserved>> {
        self.validate(desired)?;
        let mutations = volume_delta(desired, observed)?;
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Updating);

        let mut applied = Vec::new();
        let mut failures = Vec::new();
        for mutation in &mutations {
            info!("Volume {}: {:?}", observed.id, mutation);
            match apply(api, &observed.id, mutation).await {
                Ok(()) => applied.push(mutation.name()),
                Err(error) => {
                    warn!("Volume {}: {} failed: {}", observed.id, mutation.name(), error);
                    failures.push(MutationFailure {
                        mutation: mutation.name(),
                        error,
                    });
                }
            }
        }

        let local = LocalAttrs {
            capacity_unit: desired.capacity_unit,
            remove_mode: desired.remove_mode,
        };
        let refreshed = self.fetch(api, &observed.id, local).await;
        let report = UpdateReport::assemble(Self::KIND, &observed.id, refreshed, applied, failures)?;
        transition(Self::KIND, &observed.id, EntityState::Updating, EntityState::Present);
        Ok(report)
    }

    async fn delete(&self, api: &dyn ClusterApi, observed: &VolumeObserved) -> Result<()> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Deleting);
        info!("Removing volume {} ({:?})", observed.id, observed.remove_mode);
        absent_ok(api.delete_volume(&observed.id, observed.remove_mode).await)?;
        transition(Self::KIND, &observed.id, EntityState::Deleting, EntityState::Absent);
        Ok(())
    }

    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<VolumeObserved> {
        self.fetch(api, id, LocalAttrs::default()).await
    }
}
