//! SDC Volume Mapping Reconciler
//!
//! Owns the set of volumes mapped to one SDC, with per-volume access mode and
//! IOPS / bandwidth limits. An access mode change is applied as unmap and
//! remap, since a mapping's mode cannot be altered in place.

use super::lookup::{resolve_sdc, resolve_volume};
use super::{absent_ok, found, transition, EntityState, Mutation, MutationFailure, Reconciler, UpdateReport};
use crate::domain::ports::{AccessMode, ClusterApi, Sdc, Volume};
use crate::domain::Reference;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

// =============================================================================
// Desired / Observed
// =============================================================================

/// One volume that should be mapped to the SDC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMappingDesired {
    pub volume: Reference,
    /// 0 means unlimited
    #[serde(default)]
    pub limit_iops: u64,
    /// MB/s, 0 means unlimited
    #[serde(default)]
    pub limit_bw_in_mbps: u64,
    #[serde(default)]
    pub access_mode: AccessMode,
}

impl VolumeMappingDesired {
    pub fn new(volume: Reference) -> Self {
        Self {
            volume,
            limit_iops: 0,
            limit_bw_in_mbps: 0,
            access_mode: AccessMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcVolumeMappingDesired {
    /// SDC by id, IP (key) or name
    pub sdc: Reference,
    #[serde(default)]
    pub volumes: Vec<VolumeMappingDesired>,
}

/// A volume currently mapped to the SDC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedVolume {
    pub volume_id: String,
    pub volume_name: String,
    pub limit_iops: u64,
    pub limit_bw_in_mbps: u64,
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcVolumeMappingObserved {
    pub sdc_id: String,
    pub sdc_name: Option<String>,
    pub sdc_ip: String,
    pub volumes: Vec<MappedVolume>,
    pub last_updated: DateTime<Utc>,
}

/// Collect the mappings of one SDC from the volume list
pub fn mapping_to_observed(sdc: &Sdc, volumes: &[Volume]) -> SdcVolumeMappingObserved {
    let mapped = volumes
        .iter()
        .filter_map(|volume| {
            volume
                .mapped_sdc_info
                .iter()
                .find(|m| m.sdc_id == sdc.id)
                .map(|m| MappedVolume {
                    volume_id: volume.id.clone(),
                    volume_name: volume.name.clone(),
                    limit_iops: m.limit_iops,
                    limit_bw_in_mbps: m.limit_bw_in_mbps,
                    access_mode: m.access_mode,
                })
        })
        .collect();

    SdcVolumeMappingObserved {
        sdc_id: sdc.id.clone(),
        sdc_name: sdc.name.clone(),
        sdc_ip: sdc.sdc_ip.clone(),
        volumes: mapped,
        last_updated: Utc::now(),
    }
}

// =============================================================================
// Delta
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingMutation {
    Unmap {
        volume_id: String,
    },
    Map {
        volume_id: String,
        access_mode: AccessMode,
    },
    SetLimits {
        volume_id: String,
        limit_iops: u64,
        limit_bw_in_mbps: u64,
    },
}

impl Mutation for MappingMutation {
    fn name(&self) -> &'static str {
        match self {
            MappingMutation::Unmap { .. } => "unmap_volume_from_sdc",
            MappingMutation::Map { .. } => "map_volume_to_sdc",
            MappingMutation::SetLimits { .. } => "set_mapped_sdc_limits",
        }
    }
}

/// Desired mappings with every volume reference resolved to an id
pub type ResolvedMappings = BTreeMap<String, VolumeMappingDesired>;

/// Compute unmaps, then maps, then limit changes
pub fn mapping_delta(desired: &ResolvedMappings, observed: &SdcVolumeMappingObserved) -> Vec<MappingMutation> {
    let current: BTreeMap<&str, &MappedVolume> = observed
        .volumes
        .iter()
        .map(|m| (m.volume_id.as_str(), m))
        .collect();

    let mut unmaps = Vec::new();
    let mut maps = Vec::new();
    let mut limits = Vec::new();

    for (volume_id, existing) in &current {
        let remap = match desired.get(*volume_id) {
            None => true,
            Some(want) => want.access_mode != existing.access_mode,
        };
        if remap {
            unmaps.push(MappingMutation::Unmap {
                volume_id: volume_id.to_string(),
            });
        }
    }

    for (volume_id, want) in desired {
        let mapped_as_wanted = current
            .get(volume_id.as_str())
            .filter(|existing| existing.access_mode == want.access_mode);
        match mapped_as_wanted {
            Some(existing) => {
                if existing.limit_iops != want.limit_iops
                    || existing.limit_bw_in_mbps != want.limit_bw_in_mbps
                {
                    limits.push(MappingMutation::SetLimits {
                        volume_id: volume_id.clone(),
                        limit_iops: want.limit_iops,
                        limit_bw_in_mbps: want.limit_bw_in_mbps,
                    });
                }
            }
            None => {
                maps.push(MappingMutation::Map {
                    volume_id: volume_id.clone(),
                    access_mode: want.access_mode,
                });
                if want.limit_iops != 0 || want.limit_bw_in_mbps != 0 {
                    limits.push(MappingMutation::SetLimits {
                        volume_id: volume_id.clone(),
                        limit_iops: want.limit_iops,
                        limit_bw_in_mbps: want.limit_bw_in_mbps,
                    });
                }
            }
        }
    }

    unmaps.into_iter().chain(maps).chain(limits).collect()
}

async fn apply(api: &dyn ClusterApi, sdc_id: &str, mutation: &MappingMutation) -> Result<()> {
    match mutation {
        MappingMutation::Unmap { volume_id } => api.unmap_volume_from_sdc(volume_id, sdc_id).await,
        MappingMutation::Map {
            volume_id,
            access_mode,
        } => api.map_volume_to_sdc(volume_id, sdc_id, *access_mode).await,
        MappingMutation::SetLimits {
            volume_id,
            limit_iops,
            limit_bw_in_mbps,
        } => {
            api.set_mapped_sdc_limits(volume_id, sdc_id, *limit_iops, *limit_bw_in_mbps)
                .await
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct SdcVolumeMappingReconciler;

impl SdcVolumeMappingReconciler {
    async fn fetch(&self, api: &dyn ClusterApi, sdc_id: &str) -> Result<SdcVolumeMappingObserved> {
        let sdc = api.get_sdc(sdc_id).await?;
        let volumes = api.list_volumes().await?;
        Ok(mapping_to_observed(&sdc, &volumes))
    }

    /// Resolve every volume reference before any mutation is issued
    async fn resolve_volumes(
        &self,
        api: &dyn ClusterApi,
        desired: &SdcVolumeMappingDesired,
    ) -> Result<ResolvedMappings> {
        let mut resolved = ResolvedMappings::new();
        for mapping in &desired.volumes {
            let volume = resolve_volume(api, &mapping.volume).await?;
            if resolved.insert(volume.id.clone(), mapping.clone()).is_some() {
                return Err(Error::validation(format!(
                    "volume {} is listed more than once for SDC {}",
                    volume.id, desired.sdc
                )));
            }
        }
        Ok(resolved)
    }

    /// Apply mutations in order; limits are skipped for volumes whose map failed
    async fn converge(
        &self,
        api: &dyn ClusterApi,
        sdc_id: &str,
        mutations: &[MappingMutation],
        halt_on_failure: bool,
    ) -> (Vec<&'static str>, Vec<MutationFailure>) {
        let mut applied = Vec::new();
        let mut failures = Vec::new();
        let mut failed_maps: HashSet<&str> = HashSet::new();
        for mutation in mutations {
            if let MappingMutation::SetLimits { volume_id, .. } = mutation {
                if failed_maps.contains(volume_id.as_str()) {
                    debug!("SDC {} mapping: skipping limits of unmapped volume {}", sdc_id, volume_id);
                    continue;
                }
            }
            debug!("SDC {} mapping: {:?}", sdc_id, mutation);
            match apply(api, sdc_id, mutation).await {
                Ok(()) => applied.push(mutation.name()),
                Err(error) => {
                    warn!("SDC {} mapping: {} failed: {}", sdc_id, mutation.name(), error);
                    if let MappingMutation::Map { volume_id, .. } = mutation {
                        failed_maps.insert(volume_id.as_str());
                    }
                    failures.push(MutationFailure {
                        mutation: mutation.name(),
                        error,
                    });
                    if halt_on_failure {
                        break;
                    }
                }
            }
        }
        (applied, failures)
    }
}

#[async_trait]
impl Reconciler for SdcVolumeMappingReconciler {
    type Desired = SdcVolumeMappingDesired;
    type Observed = SdcVolumeMappingObserved;

    const KIND: &'static str = "SdcVolumeMapping";

    fn validate(&self, desired: &SdcVolumeMappingDesired) -> Result<()> {
        desired.sdc.validate("Sdc")?;
        let mut seen = HashSet::new();
        for mapping in &desired.volumes {
            mapping.volume.validate("Volume")?;
            if !seen.insert(&mapping.volume) {
                return Err(Error::validation(format!(
                    "volume {} is listed more than once",
                    mapping.volume
                )));
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        api: &dyn ClusterApi,
        desired: &SdcVolumeMappingDesired,
    ) -> Result<SdcVolumeMappingObserved> {
        self.validate(desired)?;
        let sdc = resolve_sdc(api, &desired.sdc).await?;
        transition(Self::KIND, &sdc.id, EntityState::Absent, EntityState::Creating);

        let resolved = self.resolve_volumes(api, desired).await?;
        let current = self.fetch(api, &sdc.id).await?;
        let mutations = mapping_delta(&resolved, &current);
        info!("Mapping {} volumes to SDC {}", resolved.len(), sdc.id);

        let (applied, mut failures) = self.converge(api, &sdc.id, &mutations, true).await;
        if let Some(failure) = failures.pop() {
            warn!(
                "SDC {} mapping stopped after {} of {} mutations",
                sdc.id,
                applied.len(),
                mutations.len()
            );
            return Err(failure.error);
        }

        let observed = self.fetch(api, &sdc.id).await?;
        transition(Self::KIND, &sdc.id, EntityState::Creating, EntityState::Present);
        Ok(observed)
    }

    async fn read(
        &self,
        api: &dyn ClusterApi,
        observed: &SdcVolumeMappingObserved,
    ) -> Result<Option<SdcVolumeMappingObserved>> {
        transition(Self::KIND, &observed.sdc_id, EntityState::Present, EntityState::Reading);
        found(self.fetch(api, &observed.sdc_id).await)
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &SdcVolumeMappingDesired,
        observed: &SdcVolumeMappingObserved,
    ) -> Result<UpdateReport<SdcVolumeMappingObserved>> {
        self.validate(desired)?;
        let sdc = resolve_sdc(api, &desired.sdc).await?;
        if sdc.id != observed.sdc_id {
            return Err(Error::validation(format!(
                "mapping of SDC {} cannot move to SDC {}",
                observed.sdc_id, sdc.id
            )));
        }
        let resolved = self.resolve_volumes(api, desired).await?;
        let mutations = mapping_delta(&resolved, observed);
        transition(Self::KIND, &observed.sdc_id, EntityState::Present, EntityState::Updating);

        let (applied, failures) = self.converge(api, &observed.sdc_id, &mutations, false).await;

        let refreshed = self.fetch(api, &observed.sdc_id).await;
        let report = UpdateReport::assemble(Self::KIND, &observed.sdc_id, refreshed, applied, failures)?;
        transition(Self::KIND, &observed.sdc_id, EntityState::Updating, EntityState::Present);
        Ok(report)
    }

    async fn delete(&self, api: &dyn ClusterApi, observed: &SdcVolumeMappingObserved) -> Result<()> {
        transition(Self::KIND, &observed.sdc_id, EntityState::Present, EntityState::Deleting);
        for mapped in &observed.volumes {
            info!("Unmapping volume {} from SDC {}", mapped.volume_id, observed.sdc_id);
            absent_ok(api.unmap_volume_from_sdc(&mapped.volume_id, &observed.sdc_id).await)?;
        }
        transition(Self::KIND, &observed.sdc_id, EntityState::Deleting, EntityState::Absent);
        Ok(())
    }

    /// Import by SDC id
    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<SdcVolumeMappingObserved> {
        self.fetch(api, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCluster;
    use crate::domain::ports::{VolumeApi, VolumeParams, VolumeType};
    use crate::domain::units::GIB_IN_KB;
    use assert_matches::assert_matches;

    async fn cluster() -> (MemoryCluster, String, String, String) {
        let cluster = MemoryCluster::new();
        let pd = cluster.add_protection_domain("domain1");
        let pool = cluster.add_storage_pool(&pd, "pool1", "MediumGranularity");
        let mut ids = Vec::new();
        for name in ["vol1", "vol2"] {
            ids.push(
                cluster
                    .create_volume(&VolumeParams {
                        name: name.into(),
                        protection_domain_id: pd.clone(),
                        storage_pool_id: pool.clone(),
                        volume_size_in_kb: 8 * GIB_IN_KB,
                        volume_type: VolumeType::ThinProvisioned,
                        use_rm_cache: false,
                        compression_method: None,
                    })
                    .await
                    .unwrap(),
            );
        }
        let sdc = cluster.add_sdc("10.0.0.1", Some("host-a"));
        cluster.reset_calls();
        let vol2 = ids.remove(1);
        let vol1 = ids.remove(0);
        (cluster, sdc, vol1, vol2)
    }

    fn desired(volumes: Vec<VolumeMappingDesired>) -> SdcVolumeMappingDesired {
        SdcVolumeMappingDesired {
            sdc: Reference::key("10.0.0.1"),
            volumes,
        }
    }

    #[tokio::test]
    async fn test_create_maps_with_limits() {
        let (cluster, sdc, vol1, _) = cluster().await;
        let mut mapping = VolumeMappingDesired::new(Reference::name("vol1"));
        mapping.limit_iops = 500;

        let observed = SdcVolumeMappingReconciler
            .create(&cluster, &desired(vec![mapping]))
            .await
            .unwrap();

        assert_eq!(observed.sdc_id, sdc);
        assert_eq!(observed.volumes.len(), 1);
        assert_eq!(observed.volumes[0].volume_id, vol1);
        assert_eq!(observed.volumes[0].limit_iops, 500);
        assert_eq!(
            cluster.mutations(),
            vec![
                format!("map_volume_to_sdc:{vol1}"),
                format!("set_mapped_sdc_limits:{vol1}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_access_mode_change_remaps() {
        let (cluster, _, vol1, vol2) = cluster().await;
        let observed = SdcVolumeMappingReconciler
            .create(&cluster, &desired(vec![VolumeMappingDesired::new(Reference::name("vol1"))]))
            .await
            .unwrap();
        cluster.reset_calls();

        let mut read_only = VolumeMappingDesired::new(Reference::id(vol1.clone()));
        read_only.access_mode = AccessMode::ReadOnly;
        let want = desired(vec![read_only, VolumeMappingDesired::new(Reference::name("vol2"))]);
        let report = SdcVolumeMappingReconciler
            .update(&cluster, &want, &observed)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(
            report.applied,
            vec!["unmap_volume_from_sdc", "map_volume_to_sdc", "map_volume_to_sdc"]
        );
        let modes: BTreeMap<_, _> = report
            .observed
            .volumes
            .iter()
            .map(|m| (m.volume_id.clone(), m.access_mode))
            .collect();
        assert_eq!(modes[&vol1], AccessMode::ReadOnly);
        assert_eq!(modes[&vol2], AccessMode::ReadWrite);
    }

    #[tokio::test]
    async fn test_no_delta_no_calls() {
        let (cluster, _, _, _) = cluster().await;
        let want = desired(vec![VolumeMappingDesired::new(Reference::name("vol1"))]);
        let observed = SdcVolumeMappingReconciler.create(&cluster, &want).await.unwrap();
        cluster.reset_calls();

        let report = SdcVolumeMappingReconciler
            .update(&cluster, &want, &observed)
            .await
            .unwrap();
        assert!(report.applied.is_empty());
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_volume_fails_before_mutation() {
        let (cluster, _, _, _) = cluster().await;
        let want = desired(vec![
            VolumeMappingDesired::new(Reference::name("vol1")),
            VolumeMappingDesired::new(Reference::name("missing")),
        ]);

        assert_matches!(
            SdcVolumeMappingReconciler.create(&cluster, &want).await,
            Err(Error::ReferenceNotFound { .. })
        );
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_stops_at_first_failure() {
        let (cluster, _, vol1, _) = cluster().await;
        cluster.fail_on("map_volume_to_sdc", "SDC is disconnected");
        let mut limited = VolumeMappingDesired::new(Reference::name("vol1"));
        limited.limit_iops = 500;
        let want = desired(vec![limited, VolumeMappingDesired::new(Reference::name("vol2"))]);

        assert_matches!(
            SdcVolumeMappingReconciler.create(&cluster, &want).await,
            Err(Error::RemoteRejected { ref message, .. }) if message == "SDC is disconnected"
        );
        assert_eq!(
            cluster.mutations(),
            vec![format!("map_volume_to_sdc:{vol1}")]
        );
    }

    #[tokio::test]
    async fn test_failed_map_skips_its_limits() {
        let (cluster, _, vol1, _) = cluster().await;
        let observed = SdcVolumeMappingReconciler
            .create(&cluster, &desired(Vec::new()))
            .await
            .unwrap();
        cluster.fail_on("map_volume_to_sdc", "SDC is disconnected");
        cluster.reset_calls();

        let mut limited = VolumeMappingDesired::new(Reference::name("vol1"));
        limited.limit_bw_in_mbps = 100;
        let report = SdcVolumeMappingReconciler
            .update(&cluster, &desired(vec![limited]), &observed)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].mutation, "map_volume_to_sdc");
        assert_eq!(
            cluster.mutations(),
            vec![format!("map_volume_to_sdc:{vol1}")]
        );
    }

    #[tokio::test]
    async fn test_failed_reread_still_reports_mutations() {
        let (cluster, _, _, _) = cluster().await;
        let observed = SdcVolumeMappingReconciler
            .create(&cluster, &desired(vec![VolumeMappingDesired::new(Reference::name("vol1"))]))
            .await
            .unwrap();
        cluster.fail_on("get_sdc", "gateway busy");

        let want = desired(vec![VolumeMappingDesired::new(Reference::name("vol2"))]);
        assert_matches!(
            SdcVolumeMappingReconciler.update(&cluster, &want, &observed).await,
            Err(Error::PartialUpdate { ref applied, ref failures, .. })
                if applied == &["unmap_volume_from_sdc", "map_volume_to_sdc"]
                    && failures.len() == 1
                    && failures[0].contains("gateway busy")
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_already_unmapped() {
        let (cluster, sdc, vol1, _) = cluster().await;
        let observed = SdcVolumeMappingReconciler
            .create(
                &cluster,
                &desired(vec![
                    VolumeMappingDesired::new(Reference::name("vol1")),
                    VolumeMappingDesired::new(Reference::name("vol2")),
                ]),
            )
            .await
            .unwrap();
        cluster.unmap_volume_from_sdc(&vol1, &sdc).await.unwrap();

        SdcVolumeMappingReconciler.delete(&cluster, &observed).await.unwrap();
        let after = SdcVolumeMappingReconciler.import(&cluster, &sdc).await.unwrap();
        assert!(after.volumes.is_empty());
    }
}
