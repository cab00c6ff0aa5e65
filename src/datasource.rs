//! Read-only queries
//!
//! Filtered listings of SDCs, volumes and storage pools. Each query accepts
//! at most one filter; an empty query lists everything. Nothing here mutates
//! the cluster.

use crate::domain::ports::{ClusterApi, Volume};
use crate::domain::reference::Reference;
use crate::error::{Error, Result};
use crate::reconciler::lookup::resolve_protection_domain;
use crate::reconciler::{sdc_to_observed, storage_pool_to_observed, SdcObserved, StoragePoolObserved};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn at_most_one(kind: &str, set: &[bool]) -> Result<()> {
    if set.iter().filter(|s| **s).count() > 1 {
        return Err(Error::validation(format!(
            "{kind} query accepts at most one filter"
        )));
    }
    Ok(())
}

// =============================================================================
// SDCs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdcQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// SDCs matching the query
pub async fn query_sdcs(api: &dyn ClusterApi, query: &SdcQuery) -> Result<Vec<SdcObserved>> {
    at_most_one(
        "SDC",
        &[query.id.is_some(), query.ip.is_some(), query.name.is_some()],
    )?;

    if let Some(id) = &query.id {
        let sdc = api.get_sdc(id).await?;
        return Ok(vec![sdc_to_observed(sdc)]);
    }

    let sdcs = api
        .list_sdcs()
        .await?
        .into_iter()
        .filter(|s| query.ip.as_ref().map_or(true, |ip| &s.sdc_ip == ip))
        .filter(|s| query.name.as_ref().map_or(true, |n| s.name.as_ref() == Some(n)))
        .map(sdc_to_observed)
        .collect::<Vec<_>>();
    debug!("SDC query matched {} entries", sdcs.len());
    Ok(sdcs)
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub storage_pool_id: Option<String>,
    /// Matches every pool with this name, in any protection domain
    #[serde(default)]
    pub storage_pool_name: Option<String>,
}

/// Volumes and snapshots matching the query
pub async fn query_volumes(api: &dyn ClusterApi, query: &VolumeQuery) -> Result<Vec<Volume>> {
    at_most_one(
        "Volume",
        &[
            query.id.is_some(),
            query.name.is_some(),
            query.storage_pool_id.is_some(),
            query.storage_pool_name.is_some(),
        ],
    )?;

    if let Some(id) = &query.id {
        return Ok(vec![api.get_volume(id).await?]);
    }

    let pool_ids = match &query.storage_pool_name {
        Some(name) => {
            let mut ids = Vec::new();
            for domain in api.list_protection_domains().await? {
                ids.extend(
                    api.list_storage_pools(&domain.id)
                        .await?
                        .into_iter()
                        .filter(|p| &p.name == name)
                        .map(|p| p.id),
                );
            }
            if ids.is_empty() {
                return Err(Error::ReferenceNotFound {
                    kind: "StoragePool".into(),
                    reference: Reference::name(name.clone()).to_string(),
                });
            }
            Some(ids)
        }
        None => query.storage_pool_id.clone().map(|id| vec![id]),
    };

    let volumes = api
        .list_volumes()
        .await?
        .into_iter()
        .filter(|v| query.name.as_ref().map_or(true, |n| &v.name == n))
        .filter(|v| {
            pool_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&v.storage_pool_id))
        })
        .collect::<Vec<_>>();
    debug!("Volume query matched {} entries", volumes.len());
    Ok(volumes)
}

// =============================================================================
// Storage Pools
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolQuery {
    pub protection_domain: Reference,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

impl StoragePoolQuery {
    pub fn in_domain(protection_domain: Reference) -> Self {
        Self {
            protection_domain,
            ids: Vec::new(),
            names: Vec::new(),
        }
    }
}

/// Storage pools of one protection domain matching the query
pub async fn query_storage_pools(
    api: &dyn ClusterApi,
    query: &StoragePoolQuery,
) -> Result<Vec<StoragePoolObserved>> {
    query.protection_domain.validate("ProtectionDomain")?;
    at_most_one("StoragePool", &[!query.ids.is_empty(), !query.names.is_empty()])?;

    let domain = resolve_protection_domain(api, &query.protection_domain).await?;
    let pools = api
        .list_storage_pools(&domain.id)
        .await?
        .into_iter()
        .filter(|p| query.ids.is_empty() || query.ids.contains(&p.id))
        .filter(|p| query.names.is_empty() || query.names.contains(&p.name))
        .map(|p| storage_pool_to_observed(p, &domain))
        .collect::<Vec<_>>();
    debug!(
        "Storage pool query in {} matched {} entries",
        domain.name,
        pools.len()
    );
    Ok(pools)
}
