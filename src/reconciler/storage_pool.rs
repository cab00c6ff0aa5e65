//! Storage Pool Reconciler

use super::lookup::{reference_matches, resolve_protection_domain};
use super::{absent_ok, found, transition, EntityState, Mutation, MutationFailure, Reconciler, UpdateReport};
use crate::domain::ports::{ClusterApi, MediaType, ProtectionDomain, StoragePool, StoragePoolParams};
use crate::domain::Reference;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Declared configuration of a storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolDesired {
    pub name: String,
    pub protection_domain: Reference,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub use_rm_cache: bool,
    #[serde(default)]
    pub use_rf_cache: bool,
}

/// Last known state of a storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolObserved {
    pub id: String,
    pub name: String,
    pub protection_domain_id: String,
    pub protection_domain_name: String,
    pub media_type: MediaType,
    pub use_rm_cache: bool,
    pub use_rf_cache: bool,
    pub data_layout: Option<String>,
    pub last_updated: DateTime<Utc>,
}

pub fn storage_pool_to_observed(pool: StoragePool, domain: &ProtectionDomain) -> StoragePoolObserved {
    StoragePoolObserved {
        id: pool.id,
        name: pool.name,
        protection_domain_id: domain.id.clone(),
        protection_domain_name: domain.name.clone(),
        media_type: pool.media_type,
        use_rm_cache: pool.use_rmcache,
        use_rf_cache: pool.use_rfcache,
        data_layout: pool.data_layout,
        last_updated: Utc::now(),
    }
}

pub fn storage_pool_to_params(desired: &StoragePoolDesired, protection_domain_id: &str) -> StoragePoolParams {
    StoragePoolParams {
        name: desired.name.clone(),
        protection_domain_id: protection_domain_id.to_string(),
        media_type: desired.media_type,
        use_rmcache: desired.use_rm_cache,
        use_rfcache: desired.use_rf_cache,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePoolMutation {
    Rename(String),
    MediaType(MediaType),
    RmCache(bool),
    RfCache(bool),
}

impl Mutation for StoragePoolMutation {
    fn name(&self) -> &'static str {
        match self {
            StoragePoolMutation::Rename(_) => "set_storage_pool_name",
            StoragePoolMutation::MediaType(_) => "set_storage_pool_media_type",
            StoragePoolMutation::RmCache(_) => "set_storage_pool_rm_cache",
            StoragePoolMutation::RfCache(_) => "set_storage_pool_rf_cache",
        }
    }
}

pub fn storage_pool_delta(
    desired: &StoragePoolDesired,
    observed: &StoragePoolObserved,
) -> Result<Vec<StoragePoolMutation>> {
    if !reference_matches(
        &desired.protection_domain,
        &observed.protection_domain_id,
        &observed.protection_domain_name,
    ) {
        return Err(Error::validation(format!(
            "storage pool {} cannot be moved to protection domain {}",
            observed.id, desired.protection_domain
        )));
    }

    let mut mutations = Vec::new();
    if desired.name != observed.name {
        mutations.push(StoragePoolMutation::Rename(desired.name.clone()));
    }
    if desired.media_type != observed.media_type {
        mutations.push(StoragePoolMutation::MediaType(desired.media_type));
    }
    if desired.use_rm_cache != observed.use_rm_cache {
        mutations.push(StoragePoolMutation::RmCache(desired.use_rm_cache));
    }
    if desired.use_rf_cache != observed.use_rf_cache {
        mutations.push(StoragePoolMutation::RfCache(desired.use_rf_cache));
    }
    Ok(mutations)
}

async fn apply(api: &dyn ClusterApi, id: &str, mutation: &StoragePoolMutation) -> Result<()> {
    match mutation {
        StoragePoolMutation::Rename(name) => api.set_storage_pool_name(id, name).await,
        StoragePoolMutation::MediaType(media) => api.set_storage_pool_media_type(id, *media).await,
        StoragePoolMutation::RmCache(enabled) => api.set_storage_pool_rm_cache(id, *enabled).await,
        StoragePoolMutation::RfCache(enabled) => api.set_storage_pool_rf_cache(id, *enabled).await,
    }
}

/// Reconciler for storage pools
#[derive(Debug, Clone, Copy, Default)]
pub struct StoragePoolReconciler;

impl StoragePoolReconciler {
    async fn fetch(&self, api: &dyn ClusterApi, id: &str) -> Result<StoragePoolObserved> {
        let pool = api.get_storage_pool(id).await?;
        let domain = api.get_protection_domain(&pool.protection_domain_id).await?;
        Ok(storage_pool_to_observed(pool, &domain))
    }
}

#[async_trait]
impl Reconciler for StoragePoolReconciler {
    type Desired = StoragePoolDesired;
    type Observed = StoragePoolObserved;

    const KIND: &'static str = "StoragePool";

    fn validate(&self, desired: &StoragePoolDesired) -> Result<()> {
        if desired.name.trim().is_empty() {
            return Err(Error::validation("storage pool name must not be empty"));
        }
        desired.protection_domain.validate("ProtectionDomain")
    }

    async fn create(&self, api: &dyn ClusterApi, desired: &StoragePoolDesired) -> Result<StoragePoolObserved> {
        self.validate(desired)?;
        transition(Self::KIND, &desired.name, EntityState::Absent, EntityState::Creating);

        let domain = resolve_protection_domain(api, &desired.protection_domain).await?;
        let params = storage_pool_to_params(desired, &domain.id);
        info!("Creating storage pool {} in protection domain {}", params.name, domain.name);
        let id = api.create_storage_pool(&params).await?;

        let observed = self.fetch(api, &id).await?;
        transition(Self::KIND, &id, EntityState::Creating, EntityState::Present);
        Ok(observed)
    }

    async fn read(&self, api: &dyn ClusterApi, observed: &StoragePoolObserved) -> Result<Option<StoragePoolObserved>> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Reading);
        found(self.fetch(api, &observed.id).await)
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &StoragePoolDesired,
        observed: &StoragePoolObserved,
    ) -> Result<UpdateReport<StoragePoolObserved>> {
        self.validate(desired)?;
        let mutations = storage_pool_delta(desired, observed)?;
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Updating);

        let mut applied = Vec::new();
        let mut failures = Vec::new();
        for mutation in &mutations {
            match apply(api, &observed.id, mutation).await {
                Ok(()) => applied.push(mutation.name()),
                Err(error) => {
                    warn!("Storage pool {}: {} failed: {}", observed.id, mutation.name(), error);
                    failures.push(MutationFailure {
                        mutation: mutation.name(),
                        error,
                    });
                }
            }
        }

        let refreshed = self.fetch(api, &observed.id).await;
        let report = UpdateReport::assemble(Self::KIND, &observed.id, refreshed, applied, failures)?;
        transition(Self::KIND, &observed.id, EntityState::Updating, EntityState::Present);
        Ok(report)
    }

    async fn delete(&self, api: &dyn ClusterApi, observed: &StoragePoolObserved) -> Result<()> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Deleting);
        absent_ok(api.delete_storage_pool(&observed.id).await)?;
        transition(Self::KIND, &observed.id, EntityState::Deleting, EntityState::Absent);
        Ok(())
    }

    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<StoragePoolObserved> {
        self.fetch(api, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCluster;
    use assert_matches::assert_matches;

    fn desired() -> StoragePoolDesired {
        StoragePoolDesired {
            name: "pool1".into(),
            protection_domain: Reference::name("domain1"),
            media_type: MediaType::HDD,
            use_rm_cache: false,
            use_rf_cache: false,
        }
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let cluster = MemoryCluster::new();
        let pd = cluster.add_protection_domain("domain1");

        let observed = StoragePoolReconciler.create(&cluster, &desired()).await.unwrap();
        assert_eq!(observed.protection_domain_id, pd);
        assert_eq!(observed.protection_domain_name, "domain1");

        let mut want = desired();
        want.name = "pool-ssd".into();
        want.media_type = MediaType::SSD;
        want.use_rf_cache = true;
        cluster.reset_calls();
        let report = StoragePoolReconciler.update(&cluster, &want, &observed).await.unwrap();
        assert_eq!(
            report.applied,
            vec!["set_storage_pool_name", "set_storage_pool_media_type", "set_storage_pool_rf_cache"]
        );
        assert_eq!(report.observed.media_type, MediaType::SSD);

        StoragePoolReconciler.delete(&cluster, &report.observed).await.unwrap();
        StoragePoolReconciler.delete(&cluster, &report.observed).await.unwrap();
        assert!(StoragePoolReconciler
            .read(&cluster, &report.observed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_delta_no_calls() {
        let cluster = MemoryCluster::new();
        cluster.add_protection_domain("domain1");
        let observed = StoragePoolReconciler.create(&cluster, &desired()).await.unwrap();
        cluster.reset_calls();

        let report = StoragePoolReconciler.update(&cluster, &desired(), &observed).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reread_still_reports_mutations() {
        let cluster = MemoryCluster::new();
        cluster.add_protection_domain("domain1");
        let observed = StoragePoolReconciler.create(&cluster, &desired()).await.unwrap();
        cluster.fail_on("set_storage_pool_media_type", "media type locked");
        cluster.fail_on("get_storage_pool", "gateway busy");

        let mut want = desired();
        want.media_type = MediaType::SSD;
        want.use_rm_cache = true;
        assert_matches!(
            StoragePoolReconciler.update(&cluster, &want, &observed).await,
            Err(Error::PartialUpdate { ref applied, ref failures, .. })
                if applied == &["set_storage_pool_rm_cache"] && failures.len() == 2
        );
    }

    #[tokio::test]
    async fn test_domain_is_immutable() {
        let cluster = MemoryCluster::new();
        cluster.add_protection_domain("domain1");
        cluster.add_protection_domain("domain2");
        let observed = StoragePoolReconciler.create(&cluster, &desired()).await.unwrap();

        let mut want = desired();
        want.protection_domain = Reference::name("domain2");
        assert_matches!(
            StoragePoolReconciler.update(&cluster, &want, &observed).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_ambiguous_domain() {
        let cluster = MemoryCluster::new();
        cluster.add_protection_domain("domain1");
        cluster.add_protection_domain("domain1");

        assert_matches!(
            StoragePoolReconciler.create(&cluster, &desired()).await,
            Err(Error::ReferenceAmbiguous { matches: 2, .. })
        );
        assert!(cluster.mutations().is_empty());
    }
}
