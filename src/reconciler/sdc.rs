//! SDC Reconciler
//!
//! SDCs register themselves with the cluster when the client package is
//! installed on a host, so `create` adopts an existing SDC rather than
//! creating one. The SDC is located by id, then IP, then name.

use super::lookup::{first_unique, priority_candidates, resolve_sdc};
use super::{absent_ok, found, transition, EntityState, Mutation, MutationFailure, Reconciler, UpdateReport};
use crate::domain::ports::{ClusterApi, PerformanceProfile, Sdc};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Declared configuration of an SDC
///
/// `id` and `ip` only locate the SDC. `name` both locates it (as the last
/// resort) and is the name the SDC should carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdcDesired {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub performance_profile: Option<PerformanceProfile>,
}

impl SdcDesired {
    pub fn by_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Default::default()
        }
    }
}

/// Last known state of an SDC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcObserved {
    pub id: String,
    pub name: Option<String>,
    pub ip: String,
    pub guid: String,
    pub approved: bool,
    pub on_vmware: bool,
    pub system_id: String,
    pub performance_profile: Option<PerformanceProfile>,
    pub mdm_connection_state: String,
    pub last_updated: DateTime<Utc>,
}

pub fn sdc_to_observed(sdc: Sdc) -> SdcObserved {
    SdcObserved {
        id: sdc.id,
        name: sdc.name,
        ip: sdc.sdc_ip,
        guid: sdc.sdc_guid,
        approved: sdc.sdc_approved,
        on_vmware: sdc.on_vmware,
        system_id: sdc.system_id,
        performance_profile: sdc.perf_profile,
        mdm_connection_state: sdc.mdm_connection_state,
        last_updated: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdcMutation {
    Rename(String),
    PerformanceProfile(PerformanceProfile),
}

impl Mutation for SdcMutation {
    fn name(&self) -> &'static str {
        match self {
            SdcMutation::Rename(_) => "set_sdc_name",
            SdcMutation::PerformanceProfile(_) => "set_sdc_performance_profile",
        }
    }
}

/// Compute the mutations for an SDC
///
/// Name collisions are not checked up front; a name already claimed by
/// another SDC surfaces as the remote rejection of the rename.
pub fn sdc_delta(desired: &SdcDesired, observed: &SdcObserved) -> Result<Vec<SdcMutation>> {
    if let Some(id) = desired.id.as_deref().filter(|s| !s.is_empty()) {
        if id != observed.id {
            return Err(Error::validation(format!(
                "SDC id {} cannot change to {}",
                observed.id, id
            )));
        }
    }
    if let Some(ip) = desired.ip.as_deref().filter(|s| !s.is_empty()) {
        if ip != observed.ip {
            return Err(Error::validation(format!(
                "SDC {} has IP {}; its IP cannot change to {}",
                observed.id, observed.ip, ip
            )));
        }
    }

    let mut mutations = Vec::new();
    if let Some(name) = desired.name.as_deref().filter(|s| !s.is_empty()) {
        if observed.name.as_deref() != Some(name) {
            mutations.push(SdcMutation::Rename(name.to_string()));
        }
    }
    if let Some(profile) = desired.performance_profile {
        if observed.performance_profile != Some(profile) {
            mutations.push(SdcMutation::PerformanceProfile(profile));
        }
    }
    Ok(mutations)
}

async fn apply(api: &dyn ClusterApi, id: &str, mutation: &SdcMutation) -> Result<()> {
    match mutation {
        SdcMutation::Rename(name) => api.set_sdc_name(id, name).await,
        SdcMutation::PerformanceProfile(profile) => api.set_sdc_performance_profile(id, *profile).await,
    }
}

/// Reconciler for SDCs
#[derive(Debug, Clone, Copy, Default)]
pub struct SdcReconciler;

impl SdcReconciler {
    /// Locate the SDC a desired state refers to
    pub async fn locate(&self, api: &dyn ClusterApi, desired: &SdcDesired) -> Result<Sdc> {
        let candidates = priority_candidates(
            desired.id.as_deref(),
            desired.ip.as_deref(),
            desired.name.as_deref(),
        );
        first_unique(Self::KIND, candidates, |r| async move { resolve_sdc(api, &r).await }).await
    }
}

#[async_trait]
impl Reconciler for SdcReconciler {
    type Desired = SdcDesired;
    type Observed = SdcObserved;

    const KIND: &'static str = "Sdc";

    fn validate(&self, desired: &SdcDesired) -> Result<()> {
        let given = [&desired.id, &desired.ip, &desired.name]
            .into_iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
        if !given {
            return Err(Error::validation("an SDC needs an id, IP or name"));
        }
        Ok(())
    }

    async fn create(&self, api: &dyn ClusterApi, desired: &SdcDesired) -> Result<SdcObserved> {
        self.validate(desired)?;
        let sdc = self.locate(api, desired).await?;
        transition(Self::KIND, &sdc.id, EntityState::Absent, EntityState::Creating);
        info!("Adopting SDC {} ({})", sdc.id, sdc.sdc_ip);

        let id = sdc.id.clone();
        for mutation in sdc_delta(desired, &sdc_to_observed(sdc))? {
            if let Err(e) = apply(api, &id, &mutation).await {
                warn!("SDC {} adopted but {} failed: {}", id, mutation.name(), e);
                return Err(e);
            }
        }

        let observed = sdc_to_observed(api.get_sdc(&id).await?);
        transition(Self::KIND, &id, EntityState::Creating, EntityState::Present);
        Ok(observed)
    }

    async fn read(&self, api: &dyn ClusterApi, observed: &SdcObserved) -> Result<Option<SdcObserved>> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Reading);
        Ok(found(api.get_sdc(&observed.id).await)?.map(sdc_to_observed))
    }

    async fn update(
        &self,
        api: &dyn ClusterApi,
        desired: &SdcDesired,
        observed: &SdcObserved,
    ) -> Result<UpdateReport<SdcObserved>> {
        let mutations = sdc_delta(desired, observed)?;
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Updating);

        let mut applied = Vec::new();
        let mut failures = Vec::new();
        for mutation in &mutations {
            info!("SDC {}: {:?}", observed.id, mutation);
            match apply(api, &observed.id, mutation).await {
                Ok(()) => applied.push(mutation.name()),
                Err(error) => {
                    warn!("SDC {}: {} failed: {}", observed.id, mutation.name(), error);
                    failures.push(MutationFailure {
                        mutation: mutation.name(),
                        error,
                    });
                }
            }
        }

        let refreshed = api.get_sdc(&observed.id).await.map(sdc_to_observed);
        let report = UpdateReport::assemble(Self::KIND, &observed.id, refreshed, applied, failures)?;
        transition(Self::KIND, &observed.id, EntityState::Updating, EntityState::Present);
        Ok(report)
    }

    async fn delete(&self, api: &dyn ClusterApi, observed: &SdcObserved) -> Result<()> {
        transition(Self::KIND, &observed.id, EntityState::Present, EntityState::Deleting);
        info!("Removing SDC {} ({})", observed.id, observed.ip);
        absent_ok(api.delete_sdc(&observed.id).await)?;
        transition(Self::KIND, &observed.id, EntityState::Deleting, EntityState::Absent);
        Ok(())
    }

    async fn import(&self, api: &dyn ClusterApi, id: &str) -> Result<SdcObserved> {
        Ok(sdc_to_observed(api.get_sdc(id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCluster;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_adopt_by_ip_and_configure() {
        let cluster = MemoryCluster::new();
        let id = cluster.add_sdc("10.0.0.1", None);

        let desired = SdcDesired {
            name: Some("host-a".into()),
            performance_profile: Some(PerformanceProfile::HighPerformance),
            ..SdcDesired::by_ip("10.0.0.1")
        };
        let observed = SdcReconciler.create(&cluster, &desired).await.unwrap();

        assert_eq!(observed.id, id);
        assert_eq!(observed.name.as_deref(), Some("host-a"));
        assert_eq!(observed.performance_profile, Some(PerformanceProfile::HighPerformance));

        let read = SdcReconciler.read(&cluster, &observed).await.unwrap().unwrap();
        assert_eq!(read.id, observed.id);
    }

    #[tokio::test]
    async fn test_adopt_falls_back_to_name() {
        let cluster = MemoryCluster::new();
        let id = cluster.add_sdc("10.0.0.1", Some("host-a"));

        let desired = SdcDesired {
            id: Some("0000000000000000".into()),
            name: Some("host-a".into()),
            ..Default::default()
        };
        let observed = SdcReconciler.create(&cluster, &desired).await.unwrap();
        assert_eq!(observed.id, id);
        // already named, nothing to do
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_name() {
        let cluster = MemoryCluster::new();
        cluster.add_sdc("10.0.0.1", Some("dup"));
        cluster.add_sdc("10.0.0.2", Some("dup"));

        let desired = SdcDesired {
            name: Some("dup".into()),
            ..Default::default()
        };
        assert_matches!(
            SdcReconciler.create(&cluster, &desired).await,
            Err(Error::ReferenceAmbiguous { matches: 2, .. })
        );
    }

    #[tokio::test]
    async fn test_empty_desired_is_invalid() {
        let cluster = MemoryCluster::new();
        assert_matches!(
            SdcReconciler.create(&cluster, &SdcDesired::default()).await,
            Err(Error::Validation(_))
        );
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rename_collision_is_reported() {
        let cluster = MemoryCluster::new();
        cluster.add_sdc("10.0.0.1", Some("taken"));
        cluster.add_sdc("10.0.0.2", None);
        let observed = SdcReconciler
            .create(&cluster, &SdcDesired::by_ip("10.0.0.2"))
            .await
            .unwrap();

        let desired = SdcDesired {
            name: Some("taken".into()),
            performance_profile: Some(PerformanceProfile::HighPerformance),
            ..SdcDesired::by_ip("10.0.0.2")
        };
        let report = SdcReconciler.update(&cluster, &desired, &observed).await.unwrap();

        assert_eq!(report.applied, vec!["set_sdc_performance_profile"]);
        assert_matches!(
            &report.failures[0].error,
            Error::RemoteRejected { message, .. } if message.contains("already in use")
        );
        assert_eq!(report.observed.name, None);
    }

    #[tokio::test]
    async fn test_failed_reread_still_reports_mutations() {
        let cluster = MemoryCluster::new();
        cluster.add_sdc("10.0.0.1", None);
        let observed = SdcReconciler
            .create(&cluster, &SdcDesired::by_ip("10.0.0.1"))
            .await
            .unwrap();
        cluster.fail_on("set_sdc_name", "name already in use");
        cluster.fail_on("get_sdc", "gateway busy");

        let desired = SdcDesired {
            name: Some("host-a".into()),
            performance_profile: Some(PerformanceProfile::HighPerformance),
            ..SdcDesired::by_ip("10.0.0.1")
        };
        assert_matches!(
            SdcReconciler.update(&cluster, &desired, &observed).await,
            Err(Error::PartialUpdate { ref applied, ref failures, .. })
                if applied == &["set_sdc_performance_profile"]
                    && failures.len() == 2
                    && failures[1].contains("gateway busy")
        );
    }

    #[tokio::test]
    async fn test_ip_is_immutable() {
        let cluster = MemoryCluster::new();
        cluster.add_sdc("10.0.0.1", None);
        let observed = SdcReconciler
            .create(&cluster, &SdcDesired::by_ip("10.0.0.1"))
            .await
            .unwrap();

        assert_matches!(
            SdcReconciler
                .update(&cluster, &SdcDesired::by_ip("10.0.0.9"), &observed)
                .await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_delete_and_read_missing() {
        let cluster = MemoryCluster::new();
        cluster.add_sdc("10.0.0.1", None);
        let observed = SdcReconciler
            .create(&cluster, &SdcDesired::by_ip("10.0.0.1"))
            .await
            .unwrap();

        SdcReconciler.delete(&cluster, &observed).await.unwrap();
        SdcReconciler.delete(&cluster, &observed).await.unwrap();
        assert!(SdcReconciler.read(&cluster, &observed).await.unwrap().is_none());
    }
}
