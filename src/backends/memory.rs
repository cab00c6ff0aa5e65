//! In-memory PowerFlex backend
//!
//! Simulates a single-system PowerFlex cluster and its installer gateway.
//! Used for standalone mode and as the remote side in tests: every call is
//! recorded and any operation can be made to fail.

use crate::domain::ports::*;
use crate::domain::units::GIB_IN_KB;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Debug, Default)]
struct ClusterState {
    protection_domains: BTreeMap<String, ProtectionDomain>,
    storage_pools: BTreeMap<String, StoragePool>,
    volumes: BTreeMap<String, Volume>,
    sdcs: BTreeMap<String, Sdc>,
}

/// Simulated PowerFlex management API
pub struct MemoryCluster {
    system_id: String,
    state: RwLock<ClusterState>,
    next_id: AtomicU64,
    /// Every call, as `operation:target`
    calls: RwLock<Vec<String>>,
    /// Mutating calls only
    mutations: RwLock<Vec<String>>,
    /// Operations forced to fail, with the rejection message
    failures: RwLock<HashMap<String, String>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Create an empty cluster with one system
    pub fn new() -> Self {
        Self {
            system_id: "0e7a082862fedf0f".to_string(),
            state: RwLock::new(ClusterState::default()),
            next_id: AtomicU64::new(1),
            calls: RwLock::new(Vec::new()),
            mutations: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    fn generate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}", 0xe3d0_1ba2_0000_0000u64 + n)
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Add a protection domain, returning its id
    pub fn add_protection_domain(&self, name: &str) -> String {
        let id = self.generate_id();
        self.state.write().protection_domains.insert(
            id.clone(),
            ProtectionDomain {
                id: id.clone(),
                name: name.to_string(),
                system_id: self.system_id.clone(),
                protection_domain_state: Some("Active".to_string()),
            },
        );
        id
    }

    /// Add a storage pool with the given data layout, returning its id
    pub fn add_storage_pool(&self, protection_domain_id: &str, name: &str, data_layout: &str) -> String {
        let id = self.generate_id();
        self.state.write().storage_pools.insert(
            id.clone(),
            StoragePool {
                id: id.clone(),
                name: name.to_string(),
                protection_domain_id: protection_domain_id.to_string(),
                media_type: MediaType::HDD,
                use_rmcache: false,
                use_rfcache: false,
                data_layout: Some(data_layout.to_string()),
            },
        );
        id
    }

    /// Register an SDC as if installed on a host, returning its id
    pub fn add_sdc(&self, ip: &str, name: Option<&str>) -> String {
        let id = self.generate_id();
        self.state.write().sdcs.insert(
            id.clone(),
            Sdc {
                id: id.clone(),
                name: name.map(str::to_string),
                sdc_ip: ip.to_string(),
                sdc_guid: format!("GUID-{id}"),
                sdc_approved: true,
                on_vmware: false,
                system_id: self.system_id.clone(),
                perf_profile: Some(PerformanceProfile::Compact),
                mdm_connection_state: "Connected".to_string(),
            },
        );
        id
    }

    /// Remove an entity behind the reconciler's back
    pub fn drop_volume(&self, id: &str) {
        self.state.write().volumes.remove(id);
    }

    /// Make every call of `operation` fail with a remote rejection
    pub fn fail_on(&self, operation: &str, message: &str) {
        self.failures
            .write()
            .insert(operation.to_string(), message.to_string());
    }

    /// All recorded calls
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().clone()
    }

    /// Recorded mutating calls
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.read().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.write().clear();
        self.mutations.write().clear();
    }

    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.state.read().volumes.get(id).cloned()
    }

    pub fn sdc(&self, id: &str) -> Option<Sdc> {
        self.state.read().sdcs.get(id).cloned()
    }

    // -------------------------------------------------------------------------
    // Call bookkeeping
    // -------------------------------------------------------------------------

    fn record(&self, operation: &str, target: &str, mutating: bool) -> Result<()> {
        let entry = format!("{operation}:{target}");
        debug!("memory backend call {}", entry);
        self.calls.write().push(entry.clone());
        if mutating {
            self.mutations.write().push(entry);
        }
        match self.failures.read().get(operation) {
            Some(message) => Err(Error::RemoteRejected {
                operation: operation.to_string(),
                target: target.to_string(),
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn query(&self, operation: &str, target: &str) -> Result<()> {
        self.record(operation, target, false)
    }

    fn mutate(&self, operation: &str, target: &str) -> Result<()> {
        self.record(operation, target, true)
    }

    fn with_volume<T>(&self, id: &str, f: impl FnOnce(&mut Volume) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let volume = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Volume", id))?;
        f(volume)
    }

    fn with_pool<T>(&self, id: &str, f: impl FnOnce(&mut StoragePool) -> T) -> Result<T> {
        let mut state = self.state.write();
        let pool = state
            .storage_pools
            .get_mut(id)
            .ok_or_else(|| Error::not_found("StoragePool", id))?;
        Ok(f(pool))
    }

    fn with_sdc<T>(&self, id: &str, f: impl FnOnce(&mut Sdc) -> T) -> Result<T> {
        let mut state = self.state.write();
        let sdc = state
            .sdcs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Sdc", id))?;
        Ok(f(sdc))
    }
}

fn rejected(operation: &str, target: &str, message: impl Into<String>) -> Error {
    Error::RemoteRejected {
        operation: operation.to_string(),
        target: target.to_string(),
        status: 500,
        message: message.into(),
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Management API
// =============================================================================

#[async_trait]
impl SystemApi for MemoryCluster {
    async fn list_systems(&self) -> Result<Vec<System>> {
        self.query("list_systems", "System")?;
        Ok(vec![System {
            id: self.system_id.clone(),
            name: Some("memory".to_string()),
        }])
    }
}

#[async_trait]
impl ProtectionDomainApi for MemoryCluster {
    async fn list_protection_domains(&self) -> Result<Vec<ProtectionDomain>> {
        self.query("list_protection_domains", "ProtectionDomain")?;
        Ok(self.state.read().protection_domains.values().cloned().collect())
    }

    async fn get_protection_domain(&self, id: &str) -> Result<ProtectionDomain> {
        self.query("get_protection_domain", id)?;
        self.state
            .read()
            .protection_domains
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("ProtectionDomain", id))
    }
}

#[async_trait]
impl StoragePoolApi for MemoryCluster {
    async fn list_storage_pools(&self, protection_domain_id: &str) -> Result<Vec<StoragePool>> {
        self.query("list_storage_pools", protection_domain_id)?;
        let state = self.state.read();
        if !state.protection_domains.contains_key(protection_domain_id) {
            return Err(Error::not_found("ProtectionDomain", protection_domain_id));
        }
        Ok(state
            .storage_pools
            .values()
            .filter(|p| p.protection_domain_id == protection_domain_id)
            .cloned()
            .collect())
    }

    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool> {
        self.query("get_storage_pool", id)?;
        self.state
            .read()
            .storage_pools
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("StoragePool", id))
    }

    async fn create_storage_pool(&self, params: &StoragePoolParams) -> Result<String> {
        self.mutate("create_storage_pool", &params.protection_domain_id)?;
        let id = self.generate_id();
        let mut state = self.state.write();
        if !state.protection_domains.contains_key(&params.protection_domain_id) {
            return Err(Error::not_found("ProtectionDomain", &params.protection_domain_id));
        }
        if state.storage_pools.values().any(|p| {
            p.protection_domain_id == params.protection_domain_id && p.name == params.name
        }) {
            return Err(rejected(
                "create_storage_pool",
                &params.protection_domain_id,
                format!("Storage Pool name {} already in use", params.name),
            ));
        }
        state.storage_pools.insert(
            id.clone(),
            StoragePool {
                id: id.clone(),
                name: params.name.clone(),
                protection_domain_id: params.protection_domain_id.clone(),
                media_type: params.media_type,
                use_rmcache: params.use_rmcache,
                use_rfcache: params.use_rfcache,
                data_layout: Some("MediumGranularity".to_string()),
            },
        );
        Ok(id)
    }

    async fn set_storage_pool_name(&self, id: &str, name: &str) -> Result<()> {
        self.mutate("set_storage_pool_name", id)?;
        self.with_pool(id, |p| p.name = name.to_string())
    }

    async fn set_storage_pool_media_type(&self, id: &str, media_type: MediaType) -> Result<()> {
        self.mutate("set_storage_pool_media_type", id)?;
        self.with_pool(id, |p| p.media_type = media_type)
    }

    async fn set_storage_pool_rm_cache(&self, id: &str, enabled: bool) -> Result<()> {
        self.mutate("set_storage_pool_rm_cache", id)?;
        self.with_pool(id, |p| p.use_rmcache = enabled)
    }

    async fn set_storage_pool_rf_cache(&self, id: &str, enabled: bool) -> Result<()> {
        self.mutate("set_storage_pool_rf_cache", id)?;
        self.with_pool(id, |p| p.use_rfcache = enabled)
    }

    async fn delete_storage_pool(&self, id: &str) -> Result<()> {
        self.mutate("delete_storage_pool", id)?;
        let mut state = self.state.write();
        if state.volumes.values().any(|v| v.storage_pool_id == id) {
            return Err(rejected("delete_storage_pool", id, "Storage Pool has volumes"));
        }
        state
            .storage_pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("StoragePool", id))
    }
}

#[async_trait]
impl VolumeApi for MemoryCluster {
    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.query("list_volumes", "Volume")?;
        Ok(self.state.read().volumes.values().cloned().collect())
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.query("get_volume", id)?;
        self.state
            .read()
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Volume", id))
    }

    async fn create_volume(&self, params: &VolumeParams) -> Result<String> {
        self.mutate("create_volume", &params.storage_pool_id)?;
        let id = self.generate_id();
        let mut state = self.state.write();
        let pool = state
            .storage_pools
            .get(&params.storage_pool_id)
            .cloned()
            .ok_or_else(|| Error::not_found("StoragePool", &params.storage_pool_id))?;
        if state.volumes.values().any(|v| v.name == params.name) {
            return Err(rejected(
                "create_volume",
                &params.storage_pool_id,
                format!("Volume name {} already in use", params.name),
            ));
        }
        state.volumes.insert(
            id.clone(),
            Volume {
                id: id.clone(),
                name: params.name.clone(),
                size_in_kb: params.volume_size_in_kb,
                storage_pool_id: pool.id,
                vtree_id: self.generate_id(),
                volume_type: params.volume_type,
                use_rm_cache: params.use_rm_cache,
                compression_method: params.compression_method,
                access_mode_limit: AccessMode::ReadWrite,
                data_layout: pool.data_layout,
                ancestor_volume_id: None,
                creation_time: now_secs(),
                secure_snapshot_exp_time: 0,
                locked_auto_snapshot: false,
                mapped_sdc_info: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn snapshot_volume(&self, system_id: &str, params: &SnapshotParams) -> Result<String> {
        self.mutate("snapshot_volume", &params.volume_id)?;
        if system_id != self.system_id {
            return Err(Error::not_found("System", system_id));
        }
        let id = self.generate_id();
        let mut state = self.state.write();
        let source = state
            .volumes
            .get(&params.volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Volume", &params.volume_id))?;
        let creation_time = now_secs();
        let secure_snapshot_exp_time = params
            .retention_in_min
            .map(|m| creation_time + m as i64 * 60)
            .unwrap_or(0);
        state.volumes.insert(
            id.clone(),
            Volume {
                id: id.clone(),
                name: params.snapshot_name.clone(),
                access_mode_limit: params.access_mode,
                ancestor_volume_id: Some(source.id.clone()),
                creation_time,
                secure_snapshot_exp_time,
                locked_auto_snapshot: false,
                mapped_sdc_info: Vec::new(),
                ..source
            },
        );
        Ok(id)
    }

    async fn set_volume_name(&self, id: &str, name: &str) -> Result<()> {
        self.mutate("set_volume_name", id)?;
        let taken = self
            .state
            .read()
            .volumes
            .values()
            .any(|v| v.name == name && v.id != id);
        if taken {
            return Err(rejected("set_volume_name", id, format!("Volume name {name} already in use")));
        }
        self.with_volume(id, |v| {
            v.name = name.to_string();
            Ok(())
        })
    }

    async fn set_volume_size_gb(&self, id: &str, size_gb: u64) -> Result<()> {
        self.mutate("set_volume_size_gb", id)?;
        self.with_volume(id, |v| {
            let size_in_kb = size_gb * GIB_IN_KB;
            if size_in_kb < v.size_in_kb {
                return Err(rejected("set_volume_size_gb", id, "Volume size cannot be decreased"));
            }
            v.size_in_kb = size_in_kb;
            Ok(())
        })
    }

    async fn set_volume_rm_cache(&self, id: &str, enabled: bool) -> Result<()> {
        self.mutate("set_volume_rm_cache", id)?;
        self.with_volume(id, |v| {
            v.use_rm_cache = enabled;
            Ok(())
        })
    }

    async fn set_volume_compression(&self, id: &str, method: CompressionMethod) -> Result<()> {
        self.mutate("set_volume_compression", id)?;
        self.with_volume(id, |v| {
            if v.data_layout.as_deref() != Some(FINE_GRANULARITY_LAYOUT) {
                return Err(rejected(
                    "set_volume_compression",
                    id,
                    "Compression requires a fine granularity storage pool",
                ));
            }
            v.compression_method = Some(method);
            Ok(())
        })
    }

    async fn set_volume_access_mode(&self, id: &str, mode: AccessMode) -> Result<()> {
        self.mutate("set_volume_access_mode", id)?;
        self.with_volume(id, |v| {
            v.access_mode_limit = mode;
            Ok(())
        })
    }

    async fn set_auto_snapshot_lock(&self, id: &str, locked: bool) -> Result<()> {
        self.mutate("set_auto_snapshot_lock", id)?;
        self.with_volume(id, |v| {
            v.locked_auto_snapshot = locked;
            Ok(())
        })
    }

    async fn set_snapshot_retention(&self, id: &str, retention_in_min: u64) -> Result<()> {
        self.mutate("set_snapshot_retention", id)?;
        self.with_volume(id, |v| {
            let exp = v.creation_time + retention_in_min as i64 * 60;
            if v.secure_snapshot_exp_time > 0 && exp < v.secure_snapshot_exp_time {
                return Err(rejected(
                    "set_snapshot_retention",
                    id,
                    "Secure snapshot expiry cannot be shortened",
                ));
            }
            v.secure_snapshot_exp_time = exp;
            Ok(())
        })
    }

    async fn map_volume_to_sdc(&self, id: &str, sdc_id: &str, mode: AccessMode) -> Result<()> {
        self.mutate("map_volume_to_sdc", id)?;
        let sdc = self
            .state
            .read()
            .sdcs
            .get(sdc_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Sdc", sdc_id))?;
        self.with_volume(id, |v| {
            if v.mapped_sdc_info.iter().any(|m| m.sdc_id == sdc_id) {
                return Err(rejected("map_volume_to_sdc", id, "Volume already mapped to SDC"));
            }
            v.mapped_sdc_info.push(MappedSdcInfo {
                sdc_id: sdc.id,
                sdc_ip: sdc.sdc_ip,
                sdc_name: sdc.name.unwrap_or_default(),
                limit_iops: 0,
                limit_bw_in_mbps: 0,
                access_mode: mode,
            });
            Ok(())
        })
    }

    async fn unmap_volume_from_sdc(&self, id: &str, sdc_id: &str) -> Result<()> {
        self.mutate("unmap_volume_from_sdc", id)?;
        self.with_volume(id, |v| {
            let before = v.mapped_sdc_info.len();
            v.mapped_sdc_info.retain(|m| m.sdc_id != sdc_id);
            if v.mapped_sdc_info.len() == before {
                return Err(Error::not_found("SdcMapping", format!("{id}/{sdc_id}")));
            }
            Ok(())
        })
    }

    async fn set_mapped_sdc_limits(
        &self,
        id: &str,
        sdc_id: &str,
        limit_iops: u64,
        limit_bw_in_mbps: u64,
    ) -> Result<()> {
        self.mutate("set_mapped_sdc_limits", id)?;
        self.with_volume(id, |v| {
            let mapping = v
                .mapped_sdc_info
                .iter_mut()
                .find(|m| m.sdc_id == sdc_id)
                .ok_or_else(|| Error::not_found("SdcMapping", format!("{id}/{sdc_id}")))?;
            mapping.limit_iops = limit_iops;
            mapping.limit_bw_in_mbps = limit_bw_in_mbps;
            Ok(())
        })
    }

    async fn delete_volume(&self, id: &str, mode: RemoveMode) -> Result<()> {
        self.mutate("delete_volume", id)?;
        let mut state = self.state.write();
        if !state.volumes.contains_key(id) {
            return Err(Error::not_found("Volume", id));
        }
        let descendants: Vec<String> = state
            .volumes
            .values()
            .filter(|v| v.ancestor_volume_id.as_deref() == Some(id))
            .map(|v| v.id.clone())
            .collect();
        match mode {
            RemoveMode::OnlyMe => {
                for child in descendants {
                    if let Some(v) = state.volumes.get_mut(&child) {
                        v.ancestor_volume_id = None;
                    }
                }
            }
            RemoveMode::IncludingDescendants => {
                for child in descendants {
                    state.volumes.remove(&child);
                }
            }
        }
        state.volumes.remove(id);
        Ok(())
    }
}

#[async_trait]
impl SdcApi for MemoryCluster {
    async fn list_sdcs(&self) -> Result<Vec<Sdc>> {
        self.query("list_sdcs", "Sdc")?;
        Ok(self.state.read().sdcs.values().cloned().collect())
    }

    async fn get_sdc(&self, id: &str) -> Result<Sdc> {
        self.query("get_sdc", id)?;
        self.state
            .read()
            .sdcs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Sdc", id))
    }

    async fn set_sdc_name(&self, id: &str, name: &str) -> Result<()> {
        self.mutate("set_sdc_name", id)?;
        let taken = self
            .state
            .read()
            .sdcs
            .values()
            .any(|s| s.name.as_deref() == Some(name) && s.id != id);
        if taken {
            return Err(rejected("set_sdc_name", id, format!("SDC name {name} already in use")));
        }
        self.with_sdc(id, |s| s.name = Some(name.to_string()))
    }

    async fn set_sdc_performance_profile(&self, id: &str, profile: PerformanceProfile) -> Result<()> {
        self.mutate("set_sdc_performance_profile", id)?;
        self.with_sdc(id, |s| s.perf_profile = Some(profile))
    }

    async fn delete_sdc(&self, id: &str) -> Result<()> {
        self.mutate("delete_sdc", id)?;
        self.state
            .write()
            .sdcs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Sdc", id))
    }
}

// =============================================================================
// Installer Gateway
// =============================================================================

#[derive(Debug, Default)]
struct GatewayState {
    /// Statuses returned by successive phase polls; `Completed` once drained
    scripted: VecDeque<PhaseStatus>,
    installed_ips: Vec<String>,
    phase: String,
    uploaded_csv: Option<String>,
}

/// Simulated installer gateway
pub struct MemoryGateway {
    state: RwLock<GatewayState>,
    calls: RwLock<Vec<String>>,
    failures: RwLock<HashMap<String, String>>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GatewayState {
                phase: "idle".to_string(),
                ..Default::default()
            }),
            calls: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Queue statuses to be returned by the next phase polls
    pub fn script_phases(&self, statuses: impl IntoIterator<Item = PhaseStatus>) {
        self.state.write().scripted.extend(statuses);
    }

    /// IPs the gateway reports as already running an SDC
    pub fn set_installed_ips(&self, ips: &[&str]) {
        self.state.write().installed_ips = ips.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_on(&self, operation: &str, message: &str) {
        self.failures
            .write()
            .insert(operation.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().clone()
    }

    /// Current installer phase name
    pub fn phase(&self) -> String {
        self.state.read().phase.clone()
    }

    pub fn uploaded_csv(&self) -> Option<String> {
        self.state.read().uploaded_csv.clone()
    }

    fn record(&self, operation: &str) -> Result<()> {
        self.calls.write().push(operation.to_string());
        match self.failures.read().get(operation) {
            Some(message) => Err(rejected(operation, "gateway", message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GatewayApi for MemoryGateway {
    async fn parse_csv(&self, csv: &str) -> Result<GatewayResponse> {
        self.record("parse_csv")?;
        self.state.write().uploaded_csv = Some(csv.to_string());
        Ok(GatewayResponse::ok("topology"))
    }

    async fn validate_mdm(&self, _request: &MdmValidation) -> Result<GatewayResponse> {
        self.record("validate_mdm")?;
        Ok(GatewayResponse::ok(self.state.read().installed_ips.join(",")))
    }

    async fn begin_installation(&self, _request: &InstallationRequest) -> Result<GatewayResponse> {
        self.record("begin_installation")?;
        self.state.write().phase = "query".to_string();
        Ok(GatewayResponse::ok(""))
    }

    async fn phase_status(&self, phase: &str) -> Result<PhaseStatus> {
        self.record(&format!("phase_status:{phase}"))?;
        Ok(self
            .state
            .write()
            .scripted
            .pop_front()
            .unwrap_or(PhaseStatus::Completed))
    }

    async fn move_to_next_phase(&self) -> Result<GatewayResponse> {
        self.record("move_to_next_phase")?;
        let mut state = self.state.write();
        state.phase = match state.phase.as_str() {
            "query" => "upload",
            "upload" => "install",
            "install" => "configure",
            other => other,
        }
        .to_string();
        Ok(GatewayResponse::ok(""))
    }

    async fn abort_operation(&self) -> Result<GatewayResponse> {
        self.record("abort_operation")?;
        Ok(GatewayResponse::ok(""))
    }

    async fn clear_queue(&self) -> Result<GatewayResponse> {
        self.record("clear_queue")?;
        Ok(GatewayResponse::ok(""))
    }

    async fn move_to_idle_phase(&self) -> Result<GatewayResponse> {
        self.record("move_to_idle_phase")?;
        self.state.write().phase = "idle".to_string();
        Ok(GatewayResponse::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_create_and_get_volume() {
        let cluster = MemoryCluster::new();
        let pd = cluster.add_protection_domain("domain1");
        let pool = cluster.add_storage_pool(&pd, "pool1", "MediumGranularity");

        let id = cluster
            .create_volume(&VolumeParams {
                name: "vol1".into(),
                protection_domain_id: pd,
                storage_pool_id: pool,
                volume_size_in_kb: 8 * GIB_IN_KB,
                volume_type: VolumeType::ThinProvisioned,
                use_rm_cache: false,
                compression_method: None,
            })
            .await
            .unwrap();

        let volume = cluster.get_volume(&id).await.unwrap();
        assert_eq!(volume.name, "vol1");
        assert_eq!(cluster.mutations(), vec![format!("create_volume:{}", volume.storage_pool_id)]);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let cluster = MemoryCluster::new();
        assert_matches!(cluster.get_sdc("nope").await, Err(Error::NotFound { .. }));
        assert_matches!(
            cluster.delete_volume("nope", RemoveMode::OnlyMe).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cluster = MemoryCluster::new();
        let sdc = cluster.add_sdc("10.0.0.1", None);
        cluster.fail_on("set_sdc_name", "denied");

        assert_matches!(
            cluster.set_sdc_name(&sdc, "host-1").await,
            Err(Error::RemoteRejected { message, .. }) if message == "denied"
        );
        assert_eq!(cluster.sdc(&sdc).unwrap().name, None);
    }

    #[tokio::test]
    async fn test_gateway_phase_walk() {
        let gateway = MemoryGateway::new();
        gateway.script_phases([PhaseStatus::Running]);
        gateway
            .begin_installation(&InstallationRequest {
                topology: "t".into(),
                mdm_user: "admin".into(),
                mdm_password: "p".into(),
                lia_password: "l".into(),
            })
            .await
            .unwrap();

        assert_eq!(gateway.phase_status("query").await.unwrap(), PhaseStatus::Running);
        assert_eq!(gateway.phase_status("query").await.unwrap(), PhaseStatus::Completed);
        gateway.move_to_next_phase().await.unwrap();
        assert_eq!(gateway.phase(), "upload");
    }
}
