//! Domain Ports - Remote API boundaries of the reconciler
//!
//! These traits define the boundary between the reconciliation logic and the
//! PowerFlex management and gateway APIs. Adapters implement them; every
//! reconciler operation receives the adapter explicitly.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Enumerations
// =============================================================================

/// Provisioning type of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    #[default]
    ThinProvisioned,
    ThickProvisioned,
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeType::ThinProvisioned => write!(f, "ThinProvisioned"),
            VolumeType::ThickProvisioned => write!(f, "ThickProvisioned"),
        }
    }
}

/// Access mode limit of a volume, snapshot or SDC mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    NoAccess,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWrite => write!(f, "ReadWrite"),
            AccessMode::ReadOnly => write!(f, "ReadOnly"),
            AccessMode::NoAccess => write!(f, "NoAccess"),
        }
    }
}

/// Compression applied to a volume on a fine granularity pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    Normal,
}

/// Media type of a storage pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    HDD,
    SSD,
    Transitional,
}

/// How descendants are handled when a volume is removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoveMode {
    #[default]
    OnlyMe,
    IncludingDescendants,
}

/// SDC performance profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerformanceProfile {
    Compact,
    HighPerformance,
}

/// Storage pool data layout that supports compression
pub const FINE_GRANULARITY_LAYOUT: &str = "FineGranularity";

// =============================================================================
// Remote Records
// =============================================================================

/// A PowerFlex system (cluster)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Protection domain as returned by the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionDomain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_id: String,
    #[serde(default)]
    pub protection_domain_state: Option<String>,
}

/// Storage pool as returned by the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub protection_domain_id: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub use_rmcache: bool,
    #[serde(default)]
    pub use_rfcache: bool,
    #[serde(default)]
    pub data_layout: Option<String>,
}

/// Mapping of a volume to one SDC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedSdcInfo {
    pub sdc_id: String,
    #[serde(default)]
    pub sdc_ip: String,
    #[serde(default)]
    pub sdc_name: String,
    #[serde(default)]
    pub limit_iops: u64,
    #[serde(default)]
    pub limit_bw_in_mbps: u64,
    pub access_mode: AccessMode,
}

/// Volume (or snapshot) as returned by the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_in_kb: u64,
    pub storage_pool_id: String,
    #[serde(default)]
    pub vtree_id: String,
    pub volume_type: VolumeType,
    #[serde(default, rename = "useRmcache")]
    pub use_rm_cache: bool,
    #[serde(default)]
    pub compression_method: Option<CompressionMethod>,
    #[serde(default)]
    pub access_mode_limit: AccessMode,
    #[serde(default)]
    pub data_layout: Option<String>,
    #[serde(default)]
    pub ancestor_volume_id: Option<String>,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub secure_snapshot_exp_time: i64,
    #[serde(default)]
    pub locked_auto_snapshot: bool,
    #[serde(default)]
    pub mapped_sdc_info: Vec<MappedSdcInfo>,
}

/// SDC as returned by the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sdc {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sdc_ip: String,
    #[serde(default)]
    pub sdc_guid: String,
    #[serde(default)]
    pub sdc_approved: bool,
    #[serde(default, rename = "onVmWare")]
    pub on_vmware: bool,
    #[serde(default)]
    pub system_id: String,
    #[serde(default)]
    pub perf_profile: Option<PerformanceProfile>,
    #[serde(default)]
    pub mdm_connection_state: String,
}

// =============================================================================
// Create Parameters
// =============================================================================

/// Parameters to create a storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolParams {
    pub name: String,
    pub protection_domain_id: String,
    pub media_type: MediaType,
    pub use_rmcache: bool,
    pub use_rfcache: bool,
}

/// Parameters to create a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeParams {
    pub name: String,
    pub protection_domain_id: String,
    pub storage_pool_id: String,
    pub volume_size_in_kb: u64,
    pub volume_type: VolumeType,
    #[serde(rename = "useRmCache")]
    pub use_rm_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_method: Option<CompressionMethod>,
}

/// Parameters to snapshot a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotParams {
    pub volume_id: String,
    pub snapshot_name: String,
    pub access_mode: AccessMode,
    pub retention_in_min: Option<u64>,
}

// =============================================================================
// Management API Ports
// =============================================================================

/// System level queries
#[async_trait]
pub trait SystemApi: Send + Sync {
    /// List systems visible to the session
    async fn list_systems(&self) -> Result<Vec<System>>;
}

/// Protection domain queries
#[async_trait]
pub trait ProtectionDomainApi: Send + Sync {
    async fn list_protection_domains(&self) -> Result<Vec<ProtectionDomain>>;

    async fn get_protection_domain(&self, id: &str) -> Result<ProtectionDomain>;
}

/// Storage pool endpoints
#[async_trait]
pub trait StoragePoolApi: Send + Sync {
    /// Storage pools of one protection domain
    async fn list_storage_pools(&self, protection_domain_id: &str) -> Result<Vec<StoragePool>>;

    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool>;

    /// Create a storage pool, returning its id
    async fn create_storage_pool(&self, params: &StoragePoolParams) -> Result<String>;

    async fn set_storage_pool_name(&self, id: &str, name: &str) -> Result<()>;

    async fn set_storage_pool_media_type(&self, id: &str, media_type: MediaType) -> Result<()>;

    async fn set_storage_pool_rm_cache(&self, id: &str, enabled: bool) -> Result<()>;

    async fn set_storage_pool_rf_cache(&self, id: &str, enabled: bool) -> Result<()>;

    async fn delete_storage_pool(&self, id: &str) -> Result<()>;
}

/// Volume and snapshot endpoints
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    async fn get_volume(&self, id: &str) -> Result<Volume>;

    /// Create a volume, returning its id
    async fn create_volume(&self, params: &VolumeParams) -> Result<String>;

    /// Snapshot a volume, returning the snapshot id
    async fn snapshot_volume(&self, system_id: &str, params: &SnapshotParams) -> Result<String>;

    async fn set_volume_name(&self, id: &str, name: &str) -> Result<()>;

    async fn set_volume_size_gb(&self, id: &str, size_gb: u64) -> Result<()>;

    async fn set_volume_rm_cache(&self, id: &str, enabled: bool) -> Result<()>;

    async fn set_volume_compression(&self, id: &str, method: CompressionMethod) -> Result<()>;

    async fn set_volume_access_mode(&self, id: &str, mode: AccessMode) -> Result<()>;

    async fn set_auto_snapshot_lock(&self, id: &str, locked: bool) -> Result<()>;

    async fn set_snapshot_retention(&self, id: &str, retention_in_min: u64) -> Result<()>;

    async fn map_volume_to_sdc(&self, id: &str, sdc_id: &str, mode: AccessMode) -> Result<()>;

    async fn unmap_volume_from_sdc(&self, id: &str, sdc_id: &str) -> Result<()>;

    async fn set_mapped_sdc_limits(
        &self,
        id: &str,
        sdc_id: &str,
        limit_iops: u64,
        limit_bw_in_mbps: u64,
    ) -> Result<()>;

    async fn delete_volume(&self, id: &str, mode: RemoveMode) -> Result<()>;
}

/// SDC endpoints
#[async_trait]
pub trait SdcApi: Send + Sync {
    async fn list_sdcs(&self) -> Result<Vec<Sdc>>;

    async fn get_sdc(&self, id: &str) -> Result<Sdc>;

    async fn set_sdc_name(&self, id: &str, name: &str) -> Result<()>;

    async fn set_sdc_performance_profile(&self, id: &str, profile: PerformanceProfile) -> Result<()>;

    async fn delete_sdc(&self, id: &str) -> Result<()>;
}

/// The complete management API
pub trait ClusterApi:
    SystemApi + ProtectionDomainApi + StoragePoolApi + VolumeApi + SdcApi
{
}

impl<T> ClusterApi for T where
    T: SystemApi + ProtectionDomainApi + StoragePoolApi + VolumeApi + SdcApi
{
}

// =============================================================================
// Installer Gateway Port
// =============================================================================

/// Generic gateway reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: String,
}

impl GatewayResponse {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            message: String::new(),
            data: data.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Completion state of the current installer phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    Running,
    Failed(String),
}

/// MDM credential validation request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MdmValidation {
    pub mdm_user: String,
    pub mdm_password: String,
    pub mdm_ips: Vec<String>,
    pub security_configuration: SecurityConfiguration,
}

/// Security options sent with MDM validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfiguration {
    pub allow_non_secure_communication_with_mdm: bool,
    pub allow_non_secure_communication_with_lia: bool,
    pub disable_non_mgmt_components_auth: bool,
}

impl Default for SecurityConfiguration {
    fn default() -> Self {
        Self {
            allow_non_secure_communication_with_mdm: true,
            allow_non_secure_communication_with_lia: true,
            disable_non_mgmt_components_auth: false,
        }
    }
}

/// Request to start an installation from a parsed topology
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationRequest {
    /// Topology returned by the CSV parse step
    pub topology: String,
    pub mdm_user: String,
    pub mdm_password: String,
    pub lia_password: String,
}

/// Installer gateway endpoints
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Upload an installation CSV; `data` of the reply carries the parsed topology
    async fn parse_csv(&self, csv: &str) -> Result<GatewayResponse>;

    /// Validate MDM credentials; `data` of the reply lists installed SDC IPs comma separated
    async fn validate_mdm(&self, request: &MdmValidation) -> Result<GatewayResponse>;

    async fn begin_installation(&self, request: &InstallationRequest) -> Result<GatewayResponse>;

    async fn phase_status(&self, phase: &str) -> Result<PhaseStatus>;

    async fn move_to_next_phase(&self) -> Result<GatewayResponse>;

    async fn abort_operation(&self) -> Result<GatewayResponse>;

    async fn clear_queue(&self) -> Result<GatewayResponse>;

    async fn move_to_idle_phase(&self) -> Result<GatewayResponse>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type GatewayApiRef = Arc<dyn GatewayApi>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_wire_format() {
        let json = r#"{
            "id": "a1b2",
            "name": "vol1",
            "sizeInKb": 8388608,
            "storagePoolId": "p1",
            "vtreeId": "t1",
            "volumeType": "ThinProvisioned",
            "useRmcache": true,
            "accessModeLimit": "ReadOnly",
            "mappedSdcInfo": [
                {"sdcId": "s1", "sdcIp": "10.0.0.1", "limitIops": 100, "limitBwInMbps": 10, "accessMode": "ReadWrite"}
            ]
        }"#;
        let volume: Volume = serde_json::from_str(json).unwrap();
        assert_eq!(volume.size_in_kb, 8 * 1024 * 1024);
        assert!(volume.use_rm_cache);
        assert_eq!(volume.access_mode_limit, AccessMode::ReadOnly);
        assert_eq!(volume.mapped_sdc_info[0].limit_iops, 100);
        assert_eq!(volume.compression_method, None);
    }

    #[test]
    fn test_sdc_wire_format() {
        let json = r#"{"id": "s1", "sdcIp": "10.0.0.1", "onVmWare": true, "perfProfile": "HighPerformance"}"#;
        let sdc: Sdc = serde_json::from_str(json).unwrap();
        assert!(sdc.on_vmware);
        assert_eq!(sdc.perf_profile, Some(PerformanceProfile::HighPerformance));
        assert_eq!(sdc.name, None);
    }

    #[test]
    fn test_remove_mode_wire_format() {
        assert_eq!(
            serde_json::to_string(&RemoveMode::IncludingDescendants).unwrap(),
            "\"INCLUDING_DESCENDANTS\""
        );
        assert_eq!(serde_json::to_string(&RemoveMode::OnlyMe).unwrap(), "\"ONLY_ME\"");
    }
}
