//! PowerFlex REST Adapter
//!
//! Talks to the management API under `/api`. A session starts with
//! `GET /api/login` using the configured credentials; the returned token is
//! then sent as the basic-auth password of every request. An expired token is
//! refreshed once per request.

use crate::config::ClientConfig;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Error body returned by the management API
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_code: Option<i64>,
}

/// Reply of create calls
#[derive(Debug, Deserialize)]
struct CreatedId {
    id: String,
}

/// Reply of the `snapshotVolumes` action
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotVolumesReply {
    volume_id_list: Vec<String>,
}

/// The management API answers some lookups of unknown ids with a 500
fn reports_missing(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("could not find") || message.contains("not found")
}

fn transport(operation: &str, target: &str, e: reqwest::Error) -> Error {
    let reason = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    Error::TransportFailure {
        operation: operation.to_string(),
        target: target.to_string(),
        reason,
    }
}

/// Names the remote entity a request is about
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    kind: &'a str,
    id: &'a str,
}

impl std::fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.kind, self.id)
    }
}

// =============================================================================
// REST Cluster
// =============================================================================

/// Management API client
pub struct RestCluster {
    base_url: String,
    config: ClientConfig,
    client: Client,
    token: RwLock<Option<String>>,
}

impl RestCluster {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.base_url()?.as_str().trim_end_matches('/').to_string();
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        debug!("PowerFlex client initialized with endpoint {}", base_url);
        Ok(Self {
            base_url,
            config,
            client,
            token: RwLock::new(None),
        })
    }

    /// Open a session, replacing any previous token
    pub async fn login(&self) -> Result<()> {
        let target = "login";
        let response = self
            .client
            .get(format!("{}/api/login", self.base_url))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| transport("login", target, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::RemoteRejected {
                operation: "login".into(),
                target: self.config.username.clone(),
                status: status.as_u16(),
                message: body.message,
            });
        }
        let token: String = response
            .json()
            .await
            .map_err(|e| transport("login", target, e))?;
        *self.token.write() = Some(token);
        info!("Logged in to {} as {}", self.base_url, self.config.username);
        Ok(())
    }

    async fn token(&self) -> Result<String> {
        let cached = self.token.read().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        self.login().await?;
        self.token
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("login produced no token".into()))
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        op: &str,
        target: Target<'_>,
    ) -> Result<Response> {
        let token = self.token().await?;
        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .basic_auth(&self.config.username, Some(token));
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| transport(op, &target.to_string(), e))
    }

    /// Send a request and turn error statuses into errors
    async fn execute(
        &self,
        op: &str,
        target: Target<'_>,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response> {
        debug!("{} {} ({} on {})", method, path, op, target);
        let mut response = self.send_once(&method, path, body, op, target).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("Session token rejected, logging in again");
            *self.token.write() = None;
            response = self.send_once(&method, path, body, op, target).await?;
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = error_body(response).await;
        if status == StatusCode::NOT_FOUND || (status.is_server_error() && reports_missing(&body.message)) {
            return Err(Error::not_found(target.kind, target.id));
        }
        debug!("{} rejected with error code {:?}", op, body.error_code);
        Err(Error::RemoteRejected {
            operation: op.to_string(),
            target: target.to_string(),
            status: status.as_u16(),
            message: body.message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, op: &str, target: Target<'_>, path: &str) -> Result<T> {
        let response = self.execute(op, target, Method::GET, path, None).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport(op, &target.to_string(), e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        op: &str,
        target: Target<'_>,
        path: &str,
        body: Value,
    ) -> Result<T> {
        let response = self.execute(op, target, Method::POST, path, Some(&body)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport(op, &target.to_string(), e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Invoke `/api/instances/<kind>::<id>/action/<action>`
    async fn action(&self, op: &str, kind: &str, id: &str, action: &str, body: Value) -> Result<()> {
        let path = format!("/api/instances/{kind}::{id}/action/{action}");
        self.execute(op, Target { kind, id }, Method::POST, &path, Some(&body))
            .await
            .map(|_| ())
    }

    async fn instance<T: DeserializeOwned>(&self, op: &str, kind: &str, id: &str) -> Result<T> {
        self.get_json(op, Target { kind, id }, &format!("/api/instances/{kind}::{id}"))
            .await
    }

    async fn instances<T: DeserializeOwned>(&self, op: &str, kind: &str) -> Result<Vec<T>> {
        self.get_json(op, Target { kind, id: "*" }, &format!("/api/types/{kind}/instances"))
            .await
    }
}

async fn error_body(response: Response) -> ApiErrorBody {
    let status = response.status();
    match response.bytes().await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| ApiErrorBody {
            message: String::from_utf8_lossy(&bytes).trim().to_string(),
            error_code: None,
        }),
        Err(_) => ApiErrorBody {
            message: status.to_string(),
            error_code: None,
        },
    }
}

fn flag(enabled: bool) -> &'static str {
    if enabled {
        "TRUE"
    } else {
        "FALSE"
    }
}

// =============================================================================
// Port Implementations
// =============================================================================

#[async_trait]
impl SystemApi for RestCluster {
    async fn list_systems(&self) -> Result<Vec<System>> {
        self.instances("list_systems", "System").await
    }
}

#[async_trait]
impl ProtectionDomainApi for RestCluster {
    async fn list_protection_domains(&self) -> Result<Vec<ProtectionDomain>> {
        self.instances("list_protection_domains", "ProtectionDomain").await
    }

    async fn get_protection_domain(&self, id: &str) -> Result<ProtectionDomain> {
        self.instance("get_protection_domain", "ProtectionDomain", id).await
    }
}

#[async_trait]
impl StoragePoolApi for RestCluster {
    async fn list_storage_pools(&self, protection_domain_id: &str) -> Result<Vec<StoragePool>> {
        let path = format!("/api/instances/ProtectionDomain::{protection_domain_id}/relationships/StoragePool");
        let target = Target {
            kind: "ProtectionDomain",
            id: protection_domain_id,
        };
        self.get_json("list_storage_pools", target, &path).await
    }

    async fn get_storage_pool(&self, id: &str) -> Result<StoragePool> {
        self.instance("get_storage_pool", "StoragePool", id).await
    }

    async fn create_storage_pool(&self, params: &StoragePoolParams) -> Result<String> {
        let body = json!({
            "name": params.name,
            "protectionDomainId": params.protection_domain_id,
            "mediaType": params.media_type,
            "useRmcache": flag(params.use_rmcache),
            "useRfcache": flag(params.use_rfcache),
        });
        let target = Target {
            kind: "StoragePool",
            id: &params.name,
        };
        let created: CreatedId = self
            .post_json("create_storage_pool", target, "/api/types/StoragePool/instances", body)
            .await?;
        Ok(created.id)
    }

    async fn set_storage_pool_name(&self, id: &str, name: &str) -> Result<()> {
        self.action("set_storage_pool_name", "StoragePool", id, "setStoragePoolName", json!({ "name": name }))
            .await
    }

    async fn set_storage_pool_media_type(&self, id: &str, media_type: MediaType) -> Result<()> {
        self.action(
            "set_storage_pool_media_type",
            "StoragePool",
            id,
            "setMediaType",
            json!({ "mediaType": media_type }),
        )
        .await
    }

    async fn set_storage_pool_rm_cache(&self, id: &str, enabled: bool) -> Result<()> {
        self.action(
            "set_storage_pool_rm_cache",
            "StoragePool",
            id,
            "setUseRmcache",
            json!({ "useRmcache": flag(enabled) }),
        )
        .await
    }

    async fn set_storage_pool_rf_cache(&self, id: &str, enabled: bool) -> Result<()> {
        let action = if enabled { "enableRfcache" } else { "disableRfcache" };
        self.action("set_storage_pool_rf_cache", "StoragePool", id, action, json!({}))
            .await
    }

    async fn delete_storage_pool(&self, id: &str) -> Result<()> {
        self.action("delete_storage_pool", "StoragePool", id, "removeStoragePool", json!({}))
            .await
    }
}

#[async_trait]
impl VolumeApi for RestCluster {
    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.instances("list_volumes", "Volume").await
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.instance("get_volume", "Volume", id).await
    }

    async fn create_volume(&self, params: &VolumeParams) -> Result<String> {
        let mut body = json!({
            "name": params.name,
            "protectionDomainId": params.protection_domain_id,
            "storagePoolId": params.storage_pool_id,
            "volumeSizeInKb": params.volume_size_in_kb.to_string(),
            "volumeType": params.volume_type,
            "useRmCache": params.use_rm_cache,
        });
        if let Some(method) = params.compression_method {
            body["compressionMethod"] = json!(method);
        }
        let target = Target {
            kind: "Volume",
            id: &params.name,
        };
        let created: CreatedId = self
            .post_json("create_volume", target, "/api/types/Volume/instances", body)
            .await?;
        Ok(created.id)
    }

    async fn snapshot_volume(&self, system_id: &str, params: &SnapshotParams) -> Result<String> {
        let mut body = json!({
            "snapshotDefs": [{
                "volumeId": params.volume_id,
                "snapshotName": params.snapshot_name,
            }],
            "accessModeLimit": params.access_mode,
        });
        if let Some(minutes) = params.retention_in_min {
            body["retentionPeriodInMin"] = json!(minutes.to_string());
        }
        let path = format!("/api/instances/System::{system_id}/action/snapshotVolumes");
        let target = Target {
            kind: "Volume",
            id: &params.volume_id,
        };
        let reply: SnapshotVolumesReply = self.post_json("snapshot_volume", target, &path, body).await?;
        reply
            .volume_id_list
            .into_iter()
            .next()
            .ok_or_else(|| Error::RemoteRejected {
                operation: "snapshot_volume".into(),
                target: target.to_string(),
                status: 200,
                message: "no snapshot id returned".into(),
            })
    }

    async fn set_volume_name(&self, id: &str, name: &str) -> Result<()> {
        self.action("set_volume_name", "Volume", id, "setVolumeName", json!({ "newName": name }))
            .await
    }

    async fn set_volume_size_gb(&self, id: &str, size_gb: u64) -> Result<()> {
        self.action(
            "set_volume_size",
            "Volume",
            id,
            "setVolumeSize",
            json!({ "sizeInGB": size_gb.to_string() }),
        )
        .await
    }

    async fn set_volume_rm_cache(&self, id: &str, enabled: bool) -> Result<()> {
        self.action(
            "set_volume_rm_cache",
            "Volume",
            id,
            "setVolumeRmcacheUsage",
            json!({ "useRmcache": flag(enabled) }),
        )
        .await
    }

    async fn set_volume_compression(&self, id: &str, method: CompressionMethod) -> Result<()> {
        self.action(
            "set_volume_compression",
            "Volume",
            id,
            "modifyCompressionMethod",
            json!({ "compressionMethod": method }),
        )
        .await
    }

    async fn set_volume_access_mode(&self, id: &str, mode: AccessMode) -> Result<()> {
        self.action(
            "set_volume_access_mode",
            "Volume",
            id,
            "setVolumeAccessModeLimit",
            json!({ "accessModeLimit": mode }),
        )
        .await
    }

    async fn set_auto_snapshot_lock(&self, id: &str, locked: bool) -> Result<()> {
        let action = if locked { "lockAutoSnapshot" } else { "unlockAutoSnapshot" };
        self.action("set_auto_snapshot_lock", "Volume", id, action, json!({}))
            .await
    }

    async fn set_snapshot_retention(&self, id: &str, retention_in_min: u64) -> Result<()> {
        self.action(
            "set_snapshot_retention",
            "Volume",
            id,
            "setSnapshotSecurity",
            json!({ "retentionPeriodInMin": retention_in_min.to_string() }),
        )
        .await
    }

    async fn map_volume_to_sdc(&self, id: &str, sdc_id: &str, mode: AccessMode) -> Result<()> {
        self.action(
            "map_volume_to_sdc",
            "Volume",
            id,
            "addMappedSdc",
            json!({ "sdcId": sdc_id, "accessMode": mode, "allowMultipleMappings": "TRUE" }),
        )
        .await
    }

    async fn unmap_volume_from_sdc(&self, id: &str, sdc_id: &str) -> Result<()> {
        self.action(
            "unmap_volume_from_sdc",
            "Volume",
            id,
            "removeMappedSdc",
            json!({ "sdcId": sdc_id }),
        )
        .await
    }

    async fn set_mapped_sdc_limits(
        &self,
        id: &str,
        sdc_id: &str,
        limit_iops: u64,
        limit_bw_in_mbps: u64,
    ) -> Result<()> {
        let bandwidth_kbps = limit_bw_in_mbps.checked_mul(1024).ok_or_else(|| {
            Error::validation(format!("bandwidth limit {limit_bw_in_mbps} MB/s overflows"))
        })?;
        self.action(
            "set_mapped_sdc_limits",
            "Volume",
            id,
            "setMappedSdcLimits",
            json!({
                "sdcId": sdc_id,
                "iopsLimit": limit_iops.to_string(),
                "bandwidthLimitInKbps": bandwidth_kbps.to_string(),
            }),
        )
        .await
    }

    async fn delete_volume(&self, id: &str, mode: RemoveMode) -> Result<()> {
        self.action("delete_volume", "Volume", id, "removeVolume", json!({ "removeMode": mode }))
            .await
    }
}

#[async_trait]
impl SdcApi for RestCluster {
    async fn list_sdcs(&self) -> Result<Vec<Sdc>> {
        self.instances("list_sdcs", "Sdc").await
    }

    async fn get_sdc(&self, id: &str) -> Result<Sdc> {
        self.instance("get_sdc", "Sdc", id).await
    }

    async fn set_sdc_name(&self, id: &str, name: &str) -> Result<()> {
        self.action("set_sdc_name", "Sdc", id, "setSdcName", json!({ "sdcName": name }))
            .await
    }

    async fn set_sdc_performance_profile(&self, id: &str, profile: PerformanceProfile) -> Result<()> {
        self.action(
            "set_sdc_performance_profile",
            "Sdc",
            id,
            "setSdcPerformanceParameters",
            json!({ "perfProfile": profile }),
        )
        .await
    }

    async fn delete_sdc(&self, id: &str) -> Result<()> {
        self.action("delete_sdc", "Sdc", id, "removeSdc", json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_new_validates_config() {
        assert_matches!(
            RestCluster::new(ClientConfig::default()).err(),
            Some(Error::Configuration(_))
        );
        let cluster = RestCluster::new(ClientConfig::new("https://10.0.0.5/", "admin", "secret")).unwrap();
        assert_eq!(cluster.base_url, "https://10.0.0.5");
    }

    #[test]
    fn test_missing_message_detection() {
        assert!(reports_missing("Could not find the volume"));
        assert!(reports_missing("SDC not found"));
        assert!(!reports_missing("Volume name already in use"));
    }

    #[test]
    fn test_error_body_format() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"message":"Volume name already in use","httpStatusCode":500,"errorCode":6}"#)
                .unwrap();
        assert_eq!(body.message, "Volume name already in use");
        assert_eq!(body.error_code, Some(6));
    }

    #[test]
    fn test_snapshot_reply_format() {
        let reply: SnapshotVolumesReply =
            serde_json::from_str(r#"{"volumeIdList":["e3d01ba200000009"],"snapshotGroupId":"g1"}"#).unwrap();
        assert_eq!(reply.volume_id_list, vec!["e3d01ba200000009"]);
    }

    #[tokio::test]
    async fn test_bandwidth_limit_overflow_rejected_before_request() {
        let cluster = RestCluster::new(ClientConfig::new("https://10.0.0.5", "admin", "secret")).unwrap();
        assert_matches!(
            cluster.set_mapped_sdc_limits("v1", "s1", 0, u64::MAX).await,
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn test_target_display() {
        let target = Target { kind: "Volume", id: "v1" };
        assert_eq!(target.to_string(), "Volume::v1");
    }
}
