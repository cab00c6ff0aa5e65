//! PowerFlex Installer Gateway Adapter
//!
//! Drives the installation manager under `/im`. Every request carries the
//! gateway credentials as basic auth. HTTP level rejections are returned as a
//! non-success [`GatewayResponse`] so the installer can report the phase it
//! was in; only transport failures are errors here.

use crate::config::ClientConfig;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

/// Command states that mean a phase has not finished
const PENDING_STATES: [&str; 2] = ["pending", "running"];

/// Installer gateway client
pub struct RestGateway {
    base_url: String,
    config: ClientConfig,
    client: Client,
}

impl RestGateway {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.base_url()?.as_str().trim_end_matches('/').to_string();
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            config,
            client,
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Send a request and fold the reply into a [`GatewayResponse`]
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<GatewayResponse> {
        debug!("gateway {}", operation);
        let response = request.send().await.map_err(|e| Error::TransportFailure {
            operation: operation.to_string(),
            target: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| Error::TransportFailure {
            operation: operation.to_string(),
            target: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        if status.is_success() {
            return Ok(GatewayResponse {
                status_code: 200,
                message: String::new(),
                data: body,
            });
        }
        Ok(GatewayResponse {
            status_code: status.as_u16(),
            message: error_message(&body),
            data: String::new(),
        })
    }
}

/// Pull the `message` out of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Installed SDC IPs from an MDM validation reply, comma separated
fn installed_sdc_ips(body: &str) -> Result<String> {
    let reply: Value = serde_json::from_str(body)?;
    let ips = reply
        .get("sdcIps")
        .and_then(Value::as_array)
        .map(|ips| {
            ips.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    Ok(ips)
}

/// Status of one phase from the command queue listing
///
/// The listing maps phase names to command lists. A failed command fails
/// the phase; a pending or running one keeps it running.
pub fn phase_status_from_commands(phase: &str, listing: &Value) -> PhaseStatus {
    let commands = listing
        .as_object()
        .and_then(|phases| {
            phases
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(phase))
                .map(|(_, commands)| commands)
        })
        .and_then(Value::as_array);

    let Some(commands) = commands else {
        return PhaseStatus::Completed;
    };

    let mut running = false;
    for command in commands {
        let state = command
            .get("commandState")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if state == "failed" {
            let message = command
                .get("message")
                .or_else(|| command.get("commandName"))
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string();
            return PhaseStatus::Failed(message);
        }
        if PENDING_STATES.contains(&state.as_str()) {
            running = true;
        }
    }
    if running {
        PhaseStatus::Running
    } else {
        PhaseStatus::Completed
    }
}

#[async_trait]
impl GatewayApi for RestGateway {
    async fn parse_csv(&self, csv: &str) -> Result<GatewayResponse> {
        let part = Part::text(csv.to_string())
            .file_name("Minimal.csv")
            .mime_str("text/csv")
            .map_err(|e| Error::Internal(format!("invalid CSV part: {e}")))?;
        let form = Form::new().part("file", part);
        let request = self
            .post("/im/types/Configuration/instances/actions/parseFromCSV")
            .multipart(form);
        self.send("parse_csv", request).await
    }

    async fn validate_mdm(&self, validation: &MdmValidation) -> Result<GatewayResponse> {
        let request = self.post("/im/types/Configuration/instances").json(validation);
        let mut response = self.send("validate_mdm", request).await?;
        if response.is_success() {
            response.data = installed_sdc_ips(&response.data)?;
        }
        Ok(response)
    }

    async fn begin_installation(&self, installation: &InstallationRequest) -> Result<GatewayResponse> {
        let mut topology: Value = serde_json::from_str(&installation.topology)?;
        let Some(fields) = topology.as_object_mut() else {
            return Err(Error::Installer {
                phase: "begin".into(),
                message: "parsed topology is not an object".into(),
            });
        };
        fields.insert("mdmUser".into(), json!(installation.mdm_user));
        fields.insert("mdmPassword".into(), json!(installation.mdm_password));
        fields.insert("liaPassword".into(), json!(installation.lia_password));
        fields.insert("liaLdapInitialMode".into(), json!("NATIVE_AUTHENTICATION"));

        let request = self
            .post("/im/types/Configuration/actions/install")
            .query(&[
                ("noUpload", "false"),
                ("noInstall", "false"),
                ("noConfigure", "false"),
                ("noLinuxDevValidation", "false"),
                ("globalZeroPadPolicy", "false"),
                ("extend", "true"),
            ])
            .json(&topology);
        self.send("begin_installation", request).await
    }

    async fn phase_status(&self, phase: &str) -> Result<PhaseStatus> {
        let response = self
            .send("phase_status", self.get("/im/types/Command/instances"))
            .await?;
        if !response.is_success() {
            return Ok(PhaseStatus::Failed(response.message));
        }
        let listing: Value = serde_json::from_str(&response.data)?;
        Ok(phase_status_from_commands(phase, &listing))
    }

    async fn move_to_next_phase(&self) -> Result<GatewayResponse> {
        self.send(
            "move_to_next_phase",
            self.post("/im/types/ProcessPhase/actions/moveToNextPhase"),
        )
        .await
    }

    async fn abort_operation(&self) -> Result<GatewayResponse> {
        self.send(
            "abort_operation",
            self.post("/im/types/Command/instances/actions/abort"),
        )
        .await
    }

    async fn clear_queue(&self) -> Result<GatewayResponse> {
        self.send(
            "clear_queue",
            self.post("/im/types/Command/instances/actions/clear"),
        )
        .await
    }

    async fn move_to_idle_phase(&self) -> Result<GatewayResponse> {
        self.send(
            "move_to_idle_phase",
            self.post("/im/types/ProcessPhase/actions/moveToIdlePhase"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_status_from_commands() {
        let listing = json!({
            "query": [{"commandState": "succeeded"}],
            "install": [
                {"commandState": "succeeded"},
                {"commandState": "running"}
            ],
            "configure": [
                {"commandState": "failed", "message": "LIA unreachable on 10.0.0.3"}
            ]
        });

        assert_eq!(phase_status_from_commands("query", &listing), PhaseStatus::Completed);
        assert_eq!(phase_status_from_commands("Install", &listing), PhaseStatus::Running);
        assert_eq!(
            phase_status_from_commands("configure", &listing),
            PhaseStatus::Failed("LIA unreachable on 10.0.0.3".into())
        );
        assert_eq!(phase_status_from_commands("upload", &listing), PhaseStatus::Completed);
    }

    #[test]
    fn test_installed_sdc_ips() {
        let ips = installed_sdc_ips(r#"{"mdmIps":["10.0.0.1"],"sdcIps":["10.0.0.2","10.0.0.3"]}"#).unwrap();
        assert_eq!(ips, "10.0.0.2,10.0.0.3");
        assert_eq!(installed_sdc_ips("{}").unwrap(), "");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"message":"bad password"}"#), "bad password");
        assert_eq!(error_message("Unauthorized\n"), "Unauthorized");
    }
}
