//! SDC Installer - phased installation through the PowerFlex gateway
//!
//! Expanding a cluster with new SDC hosts follows the gateway's fixed
//! sequence:
//!
//! ```text
//! parse CSV ─▶ reset queue ─▶ validate MDM ─▶ begin install
//!                                               │
//!     ┌─────────────────────────────────────────┘
//!     ▼
//!   query ─▶ upload ─▶ install ─▶ configure ─▶ reset queue
//! ```
//!
//! Each phase is polled until its commands complete. Too many consecutive
//! `Running` polls abort the installation; the gateway queue is always reset
//! to idle before the timeout is reported.

use crate::config::InstallerConfig;
use crate::domain::ports::{
    ClusterApi, GatewayApi, GatewayResponse, InstallationRequest, MdmValidation, PerformanceProfile,
    PhaseStatus, SecurityConfiguration,
};
use crate::error::{Error, Result};
use crate::reconciler::{Reconciler, SdcDesired, SdcObserved, SdcReconciler};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// CSV header expected by the gateway
pub const CSV_HEADER: &str = "IPs,Username,Password,Operating System,Is MDM/TB,Is SDC,perfProfileForSDC";

// =============================================================================
// Installation Plan
// =============================================================================

/// One host of the cluster topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcHost {
    pub ip: String,
    #[serde(default)]
    pub username: String,
    /// Hosts without a password are already installed and left out of the CSV
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_os")]
    pub operating_system: String,
    /// `Primary`, `Secondary`, `TB` or empty
    #[serde(default)]
    pub is_mdm_or_tb: String,
    #[serde(default)]
    pub is_sdc: bool,
    #[serde(default)]
    pub performance_profile: Option<PerformanceProfile>,
    /// Name to give the SDC once installed
    #[serde(default)]
    pub name: Option<String>,
}

fn default_os() -> String {
    "linux".to_string()
}

/// Hosts plus the credentials needed to install on them
#[derive(Clone, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub hosts: Vec<SdcHost>,
    pub mdm_password: String,
    pub lia_password: String,
}

impl std::fmt::Debug for InstallationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationPlan")
            .field("hosts", &self.hosts.iter().map(|h| &h.ip).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl InstallationPlan {
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::validation("installation plan has no hosts"));
        }
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.ip.trim().is_empty() {
                return Err(Error::validation("host IP must not be empty"));
            }
            if !seen.insert(host.ip.as_str()) {
                return Err(Error::validation(format!("host {} is listed twice", host.ip)));
            }
        }
        if self.mdm_password.is_empty() {
            return Err(Error::validation("MDM password is required"));
        }
        if self.lia_password.is_empty() {
            return Err(Error::validation("LIA password is required"));
        }
        Ok(())
    }

    /// IPs of hosts that should run an SDC
    pub fn sdc_ips(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.is_sdc)
            .map(|h| h.ip.clone())
            .collect()
    }
}

/// Quote a CSV field when it holds a separator, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render the topology CSV uploaded to the gateway
pub fn build_csv(hosts: &[SdcHost]) -> String {
    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    for host in hosts.iter().filter(|h| !h.password.is_empty()) {
        let profile = match host.performance_profile {
            Some(PerformanceProfile::HighPerformance) => "High",
            Some(PerformanceProfile::Compact) => "Compact",
            None => "",
        };
        let row = [
            host.ip.as_str(),
            host.username.as_str(),
            host.password.as_str(),
            host.operating_system.as_str(),
            host.is_mdm_or_tb.as_str(),
            if host.is_sdc { "Yes" } else { "No" },
            profile,
        ];
        let line = row.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
        csv.push_str(&line);
        csv.push('\n');
    }
    csv
}

/// IP of the primary MDM
pub fn primary_mdm_ip(hosts: &[SdcHost]) -> Result<String> {
    hosts
        .iter()
        .find(|h| h.is_mdm_or_tb.eq_ignore_ascii_case("primary"))
        .map(|h| h.ip.clone())
        .ok_or_else(|| Error::validation("no host is marked as the primary MDM"))
}

/// Whether any requested SDC IP is not installed yet
pub fn needs_installation(requested: &[String], installed: &[String]) -> bool {
    let installed: HashSet<&str> = installed.iter().map(|s| s.trim()).collect();
    requested
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .any(|ip| !installed.contains(ip))
}

// =============================================================================
// Phases
// =============================================================================

/// Installer phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerPhase {
    Query,
    Upload,
    Install,
    Configure,
}

impl InstallerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallerPhase::Query => "query",
            InstallerPhase::Upload => "upload",
            InstallerPhase::Install => "install",
            InstallerPhase::Configure => "configure",
        }
    }

    /// The following phase; `None` after configure
    pub fn next(self) -> Option<Self> {
        match self {
            InstallerPhase::Query => Some(InstallerPhase::Upload),
            InstallerPhase::Upload => Some(InstallerPhase::Install),
            InstallerPhase::Install => Some(InstallerPhase::Configure),
            InstallerPhase::Configure => None,
        }
    }
}

impl std::fmt::Display for InstallerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn require_success(phase: &str, step: &str, response: GatewayResponse) -> Result<GatewayResponse> {
    if response.is_success() {
        return Ok(response);
    }
    Err(Error::Installer {
        phase: phase.to_string(),
        message: format!(
            "{} returned status {}: {}",
            step, response.status_code, response.message
        ),
    })
}

// =============================================================================
// Gateway Operations
// =============================================================================

/// Abort running commands, clear the queue and return the gateway to idle
pub async fn reset_queue(gateway: &dyn GatewayApi) -> Result<()> {
    require_success("reset", "abort", gateway.abort_operation().await?)?;
    require_success("reset", "clear queue", gateway.clear_queue().await?)?;
    require_success("reset", "move to idle", gateway.move_to_idle_phase().await?)?;
    info!("Gateway installer queue reset to idle");
    Ok(())
}

/// Start an installation from a parsed topology and walk it through every phase
pub async fn run_installation(
    gateway: &dyn GatewayApi,
    config: &InstallerConfig,
    topology: &str,
    plan: &InstallationPlan,
) -> Result<()> {
    let request = InstallationRequest {
        topology: topology.to_string(),
        mdm_user: config.mdm_user.clone(),
        mdm_password: plan.mdm_password.clone(),
        lia_password: plan.lia_password.clone(),
    };
    require_success("begin", "begin installation", gateway.begin_installation(&request).await?)?;

    let mut phase = InstallerPhase::Query;
    let mut running_polls = 0u32;
    info!("Gateway installation started, phase {}", phase);

    loop {
        tokio::time::sleep(config.poll_interval).await;

        match gateway.phase_status(phase.as_str()).await? {
            PhaseStatus::Completed => {
                running_polls = 0;
                let Some(next) = phase.next() else {
                    reset_queue(gateway).await?;
                    info!("Gateway installation completed");
                    return Ok(());
                };
                require_success(phase.as_str(), "move to next phase", gateway.move_to_next_phase().await?)?;
                info!("Gateway installation phase changed to {}", next);
                phase = next;
            }
            PhaseStatus::Running => {
                running_polls += 1;
                info!(
                    "Gateway installation phase {} still running ({}/{})",
                    phase, running_polls, config.max_running_polls
                );
                if running_polls >= config.max_running_polls {
                    reset_queue(gateway).await?;
                    return Err(Error::InstallerTimeout {
                        phase: phase.to_string(),
                        polls: running_polls,
                    });
                }
            }
            PhaseStatus::Failed(message) => {
                if let Err(e) = reset_queue(gateway).await {
                    warn!("Queue reset after failed phase {} did not succeed: {}", phase, e);
                }
                return Err(Error::Installer {
                    phase: phase.to_string(),
                    message,
                });
            }
        }
    }
}

/// Result of an expansion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionOutcome {
    /// SDC IPs the plan asked for
    pub sdc_ips: Vec<String>,
    /// Whether an installation was run, as opposed to every SDC already being present
    pub installed: bool,
}

/// Install SDCs on every plan host that does not run one yet
pub async fn expand(
    gateway: &dyn GatewayApi,
    config: &InstallerConfig,
    plan: &InstallationPlan,
) -> Result<ExpansionOutcome> {
    config.validate()?;
    plan.validate()?;

    let sdc_ips = plan.sdc_ips();
    if sdc_ips.is_empty() {
        info!("No SDC hosts in plan, nothing to install");
        return Ok(ExpansionOutcome {
            sdc_ips,
            installed: false,
        });
    }
    let mdm_ip = primary_mdm_ip(&plan.hosts)?;

    let csv = build_csv(&plan.hosts);
    let parsed = require_success("parse", "parse CSV", gateway.parse_csv(&csv).await?)?;
    info!("Installation CSV parsed");

    // The gateway must be idle before a new installation starts
    reset_queue(gateway).await?;

    let validation = MdmValidation {
        mdm_user: config.mdm_user.clone(),
        mdm_password: plan.mdm_password.clone(),
        mdm_ips: vec![mdm_ip],
        security_configuration: SecurityConfiguration::default(),
    };
    let validated = require_success("validate", "validate MDM", gateway.validate_mdm(&validation).await?)?;
    info!("MDM credentials validated");

    let installed_ips: Vec<String> = validated.data.split(',').map(str::to_string).collect();
    if !needs_installation(&sdc_ips, &installed_ips) {
        info!("All requested SDCs are already installed");
        return Ok(ExpansionOutcome {
            sdc_ips,
            installed: false,
        });
    }

    run_installation(gateway, config, &parsed.data, plan).await?;
    Ok(ExpansionOutcome {
        sdc_ips,
        installed: true,
    })
}

/// Expand the cluster, then adopt every SDC host and apply its name and profile
pub async fn expand_and_adopt(
    api: &dyn ClusterApi,
    gateway: &dyn GatewayApi,
    config: &InstallerConfig,
    plan: &InstallationPlan,
) -> Result<Vec<SdcObserved>> {
    expand(gateway, config, plan).await?;

    let mut adopted = Vec::new();
    for host in plan.hosts.iter().filter(|h| h.is_sdc) {
        let desired = SdcDesired {
            ip: Some(host.ip.clone()),
            name: host.name.clone(),
            performance_profile: host.performance_profile,
            ..Default::default()
        };
        adopted.push(SdcReconciler.create(api, &desired).await?);
    }
    Ok(adopted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryCluster, MemoryGateway};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn host(ip: &str, role: &str, is_sdc: bool) -> SdcHost {
        SdcHost {
            ip: ip.into(),
            username: "root".into(),
            password: "Password123".into(),
            operating_system: "linux".into(),
            is_mdm_or_tb: role.into(),
            is_sdc,
            performance_profile: None,
            name: None,
        }
    }

    fn plan() -> InstallationPlan {
        let mut sdc = host("10.0.0.4", "", true);
        sdc.performance_profile = Some(PerformanceProfile::HighPerformance);
        sdc.name = Some("host-d".into());
        InstallationPlan {
            hosts: vec![
                host("10.0.0.1", "Primary", false),
                host("10.0.0.2", "Secondary", false),
                host("10.0.0.3", "TB", false),
                sdc,
            ],
            mdm_password: "MdmPassword1".into(),
            lia_password: "LiaPassword1".into(),
        }
    }

    fn fast() -> InstallerConfig {
        InstallerConfig {
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_csv() {
        let mut hosts = plan().hosts;
        hosts[1].password.clear();
        let csv = build_csv(&hosts);
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "10.0.0.1,root,Password123,linux,Primary,No,");
        assert_eq!(lines[3], "10.0.0.4,root,Password123,linux,,Yes,High");
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("pa,ss"), "\"pa,ss\"");
        assert_eq!(csv_field("pa\"ss"), "\"pa\"\"ss\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn test_primary_mdm_ip() {
        assert_eq!(primary_mdm_ip(&plan().hosts).unwrap(), "10.0.0.1");
        assert_matches!(primary_mdm_ip(&plan().hosts[1..]), Err(Error::Validation(_)));
    }

    #[test]
    fn test_needs_installation() {
        let installed = vec!["10.0.0.4".to_string(), "10.0.0.5".to_string()];
        assert!(!needs_installation(&["10.0.0.4".to_string()], &installed));
        assert!(needs_installation(&["10.0.0.6".to_string()], &installed));
        assert!(needs_installation(&["10.0.0.4".to_string()], &[String::new()]));
    }

    #[test]
    fn test_phase_order() {
        let mut phases = vec![InstallerPhase::Query];
        while let Some(next) = phases.last().and_then(|p| p.next()) {
            phases.push(next);
        }
        assert_eq!(
            phases.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            vec!["query", "upload", "install", "configure"]
        );
    }

    #[tokio::test]
    async fn test_expand_runs_all_phases() {
        let gateway = MemoryGateway::new();
        gateway.script_phases([PhaseStatus::Running, PhaseStatus::Completed]);

        let outcome = expand(&gateway, &fast(), &plan()).await.unwrap();
        assert!(outcome.installed);
        assert_eq!(outcome.sdc_ips, vec!["10.0.0.4"]);
        assert_eq!(gateway.phase(), "idle");

        let calls = gateway.calls();
        let polls: Vec<&str> = calls
            .iter()
            .filter(|c| c.starts_with("phase_status:"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            polls,
            vec![
                "phase_status:query",
                "phase_status:query",
                "phase_status:upload",
                "phase_status:install",
                "phase_status:configure",
            ]
        );
        assert!(gateway.uploaded_csv().unwrap().starts_with(CSV_HEADER));
    }

    #[tokio::test]
    async fn test_running_too_long_times_out_and_resets() {
        let gateway = MemoryGateway::new();
        gateway.script_phases(std::iter::repeat(PhaseStatus::Running).take(5));

        let result = expand(&gateway, &fast(), &plan()).await;
        assert_matches!(
            result,
            Err(Error::InstallerTimeout { ref phase, polls: 5 }) if phase == "query"
        );
        assert_eq!(gateway.phase(), "idle");

        let calls = gateway.calls();
        let tail: Vec<&str> = calls[calls.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["abort_operation", "clear_queue", "move_to_idle_phase"]);
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_running_counter_resets_between_phases() {
        let gateway = MemoryGateway::new();
        let mut script = vec![PhaseStatus::Running; 4];
        script.push(PhaseStatus::Completed);
        script.extend(vec![PhaseStatus::Running; 4]);
        gateway.script_phases(script);

        let outcome = expand(&gateway, &fast(), &plan()).await.unwrap();
        assert!(outcome.installed);
    }

    #[tokio::test]
    async fn test_failed_phase() {
        let gateway = MemoryGateway::new();
        gateway.script_phases([
            PhaseStatus::Completed,
            PhaseStatus::Failed("upload of packages failed".into()),
        ]);

        assert_matches!(
            expand(&gateway, &fast(), &plan()).await,
            Err(Error::Installer { ref phase, .. }) if phase == "upload"
        );
        assert_eq!(gateway.phase(), "idle");
    }

    #[tokio::test]
    async fn test_already_installed_skips_installation() {
        let gateway = MemoryGateway::new();
        gateway.set_installed_ips(&["10.0.0.4"]);

        let outcome = expand(&gateway, &fast(), &plan()).await.unwrap();
        assert!(!outcome.installed);
        assert!(!gateway.calls().iter().any(|c| c == "begin_installation"));
    }

    #[tokio::test]
    async fn test_rejected_validation() {
        let gateway = MemoryGateway::new();
        gateway.fail_on("validate_mdm", "bad MDM password");

        assert_matches!(
            expand(&gateway, &fast(), &plan()).await,
            Err(Error::RemoteRejected { .. })
        );
        assert!(!gateway.calls().iter().any(|c| c == "begin_installation"));
    }

    #[tokio::test]
    async fn test_expand_and_adopt() {
        let gateway = MemoryGateway::new();
        let cluster = MemoryCluster::new();
        // the installed SDC registers itself with the cluster
        let id = cluster.add_sdc("10.0.0.4", None);

        let adopted = expand_and_adopt(&cluster, &gateway, &fast(), &plan()).await.unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].id, id);
        assert_eq!(adopted[0].name.as_deref(), Some("host-d"));
        assert_eq!(adopted[0].performance_profile, Some(PerformanceProfile::HighPerformance));
    }

    #[test]
    fn test_plan_validation() {
        let mut bad = plan();
        bad.hosts.push(host("10.0.0.1", "", true));
        assert_matches!(bad.validate(), Err(Error::Validation(_)));

        let mut bad = plan();
        bad.lia_password.clear();
        assert_matches!(bad.validate(), Err(Error::Validation(_)));
    }
}
