//! PowerFlex Reconciler CLI
//!
//! Inspects a PowerFlex cluster through the same reconcilers a lifecycle
//! driver uses, and expands it with new SDC hosts.
//!
//! ```text
//! powerflex-reconciler systems
//! powerflex-reconciler show volume 457752ff000000c7
//! powerflex-reconciler sdcs --name host-a
//! powerflex-reconciler expand --plan hosts.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use powerflex_reconciler::{
    expand_and_adopt, query_sdcs, BackendFactory, ClientConfig, ClusterApi, Error, InstallationPlan,
    InstallerConfig, Reconciler, Result, SdcQuery, SdcReconciler, SdcVolumeMappingReconciler,
    SnapshotReconciler, StoragePoolReconciler, VolumeReconciler,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PowerFlex Reconciler - declarative state for PowerFlex clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gateway endpoint, e.g. https://10.0.0.5:443
    #[arg(long, env = "POWERFLEX_ENDPOINT", default_value = "")]
    endpoint: String,

    /// Gateway user
    #[arg(long, env = "POWERFLEX_USERNAME", default_value = "")]
    username: String,

    /// Gateway password
    #[arg(long, env = "POWERFLEX_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Accept self-signed certificates
    #[arg(long, env = "POWERFLEX_INSECURE")]
    insecure: bool,

    /// Request timeout in seconds
    #[arg(long, env = "POWERFLEX_TIMEOUT", default_value = "120")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against the in-memory cluster instead of a gateway
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and resolve the single system
    Systems,

    /// Import an entity by id and print its observed state
    Show {
        #[arg(value_enum)]
        kind: Kind,
        id: String,
    },

    /// List SDCs, optionally filtered
    Sdcs {
        #[arg(long, conflicts_with_all = ["ip", "name"])]
        id: Option<String>,
        #[arg(long, conflicts_with = "name")]
        ip: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Install SDCs on new hosts and adopt them
    Expand {
        /// JSON installation plan
        #[arg(long)]
        plan: PathBuf,

        /// Seconds between phase polls
        #[arg(long, default_value = "60")]
        poll_interval_secs: u64,

        /// Consecutive running polls before the installation is aborted
        #[arg(long, default_value = "5")]
        max_running_polls: u32,

        #[arg(long, default_value = "admin")]
        mdm_user: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Sdc,
    Volume,
    Snapshot,
    StoragePool,
    Mapping,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting PowerFlex Reconciler");
    info!("  Version: {}", powerflex_reconciler::VERSION);
    info!("  Standalone mode: {}", args.standalone);

    let backend = if args.standalone { "memory" } else { "rest" };
    let config = ClientConfig {
        endpoint: args.endpoint.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        insecure: args.insecure,
        timeout: Duration::from_secs(args.timeout_secs),
    };
    if !args.standalone {
        info!("  Endpoint: {}", config.endpoint);
    }

    let cluster = BackendFactory::cluster(backend, config.clone())?;

    match args.command {
        Command::Systems => {
            let systems = cluster.list_systems().await?;
            print_json(&systems)?;
        }
        Command::Show { kind, id } => {
            let api = cluster.as_ref();
            match kind {
                Kind::Sdc => show(&SdcReconciler, api, &id).await?,
                Kind::Volume => show(&VolumeReconciler, api, &id).await?,
                Kind::Snapshot => show(&SnapshotReconciler, api, &id).await?,
                Kind::StoragePool => show(&StoragePoolReconciler, api, &id).await?,
                Kind::Mapping => show(&SdcVolumeMappingReconciler, api, &id).await?,
            }
        }
        Command::Sdcs { id, ip, name } => {
            let sdcs = query_sdcs(cluster.as_ref(), &SdcQuery { id, ip, name }).await?;
            print_json(&sdcs)?;
        }
        Command::Expand {
            plan,
            poll_interval_secs,
            max_running_polls,
            mdm_user,
        } => {
            let raw = std::fs::read_to_string(&plan)?;
            let plan: InstallationPlan = serde_json::from_str(&raw)?;
            let installer = InstallerConfig {
                poll_interval: Duration::from_secs(poll_interval_secs),
                max_running_polls,
                mdm_user,
            };
            let gateway = BackendFactory::gateway(backend, config)?;

            let adopted = expand_and_adopt(cluster.as_ref(), gateway.as_ref(), &installer, &plan).await?;
            info!("Expansion complete, {} SDCs adopted", adopted.len());
            print_json(&adopted)?;
        }
    }

    Ok(())
}

async fn show<R>(reconciler: &R, api: &dyn ClusterApi, id: &str) -> Result<()>
where
    R: Reconciler,
    R::Observed: Serialize,
{
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} id must not be empty", R::KIND)));
    }
    let observed = reconciler.import(api, id).await?;
    print_json(&observed)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so stdout stays valid JSON
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
