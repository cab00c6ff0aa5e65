//! PowerFlex Reconciler - declarative state for PowerFlex (ScaleIO) clusters
//!
//! Converges SDCs, volumes, snapshots, storage pools and SDC volume mappings
//! toward a declared state, and expands clusters with new SDC hosts through
//! the installer gateway.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Lifecycle Driver (caller)                       │
//! │             create / read / update / delete / import per entity          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐  │
//! │  │  Reconcilers │  │   Queries    │  │  Installer   │  │   Lookup    │  │
//! │  │ (per entity) │  │ (read-only)  │  │  (phased)    │  │ (reference) │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘  │
//! │         └─────────────────┴────────┬────────┴─────────────────┘         │
//! │                                    │                                    │
//! │                   ┌────────────────┴────────────────┐                   │
//! │                   │   Ports: ClusterApi, GatewayApi │                   │
//! │                   └────────────────┬────────────────┘                   │
//! ├────────────────────────────────────┼────────────────────────────────────┤
//! │  ┌──────────────┐  ┌───────────────┴──┐  ┌──────────────────────────┐   │
//! │  │ REST (/api)  │  │  Gateway (/im)   │  │  Memory (standalone)     │   │
//! │  └──────────────┘  └──────────────────┘  └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconciler`]: Per-entity reconcilers and reference lookup
//! - [`installer`]: SDC installation through the gateway
//! - [`datasource`]: Filtered read-only queries
//! - [`backends`]: REST, gateway and in-memory adapters
//! - [`domain`]: Wire records, ports, references and unit conversion
//! - [`config`]: Client and installer configuration
//! - [`error`]: Error types and handling

pub mod backends;
pub mod config;
pub mod datasource;
pub mod domain;
pub mod error;
pub mod installer;
pub mod reconciler;

// Re-export commonly used types
pub use backends::{BackendFactory, MemoryCluster, MemoryGateway, RestCluster, RestGateway};

pub use config::{ClientConfig, InstallerConfig};

pub use datasource::{query_sdcs, query_storage_pools, query_volumes, SdcQuery, StoragePoolQuery, VolumeQuery};

pub use domain::ports::{ClusterApi, ClusterApiRef, GatewayApi, GatewayApiRef};
pub use domain::reference::Reference;
pub use domain::units::CapacityUnit;

pub use error::{Error, ErrorAction, Result};

pub use installer::{expand, expand_and_adopt, ExpansionOutcome, InstallationPlan, SdcHost};

pub use reconciler::{
    Reconciler, SdcReconciler, SdcVolumeMappingReconciler, SnapshotReconciler, StoragePoolReconciler,
    UpdateReport, VolumeReconciler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
