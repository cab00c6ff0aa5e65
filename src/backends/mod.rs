//! Remote API Adapters
//!
//! - `rest`: PowerFlex management REST API
//! - `gateway`: PowerFlex installer gateway
//! - `memory`: simulated cluster and gateway for standalone runs and tests

pub mod gateway;
pub mod memory;
pub mod rest;

pub use gateway::RestGateway;
pub use memory::{MemoryCluster, MemoryGateway};
pub use rest::RestCluster;

use crate::config::ClientConfig;
use crate::domain::ports::{ClusterApiRef, GatewayApiRef};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for remote API adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create a management API adapter by name
    pub fn cluster(name: &str, config: ClientConfig) -> Result<ClusterApiRef> {
        match name.to_lowercase().as_str() {
            "rest" | "powerflex" => Ok(Arc::new(RestCluster::new(config)?)),
            "memory" | "standalone" => Ok(Arc::new(MemoryCluster::new())),
            _ => Err(Error::Configuration(format!("unknown backend {name}"))),
        }
    }

    /// Create an installer gateway adapter by name
    pub fn gateway(name: &str, config: ClientConfig) -> Result<GatewayApiRef> {
        match name.to_lowercase().as_str() {
            "rest" | "powerflex" => Ok(Arc::new(RestGateway::new(config)?)),
            "memory" | "standalone" => Ok(Arc::new(MemoryGateway::new())),
            _ => Err(Error::Configuration(format!("unknown backend {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_factory() {
        let cluster = BackendFactory::cluster("memory", ClientConfig::default()).unwrap();
        assert_eq!(cluster.list_systems().await.unwrap().len(), 1);

        assert_matches!(
            BackendFactory::cluster("rest", ClientConfig::default()).err(),
            Some(Error::Configuration(_))
        );
        assert_matches!(
            BackendFactory::gateway("nfs", ClientConfig::default()).err(),
            Some(Error::Configuration(_))
        );
    }
}
