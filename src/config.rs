//! Client and installer configuration

use crate::error::{Error, Result};
use reqwest::Url;
use std::time::Duration;

// =============================================================================
// Client Configuration
// =============================================================================

/// Connection settings shared by the management API and gateway adapters
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://10.0.0.5:443`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed gateway certificates
    pub insecure: bool,
    /// Per request timeout
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            timeout: Duration::from_secs(120),
        }
    }
}

// Keep the password out of logs
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Parsed endpoint without a trailing slash
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(self.endpoint.trim_end_matches('/')).map_err(|e| {
            Error::Configuration(format!("invalid endpoint {:?}: {}", self.endpoint, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Configuration(format!(
                "endpoint scheme must be http or https, got {other}"
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Configuration("endpoint is required".into()));
        }
        self.base_url()?;
        if self.username.is_empty() {
            return Err(Error::Configuration("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Configuration("password is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration("timeout must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Installer Configuration
// =============================================================================

/// Phase polling behaviour of the SDC installer
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Sleep before each phase status poll
    pub poll_interval: Duration,
    /// Consecutive `Running` polls tolerated before the queue is reset
    pub max_running_polls: u32,
    /// MDM user for validation and installation
    pub mdm_user: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_running_polls: 5,
            mdm_user: "admin".to_string(),
        }
    }
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_running_polls == 0 {
            return Err(Error::Configuration("max_running_polls must be at least 1".into()));
        }
        if self.mdm_user.is_empty() {
            return Err(Error::Configuration("mdm_user is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let installer = InstallerConfig::default();
        assert_eq!(installer.poll_interval, Duration::from_secs(60));
        assert_eq!(installer.max_running_polls, 5);
        assert!(installer.validate().is_ok());

        assert_matches!(ClientConfig::default().validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_client_validation() {
        let config = ClientConfig::new("https://10.0.0.5/", "admin", "secret");
        assert!(config.validate().is_ok());
        assert_eq!(config.base_url().unwrap().host_str(), Some("10.0.0.5"));

        let config = ClientConfig::new("ftp://10.0.0.5", "admin", "secret");
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let config = ClientConfig::new("https://10.0.0.5", "admin", "");
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = ClientConfig::new("https://10.0.0.5", "admin", "secret");
        assert!(!format!("{config:?}").contains("secret"));
    }
}
