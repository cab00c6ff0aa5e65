//! Entity references
//!
//! A desired state names the entities it depends on either by server id, by
//! a secondary natural key (an SDC's IP) or by name. Exactly one form is used
//! per reference.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Reference to a remote entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    ById(String),
    ByKey(String),
    ByName(String),
}

impl Reference {
    pub fn id(id: impl Into<String>) -> Self {
        Reference::ById(id.into())
    }

    pub fn key(key: impl Into<String>) -> Self {
        Reference::ByKey(key.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        Reference::ByName(name.into())
    }

    /// The raw value carried by the reference
    pub fn value(&self) -> &str {
        match self {
            Reference::ById(v) | Reference::ByKey(v) | Reference::ByName(v) => v,
        }
    }

    /// Validate the value is non-empty
    pub fn validate(&self, kind: &str) -> Result<()> {
        if self.value().trim().is_empty() {
            return Err(Error::validation(format!("{kind} reference {self} is empty")));
        }
        Ok(())
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::ById(v) => write!(f, "id={v}"),
            Reference::ByKey(v) => write!(f, "key={v}"),
            Reference::ByName(v) => write!(f, "name={v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Reference::id("abc").to_string(), "id=abc");
        assert_eq!(Reference::name("pool1").to_string(), "name=pool1");
    }

    #[test]
    fn test_empty_value_invalid() {
        assert!(Reference::name(" ").validate("StoragePool").is_err());
        assert!(Reference::name("pool1").validate("StoragePool").is_ok());
    }
}
