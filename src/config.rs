//! Port wiring configuration.
//!
//! Components receive their port wirings as a TOML document with a top-level
//! `[ports]` table: `[ports.in.<name>]` and `[ports.out.<name>]` entries each
//! carry a sturdy ref, and an out port declared as an array of tables
//! (`[[ports.out.<name>]]`) fans out to one writer per element.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ports config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub ports: PortsTable,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortsTable {
    #[serde(default, rename = "in")]
    pub in_ports: BTreeMap<String, PortEntry>,
    #[serde(default, rename = "out")]
    pub out_ports: BTreeMap<String, OutPortEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
    pub sr: String,
}

/// A scalar out port or an array out port, depending on the TOML shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutPortEntry {
    Scalar(PortEntry),
    Array(Vec<PortEntry>),
}

impl PortsConfig {
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_and_array_ports() {
        let cfg = PortsConfig::from_str(
            r#"
            [ports.in.events]
            sr = "weir://vat/in-1"

            [ports.out.result]
            sr = "weir://vat/out-1"

            [[ports.out.fanout]]
            sr = "weir://vat/arr-1"

            [[ports.out.fanout]]
            sr = "weir://vat/arr-2"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.ports.in_ports["events"].sr, "weir://vat/in-1");
        assert_eq!(
            cfg.ports.out_ports["result"],
            OutPortEntry::Scalar(PortEntry {
                sr: "weir://vat/out-1".into()
            })
        );
        let OutPortEntry::Array(entries) = &cfg.ports.out_ports["fanout"] else {
            panic!("fanout should be an array port");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sr, "weir://vat/arr-2");
    }

    #[test]
    fn empty_document_is_an_empty_wiring() {
        let cfg = PortsConfig::from_str("").unwrap();
        assert!(cfg.ports.in_ports.is_empty());
        assert!(cfg.ports.out_ports.is_empty());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(matches!(
            PortsConfig::from_str("[ports.in\nsr ="),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ports.toml");
        std::fs::write(&path, "[ports.in.data]\nsr = \"tok\"\n").unwrap();
        let cfg = PortsConfig::from_file(&path).unwrap();
        assert_eq!(cfg.ports.in_ports["data"].sr, "tok");

        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            PortsConfig::from_file(&missing),
            Err(ConfigError::Io { .. })
        ));
    }
}
