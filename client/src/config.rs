//! # Agent Configuration
//!
//! The agent reads a JSON document describing its identity, its default
//! local target, and its prefix routing table. A missing or malformed
//! file is a fatal startup error. The `options` block and the
//! `healthCheck`/`protected` mapping fields are reserved for future
//! behavior; they parse but nothing acts on them yet.

use crate::protocol::MappingEntry;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub client: ClientSection,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
    #[serde(default)]
    #[allow(dead_code)]
    pub options: Options,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSection {
    /// Stable identity presented to the relay. When absent the relay
    /// mints one on registration.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub default_target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingConfig {
    pub prefix: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub health_check: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub protected: Option<bool>,
}

/// Reserved knobs; the baseline ignores them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct Options {
    #[serde(default)]
    pub enable_fallback: bool,
    #[serde(default)]
    pub health_check_interval: u64,
    #[serde(default)]
    pub retry_failed_requests: bool,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AgentConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.client.default_target)
            .with_context(|| format!("invalid defaultTarget '{}'", self.client.default_target))?;

        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if mapping.prefix.is_empty() || mapping.prefix.contains('/') {
                bail!(
                    "mapping prefix '{}' must be a single non-empty path segment",
                    mapping.prefix
                );
            }
            if !seen.insert(mapping.prefix.as_str()) {
                bail!("duplicate mapping prefix '{}'", mapping.prefix);
            }
            Url::parse(&mapping.target).with_context(|| {
                format!("invalid target '{}' for prefix '{}'", mapping.target, mapping.prefix)
            })?;
        }
        Ok(())
    }

    /// The routing table as registered with the relay: enabled entries only.
    pub fn effective_mappings(&self) -> Vec<MappingEntry> {
        self.mappings
            .iter()
            .filter(|m| m.enabled)
            .map(|m| MappingEntry {
                prefix: m.prefix.clone(),
                target: m.target.clone(),
                description: m.description.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<AgentConfig> {
        let config: AgentConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    const FULL: &str = r#"{
        "client": { "id": "a2", "name": "office-gateway", "defaultTarget": "http://localhost:8000" },
        "mappings": [
            { "prefix": "api", "target": "http://localhost:5000", "description": "main api" },
            { "prefix": "admin", "target": "http://localhost:6000", "description": "", "enabled": false,
              "healthCheck": "/healthz", "protected": true }
        ],
        "options": { "enableFallback": true, "healthCheckInterval": 60,
                     "retryFailedRequests": false, "maxRetries": 3 }
    }"#;

    #[test]
    fn full_document_parses() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.client.id.as_deref(), Some("a2"));
        assert_eq!(config.client.name, "office-gateway");
        assert_eq!(config.mappings.len(), 2);
    }

    #[test]
    fn mappings_are_enabled_by_default_and_disabled_entries_are_filtered() {
        let config = parse(FULL).unwrap();
        assert!(config.mappings[0].enabled);
        let effective = config.effective_mappings();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].prefix, "api");
    }

    #[test]
    fn minimal_document_parses_without_mappings_or_options() {
        let config = parse(
            r#"{ "client": { "name": "bare", "defaultTarget": "http://localhost:3000" } }"#,
        )
        .unwrap();
        assert_eq!(config.client.id, None);
        assert!(config.effective_mappings().is_empty());
    }

    #[test]
    fn duplicate_prefixes_are_rejected() {
        let err = parse(
            r#"{ "client": { "name": "x", "defaultTarget": "http://localhost:3000" },
                 "mappings": [
                    { "prefix": "api", "target": "http://localhost:1" },
                    { "prefix": "api", "target": "http://localhost:2" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate mapping prefix"));
    }

    #[test]
    fn multi_segment_prefixes_are_rejected() {
        let err = parse(
            r#"{ "client": { "name": "x", "defaultTarget": "http://localhost:3000" },
                 "mappings": [ { "prefix": "api/v1", "target": "http://localhost:1" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("single non-empty path segment"));
    }

    #[test]
    fn bad_target_urls_are_rejected() {
        let err = parse(
            r#"{ "client": { "name": "x", "defaultTarget": "not a url" } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid defaultTarget"));
    }

    #[test]
    fn a_missing_file_is_a_load_error() {
        assert!(AgentConfig::load(Path::new("/definitely/not/here.json")).is_err());
    }
}
