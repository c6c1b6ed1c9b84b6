use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::EntityType;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2000;

/// Engine settings, usually read from a TOML file:
///
/// ```toml
/// cache_ttl_secs = 300
/// max_depth = 10
///
/// [[entity_types]]
/// code = "project"
/// root_level = true
/// children = ["task", { entity_type = "person", ownership_flag = false }]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_ttl_secs: u64,
    pub max_depth: usize,
    pub request_timeout_ms: u64,
    /// Reject links between entity types that are not declared.
    pub strict_types: bool,
    pub entity_types: Vec<EntityType>,
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            "Loaded engine config from {} ({} entity types)",
            path.as_ref().display(),
            config.entity_types.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(Error::Config("max_depth must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for ty in &self.entity_types {
            if ty.code.is_empty() {
                return Err(Error::Config("entity type code cannot be empty".into()));
            }
            if !seen.insert(ty.code.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate entity type code: {}",
                    ty.code
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Registry used when no configuration file is given.
    #[must_use]
    pub fn default_entity_types() -> Vec<EntityType> {
        vec![
            EntityType::new("business").root().owns("project"),
            EntityType::new("customer").root().references("project"),
            EntityType::new("project")
                .root()
                .owns("task")
                .owns("artifact")
                .references("person"),
            EntityType::new("task").owns("task").owns("artifact"),
            EntityType::new("artifact"),
            EntityType::new("person"),
        ]
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_depth: DEFAULT_MAX_DEPTH,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            strict_types: false,
            entity_types: Self::default_entity_types(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert!(config.entity_types.iter().any(|t| t.code == "project"));
    }

    #[test]
    fn test_parses_legacy_and_object_children() {
        let config = EngineConfig::from_toml_str(
            r#"
            cache_ttl_secs = 60

            [[entity_types]]
            code = "project"
            root_level = true
            children = ["task", { entity_type = "person", ownership_flag = false }]

            [[entity_types]]
            code = "task"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.entity_types.len(), 2);
        let project = &config.entity_types[0];
        assert!(project.root_level);
        assert!(project.children[0].ownership_flag);
        assert!(!project.children[1].ownership_flag);
    }

    #[test]
    fn test_rejects_duplicate_codes() {
        let result = EngineConfig::from_toml_str(
            r#"
            [[entity_types]]
            code = "task"
            [[entity_types]]
            code = "task"
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_depth() {
        let result = EngineConfig::from_toml_str("max_depth = 0");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
