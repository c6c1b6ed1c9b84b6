use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::types::EntityType;

/// Declared entity types, fixed once the engine is built.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    types: HashMap<String, EntityType>,
    strict: bool,
}

impl EntityRegistry {
    pub fn new(types: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.code.clone(), t)).collect(),
            strict: false,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new(config.entity_types.iter().cloned());
        registry.strict = config.strict_types;
        registry
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&EntityType> {
        self.types.get(code)
    }

    #[must_use]
    pub fn is_declared(&self, code: &str) -> bool {
        self.types.contains_key(code)
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Unknown types are never roots.
    #[must_use]
    pub fn is_root(&self, code: &str) -> bool {
        self.types.get(code).is_some_and(|t| t.root_level)
    }

    /// Ownership flag declared for `parent_type -> child_type`, or `true` if undeclared.
    #[must_use]
    pub fn default_ownership(&self, parent_type: &str, child_type: &str) -> bool {
        self.types
            .get(parent_type)
            .and_then(|t| t.children.iter().find(|c| c.entity_type == child_type))
            .is_none_or(|c| c.ownership_flag)
    }

    /// Entity types in code order.
    #[must_use]
    pub fn types(&self) -> Vec<&EntityType> {
        let mut types: Vec<_> = self.types.values().collect();
        types.sort_by(|a, b| a.code.cmp(&b.code));
        types
    }

    #[must_use]
    pub fn codes(&self) -> Vec<&str> {
        self.types().into_iter().map(|t| t.code.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_flags() {
        let registry = EntityRegistry::from_config(&EngineConfig::default());
        assert!(registry.is_root("project"));
        assert!(!registry.is_root("task"));
        assert!(!registry.is_root("unknown"));
        assert!(registry.default_ownership("project", "task"));
        assert!(!registry.default_ownership("project", "person"));
        // Undeclared relations are owned.
        assert!(registry.default_ownership("task", "person"));
    }

    #[test]
    fn test_types_sorted() {
        let registry = EntityRegistry::new([EntityType::new("b"), EntityType::new("a")]);
        let codes: Vec<_> = registry.types().iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["a", "b"]);
    }
}
