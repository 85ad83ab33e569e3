//! Reconciliation configuration
use crate::models::{NAME_KEY, PARENT_KEY};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Naming pattern applied to entity types without their own entry
const DEFAULT_NAME_PATTERN: &str = r"^[a-zA-Z0-9_.]*$";

/// Upper bound on rename passes; a pass is linear in the pending set
const MAX_RENAME_PASSES: usize = 32;

/// Configuration surface of the reconciliation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tracking tree type names whose notifications are dropped (case-insensitive)
    pub ignored_entity_types: BTreeSet<String>,

    /// Field keys that never count as a change
    pub ignored_keys: BTreeSet<String>,

    /// Regex every new entity name must match, unless overridden per type
    pub default_name_pattern: String,

    /// Per entity type naming patterns, keyed by tracking tree type name
    pub name_patterns: BTreeMap<String, String>,

    /// Attribute keys whose value is inherited from the nearest ancestor override
    pub hierarchical_attributes: BTreeSet<String>,

    /// Project attribute gating whether batches are processed at all
    pub auto_sync_attribute: String,

    /// Tracking tree attribute that stores the project database id
    pub id_attribute: String,

    /// Maximum passes over still-blocked renames before they are rejected
    pub max_rename_passes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            ignored_entity_types: strings(&["session", "job", "note", "timelog", "appointment"]),
            ignored_keys: strings(&[
                "thumbnail_id",
                "status_id",
                "priority_id",
                "modified_at",
                "sort",
            ]),
            default_name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            name_patterns: BTreeMap::new(),
            hierarchical_attributes: strings(&[
                "fps",
                "frame_start",
                "frame_end",
                "handle_start",
                "handle_end",
                "clip_in",
                "clip_out",
                "resolution_width",
                "resolution_height",
                "pixel_aspect",
            ]),
            auto_sync_attribute: "auto_sync".to_string(),
            id_attribute: "sync_id".to_string(),
            max_rename_passes: 3,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| format!("invalid sync config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.auto_sync_attribute.is_empty() {
            return Err("auto_sync_attribute cannot be empty".to_string());
        }

        if self.id_attribute.is_empty() {
            return Err("id_attribute cannot be empty".to_string());
        }

        if self.max_rename_passes == 0 || self.max_rename_passes > MAX_RENAME_PASSES {
            return Err(format!(
                "max_rename_passes must be between 1 and {}",
                MAX_RENAME_PASSES
            ));
        }

        for key in [NAME_KEY, PARENT_KEY] {
            if self.ignored_keys.contains(key) {
                return Err(format!("'{}' cannot be an ignored key", key));
            }
            if self.hierarchical_attributes.contains(key) {
                return Err(format!("'{}' cannot be a hierarchical attribute", key));
            }
        }

        NameValidator::from_config(self).map(|_| ())
    }

    pub fn is_ignored_entity_type(&self, entity_type: &str) -> bool {
        self.ignored_entity_types
            .contains(&entity_type.to_ascii_lowercase())
    }

    /// The id attribute is always ignored so id write-backs never echo back
    pub fn is_ignored_key(&self, key: &str) -> bool {
        key == self.id_attribute || self.ignored_keys.contains(key)
    }

    pub fn is_hierarchical(&self, key: &str) -> bool {
        self.hierarchical_attributes.contains(key)
    }
}

/// Compiled naming patterns
#[derive(Debug, Clone)]
pub struct NameValidator {
    default: Regex,
    by_type: HashMap<String, Regex>,
}

impl NameValidator {
    pub fn from_config(config: &SyncConfig) -> Result<Self, String> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| format!("invalid name pattern '{}': {}", pattern, e))
        };

        let default = compile(&config.default_name_pattern)?;
        let mut by_type = HashMap::new();
        for (entity_type, pattern) in &config.name_patterns {
            by_type.insert(entity_type.to_ascii_lowercase(), compile(pattern)?);
        }
        Ok(Self { default, by_type })
    }

    pub fn is_valid(&self, entity_type: &str, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.by_type
            .get(&entity_type.to_ascii_lowercase())
            .unwrap_or(&self.default)
            .is_match(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_ignored_entity_type("Session"));
        assert!(config.is_ignored_key("sync_id"));
        assert!(config.is_hierarchical("fps"));
        assert_eq!(config.max_rename_passes, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.auto_sync_attribute = String::new();
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.max_rename_passes = 0;
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.ignored_keys.insert("name".to_string());
        assert!(config.validate().is_err());

        config = SyncConfig::default();
        config.default_name_pattern = "([".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SyncConfig::from_json(r#"{ "auto_sync_attribute": "sync_enabled" }"#).unwrap();
        assert_eq!(config.auto_sync_attribute, "sync_enabled");
        assert_eq!(config.id_attribute, "sync_id");

        assert!(SyncConfig::from_json(r#"{ "max_rename_passes": 0 }"#).is_err());
    }

    #[test]
    fn test_name_validator_uses_type_override() {
        let mut config = SyncConfig::default();
        config
            .name_patterns
            .insert("Shot".to_string(), r"^sh\d{3}$".to_string());
        let names = NameValidator::from_config(&config).unwrap();

        assert!(names.is_valid("shot", "sh010"));
        assert!(!names.is_valid("Shot", "Seq01"));
        assert!(names.is_valid("Sequence", "Seq01"));
        assert!(!names.is_valid("Sequence", "Seq 01"));
        assert!(!names.is_valid("Sequence", ""));
    }
}
