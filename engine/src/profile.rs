//! Per-model identity profiles.
//!
//! A profile tells the resolver which payload fields identify a record of a
//! model, which fields disambiguate a shared legacy key, and which models
//! must be migrated first.

use crate::ModelName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field holding the migration bridge key on remote payloads.
pub const DEFAULT_LEGACY_FIELD: &str = "id_database_old";

/// Identity profile of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: ModelName,
    /// Natural keys, most specific first; each key is a list of fields that
    /// must all match
    pub natural_keys: Vec<Vec<String>>,
    /// Fields narrowing an ambiguous match (name, barcode)
    pub discriminators: Vec<String>,
    /// Models whose records this model references
    pub depends_on: Vec<ModelName>,
    /// Allow matching on identical primary keys (cloned databases)
    pub match_primary_key: bool,
    pub legacy_field: String,
}

impl ModelProfile {
    /// Profile with no natural keys and no dependencies.
    pub fn new(model: impl Into<ModelName>) -> Self {
        Self {
            model: model.into(),
            natural_keys: Vec::new(),
            discriminators: Vec::new(),
            depends_on: Vec::new(),
            match_primary_key: false,
            legacy_field: DEFAULT_LEGACY_FIELD.to_string(),
        }
    }

    /// Add a natural key made of one or more fields.
    pub fn natural_key(mut self, fields: &[&str]) -> Self {
        self.natural_keys
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn discriminator(mut self, field: &str) -> Self {
        self.discriminators.push(field.to_string());
        self
    }

    pub fn depends_on(mut self, model: &str) -> Self {
        self.depends_on.push(model.to_string());
        self
    }

    pub fn with_primary_key_match(mut self, enabled: bool) -> Self {
        self.match_primary_key = enabled;
        self
    }

    pub fn with_legacy_field(mut self, field: &str) -> Self {
        self.legacy_field = field.to_string();
        self
    }
}

/// Profiles by model name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRegistry {
    profiles: BTreeMap<ModelName, ModelProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, profile: ModelProfile) -> Self {
        self.register(profile);
        self
    }

    pub fn register(&mut self, profile: ModelProfile) {
        self.profiles.insert(profile.model.clone(), profile);
    }

    /// Profile of a model; unknown models get a bare profile.
    pub fn get(&self, model: &str) -> ModelProfile {
        self.profiles
            .get(model)
            .cloned()
            .unwrap_or_else(|| ModelProfile::new(model))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.profiles.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelName> {
        self.profiles.keys()
    }

    /// Declared dependencies of a model.
    pub fn dependencies(&self, model: &str) -> &[ModelName] {
        self.profiles
            .get(model)
            .map(|p| p.depends_on.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let profile = ModelProfile::new("product.product")
            .natural_key(&["barcode"])
            .natural_key(&["name", "type"])
            .discriminator("name")
            .depends_on("product.category");

        assert_eq!(profile.natural_keys.len(), 2);
        assert_eq!(profile.natural_keys[1], vec!["name", "type"]);
        assert_eq!(profile.legacy_field, DEFAULT_LEGACY_FIELD);
        assert!(!profile.match_primary_key);
    }

    #[test]
    fn unknown_model_gets_bare_profile() {
        let registry =
            ProfileRegistry::new().with(ModelProfile::new("res.partner").natural_key(&["vat"]));

        assert!(registry.contains("res.partner"));
        let bare = registry.get("loyalty.program");
        assert_eq!(bare.model, "loyalty.program");
        assert!(bare.natural_keys.is_empty());
        assert!(registry.dependencies("loyalty.program").is_empty());
    }
}
