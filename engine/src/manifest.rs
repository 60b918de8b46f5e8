//! Migration manifest and pagination cursor.
//!
//! The PRINCIPAL declares how many records each model holds and the order
//! in which models should be imported. The node merges that order with the
//! dependencies declared in its own profiles, so a parent model is always
//! imported before its children even when the remote order disagrees.

use crate::profile::ProfileRegistry;
use crate::{error::Result, Error, ModelName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-model record counts plus the remote's dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationManifest {
    pub counts: BTreeMap<ModelName, u64>,
    pub sync_order: Vec<ModelName>,
}

impl MigrationManifest {
    pub fn new(counts: BTreeMap<ModelName, u64>, sync_order: Vec<ModelName>) -> Self {
        Self { counts, sync_order }
    }

    /// Declared record count of a model.
    pub fn count(&self, model: &str) -> u64 {
        self.counts.get(model).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Import order for the given models.
    ///
    /// Only models present in the manifest are planned; an empty `enabled`
    /// list plans all of them. Dependencies come from `profiles` and always
    /// win; ties follow the remote `sync_order`, then model name.
    pub fn plan(&self, profiles: &ProfileRegistry, enabled: &[ModelName]) -> Result<Vec<ModelName>> {
        let selected: BTreeSet<&ModelName> = self
            .counts
            .keys()
            .filter(|model| enabled.is_empty() || enabled.contains(model))
            .collect();

        let rank = |model: &ModelName| -> (usize, ModelName) {
            let position = self
                .sync_order
                .iter()
                .position(|m| m == model)
                .unwrap_or(self.sync_order.len());
            (position, model.clone())
        };

        let mut blockers: BTreeMap<&ModelName, BTreeSet<&ModelName>> = selected
            .iter()
            .map(|model| {
                let deps = profiles
                    .dependencies(model)
                    .iter()
                    .filter_map(|dep| selected.get(dep).copied())
                    .filter(|dep| dep != model)
                    .collect();
                (*model, deps)
            })
            .collect();

        let mut order = Vec::with_capacity(selected.len());
        while !blockers.is_empty() {
            let next = blockers
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(model, _)| *model)
                .min_by_key(|model| rank(*model));

            let Some(next) = next else {
                let stuck = blockers.keys().map(|m| (*m).clone()).collect();
                return Err(Error::DependencyCycle(stuck));
            };

            blockers.remove(next);
            for deps in blockers.values_mut() {
                deps.remove(next);
            }
            order.push(next.clone());
        }
        Ok(order)
    }
}

/// Stateless page position within one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub model: ModelName,
    pub offset: u64,
    pub limit: u64,
}

impl MigrationCursor {
    /// Cursor at the first page.
    pub fn new(model: impl Into<ModelName>, limit: u64) -> Self {
        Self {
            model: model.into(),
            offset: 0,
            limit: limit.max(1),
        }
    }

    /// Resume from a known offset.
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Cursor for the page after one that returned `fetched` records.
    ///
    /// `None` when the remote reports no more data, or when it returned an
    /// empty page (which would otherwise repeat forever).
    pub fn advance(&self, fetched: usize, has_more: bool) -> Option<MigrationCursor> {
        if !has_more || fetched == 0 {
            return None;
        }
        Some(Self {
            model: self.model.clone(),
            offset: self.offset + fetched as u64,
            limit: self.limit,
        })
    }
}
