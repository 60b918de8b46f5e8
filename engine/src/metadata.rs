//! Remote identity of local records.
//!
//! Every synced entity shares the same identity bookkeeping, so it lives in
//! one place: a [`SyncMetadata`] row keyed by `(model, local_id)`.
//!
//! Invariant: within a model a `cloud_sync_id` belongs to at most one local
//! record, and a local record is never re-linked to a different
//! `cloud_sync_id`. [`validate_link`] is the single check enforcing it;
//! storage backends call it before writing a link.

use crate::{error::Result, CloudId, Error, LegacyId, LocalId, ModelName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Sync state of a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataState {
    /// Local changes not yet acknowledged by the remote
    #[default]
    Pending,
    /// In step with the remote as of `last_sync`
    Synced,
    /// Last push was rejected
    Error,
}

impl MetadataState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataState::Pending => "pending",
            MetadataState::Synced => "synced",
            MetadataState::Error => "error",
        }
    }
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MetadataState::Pending),
            "synced" => Ok(MetadataState::Synced),
            "error" => Ok(MetadataState::Error),
            other => Err(Error::UnknownState(other.to_string())),
        }
    }
}

/// Identity bookkeeping of one local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub model: ModelName,
    pub local_id: LocalId,
    pub cloud_sync_id: Option<CloudId>,
    /// Bridge key from the database the record was migrated from
    pub legacy_id: Option<LegacyId>,
    pub state: MetadataState,
    pub last_sync: Option<Timestamp>,
}

impl SyncMetadata {
    pub fn new(model: impl Into<ModelName>, local_id: LocalId) -> Self {
        Self {
            model: model.into(),
            local_id,
            cloud_sync_id: None,
            legacy_id: None,
            state: MetadataState::Pending,
            last_sync: None,
        }
    }
}

/// Result of linking a local record to a cloud id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The link was created
    Linked,
    /// The record already carried this exact link
    Unchanged,
}

/// Check whether `local_id` may be linked to `cloud_sync_id`.
///
/// `current` is the cloud id the local record already carries and `holder`
/// the local record currently owning `cloud_sync_id`, both as read from
/// storage.
pub fn validate_link(
    model: &str,
    local_id: LocalId,
    cloud_sync_id: CloudId,
    current: Option<CloudId>,
    holder: Option<LocalId>,
) -> Result<LinkOutcome> {
    if let Some(existing) = current {
        if existing == cloud_sync_id {
            return Ok(LinkOutcome::Unchanged);
        }
        return Err(Error::AlreadyLinked {
            model: model.to_string(),
            local_id,
            existing,
        });
    }
    match holder {
        Some(holder) if holder != local_id => Err(Error::CloudIdTaken {
            model: model.to_string(),
            cloud_sync_id,
            holder,
        }),
        _ => Ok(LinkOutcome::Linked),
    }
}

/// In-memory metadata table with lookups by cloud id and legacy id.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    rows: BTreeMap<(ModelName, LocalId), SyncMetadata>,
    by_cloud: HashMap<(ModelName, CloudId), LocalId>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, local_id: LocalId) -> Option<&SyncMetadata> {
        self.rows.get(&(model.to_string(), local_id))
    }

    /// The record linked to a cloud id.
    pub fn find_by_cloud(&self, model: &str, cloud_sync_id: CloudId) -> Option<&SyncMetadata> {
        self.by_cloud
            .get(&(model.to_string(), cloud_sync_id))
            .and_then(|local_id| self.get(model, *local_id))
    }

    /// Records carrying a legacy key, lowest local id first.
    pub fn find_by_legacy(&self, model: &str, legacy_id: LegacyId) -> Vec<&SyncMetadata> {
        self.rows
            .values()
            .filter(|row| row.model == model && row.legacy_id == Some(legacy_id))
            .collect()
    }

    /// Link a local record to a cloud id, enforcing link uniqueness.
    pub fn link(
        &mut self,
        model: &str,
        local_id: LocalId,
        cloud_sync_id: CloudId,
    ) -> Result<LinkOutcome> {
        let current = self.get(model, local_id).and_then(|row| row.cloud_sync_id);
        let holder = self
            .by_cloud
            .get(&(model.to_string(), cloud_sync_id))
            .copied();
        let outcome = validate_link(model, local_id, cloud_sync_id, current, holder)?;

        self.row_mut(model, local_id).cloud_sync_id = Some(cloud_sync_id);
        self.by_cloud
            .insert((model.to_string(), cloud_sync_id), local_id);
        Ok(outcome)
    }

    /// Stamp the legacy bridge key of a record.
    pub fn set_legacy(&mut self, model: &str, local_id: LocalId, legacy_id: LegacyId) {
        self.row_mut(model, local_id).legacy_id = Some(legacy_id);
    }

    /// Update the sync state; `Synced` also stamps `last_sync`.
    pub fn set_state(
        &mut self,
        model: &str,
        local_id: LocalId,
        state: MetadataState,
        now: Timestamp,
    ) {
        let row = self.row_mut(model, local_id);
        row.state = state;
        if state == MetadataState::Synced {
            row.last_sync = Some(now);
        }
    }

    /// Drop the metadata of a deleted record.
    pub fn remove(&mut self, model: &str, local_id: LocalId) -> Option<SyncMetadata> {
        let row = self.rows.remove(&(model.to_string(), local_id))?;
        if let Some(cloud_sync_id) = row.cloud_sync_id {
            self.by_cloud.remove(&(model.to_string(), cloud_sync_id));
        }
        Some(row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn row_mut(&mut self, model: &str, local_id: LocalId) -> &mut SyncMetadata {
        self.rows
            .entry((model.to_string(), local_id))
            .or_insert_with(|| SyncMetadata::new(model, local_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_and_find() {
        let mut index = MetadataIndex::new();
        assert_eq!(
            index.link("product.product", 1, 900).unwrap(),
            LinkOutcome::Linked
        );
        assert_eq!(
            index.link("product.product", 1, 900).unwrap(),
            LinkOutcome::Unchanged
        );

        let found = index.find_by_cloud("product.product", 900).unwrap();
        assert_eq!(found.local_id, 1);
        assert!(index.find_by_cloud("product.category", 900).is_none());
    }

    #[test]
    fn cloud_id_cannot_bind_two_records() {
        let mut index = MetadataIndex::new();
        index.link("product.product", 1, 900).unwrap();

        let err = index.link("product.product", 2, 900).unwrap_err();
        assert_eq!(
            err,
            Error::CloudIdTaken {
                model: "product.product".into(),
                cloud_sync_id: 900,
                holder: 1,
            }
        );
        assert!(index.get("product.product", 2).is_none());
    }

    #[test]
    fn record_cannot_be_relinked() {
        let mut index = MetadataIndex::new();
        index.link("res.partner", 5, 10).unwrap();

        let err = index.link("res.partner", 5, 11).unwrap_err();
        assert!(matches!(err, Error::AlreadyLinked { existing: 10, .. }));
        assert_eq!(
            index.find_by_cloud("res.partner", 10).unwrap().local_id,
            5
        );
        assert!(index.find_by_cloud("res.partner", 11).is_none());
    }

    #[test]
    fn legacy_lookup() {
        let mut index = MetadataIndex::new();
        index.set_legacy("product.product", 3, 77);
        index.set_legacy("product.product", 1, 77);
        index.set_legacy("product.product", 2, 78);

        let found: Vec<_> = index
            .find_by_legacy("product.product", 77)
            .iter()
            .map(|row| row.local_id)
            .collect();
        assert_eq!(found, vec![1, 3]);
    }

    #[test]
    fn synced_state_stamps_last_sync() {
        let mut index = MetadataIndex::new();
        index.set_state("res.partner", 1, MetadataState::Error, 10);
        assert_eq!(index.get("res.partner", 1).unwrap().last_sync, None);

        index.set_state("res.partner", 1, MetadataState::Synced, 20);
        let row = index.get("res.partner", 1).unwrap();
        assert_eq!(row.state, MetadataState::Synced);
        assert_eq!(row.last_sync, Some(20));
    }

    #[test]
    fn remove_frees_cloud_id() {
        let mut index = MetadataIndex::new();
        index.link("res.partner", 1, 10).unwrap();
        index.remove("res.partner", 1);

        assert!(index.find_by_cloud("res.partner", 10).is_none());
        index.link("res.partner", 2, 10).unwrap();
    }
}
