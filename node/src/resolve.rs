//! Applying remote records to the local entity table.
//!
//! [`IdentityResolver`] gathers candidates from the stores, lets the engine
//! [`Resolver`] pick the local identity, then upserts through a
//! [`RecordWriter`] so the entity row and its identity metadata land as one
//! unit and the write is never echoed back.

use crate::error::SyncResult;
use crate::store::{
    EntityStore, LocalRecord, MetadataStore, RecordWrite, RecordWriter, StoreWriter, Written,
};
use possync_engine::{
    Candidate, Candidates, LocalId, Operation, ProfileRegistry, Resolution, ResolveHints,
    ResolveMode, Resolver, Strategy, SyncOptions, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Fields of a remote payload that never reach the local record.
const REMOTE_ONLY_FIELDS: &[&str] = &["id", "cloud_sync_id"];

/// What applying one remote record did locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Applied {
    Created { local_id: LocalId },
    Updated { local_id: LocalId },
    Deleted { local_id: LocalId },
    Skipped { reason: String },
}

#[derive(Clone)]
pub struct IdentityResolver {
    profiles: Arc<ProfileRegistry>,
    metadata: Arc<dyn MetadataStore>,
    entities: Arc<dyn EntityStore>,
    writer: Arc<dyn RecordWriter>,
}

impl IdentityResolver {
    /// Resolver writing through a [`StoreWriter`] over the two stores.
    pub fn new(
        profiles: Arc<ProfileRegistry>,
        metadata: Arc<dyn MetadataStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Self {
        let writer = Arc::new(StoreWriter::new(metadata.clone(), entities.clone()));
        Self {
            profiles,
            metadata,
            entities,
            writer,
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn RecordWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Resolve a remote record without writing anything but stale-link
    /// cleanup. Conflicts are logged.
    pub async fn resolve(
        &self,
        model: &str,
        record: &Value,
        mode: ResolveMode,
    ) -> SyncResult<(ResolveHints, Resolution)> {
        let profile = self.profiles.get(model);
        let hints = ResolveHints::from_record(&profile, record);
        let candidates = self.gather(model, &hints).await?;
        let resolution = Resolver::new(&profile, mode).resolve(&hints, &candidates);

        for conflict in &resolution.conflicts {
            tracing::warn!(
                model = %model,
                conflict = %serde_json::to_string(conflict).unwrap_or_default(),
                "Identity conflict"
            );
        }
        Ok((hints, resolution))
    }

    /// Apply one remote record.
    ///
    /// Remote deletions are honoured only for records linked through their
    /// cloud id; a deletion matched by any weaker key is skipped.
    pub async fn apply(
        &self,
        model: &str,
        operation: Operation,
        record: &Value,
        mode: ResolveMode,
        now: Timestamp,
    ) -> SyncResult<Applied> {
        let (hints, resolution) = self.resolve(model, record, mode).await?;
        let options = SyncOptions::skip_queue();

        if operation == Operation::Unlink {
            return match (resolution.local_id, resolution.strategy) {
                (Some(local_id), Some(Strategy::CloudSyncId)) => {
                    self.entities.delete(model, local_id, options).await?;
                    self.metadata.remove(model, local_id).await?;
                    Ok(Applied::Deleted { local_id })
                }
                (Some(_), _) => Ok(Applied::Skipped {
                    reason: "deletion of a record not linked by cloud id".to_string(),
                }),
                (None, _) => Ok(Applied::Skipped {
                    reason: "deletion of an unknown record".to_string(),
                }),
            };
        }

        let write = RecordWrite {
            model: model.to_string(),
            target: resolution.local_id,
            payload: local_payload(record),
            link: resolution.link,
            legacy_id: hints.legacy_id,
            synced_at: now,
        };
        Ok(match self.writer.write(write).await? {
            Written::Created(local_id) => Applied::Created { local_id },
            Written::Updated(local_id) => Applied::Updated { local_id },
        })
    }

    /// Collect local candidates for every key the hints carry.
    async fn gather(&self, model: &str, hints: &ResolveHints) -> SyncResult<Candidates> {
        let profile = self.profiles.get(model);
        let mut candidates = Candidates::default();

        if let Some(cloud_sync_id) = hints.cloud_sync_id {
            if let Some(row) = self.metadata.find_by_cloud(model, cloud_sync_id).await? {
                match self.entities.get(model, row.local_id).await? {
                    Some(record) => candidates.by_cloud = Some(self.candidate(model, record).await?),
                    None => {
                        tracing::debug!(model = %model, local_id = row.local_id, "Dropping link of a deleted record");
                        self.metadata.remove(model, row.local_id).await?;
                    }
                }
            }
        }

        if let Some(legacy_id) = hints.legacy_id {
            let mut seen = BTreeSet::new();
            for row in self.metadata.find_by_legacy(model, legacy_id).await? {
                if let Some(record) = self.entities.get(model, row.local_id).await? {
                    if seen.insert(record.local_id) {
                        candidates.by_legacy.push(self.candidate(model, record).await?);
                    }
                }
            }
            let stamped = self
                .entities
                .find_by_fields(model, &[(profile.legacy_field.clone(), Value::from(legacy_id))])
                .await?;
            for record in stamped {
                if seen.insert(record.local_id) {
                    candidates.by_legacy.push(self.candidate(model, record).await?);
                }
            }
        }

        for key in &hints.natural_keys {
            let fields: Vec<(String, Value)> = key
                .pairs()
                .map(|(field, value)| (field.to_string(), value.clone()))
                .collect();
            let mut group = Vec::new();
            for record in self.entities.find_by_fields(model, &fields).await? {
                group.push(self.candidate(model, record).await?);
            }
            candidates.by_natural.push(group);
        }

        if profile.match_primary_key {
            if let Some(remote_pk) = hints.remote_pk {
                if let Some(record) = self.entities.get(model, remote_pk).await? {
                    candidates.by_pk = Some(self.candidate(model, record).await?);
                }
            }
        }

        Ok(candidates)
    }

    async fn candidate(&self, model: &str, record: LocalRecord) -> SyncResult<Candidate> {
        let cloud_sync_id = self
            .metadata
            .get(model, record.local_id)
            .await?
            .and_then(|row| row.cloud_sync_id);
        Ok(Candidate::new(record.local_id, cloud_sync_id, record.payload))
    }
}

/// The remote payload without remote-only identity fields.
fn local_payload(record: &Value) -> Value {
    let mut payload = record.clone();
    if let Some(object) = payload.as_object_mut() {
        for field in REMOTE_ONLY_FIELDS {
            object.remove(*field);
        }
    }
    payload
}
