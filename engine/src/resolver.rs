//! Entity identity resolution.
//!
//! Maps a remote record onto the local record it represents. The storage
//! layer gathers [`Candidates`] for every key the record carries; the
//! [`Resolver`] then applies strategy precedence without any IO, so the same
//! hints and candidates always resolve to the same identity.
//!
//! # Strategies
//!
//! In steady-state sync, first match wins:
//!
//! 1. [`Strategy::CloudSyncId`] - a record already linked to the remote id
//! 2. [`Strategy::LegacyKey`] - the migration bridge key, narrowed by
//!    discriminator fields when several local records share it
//! 3. [`Strategy::NaturalKey`] - business keys declared by the model profile
//! 4. [`Strategy::PrimaryKey`] - same local id, only for cloned databases
//!
//! Migration runs legacy and natural keys before the cloud id, since those
//! imports are first contact with the remote.
//!
//! A candidate already linked to a *different* cloud id is never matched by
//! strategies 2-4. Such clashes are reported as [`ResolutionConflict`]s for
//! the caller to log.

use crate::profile::ModelProfile;
use crate::{CloudId, LegacyId, LocalId, ModelName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which pass is resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveMode {
    /// Regular push/pull cycles
    #[default]
    Steady,
    /// First-time bulk import
    Migration,
}

impl ResolveMode {
    fn order(&self) -> [Strategy; 4] {
        match self {
            ResolveMode::Steady => [
                Strategy::CloudSyncId,
                Strategy::LegacyKey,
                Strategy::NaturalKey,
                Strategy::PrimaryKey,
            ],
            ResolveMode::Migration => [
                Strategy::LegacyKey,
                Strategy::NaturalKey,
                Strategy::CloudSyncId,
                Strategy::PrimaryKey,
            ],
        }
    }
}

/// Strategy that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CloudSyncId,
    LegacyKey,
    NaturalKey,
    PrimaryKey,
}

/// Values of one natural key found on a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub fields: Vec<String>,
    pub values: Vec<Value>,
}

impl KeyValue {
    /// `(field, value)` pairs of this key.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Identity keys carried by a remote record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveHints {
    pub cloud_sync_id: Option<CloudId>,
    pub legacy_id: Option<LegacyId>,
    /// Present natural keys, in profile order
    pub natural_keys: Vec<KeyValue>,
    pub discriminators: BTreeMap<String, Value>,
    /// The remote's own primary key
    pub remote_pk: Option<LocalId>,
}

impl ResolveHints {
    /// Extract hints from a remote JSON record according to its profile.
    ///
    /// The remote `id` doubles as the cloud id unless the record carries an
    /// explicit `cloud_sync_id`. Null, `false` and empty strings count as
    /// absent.
    pub fn from_record(profile: &ModelProfile, record: &Value) -> Self {
        let remote_pk = int_field(record, "id");
        let cloud_sync_id = int_field(record, "cloud_sync_id").or(remote_pk);
        let legacy_id = int_field(record, &profile.legacy_field);

        let natural_keys = profile
            .natural_keys
            .iter()
            .filter_map(|fields| {
                let values: Option<Vec<Value>> = fields
                    .iter()
                    .map(|field| present(record.get(field)).cloned())
                    .collect();
                values.map(|values| KeyValue {
                    fields: fields.clone(),
                    values,
                })
            })
            .collect();

        let discriminators = profile
            .discriminators
            .iter()
            .filter_map(|field| {
                present(record.get(field)).map(|value| (field.clone(), value.clone()))
            })
            .collect();

        Self {
            cloud_sync_id,
            legacy_id,
            natural_keys,
            discriminators,
            remote_pk,
        }
    }
}

/// A local record that might be the target of a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub local_id: LocalId,
    /// Cloud id the local record is already linked to
    pub cloud_sync_id: Option<CloudId>,
    /// Local payload, used for discriminator checks
    pub fields: Value,
}

impl Candidate {
    pub fn new(local_id: LocalId, cloud_sync_id: Option<CloudId>, fields: Value) -> Self {
        Self {
            local_id,
            cloud_sync_id,
            fields,
        }
    }

    fn matches_discriminators(&self, discriminators: &BTreeMap<String, Value>) -> bool {
        discriminators
            .iter()
            .all(|(field, value)| self.fields.get(field) == Some(value))
    }
}

/// Local candidates per strategy, as gathered by the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidates {
    /// Record linked to `hints.cloud_sync_id`
    pub by_cloud: Option<Candidate>,
    /// Records carrying `hints.legacy_id`
    pub by_legacy: Vec<Candidate>,
    /// One group per entry of `hints.natural_keys`
    pub by_natural: Vec<Vec<Candidate>>,
    /// Record whose local id equals `hints.remote_pk`
    pub by_pk: Option<Candidate>,
}

/// Kind of clash found while resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// The candidate is linked to another cloud id and was skipped
    LinkedElsewhere { local_id: LocalId, existing: CloudId },
    /// Several candidates survived; the lowest local id was taken
    Ambiguous {
        candidates: Vec<LocalId>,
        chosen: LocalId,
    },
    /// The match differs from the record already holding the cloud id, so
    /// the cloud id was not linked
    CloudIdHeldElsewhere { matched: LocalId, holder: LocalId },
}

/// A structural conflict, reported for audit logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConflict {
    pub model: ModelName,
    pub strategy: Strategy,
    pub incoming_cloud_id: Option<CloudId>,
    #[serde(flatten)]
    pub kind: ConflictKind,
}

/// Outcome of resolving one remote record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Matched local record; `None` means the caller creates one
    pub local_id: Option<LocalId>,
    pub strategy: Option<Strategy>,
    /// Cloud id to stamp on the matched or created record
    pub link: Option<CloudId>,
    pub conflicts: Vec<ResolutionConflict>,
}

impl Resolution {
    /// True when no local record matched.
    pub fn is_new(&self) -> bool {
        self.local_id.is_none()
    }
}

/// Applies strategy precedence for one model.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    profile: &'a ModelProfile,
    mode: ResolveMode,
}

impl<'a> Resolver<'a> {
    pub fn new(profile: &'a ModelProfile, mode: ResolveMode) -> Self {
        Self { profile, mode }
    }

    /// Resolve a remote record given its hints and the gathered candidates.
    pub fn resolve(&self, hints: &ResolveHints, candidates: &Candidates) -> Resolution {
        let mut resolution = Resolution::default();

        for strategy in self.mode.order() {
            let matched = match strategy {
                Strategy::CloudSyncId => candidates.by_cloud.as_ref().map(|c| c.local_id),
                Strategy::LegacyKey => self.pick(
                    strategy,
                    &candidates.by_legacy,
                    hints,
                    &mut resolution.conflicts,
                ),
                Strategy::NaturalKey => candidates.by_natural.iter().find_map(|group| {
                    self.pick(strategy, group, hints, &mut resolution.conflicts)
                }),
                Strategy::PrimaryKey => self.pick_primary_key(hints, candidates, &mut resolution),
            };

            if let Some(local_id) = matched {
                resolution.local_id = Some(local_id);
                resolution.strategy = Some(strategy);
                break;
            }
        }

        resolution.link = self.link_decision(hints, candidates, &mut resolution);
        resolution
    }

    /// Pick one candidate of a group, skipping records linked elsewhere and
    /// narrowing by discriminators when several remain. An ambiguity that
    /// discriminators cannot settle takes the lowest local id.
    fn pick(
        &self,
        strategy: Strategy,
        group: &[Candidate],
        hints: &ResolveHints,
        conflicts: &mut Vec<ResolutionConflict>,
    ) -> Option<LocalId> {
        let mut eligible: Vec<&Candidate> = Vec::with_capacity(group.len());
        for candidate in group {
            match (candidate.cloud_sync_id, hints.cloud_sync_id) {
                (Some(existing), Some(incoming)) if existing != incoming => {
                    conflicts.push(self.conflict(
                        strategy,
                        hints,
                        ConflictKind::LinkedElsewhere {
                            local_id: candidate.local_id,
                            existing,
                        },
                    ));
                }
                _ => eligible.push(candidate),
            }
        }
        eligible.sort_by_key(|c| c.local_id);
        eligible.dedup_by_key(|c| c.local_id);

        match eligible.as_slice() {
            [] => None,
            [only] => Some(only.local_id),
            _ => {
                let mut narrowed: Vec<LocalId> = eligible
                    .iter()
                    .filter(|c| c.matches_discriminators(&hints.discriminators))
                    .map(|c| c.local_id)
                    .collect();
                if narrowed.is_empty() {
                    narrowed = eligible.iter().map(|c| c.local_id).collect();
                }
                match narrowed.as_slice() {
                    [] => None,
                    [only] => Some(*only),
                    [chosen, ..] => {
                        let chosen = *chosen;
                        conflicts.push(self.conflict(
                            strategy,
                            hints,
                            ConflictKind::Ambiguous {
                                candidates: narrowed,
                                chosen,
                            },
                        ));
                        Some(chosen)
                    }
                }
            }
        }
    }

    fn pick_primary_key(
        &self,
        hints: &ResolveHints,
        candidates: &Candidates,
        resolution: &mut Resolution,
    ) -> Option<LocalId> {
        if !self.profile.match_primary_key {
            return None;
        }
        let candidate = candidates.by_pk.as_ref()?;
        if hints.remote_pk != Some(candidate.local_id) {
            return None;
        }
        self.pick(
            Strategy::PrimaryKey,
            std::slice::from_ref(candidate),
            hints,
            &mut resolution.conflicts,
        )
    }

    /// Decide which cloud id, if any, the caller should stamp.
    fn link_decision(
        &self,
        hints: &ResolveHints,
        candidates: &Candidates,
        resolution: &mut Resolution,
    ) -> Option<CloudId> {
        let incoming = hints.cloud_sync_id?;
        let Some(local_id) = resolution.local_id else {
            return Some(incoming);
        };

        match &candidates.by_cloud {
            Some(holder) if holder.local_id != local_id => {
                let conflict = self.conflict(
                    resolution.strategy.unwrap_or(Strategy::CloudSyncId),
                    hints,
                    ConflictKind::CloudIdHeldElsewhere {
                        matched: local_id,
                        holder: holder.local_id,
                    },
                );
                resolution.conflicts.push(conflict);
                None
            }
            Some(_) => None,
            None => Some(incoming),
        }
    }

    fn conflict(
        &self,
        strategy: Strategy,
        hints: &ResolveHints,
        kind: ConflictKind,
    ) -> ResolutionConflict {
        ResolutionConflict {
            model: self.profile.model.clone(),
            strategy,
            incoming_cloud_id: hints.cloud_sync_id,
            kind,
        }
    }
}

/// A field value that counts as present.
fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some(value),
    }
}

/// Integer field, accepting numeric strings.
fn int_field(record: &Value, field: &str) -> Option<i64> {
    match present(record.get(field))? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
