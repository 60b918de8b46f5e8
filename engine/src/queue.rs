//! The sync queue - ordered store of mutations waiting to be pushed.
//!
//! Every local mutation of a synced entity becomes a [`QueueRecord`]. The
//! queue keeps at most one *open* entry (`pending` or `error`) per
//! `(model, record_id)`: later mutations coalesce into the existing entry
//! instead of adding rows, so a burst of edits is pushed once with the final
//! payload.
//!
//! # Lifecycle
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!  ┌──────► pending ──dequeue──► sent ──ok──► done
//!  │           ▲                  │
//!  │           └──── release ─────┤ (transport failure, budget untouched)
//!  │                              │
//!  └── requeue ─ error ◄──fail────┤ (retry budget left)
//!                                 │
//!      requeue ─ dead  ◄──fail────┘ (budget exhausted)
//! ```
//!
//! `dequeue_batch` stamps a lock token on every row it returns and removes
//! the row from the open set, so a second caller can never receive it.

use crate::{error::Result, Error, LocalId, ModelName, Priority, QueueId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation captured for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Write,
    Unlink,
}

impl Operation {
    /// Wire/storage name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Write => "write",
            Operation::Unlink => "unlink",
        }
    }

    /// Merge a newer operation into an open entry holding `self`.
    ///
    /// Returns `None` when the two cancel out: a record created and deleted
    /// before it ever reached the remote needs no push at all. Once the
    /// create has been attempted the remote may hold the record, so the
    /// deletion is kept.
    pub fn coalesce(self, newer: Operation, attempted: bool) -> Option<Operation> {
        match (self, newer) {
            (Operation::Create, Operation::Write) => Some(Operation::Create),
            (Operation::Create, Operation::Unlink) if attempted => Some(Operation::Unlink),
            (Operation::Create, Operation::Unlink) => None,
            (Operation::Unlink, Operation::Create) => Some(Operation::Write),
            (_, newer) => Some(newer),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "write" => Ok(Operation::Write),
            "unlink" => Ok(Operation::Unlink),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}

/// State of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Waiting for the next cycle
    Pending,
    /// Locked by a running cycle
    Sent,
    /// Rejected by the remote, retry budget left
    Error,
    /// Retry budget exhausted; needs a manual requeue
    Dead,
    /// Accepted by the remote
    Done,
}

impl QueueState {
    /// Open entries are eligible for dequeue and absorb new mutations.
    pub fn is_open(&self) -> bool {
        matches!(self, QueueState::Pending | QueueState::Error)
    }

    /// Terminal entries are only touched by cleanup or a manual requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Dead | QueueState::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Sent => "sent",
            QueueState::Error => "error",
            QueueState::Dead => "dead",
            QueueState::Done => "done",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueState::Pending),
            "sent" => Ok(QueueState::Sent),
            "error" => Ok(QueueState::Error),
            "dead" => Ok(QueueState::Dead),
            "done" => Ok(QueueState::Done),
            other => Err(Error::UnknownState(other.to_string())),
        }
    }
}

/// A captured mutation, before it becomes a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub model: ModelName,
    pub record_id: LocalId,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub node_scope: String,
    pub priority: Priority,
}

impl Mutation {
    /// Create a mutation with default priority.
    pub fn new(
        model: impl Into<ModelName>,
        record_id: LocalId,
        operation: Operation,
        payload: serde_json::Value,
        node_scope: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            record_id,
            operation,
            payload,
            node_scope: node_scope.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A row of the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: QueueId,
    pub model_name: ModelName,
    pub record_id: LocalId,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub node_scope: String,
    pub priority: Priority,
    pub state: QueueState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: Timestamp,
    pub last_attempt_at: Option<Timestamp>,
    pub error_message: Option<String>,
    /// Token of the cycle holding this row while `sent`
    pub lock_token: Option<String>,
}

/// Result of folding an older entry into a newer open one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// The newer entry absorbed the older one
    Merged,
    /// The operations cancelled out; both entries go away
    Cancelled,
}

impl QueueRecord {
    /// Build a fresh pending entry from a mutation.
    pub fn from_mutation(
        id: QueueId,
        mutation: Mutation,
        max_retries: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            model_name: mutation.model,
            record_id: mutation.record_id,
            operation: mutation.operation,
            payload: mutation.payload,
            node_scope: mutation.node_scope,
            priority: mutation.priority,
            state: QueueState::Pending,
            retry_count: 0,
            max_retries,
            created_at: now,
            last_attempt_at: None,
            error_message: None,
            lock_token: None,
        }
    }

    /// Absorb a newer mutation into this open entry.
    ///
    /// The payload is replaced, the priority raised to the max of both, and
    /// the queue position (`created_at`) kept. Returns `false` when the
    /// entry cancelled out and must be dropped.
    pub fn coalesce(&mut self, mutation: Mutation) -> bool {
        let attempted = self.last_attempt_at.is_some();
        match self.operation.coalesce(mutation.operation, attempted) {
            Some(operation) => {
                self.operation = operation;
                self.payload = mutation.payload;
                self.priority = self.priority.max(mutation.priority);
                true
            }
            None => false,
        }
    }

    /// Fold this (older) entry into `newer`, an open entry for the same key
    /// that appeared while this one was locked.
    ///
    /// Consumed retry budget and the last attempt carry over, so a record
    /// that keeps changing while the remote keeps rejecting it still
    /// dead-letters.
    pub fn fold_into(&self, newer: &mut QueueRecord) -> FoldOutcome {
        let attempted = self.last_attempt_at.is_some() || newer.last_attempt_at.is_some();
        match self.operation.coalesce(newer.operation, attempted) {
            Some(operation) => {
                newer.operation = operation;
                newer.priority = newer.priority.max(self.priority);
                newer.created_at = newer.created_at.min(self.created_at);
                newer.retry_count = newer.retry_count.max(self.retry_count);
                newer.last_attempt_at = newer.last_attempt_at.max(self.last_attempt_at);
                if newer.error_message.is_none() {
                    newer.error_message = self.error_message.clone();
                }
                FoldOutcome::Merged
            }
            None => FoldOutcome::Cancelled,
        }
    }

    /// Accept a locked entry.
    pub fn complete(&mut self, now: Timestamp) -> Result<()> {
        self.ensure_state(QueueState::Sent)?;
        self.state = QueueState::Done;
        self.lock_token = None;
        self.error_message = None;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Reject a locked entry, consuming one unit of retry budget.
    pub fn fail(&mut self, message: impl Into<String>, now: Timestamp) -> Result<QueueState> {
        self.ensure_state(QueueState::Sent)?;
        self.retry_count += 1;
        self.error_message = Some(message.into());
        self.lock_token = None;
        self.last_attempt_at = Some(now);
        self.state = if self.retry_count >= self.max_retries {
            QueueState::Dead
        } else {
            QueueState::Error
        };
        Ok(self.state)
    }

    /// Return a locked entry to `pending`. False if it was not locked.
    pub fn unlock(&mut self) -> bool {
        if self.state != QueueState::Sent {
            return false;
        }
        self.state = QueueState::Pending;
        self.lock_token = None;
        true
    }

    /// Reset a dead or failed entry with a fresh retry budget.
    pub fn reset(&mut self) -> Result<()> {
        if !matches!(self.state, QueueState::Dead | QueueState::Error) {
            return Err(Error::InvalidQueueState {
                id: self.id,
                state: self.state.to_string(),
                expected: "dead or error".to_string(),
            });
        }
        self.state = QueueState::Pending;
        self.retry_count = 0;
        self.error_message = None;
        Ok(())
    }

    fn ensure_state(&self, expected: QueueState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidQueueState {
                id: self.id,
                state: self.state.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Queue key of this entry.
    pub fn key(&self) -> (ModelName, LocalId) {
        (self.model_name.clone(), self.record_id)
    }

    /// Dequeue order: priority desc, then created_at asc, then id.
    pub fn dequeue_order(a: &QueueRecord, b: &QueueRecord) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was inserted
    Inserted(QueueId),
    /// The mutation was merged into an existing open entry
    Coalesced(QueueId),
    /// The mutation cancelled the open entry, which was removed
    Cancelled(QueueId),
}

impl EnqueueOutcome {
    pub fn id(&self) -> QueueId {
        match self {
            EnqueueOutcome::Inserted(id)
            | EnqueueOutcome::Coalesced(id)
            | EnqueueOutcome::Cancelled(id) => *id,
        }
    }
}

/// Selection for [`SyncQueue::dequeue_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueRequest {
    pub limit: usize,
    pub node_scope: String,
    /// Restrict to one model; `None` takes entries of every model
    pub model: Option<ModelName>,
}

impl DequeueRequest {
    pub fn new(limit: usize, node_scope: impl Into<String>) -> Self {
        Self {
            limit,
            node_scope: node_scope.into(),
            model: None,
        }
    }

    pub fn for_model(mut self, model: impl Into<ModelName>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Whether an entry falls inside this selection (state aside).
    pub fn matches(&self, entry: &QueueRecord) -> bool {
        entry.node_scope == self.node_scope
            && self
                .model
                .as_ref()
                .map_or(true, |model| &entry.model_name == model)
    }
}

/// Number of entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub error: u64,
    pub dead: u64,
    pub done: u64,
}

impl QueueStats {
    /// Count one entry in the given state.
    pub fn record(&mut self, state: QueueState) {
        self.add(state, 1);
    }

    /// Count `count` entries in the given state.
    pub fn add(&mut self, state: QueueState, count: u64) {
        match state {
            QueueState::Pending => self.pending += count,
            QueueState::Sent => self.sent += count,
            QueueState::Error => self.error += count,
            QueueState::Dead => self.dead += count,
            QueueState::Done => self.done += count,
        }
    }

    /// Entries still waiting to be pushed.
    pub fn open(&self) -> u64 {
        self.pending + self.error
    }

    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.error + self.dead + self.done
    }
}

/// In-memory sync queue.
#[derive(Debug, Clone, Default)]
pub struct SyncQueue {
    entries: BTreeMap<QueueId, QueueRecord>,
    /// Open entry per (model, record_id)
    open: HashMap<(ModelName, LocalId), QueueId>,
    next_id: QueueId,
    max_retries: u32,
}

impl SyncQueue {
    /// Create an empty queue; new entries get `max_retries` attempts.
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            open: HashMap::new(),
            next_id: 1,
            max_retries: max_retries.max(1),
        }
    }

    /// Retry budget given to new entries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add a mutation, coalescing into the open entry for the same record.
    pub fn enqueue(&mut self, mutation: Mutation, now: Timestamp) -> EnqueueOutcome {
        let key = (mutation.model.clone(), mutation.record_id);

        if let Some(entry) = self.open.get(&key).and_then(|id| self.entries.get_mut(id)) {
            let id = entry.id;
            if entry.coalesce(mutation) {
                return EnqueueOutcome::Coalesced(id);
            }
            self.entries.remove(&id);
            self.open.remove(&key);
            return EnqueueOutcome::Cancelled(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            QueueRecord::from_mutation(id, mutation, self.max_retries, now),
        );
        self.open.insert(key, id);
        EnqueueOutcome::Inserted(id)
    }

    /// Lock and return up to `request.limit` open entries.
    ///
    /// Returned entries are `sent` and carry `lock_token` until they are
    /// marked done, failed or released.
    pub fn dequeue_batch(
        &mut self,
        request: &DequeueRequest,
        lock_token: &str,
        now: Timestamp,
    ) -> Vec<QueueRecord> {
        let mut candidates: Vec<&QueueRecord> = self
            .entries
            .values()
            .filter(|entry| entry.state.is_open() && request.matches(entry))
            .collect();
        candidates.sort_by(|a, b| QueueRecord::dequeue_order(a, b));
        let ids: Vec<QueueId> = candidates
            .into_iter()
            .take(request.limit)
            .map(|entry| entry.id)
            .collect();

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = QueueState::Sent;
                entry.lock_token = Some(lock_token.to_string());
                entry.last_attempt_at = Some(now);
                self.open.remove(&entry.key());
                batch.push(entry.clone());
            }
        }
        batch
    }

    /// Mark a locked entry as accepted by the remote.
    pub fn mark_done(&mut self, id: QueueId, now: Timestamp) -> Result<()> {
        self.entry_mut(id)?.complete(now)
    }

    /// Record an application-level rejection of a locked entry.
    ///
    /// Consumes one unit of retry budget; the entry becomes `dead` once
    /// `retry_count` reaches `max_retries`. Returns the resulting state.
    pub fn mark_failed(
        &mut self,
        id: QueueId,
        message: impl Into<String>,
        now: Timestamp,
    ) -> Result<QueueState> {
        let state = self.entry_mut(id)?.fail(message, now)?;
        if state.is_open() {
            self.reopen(id);
        }
        Ok(state)
    }

    /// Return locked entries to `pending` without touching their retry
    /// budget. Used when the transport failed, not the data.
    pub fn release(&mut self, ids: &[QueueId]) -> usize {
        let mut released = 0;
        for &id in ids {
            let unlocked = self
                .entries
                .get_mut(&id)
                .map(QueueRecord::unlock)
                .unwrap_or(false);
            if unlocked {
                self.reopen(id);
                released += 1;
            }
        }
        released
    }

    /// Manually reset a dead or failed entry to `pending` with a fresh
    /// retry budget.
    pub fn requeue(&mut self, id: QueueId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let was_open = entry.state.is_open();
        entry.reset()?;
        if !was_open {
            self.reopen(id);
        }
        Ok(())
    }

    /// Requeue every dead entry. Returns how many were reset.
    pub fn requeue_dead(&mut self) -> usize {
        let dead: Vec<QueueId> = self
            .entries
            .values()
            .filter(|entry| entry.state == QueueState::Dead)
            .map(|entry| entry.id)
            .collect();
        dead.into_iter()
            .filter(|&id| self.requeue(id).is_ok())
            .count()
    }

    /// Release entries locked before `older_than` by a cycle that never
    /// finished (crash, killed task).
    pub fn recover_stale(&mut self, older_than: Timestamp) -> usize {
        let stale: Vec<QueueId> = self
            .entries
            .values()
            .filter(|entry| {
                entry.state == QueueState::Sent
                    && entry.last_attempt_at.unwrap_or(entry.created_at) < older_than
            })
            .map(|entry| entry.id)
            .collect();
        self.release(&stale)
    }

    /// Purge `done` and `dead` entries last touched before `older_than`.
    pub fn cleanup(&mut self, older_than: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.state.is_terminal()
                && entry.last_attempt_at.unwrap_or(entry.created_at) < older_than)
        });
        before - self.entries.len()
    }

    /// Get an entry by ID.
    pub fn get(&self, id: QueueId) -> Option<&QueueRecord> {
        self.entries.get(&id)
    }

    /// The open entry for a record, if any.
    pub fn open_entry(&self, model: &str, record_id: LocalId) -> Option<&QueueRecord> {
        self.open
            .get(&(model.to_string(), record_id))
            .and_then(|id| self.entries.get(id))
    }

    /// Entries in a given state, oldest first.
    pub fn list(&self, state: QueueState) -> Vec<QueueRecord> {
        self.entries
            .values()
            .filter(|entry| entry.state == state)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.entries.values() {
            stats.record(entry.state);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, id: QueueId) -> Result<&mut QueueRecord> {
        self.entries
            .get_mut(&id)
            .ok_or(Error::QueueEntryNotFound(id))
    }

    /// Put an entry back into the open set, folding it into a newer open
    /// entry for the same record if one appeared in the meantime.
    fn reopen(&mut self, id: QueueId) {
        let Some(key) = self.entries.get(&id).map(QueueRecord::key) else {
            return;
        };
        let newer_id = match self.open.get(&key) {
            Some(&newer_id) if newer_id != id => newer_id,
            _ => {
                self.open.insert(key, id);
                return;
            }
        };

        let Some(older) = self.entries.remove(&id) else {
            return;
        };
        let outcome = match self.entries.get_mut(&newer_id) {
            Some(newer) => older.fold_into(newer),
            None => {
                self.entries.insert(id, older);
                self.open.insert(key, id);
                return;
            }
        };
        if outcome == FoldOutcome::Cancelled {
            self.entries.remove(&newer_id);
            self.open.remove(&key);
        }
    }
}
