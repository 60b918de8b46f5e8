//! Change capture: turning committed domain writes into queue mutations.
//!
//! The write path hands every committed mutation to a [`CaptureFilter`]
//! together with the caller's [`SyncOptions`]. Writes performed by the sync
//! machinery itself carry `skip_queue` so that applying a pulled change never
//! echoes it back to the PRINCIPAL.

use crate::{
    config::{OperationMode, SyncConfig},
    LocalId, ModelName, Mutation, Operation, Priority,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Options threaded through a domain write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Do not record this write for sync
    pub skip_queue: bool,
    pub priority: Priority,
}

impl SyncOptions {
    /// Options for writes that originate from the remote.
    pub fn skip_queue() -> Self {
        Self {
            skip_queue: true,
            ..Self::default()
        }
    }

    pub fn with_priority(priority: Priority) -> Self {
        Self {
            skip_queue: false,
            priority,
        }
    }
}

/// A committed local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub model: ModelName,
    pub record_id: LocalId,
    pub operation: Operation,
    pub payload: serde_json::Value,
}

impl MutationEvent {
    pub fn new(
        model: impl Into<ModelName>,
        record_id: LocalId,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            model: model.into(),
            record_id,
            operation,
            payload,
        }
    }
}

/// Decides which mutations are queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    node_scope: String,
    models: BTreeSet<ModelName>,
    mode: OperationMode,
}

impl CaptureFilter {
    pub fn new(node_scope: impl Into<String>, mode: OperationMode) -> Self {
        Self {
            node_scope: node_scope.into(),
            models: BTreeSet::new(),
            mode,
        }
    }

    /// Filter matching the enabled entities of a node configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            node_scope: config.node_scope.clone(),
            models: config.enabled_models().into_iter().collect(),
            mode: config.operation_mode,
        }
    }

    pub fn with_model(mut self, model: impl Into<ModelName>) -> Self {
        self.models.insert(model.into());
        self
    }

    /// Offline nodes keep queueing: the queue is what they replay once
    /// connectivity is configured.
    pub fn should_capture(&self, event: &MutationEvent, options: &SyncOptions) -> bool {
        !options.skip_queue && self.models.contains(&event.model)
    }

    /// The queue mutation for an event, or `None` when it is filtered out.
    pub fn capture(&self, event: MutationEvent, options: &SyncOptions) -> Option<Mutation> {
        if !self.should_capture(&event, options) {
            return None;
        }
        Some(
            Mutation::new(
                event.model,
                event.record_id,
                event.operation,
                event.payload,
                self.node_scope.clone(),
            )
            .with_priority(options.priority),
        )
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }
}
