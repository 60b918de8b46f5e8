//! Wire messages exchanged with the PRINCIPAL.
//!
//! All endpoints speak JSON. Every response carries a `success` flag; a
//! `false` flag with an `error` string is a request-level rejection, distinct
//! from per-record results.

use crate::{manifest::MigrationManifest, CloudId, LocalId, ModelName, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One record of a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRecord {
    /// Local id of the record on the pushing node
    pub record_id: LocalId,
    /// Remote id, once the record has been linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_sync_id: Option<CloudId>,
    pub payload: serde_json::Value,
}

/// `POST /sync/push`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub model: ModelName,
    pub operation: Operation,
    pub records: Vec<PushRecord>,
    pub node_scope: String,
    pub api_key: String,
}

/// Per-record verdict of the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub record_id: LocalId,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Remote id assigned to a newly created record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_sync_id: Option<CloudId>,
}

impl RecordResult {
    pub fn ok(record_id: LocalId) -> Self {
        Self {
            record_id,
            status: RecordStatus::Ok,
            message: None,
            cloud_sync_id: None,
        }
    }

    pub fn error(record_id: LocalId, message: impl Into<String>) -> Self {
        Self {
            record_id,
            status: RecordStatus::Error,
            message: Some(message.into()),
            cloud_sync_id: None,
        }
    }

    pub fn with_cloud_id(mut self, cloud_sync_id: CloudId) -> Self {
        self.cloud_sync_id = Some(cloud_sync_id);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<RecordResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What happened to one pushed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted { cloud_sync_id: Option<CloudId> },
    Rejected { message: String },
}

impl PushResponse {
    /// Verdict for each pushed record, in push order.
    ///
    /// A record the remote did not report on is rejected, as is every record
    /// of a response that failed as a whole without per-record results.
    pub fn outcomes(&self, record_ids: &[LocalId]) -> Vec<(LocalId, PushOutcome)> {
        let by_id: BTreeMap<LocalId, &RecordResult> =
            self.results.iter().map(|r| (r.record_id, r)).collect();
        let batch_error = self
            .error
            .clone()
            .unwrap_or_else(|| "remote rejected the batch".to_string());

        record_ids
            .iter()
            .map(|&record_id| {
                let outcome = match by_id.get(&record_id) {
                    Some(result) if result.status == RecordStatus::Ok => PushOutcome::Accepted {
                        cloud_sync_id: result.cloud_sync_id,
                    },
                    Some(result) => PushOutcome::Rejected {
                        message: result
                            .message
                            .clone()
                            .unwrap_or_else(|| "rejected without message".to_string()),
                    },
                    None if !self.success && self.results.is_empty() => PushOutcome::Rejected {
                        message: batch_error.clone(),
                    },
                    None => PushOutcome::Rejected {
                        message: "no result returned by remote".to_string(),
                    },
                };
                (record_id, outcome)
            })
            .collect()
    }
}

/// `GET /ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub success: bool,
    #[serde(default)]
    pub version: String,
}

/// `POST /migration/manifest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub success: bool,
    #[serde(default)]
    pub manifest: BTreeMap<ModelName, u64>,
    #[serde(default)]
    pub sync_order: Vec<ModelName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestResponse {
    pub fn into_manifest(self) -> MigrationManifest {
        MigrationManifest::new(self.manifest, self.sync_order)
    }
}

/// `POST /migration/pull_batch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullBatchRequest {
    pub model: ModelName,
    pub limit: u64,
    pub offset: u64,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullBatchResponse {
    pub success: bool,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /sync/pull` - remote-originated changes for hybrid nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesRequest {
    pub node_scope: String,
    /// Token returned by the previous pull; `None` on first contact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    pub limit: u64,
    pub models: Vec<ModelName>,
    pub api_key: String,
}

/// A change made on the PRINCIPAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub model: ModelName,
    pub operation: Operation,
    pub record: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub success: bool,
    #[serde(default)]
    pub changes: Vec<RemoteChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
