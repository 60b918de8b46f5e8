//! In-process stand-in for the PRINCIPAL plus node wiring helpers.

#![allow(dead_code)]

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use possync_engine::{
    ChangesRequest, ChangesResponse, LocalId, ManifestRequest, ManifestResponse, PingResponse,
    PullBatchRequest, PullBatchResponse, PushRequest, PushResponse, RecordResult, RemoteChange,
    SyncConfig,
};
use possync_node::config::Config;
use possync_node::{Node, Stores};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const API_KEY: &str = "test-key";

/// Scriptable PRINCIPAL.
pub struct Principal {
    pub healthy: AtomicBool,
    /// Local record ids whose push is rejected
    pub rejected: Mutex<BTreeSet<LocalId>>,
    pub push_delay: Mutex<Option<Duration>>,
    pub pushes: Mutex<Vec<PushRequest>>,
    pub changes: Mutex<Vec<RemoteChange>>,
    pub pulls: AtomicUsize,
    pub master: Mutex<BTreeMap<String, Vec<Value>>>,
    pub batch_requests: Mutex<Vec<PullBatchRequest>>,
    pub batch_delay: Mutex<Option<Duration>>,
    /// Offset whose next batch request answers 503
    pub fail_batch_at: Mutex<Option<u64>>,
    next_cloud_id: AtomicI64,
}

impl Default for Principal {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            rejected: Mutex::new(BTreeSet::new()),
            push_delay: Mutex::new(None),
            pushes: Mutex::new(Vec::new()),
            changes: Mutex::new(Vec::new()),
            pulls: AtomicUsize::new(0),
            master: Mutex::new(BTreeMap::new()),
            batch_requests: Mutex::new(Vec::new()),
            batch_delay: Mutex::new(None),
            fail_batch_at: Mutex::new(None),
            next_cloud_id: AtomicI64::new(5_000),
        }
    }
}

impl Principal {
    pub fn reject(&self, record_id: LocalId) {
        self.rejected.lock().insert(record_id);
    }

    pub fn pushed_ids(&self) -> Vec<Vec<LocalId>> {
        self.pushes
            .lock()
            .iter()
            .map(|push| push.records.iter().map(|r| r.record_id).collect())
            .collect()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }
}

/// Serve `principal` on an ephemeral port and return its base URL.
pub async fn spawn_principal(principal: Arc<Principal>) -> String {
    let router = Router::new()
        .route("/ping", get(ping))
        .route("/sync/push", post(push))
        .route("/sync/pull", post(pull))
        .route("/migration/manifest", post(manifest))
        .route("/migration/pull_batch", post(pull_batch))
        .with_state(principal);
    serve(router).await
}

/// Serve a router on an ephemeral port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn ping(State(p): State<Arc<Principal>>) -> Result<Json<PingResponse>, StatusCode> {
    if !p.healthy.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(PingResponse {
        success: true,
        version: "17.0".to_string(),
    }))
}

async fn push(State(p): State<Arc<Principal>>, Json(request): Json<PushRequest>) -> Json<PushResponse> {
    p.pushes.lock().push(request.clone());
    let delay = *p.push_delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let rejected = p.rejected.lock().clone();
    let results = request
        .records
        .iter()
        .map(|record| {
            if rejected.contains(&record.record_id) {
                RecordResult::error(record.record_id, "VAT number is invalid")
            } else {
                let cloud_sync_id = record
                    .cloud_sync_id
                    .unwrap_or_else(|| p.next_cloud_id.fetch_add(1, Ordering::SeqCst));
                RecordResult::ok(record.record_id).with_cloud_id(cloud_sync_id)
            }
        })
        .collect();
    Json(PushResponse {
        success: true,
        results,
        error: None,
    })
}

async fn pull(State(p): State<Arc<Principal>>, Json(request): Json<ChangesRequest>) -> Json<ChangesResponse> {
    p.pulls.fetch_add(1, Ordering::SeqCst);
    let changes: Vec<RemoteChange> = p
        .changes
        .lock()
        .iter()
        .filter(|change| request.models.contains(&change.model))
        .cloned()
        .collect();
    let start = request
        .since
        .as_deref()
        .and_then(|token| token.parse::<usize>().ok())
        .unwrap_or(0)
        .min(changes.len());
    let end = (start + request.limit as usize).min(changes.len());
    Json(ChangesResponse {
        success: true,
        changes: changes[start..end].to_vec(),
        next_token: Some(end.to_string()),
        has_more: end < changes.len(),
        error: None,
    })
}

async fn manifest(
    State(p): State<Arc<Principal>>,
    Json(request): Json<ManifestRequest>,
) -> Json<ManifestResponse> {
    if request.api_key != API_KEY {
        return Json(ManifestResponse {
            success: false,
            error: Some("invalid api key".to_string()),
            ..ManifestResponse::default()
        });
    }
    let manifest = p
        .master
        .lock()
        .iter()
        .map(|(model, records)| (model.clone(), records.len() as u64))
        .collect();
    Json(ManifestResponse {
        success: true,
        manifest,
        sync_order: Vec::new(),
        error: None,
    })
}

async fn pull_batch(
    State(p): State<Arc<Principal>>,
    Json(request): Json<PullBatchRequest>,
) -> Result<Json<PullBatchResponse>, StatusCode> {
    p.batch_requests.lock().push(request.clone());
    let delay = *p.batch_delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    {
        let mut fail_at = p.fail_batch_at.lock();
        if *fail_at == Some(request.offset) {
            *fail_at = None;
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    let master = p.master.lock();
    let records = master.get(&request.model).cloned().unwrap_or_default();
    let total = records.len() as u64;
    let start = request.offset.min(total) as usize;
    let end = (request.offset + request.limit).min(total) as usize;
    let page = records[start..end].to_vec();
    Ok(Json(PullBatchResponse {
        success: true,
        count: page.len() as u64,
        records: page,
        total,
        has_more: (end as u64) < total,
        error: None,
    }))
}

/// Sync configuration pointing at `url` with partners and clients enabled.
pub fn sync_config(url: &str) -> SyncConfig {
    SyncConfig::new("pos-1", "WH1")
        .with_remote(url, API_KEY)
        .with_entity("res.partner", true)
        .with_entity("institution.client", true)
        .with_timeout(1)
}

pub fn node_config(sync: SyncConfig) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: None,
        admin_token: None,
        queue_retention_days: 30,
        migrate_on_start: false,
        sync,
    }
}

/// A node on in-memory stores.
pub fn memory_node(config: Config) -> (Node, Stores) {
    let stores = Stores::memory(config.sync.retry_attempts);
    let node = Node::assemble(config, &stores, None);
    (node, stores)
}
