//! Admin API over HTTP.

mod common;

use common::*;
use possync_engine::{QueueState, SyncOptions};
use possync_node::app;
use possync_node::store::{EntityStore, QueueStore};
use serde_json::{json, Value};
use std::sync::Arc;

/// Admin API of a node whose remote is unreachable.
async fn admin(config: possync_node::config::Config) -> String {
    let (node, _) = memory_node(config);
    serve(app(node.state)).await
}

#[cfg(test)]
mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn health_is_public() {
        let mut config = node_config(sync_config("http://127.0.0.1:9"));
        config.admin_token = Some("secret".to_string());
        let url = admin(config).await;

        let body: Value = reqwest::get(format!("{}/health", url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "ok");
        assert_eq!(body["node_id"], "pos-1");
        assert_eq!(body["mode"], "hybrid");
        assert_eq!(body["sync_status"], "idle");
    }

    #[tokio::test]
    async fn admin_token_is_enforced() {
        let mut config = node_config(sync_config("http://127.0.0.1:9"));
        config.admin_token = Some("secret".to_string());
        let url = admin(config).await;
        let client = reqwest::Client::new();

        let anonymous = client
            .get(format!("{}/sync/status", url))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), 401);

        let wrong = client
            .get(format!("{}/sync/status", url))
            .bearer_auth("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let authorized = client
            .get(format!("{}/sync/status", url))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(authorized.status(), 200);
    }

    #[tokio::test]
    async fn trigger_runs_a_cycle_and_reports_it() {
        let principal = Arc::new(Principal::default());
        let remote = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&remote)));
        let url = serve(app(node.state)).await;
        stores
            .entities
            .create("res.partner", json!({"name": "Ana", "vat": "A1"}), SyncOptions::default())
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let report: Value = client
            .post(format!("{}/sync/trigger", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["accepted"], 1);
        assert_eq!(report["outcome"]["result"], "completed");

        let status: Value = client
            .get(format!("{}/sync/status", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "success");
        assert!(status["last_sync_date"].is_u64());

        let stats: Value = client
            .get(format!("{}/queue/stats", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["done"], 1);
    }

    #[tokio::test]
    async fn unreachable_remote_surfaces_as_bad_gateway() {
        let url = admin(node_config(sync_config("http://127.0.0.1:9"))).await;

        let response = reqwest::Client::new()
            .post(format!("{}/sync/trigger", url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Sync failed");
    }

    #[tokio::test]
    async fn dead_entries_can_be_listed_and_requeued() {
        let principal = Arc::new(Principal::default());
        let remote = spawn_principal(principal.clone()).await;
        let config = sync_config(&remote).with_retry_attempts(1);
        let (node, stores) = memory_node(node_config(config));
        let dispatcher = node.state.dispatcher.clone();
        let url = serve(app(node.state)).await;
        let id = stores
            .entities
            .create("res.partner", json!({"name": "Bad", "vat": "??"}), SyncOptions::default())
            .await
            .unwrap();
        principal.reject(id);
        dispatcher
            .execute_cycle(possync_node::dispatcher::Trigger::Manual)
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let dead: Vec<Value> = client
            .get(format!("{}/queue/dead", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["error_message"], "VAT number is invalid");
        let queue_id = dead[0]["id"].as_i64().unwrap();

        let requeued: Value = client
            .post(format!("{}/queue/{}/requeue", url, queue_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(requeued["entry"]["state"], "pending");
        assert_eq!(requeued["entry"]["retry_count"], 0);
        assert_eq!(stores.queue.list(QueueState::Dead, 10).await.unwrap().len(), 0);

        let missing = client
            .post(format!("{}/queue/{}/requeue", url, 9_999))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn cancel_without_running_work_reports_nothing_cancelled() {
        let url = admin(node_config(sync_config("http://127.0.0.1:9"))).await;

        let body: Value = reqwest::Client::new()
            .post(format!("{}/sync/cancel", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["sync_cancelled"], false);
        assert_eq!(body["migration_cancelled"], false);
    }
}
