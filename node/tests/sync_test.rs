//! Sync cycles against an in-process PRINCIPAL.

mod common;

use common::*;
use possync_engine::{Operation, OperationMode, QueueState, RemoteChange, SyncOptions};
use possync_node::dispatcher::{CycleOutcome, SyncStatus, Trigger};
use possync_node::error::SyncError;
use possync_node::store::{EntityStore, MetadataStore, QueueStore};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

async fn create_partners(stores: &possync_node::Stores, count: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let id = stores
            .entities
            .create(
                "res.partner",
                json!({"name": format!("Partner {}", n), "vat": format!("V{}", n)}),
                SyncOptions::default(),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod push_tests {
    use super::*;

    #[tokio::test]
    async fn one_rejected_record_does_not_fail_its_siblings() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&url)));
        let ids = create_partners(&stores, 10).await;
        principal.reject(ids[5]);

        let report = node
            .state
            .dispatcher
            .execute_cycle(Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(report.accepted, 9);
        assert_eq!(report.rejected, 1);
        assert_eq!(principal.pushed_ids(), vec![ids.clone()]);

        let done = stores.queue.list(QueueState::Done, 100).await.unwrap();
        assert_eq!(done.len(), 9);
        assert!(done.iter().all(|entry| entry.retry_count == 0));

        let failed = stores.queue.list(QueueState::Error, 100).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].record_id, ids[5]);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(
            failed[0].error_message.as_deref(),
            Some("VAT number is invalid")
        );

        let linked = stores.metadata.get("res.partner", ids[0]).await.unwrap().unwrap();
        assert!(linked.cloud_sync_id.is_some());
    }

    #[tokio::test]
    async fn timeout_releases_the_batch_without_consuming_budget() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&url)));
        let ids = create_partners(&stores, 50).await;
        *principal.push_delay.lock() = Some(Duration::from_secs(3));

        let err = node
            .state
            .dispatcher
            .execute_cycle(Trigger::Manual)
            .await
            .unwrap_err();
        assert!(err.is_transport());

        let pending = stores.queue.list(QueueState::Pending, 100).await.unwrap();
        assert_eq!(pending.len(), 50);
        assert!(pending.iter().all(|entry| entry.retry_count == 0));
        assert_eq!(stores.queue.stats().await.unwrap().sent, 0);
        assert_eq!(node.state.dispatcher.status().status, SyncStatus::Error);

        *principal.push_delay.lock() = None;
        let report = node
            .state
            .dispatcher
            .execute_cycle(Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(report.accepted, 50);
        let pushes = principal.pushed_ids();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1], ids);
        assert_eq!(node.state.dispatcher.status().status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_the_record() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let config = sync_config(&url).with_retry_attempts(2);
        let (node, stores) = memory_node(node_config(config));
        let ids = create_partners(&stores, 1).await;
        principal.reject(ids[0]);

        let first = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(first.dead_lettered, 0);
        let second = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(second.dead_lettered, 1);

        let dead = stores.queue.list(QueueState::Dead, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);

        let third = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(third.pushed, 0);
        assert_eq!(principal.push_count(), 2);

        stores.queue.requeue(dead[0].id).await.unwrap();
        let entry = stores.queue.get(dead[0].id).await.unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Pending);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn coalesced_writes_push_the_latest_payload() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&url)));

        let id = stores
            .entities
            .create(
                "institution.client",
                json!({"institution_id": 1, "partner_id": 2, "amount": 0}),
                SyncOptions::default(),
            )
            .await
            .unwrap();
        let report = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(report.accepted, 1);

        for amount in [10, 20, 30] {
            stores
                .entities
                .update(
                    "institution.client",
                    id,
                    json!({"amount": amount}),
                    SyncOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(stores.queue.stats().await.unwrap().pending, 1);

        node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        let pushes = principal.pushes.lock().clone();
        let last = pushes.last().unwrap();
        assert_eq!(last.operation, Operation::Write);
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].payload["amount"], 30);
        assert!(last.records[0].cloud_sync_id.is_some());
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_aborts_without_side_effects() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let mut config = sync_config(&url);
        config.api_key = None;
        let (node, stores) = memory_node(node_config(config));
        create_partners(&stores, 3).await;

        let err = node
            .state
            .dispatcher
            .execute_cycle(Trigger::Manual)
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(principal.push_count(), 0);
        assert_eq!(stores.queue.stats().await.unwrap().pending, 3);
        let status = node.state.dispatcher.status();
        assert_eq!(status.status, SyncStatus::Error);
        assert!(status.last_error_message.is_some());
    }

    #[tokio::test]
    async fn failed_health_check_aborts_without_side_effects() {
        let principal = Arc::new(Principal::default());
        principal.healthy.store(false, Ordering::SeqCst);
        let url = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&url)));
        create_partners(&stores, 3).await;

        let err = node
            .state
            .dispatcher
            .execute_cycle(Trigger::Manual)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(principal.push_count(), 0);
        let pending = stores.queue.list(QueueState::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|entry| entry.retry_count == 0));
    }
}

#[cfg(test)]
mod mode_tests {
    use super::*;

    #[tokio::test]
    async fn hybrid_pull_is_not_echoed_back() {
        let principal = Arc::new(Principal::default());
        principal.changes.lock().push(RemoteChange {
            model: "res.partner".to_string(),
            operation: Operation::Create,
            record: json!({"id": 900, "name": "Remote", "vat": "R1"}),
        });
        let url = spawn_principal(principal.clone()).await;
        let (node, stores) = memory_node(node_config(sync_config(&url)));

        let report = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();

        assert_eq!(report.pulled, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(stores.entities.count("res.partner").await.unwrap(), 1);
        assert_eq!(stores.queue.stats().await.unwrap().total(), 0);
        assert_eq!(node.state.dispatcher.status().pull_token.as_deref(), Some("1"));

        // The token moved past the change: a second cycle applies nothing.
        let again = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(principal.push_count(), 0);

        // A local edit of the pulled record is queued and carries its link.
        let local = stores
            .entities
            .find_by_fields("res.partner", &[("vat".to_string(), json!("R1"))])
            .await
            .unwrap();
        stores
            .entities
            .update("res.partner", local[0].local_id, json!({"name": "Edited"}), SyncOptions::default())
            .await
            .unwrap();
        node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        let pushes = principal.pushes.lock().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].records[0].cloud_sync_id, Some(900));
    }

    #[tokio::test]
    async fn offline_node_never_contacts_the_remote() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let config = sync_config(&url).with_mode(OperationMode::Offline);
        let (node, stores) = memory_node(node_config(config));
        create_partners(&stores, 2).await;

        let report = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();

        assert!(matches!(report.outcome, CycleOutcome::Skipped { .. }));
        assert_eq!(principal.push_count(), 0);
        assert_eq!(stores.queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn on_demand_mode_pushes_only_when_asked() {
        let principal = Arc::new(Principal::default());
        let url = spawn_principal(principal.clone()).await;
        let config = sync_config(&url).with_mode(OperationMode::SyncOnDemand);
        let (node, stores) = memory_node(node_config(config));
        create_partners(&stores, 2).await;

        let timer = node.state.dispatcher.execute_cycle(Trigger::Timer).await.unwrap();
        assert!(matches!(timer.outcome, CycleOutcome::Skipped { .. }));
        assert_eq!(principal.push_count(), 0);

        let manual = node.state.dispatcher.execute_cycle(Trigger::Manual).await.unwrap();
        assert_eq!(manual.accepted, 2);
        assert_eq!(principal.pulls.load(Ordering::SeqCst), 0);
    }
}
