//! Sync cycle orchestration.
//!
//! A cycle moves `Idle → Syncing → {Success, Error} → Idle`:
//!
//! 1. validate the configuration and health-check the PRINCIPAL; either
//!    failure aborts before anything is touched
//! 2. per enabled model (parents first) lock one batch and push it in runs
//!    of consecutive entries sharing an operation
//! 3. settle every entry from its own result; transport failures release
//!    the batch without consuming retry budget
//! 4. in hybrid mode pull remote changes and apply them with `skip_queue`
//! 5. purge finished queue rows past retention and update status
//!
//! Only one cycle runs at a time, and never alongside a migration run: both
//! hold the shared [`RunLock`] while they work. Budget expiry and
//! cancellation are checked between batches; an in-flight batch always
//! completes.

use crate::error::{SyncError, SyncResult};
use crate::resolve::{Applied, IdentityResolver};
use crate::store::{MetadataStore, QueueStore};
use crate::transport::{HttpTransport, Transport};
use crate::now_millis;
use parking_lot::RwLock;
use possync_engine::{
    ChangesRequest, DequeueRequest, MetadataState, MigrationManifest, ModelName, Operation,
    PushOutcome, PushRecord, PushRequest, QueueId, QueueRecord, QueueState, ResolveMode,
    SyncConfig, Timestamp,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Dispatcher state as seen by operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
}

/// How a cycle ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleOutcome {
    #[default]
    Completed,
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

/// Counters of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub outcome: CycleOutcome,
    pub batches: u64,
    pub pushed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub pulled: u64,
    pub applied: u64,
    pub pull_skipped: u64,
    pub pull_errors: u64,
    pub recovered: u64,
    pub purged: u64,
    pub budget_exhausted: bool,
    pub cancelled: bool,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

/// Operator-facing status of the dispatcher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStatus {
    pub status: SyncStatus,
    pub last_sync_date: Option<Timestamp>,
    pub last_error_message: Option<String>,
    pub last_cycle: Option<CycleReport>,
    pub cycles: u64,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_pulled: u64,
    /// Resume token of the hybrid pull
    pub pull_token: Option<String>,
}

/// Held by the active sync cycle or migration run.
pub type RunLock = Arc<tokio::sync::Mutex<()>>;

pub struct Dispatcher {
    config: SyncConfig,
    queue: Arc<dyn QueueStore>,
    metadata: Arc<dyn MetadataStore>,
    resolver: IdentityResolver,
    transport: Option<Arc<dyn Transport>>,
    retention: Duration,
    status: RwLock<DispatcherStatus>,
    running: tokio::sync::Mutex<()>,
    exclusive: RunLock,
    cancel: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: SyncConfig,
        queue: Arc<dyn QueueStore>,
        metadata: Arc<dyn MetadataStore>,
        resolver: IdentityResolver,
    ) -> Self {
        Self {
            config,
            queue,
            metadata,
            resolver,
            transport: None,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            status: RwLock::new(DispatcherStatus::default()),
            running: tokio::sync::Mutex::new(()),
            exclusive: RunLock::default(),
            cancel: AtomicBool::new(false),
        }
    }

    /// Use a fixed transport instead of one built from the configuration.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share the run lock with the migration pipeline.
    pub fn with_run_lock(mut self, lock: RunLock) -> Self {
        self.exclusive = lock;
        self
    }

    /// Keep finished queue rows for this long.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn config(&self) -> SyncConfig {
        self.config.clone()
    }

    pub fn status(&self) -> DispatcherStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Ask the running cycle to stop after its in-flight batch. Returns
    /// false when no cycle is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Transport for a validated configuration.
    pub fn transport_for(&self, config: &SyncConfig) -> SyncResult<Arc<dyn Transport>> {
        match &self.transport {
            Some(transport) => Ok(transport.clone()),
            None => Ok(Arc::new(HttpTransport::from_config(config)?)),
        }
    }

    /// Run one sync cycle.
    pub async fn execute_cycle(&self, trigger: Trigger) -> SyncResult<CycleReport> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::SeqCst);

        let config = self.config();
        let mut report = CycleReport {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at: now_millis(),
            ..CycleReport::default()
        };

        let exclusive = self.exclusive.try_lock();
        let reason = skip_reason(&config, trigger)
            .or_else(|| exclusive.is_err().then(|| "a migration is running".to_string()));
        if let Some(reason) = reason {
            tracing::debug!(mode = %config.operation_mode, ?trigger, "Sync cycle skipped: {}", reason);
            report.outcome = CycleOutcome::Skipped { reason };
            report.finished_at = Some(now_millis());
            self.status.write().last_cycle = Some(report.clone());
            return Ok(report);
        }

        tracing::info!(cycle_id = %report.cycle_id, ?trigger, "Sync cycle started");
        self.status.write().status = SyncStatus::Syncing;

        let result = self.run_cycle(&config, &mut report).await;
        report.finished_at = Some(now_millis());

        let mut status = self.status.write();
        status.cycles += 1;
        status.total_accepted += report.accepted;
        status.total_rejected += report.rejected;
        status.total_pulled += report.pulled;
        match result {
            Ok(()) => {
                tracing::info!(
                    cycle_id = %report.cycle_id,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    pulled = report.pulled,
                    "Sync cycle finished"
                );
                status.status = SyncStatus::Success;
                status.last_sync_date = report.finished_at;
                status.last_error_message = None;
                status.last_cycle = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                tracing::error!(cycle_id = %report.cycle_id, error = %e, "Sync cycle failed");
                report.outcome = CycleOutcome::Failed {
                    error: e.to_string(),
                };
                status.status = SyncStatus::Error;
                status.last_error_message = Some(e.to_string());
                status.last_cycle = Some(report);
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, config: &SyncConfig, report: &mut CycleReport) -> SyncResult<()> {
        config.validate()?;
        let (_, api_key) = config.remote()?;
        let transport = self.transport_for(config)?;

        let ping = transport.ping().await?;
        if !ping.success {
            return Err(SyncError::Transport("health check failed".to_string()));
        }

        let started = Instant::now();
        let deadline = started + Duration::from_secs(config.cycle_budget_secs);
        let now = now_millis();
        let stale_after = Duration::from_secs(config.cycle_budget_secs.max(config.sync_timeout_secs) * 2);
        report.recovered = self
            .queue
            .recover_stale(now.saturating_sub(stale_after.as_millis() as u64))
            .await? as u64;

        for model in self.push_order(config) {
            if self.should_stop(deadline, report) {
                break;
            }
            let request = DequeueRequest::new(config.batch_size as usize, &config.node_scope)
                .for_model(model.as_str());
            let batch = self
                .queue
                .dequeue_batch(&request, &report.cycle_id, now_millis())
                .await?;
            if batch.is_empty() {
                continue;
            }
            report.batches += 1;
            self.push_batch(config, api_key, transport.as_ref(), &model, batch, report)
                .await?;
        }

        if config.operation_mode.pulls() && !self.should_stop(deadline, report) {
            self.pull(config, api_key, transport.as_ref(), deadline, report)
                .await?;
        }

        let retention_ms = self.retention.as_millis() as u64;
        report.purged = self
            .queue
            .cleanup(now_millis().saturating_sub(retention_ms))
            .await? as u64;
        Ok(())
    }

    fn should_stop(&self, deadline: Instant, report: &mut CycleReport) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            return true;
        }
        if Instant::now() >= deadline {
            report.budget_exhausted = true;
            return true;
        }
        false
    }

    /// Enabled models with parents before children.
    fn push_order(&self, config: &SyncConfig) -> Vec<ModelName> {
        let enabled = config.enabled_models();
        let manifest = MigrationManifest::new(
            enabled.iter().map(|model| (model.clone(), 0)).collect(),
            Vec::new(),
        );
        match manifest.plan(self.resolver.profiles(), &enabled) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to name order for push");
                enabled
            }
        }
    }

    async fn push_batch(
        &self,
        config: &SyncConfig,
        api_key: &str,
        transport: &dyn Transport,
        model: &str,
        batch: Vec<QueueRecord>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let runs = operation_runs(batch);
        for (index, (operation, entries)) in runs.iter().enumerate() {
            let mut records = Vec::with_capacity(entries.len());
            for entry in entries {
                let cloud_sync_id = self
                    .metadata
                    .get(model, entry.record_id)
                    .await?
                    .and_then(|row| row.cloud_sync_id);
                records.push(PushRecord {
                    record_id: entry.record_id,
                    cloud_sync_id,
                    payload: entry.payload.clone(),
                });
            }
            let request = PushRequest {
                model: model.to_string(),
                operation: *operation,
                records,
                node_scope: config.node_scope.clone(),
                api_key: api_key.to_string(),
            };
            report.pushed += entries.len() as u64;

            let response = match transport.push(&request).await {
                Ok(response) => response,
                Err(SyncError::Remote(message)) => possync_engine::PushResponse {
                    success: false,
                    results: Vec::new(),
                    error: Some(message),
                },
                Err(e) => {
                    let unsent: Vec<QueueId> = runs[index..]
                        .iter()
                        .flat_map(|(_, entries)| entries.iter().map(|entry| entry.id))
                        .collect();
                    let released = self.queue.release(&unsent).await?;
                    report.released += released as u64;
                    tracing::warn!(
                        model = %model,
                        released,
                        error = %e,
                        "Push failed, batch released"
                    );
                    return Err(e);
                }
            };

            let record_ids: Vec<_> = entries.iter().map(|entry| entry.record_id).collect();
            for (entry, (_, outcome)) in entries.iter().zip(response.outcomes(&record_ids)) {
                self.settle(model, entry, outcome, report).await?;
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        model: &str,
        entry: &QueueRecord,
        outcome: PushOutcome,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let now = now_millis();
        match outcome {
            PushOutcome::Accepted { cloud_sync_id } => {
                self.queue.mark_done(entry.id, now).await?;
                report.accepted += 1;
                if entry.operation == Operation::Unlink {
                    self.metadata.remove(model, entry.record_id).await?;
                    return Ok(());
                }
                if let Some(cloud_sync_id) = cloud_sync_id {
                    if let Err(e) = self.metadata.link(model, entry.record_id, cloud_sync_id).await {
                        tracing::warn!(
                            model = %model,
                            record_id = entry.record_id,
                            cloud_sync_id,
                            error = %e,
                            "Link refused"
                        );
                    }
                }
                self.metadata
                    .set_state(model, entry.record_id, MetadataState::Synced, now)
                    .await?;
            }
            PushOutcome::Rejected { message } => {
                let state = self.queue.mark_failed(entry.id, &message, now).await?;
                report.rejected += 1;
                self.metadata
                    .set_state(model, entry.record_id, MetadataState::Error, now)
                    .await?;
                if state == QueueState::Dead {
                    report.dead_lettered += 1;
                    tracing::warn!(
                        queue_id = entry.id,
                        model = %model,
                        record_id = entry.record_id,
                        error = %message,
                        "Queue entry dead-lettered"
                    );
                } else {
                    tracing::debug!(
                        queue_id = entry.id,
                        model = %model,
                        record_id = entry.record_id,
                        error = %message,
                        "Queue entry rejected"
                    );
                }
            }
        }
        Ok(())
    }

    /// Pull remote-originated changes and apply them locally.
    async fn pull(
        &self,
        config: &SyncConfig,
        api_key: &str,
        transport: &dyn Transport,
        deadline: Instant,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let models = config.enabled_models();
        loop {
            let request = ChangesRequest {
                node_scope: config.node_scope.clone(),
                since: self.status.read().pull_token.clone(),
                limit: u64::from(config.batch_size),
                models: models.clone(),
                api_key: api_key.to_string(),
            };
            let response = transport.pull_changes(&request).await?;
            if !response.success {
                return Err(SyncError::Remote(
                    response
                        .error
                        .unwrap_or_else(|| "pull rejected".to_string()),
                ));
            }
            report.batches += 1;

            for change in &response.changes {
                report.pulled += 1;
                if !config.is_enabled(&change.model) {
                    report.pull_skipped += 1;
                    continue;
                }
                match self
                    .resolver
                    .apply(
                        &change.model,
                        change.operation,
                        &change.record,
                        ResolveMode::Steady,
                        now_millis(),
                    )
                    .await
                {
                    Ok(Applied::Skipped { reason }) => {
                        report.pull_skipped += 1;
                        tracing::debug!(model = %change.model, reason = %reason, "Remote change skipped");
                    }
                    Ok(_) => report.applied += 1,
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => {
                        report.pull_errors += 1;
                        tracing::warn!(model = %change.model, error = %e, "Remote change not applied");
                    }
                }
            }

            if response.next_token.is_some() {
                self.status.write().pull_token = response.next_token.clone();
            }
            if !response.has_more || response.changes.is_empty() || self.should_stop(deadline, report) {
                return Ok(());
            }
        }
    }
}

/// Why a cycle should not run, if it should not.
fn skip_reason(config: &SyncConfig, trigger: Trigger) -> Option<String> {
    if !config.operation_mode.contacts_remote() {
        return Some("node is offline".to_string());
    }
    if trigger == Trigger::Timer && !config.operation_mode.runs_on_timer() {
        return Some(format!("{} mode syncs only on demand", config.operation_mode));
    }
    None
}

/// Split a batch into runs of consecutive entries sharing an operation.
fn operation_runs(batch: Vec<QueueRecord>) -> Vec<(Operation, Vec<QueueRecord>)> {
    let mut runs: Vec<(Operation, Vec<QueueRecord>)> = Vec::new();
    for entry in batch {
        match runs.last_mut() {
            Some((operation, entries)) if *operation == entry.operation => entries.push(entry),
            _ => runs.push((entry.operation, vec![entry])),
        }
    }
    runs
}
