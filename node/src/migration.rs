//! Master data migration from the PRINCIPAL.
//!
//! The pipeline fetches the manifest, plans models parents-first and pages
//! through each model with a stateless cursor. Every record is resolved in
//! migration mode (legacy and natural keys before cloud ids) and upserted on
//! its own, so one bad record never aborts its page and a rerun over the
//! same remote data creates nothing.

use crate::dispatcher::RunLock;
use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use crate::resolve::{Applied, IdentityResolver};
use crate::transport::{HttpTransport, Transport};
use possync_engine::{
    ManifestRequest, MigrationCursor, MigrationManifest, ModelName, Operation, PullBatchRequest,
    PullBatchResponse, ResolveMode, SyncConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A record that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    /// Position of the record within its page
    pub index: usize,
    pub message: String,
}

/// Outcome of importing one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub failures: Vec<RecordFailure>,
}

impl ImportReport {
    pub fn imported(&self) -> u64 {
        self.created + self.updated
    }
}

/// Per-model outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelReport {
    pub model: ModelName,
    /// Count declared by the manifest
    pub total: u64,
    pub pages: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Offset to resume from
    pub next_offset: u64,
    pub completed: bool,
}

impl ModelReport {
    fn absorb(&mut self, page: &ImportReport) {
        self.pages += 1;
        self.created += page.created;
        self.updated += page.updated;
        self.skipped += page.skipped;
        self.errors += page.errors;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub plan: Vec<ModelName>,
    pub models: Vec<ModelReport>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl MigrationReport {
    pub fn created(&self) -> u64 {
        self.models.iter().map(|m| m.created).sum()
    }

    pub fn updated(&self) -> u64 {
        self.models.iter().map(|m| m.updated).sum()
    }

    pub fn errors(&self) -> u64 {
        self.models.iter().map(|m| m.errors).sum()
    }
}

/// Run options, accepted as the body of `POST /migration/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    /// Models to migrate; all enabled models when empty
    pub models: Vec<ModelName>,
    /// Resume this model from `start_offset`
    pub start_model: Option<ModelName>,
    pub start_offset: u64,
    /// Page size; the configured batch size when absent
    pub batch_size: Option<u64>,
}

pub struct MigrationPipeline {
    resolver: IdentityResolver,
    transport: Option<Arc<dyn Transport>>,
    running: tokio::sync::Mutex<()>,
    exclusive: RunLock,
    cancel: AtomicBool,
}

impl MigrationPipeline {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            transport: None,
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

    /// Share the run lock with the dispatcher, so no sync cycle runs while
    /// master data is imported.
    pub fn with_run_lock(mut self, lock: RunLock) -> Self {
        self.exclusive = lock;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Stop the running migration before its next page. Returns false when
    /// none is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    fn transport_for(&self, config: &SyncConfig) -> SyncResult<Arc<dyn Transport>> {
        match &self.transport {
            Some(transport) => Ok(transport.clone()),
            None => Ok(Arc::new(HttpTransport::from_config(config)?)),
        }
    }

    /// Per-model counts and the remote dependency order.
    pub async fn get_manifest(&self, config: &SyncConfig) -> SyncResult<MigrationManifest> {
        let (_, api_key) = config.remote()?;
        let response = self
            .transport_for(config)?
            .manifest(&ManifestRequest {
                api_key: api_key.to_string(),
            })
            .await?;
        if !response.success {
            return Err(SyncError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "manifest rejected".to_string()),
            ));
        }
        Ok(response.into_manifest())
    }

    /// Fetch one page of a model.
    pub async fn pull_batch(
        &self,
        config: &SyncConfig,
        cursor: &MigrationCursor,
    ) -> SyncResult<PullBatchResponse> {
        let (_, api_key) = config.remote()?;
        let response = self
            .transport_for(config)?
            .pull_batch(&PullBatchRequest {
                model: cursor.model.clone(),
                limit: cursor.limit,
                offset: cursor.offset,
                api_key: api_key.to_string(),
            })
            .await?;
        if !response.success {
            return Err(SyncError::Remote(
                response
                    .error
                    .unwrap_or_else(|| format!("pull of {} rejected", cursor.model)),
            ));
        }
        Ok(response)
    }

    /// Resolve and upsert a page of remote records, one at a time.
    pub async fn import_batch(&self, model: &str, records: &[Value]) -> ImportReport {
        let mut report = ImportReport::default();
        for (index, record) in records.iter().enumerate() {
            let applied = self
                .resolver
                .apply(
                    model,
                    Operation::Create,
                    record,
                    ResolveMode::Migration,
                    now_millis(),
                )
                .await;
            match applied {
                Ok(Applied::Created { .. }) => report.created += 1,
                Ok(Applied::Updated { .. }) => report.updated += 1,
                Ok(Applied::Deleted { .. }) | Ok(Applied::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(model = %model, index, error = %e, "Record import failed");
                    report.errors += 1;
                    report.failures.push(RecordFailure {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Migrate every planned model.
    ///
    /// Page failures and cancellation stop the run. The logged offset is
    /// where `start_offset` should resume.
    pub async fn run(
        &self,
        config: &SyncConfig,
        options: &MigrationOptions,
    ) -> SyncResult<MigrationReport> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        let _exclusive = self
            .exclusive
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::SeqCst);
        config.validate()?;
        config.remote()?;

        let mut report = MigrationReport {
            started_at: now_millis(),
            ..MigrationReport::default()
        };
        let manifest = self.get_manifest(config).await?;
        let selected = if options.models.is_empty() {
            config.enabled_models()
        } else {
            options.models.clone()
        };
        report.plan = manifest.plan(self.resolver.profiles(), &selected)?;
        let limit = options
            .batch_size
            .unwrap_or_else(|| u64::from(config.batch_size));

        tracing::info!(plan = ?report.plan, total = manifest.total(), "Migration started");

        for model in report.plan.clone() {
            let start = match &options.start_model {
                Some(start_model) if *start_model == model => options.start_offset,
                _ => 0,
            };
            let mut model_report = ModelReport {
                model: model.clone(),
                total: manifest.count(&model),
                next_offset: start,
                ..ModelReport::default()
            };
            let mut cursor = Some(MigrationCursor::new(model.clone(), limit).starting_at(start));

            while let Some(current) = cursor {
                if self.cancel.load(Ordering::SeqCst) {
                    tracing::warn!(model = %model, offset = current.offset, "Migration cancelled");
                    return Err(SyncError::Cancelled);
                }
                let page = match self.pull_batch(config, &current).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::error!(
                            model = %model,
                            offset = current.offset,
                            error = %e,
                            "Migration page failed"
                        );
                        return Err(e);
                    }
                };
                let imported = self.import_batch(&model, &page.records).await;
                tracing::debug!(
                    model = %model,
                    offset = current.offset,
                    fetched = page.records.len(),
                    created = imported.created,
                    updated = imported.updated,
                    errors = imported.errors,
                    "Migration page imported"
                );
                model_report.absorb(&imported);
                model_report.next_offset = current.offset + page.records.len() as u64;
                cursor = current.advance(page.records.len(), page.has_more);
            }

            model_report.completed = true;
            tracing::info!(
                model = %model,
                created = model_report.created,
                updated = model_report.updated,
                errors = model_report.errors,
                "Model migrated"
            );
            report.models.push(model_report);
        }

        report.finished_at = now_millis();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ObserverList;
    use crate::profiles::default_profiles;
    use crate::store::{EntityStore, MemoryEntityStore, MemoryMetadataStore, MetadataStore};
    use async_trait::async_trait;
    use possync_engine::{
        CloudId, LegacyId, LinkOutcome, LocalId, MetadataState, SyncMetadata, Timestamp,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Metadata store whose first `link` fails like a dropped connection.
    struct DroppedFirstLink {
        inner: MemoryMetadataStore,
        links: AtomicUsize,
    }

    #[async_trait]
    impl MetadataStore for DroppedFirstLink {
        async fn get(&self, model: &str, local_id: LocalId) -> SyncResult<Option<SyncMetadata>> {
            self.inner.get(model, local_id).await
        }

        async fn find_by_cloud(
            &self,
            model: &str,
            cloud_sync_id: CloudId,
        ) -> SyncResult<Option<SyncMetadata>> {
            self.inner.find_by_cloud(model, cloud_sync_id).await
        }

        async fn find_by_legacy(
            &self,
            model: &str,
            legacy_id: LegacyId,
        ) -> SyncResult<Vec<SyncMetadata>> {
            self.inner.find_by_legacy(model, legacy_id).await
        }

        async fn link(
            &self,
            model: &str,
            local_id: LocalId,
            cloud_sync_id: CloudId,
        ) -> SyncResult<LinkOutcome> {
            if self.links.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SyncError::Transport("connection reset".to_string()));
            }
            self.inner.link(model, local_id, cloud_sync_id).await
        }

        async fn set_legacy(
            &self,
            model: &str,
            local_id: LocalId,
            legacy_id: LegacyId,
        ) -> SyncResult<()> {
            self.inner.set_legacy(model, local_id, legacy_id).await
        }

        async fn set_state(
            &self,
            model: &str,
            local_id: LocalId,
            state: MetadataState,
            now: Timestamp,
        ) -> SyncResult<()> {
            self.inner.set_state(model, local_id, state, now).await
        }

        async fn remove(&self, model: &str, local_id: LocalId) -> SyncResult<()> {
            self.inner.remove(model, local_id).await
        }
    }

    fn pipeline() -> (MigrationPipeline, Arc<MemoryEntityStore>) {
        let entities = Arc::new(MemoryEntityStore::new(ObserverList::new()));
        let resolver = IdentityResolver::new(
            Arc::new(default_profiles()),
            Arc::new(MemoryMetadataStore::new()),
            entities.clone(),
        );
        (MigrationPipeline::new(resolver), entities)
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let (pipeline, entities) = pipeline();
        let records = vec![
            json!({"id": 1, "cloud_sync_id": 11, "name": "Ana", "vat": "A1"}),
            json!({"id": 2, "cloud_sync_id": 12, "name": "Bo", "vat": "B2"}),
        ];

        let first = pipeline.import_batch("res.partner", &records).await;
        assert_eq!(first.created, 2);

        let second = pipeline.import_batch("res.partner", &records).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(entities.count("res.partner").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_link_leaves_nothing_for_the_rerun_to_duplicate() {
        let entities = Arc::new(MemoryEntityStore::new(ObserverList::new()));
        let metadata = Arc::new(DroppedFirstLink {
            inner: MemoryMetadataStore::new(),
            links: AtomicUsize::new(0),
        });
        let resolver = IdentityResolver::new(Arc::new(default_profiles()), metadata, entities.clone());
        let pipeline = MigrationPipeline::new(resolver);
        // Only a cloud id identifies this customer.
        let records = vec![json!({"id": 77, "name": "Walk-in customer"})];

        let first = pipeline.import_batch("res.partner", &records).await;
        assert_eq!(first.created, 0);
        assert_eq!(first.errors, 1);
        assert_eq!(entities.count("res.partner").await.unwrap(), 0);

        let rerun = pipeline.import_batch("res.partner", &records).await;
        assert_eq!(rerun.created, 1);
        assert_eq!(rerun.errors, 0);
        assert_eq!(entities.count("res.partner").await.unwrap(), 1);

        let again = pipeline.import_batch("res.partner", &records).await;
        assert_eq!(again.updated, 1);
        assert_eq!(entities.count("res.partner").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_requires_remote() {
        let (pipeline, _) = pipeline();
        let config = SyncConfig::new("pos-1", "WH1");

        let err = pipeline
            .run(&config, &MigrationOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
