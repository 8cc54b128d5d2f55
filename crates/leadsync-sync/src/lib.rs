//! Lead sync engine: dedup writes, per-source orchestration, audit log and
//! scheduler wiring.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use leadsync_adapters::{adapter_for, AdapterError, SourceDescriptor};
use leadsync_core::{central_id, utc_day_start, CentralLeadRecord, RawLeadRecord, SyncRunResult};
use leadsync_storage::{CreateOutcome, DocumentStore, PgDocumentStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod config;

pub use config::{
    build_source_descriptors, CentralConfig, DeploymentConfig, ScheduleConfig, SourceConfig,
    StoreConfig, SyncConfig,
};

pub const CRATE_NAME: &str = "leadsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Skipped,
}

#[derive(Debug, Error)]
#[error("central store write for {central_id} failed: {error}")]
pub struct CentralStoreError {
    pub central_id: String,
    #[source]
    pub error: StoreError,
}

#[derive(Debug, Error)]
#[error("audit write to {collection} failed: {error}")]
pub struct AuditPersistError {
    pub collection: String,
    #[source]
    pub error: StoreError,
}

/// Why one source contributed nothing to a run.
#[derive(Debug, Error)]
pub enum SourceSyncError {
    #[error(transparent)]
    Fetch(#[from] AdapterError),
    #[error(transparent)]
    Write(#[from] CentralStoreError),
    #[error("{operation} timed out after {}s", .limit.as_secs())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

/// Per-source tallies for one successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub fetched: usize,
    pub created: u64,
    pub skipped: u64,
}

/// Create-only writer for the central lead collection.
#[derive(Clone)]
pub struct DedupWriter {
    central: Arc<dyn DocumentStore>,
    collection: String,
}

impl DedupWriter {
    pub fn new(central: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            central,
            collection: collection.into(),
        }
    }

    /// Writes the enriched record at `{source_tag}_{original_id}` unless a
    /// document with that id already exists. Existing documents are never
    /// touched, even if the source record changed since.
    pub async fn write_if_absent(
        &self,
        source_tag: &str,
        record: &RawLeadRecord,
    ) -> Result<WriteOutcome, CentralStoreError> {
        let id = central_id(source_tag, &record.original_id);
        let wrap = |error: StoreError| CentralStoreError {
            central_id: id.clone(),
            error,
        };

        if self.central.exists(&self.collection, &id).await.map_err(wrap)? {
            return Ok(WriteOutcome::Skipped);
        }

        let central = CentralLeadRecord::from_raw(source_tag, record, Utc::now());
        match self
            .central
            .create_if_absent(&self.collection, &central.id, &central.fields)
            .await
            .map_err(wrap)?
        {
            CreateOutcome::Created => Ok(WriteOutcome::Created),
            CreateOutcome::AlreadyExists => {
                debug!(central_id = %id, "lost create race; treating as skipped");
                Ok(WriteOutcome::Skipped)
            }
        }
    }
}

/// Runs one pass over every source. Never fails: source-level problems are
/// folded into the returned [`SyncRunResult`].
#[derive(Clone)]
pub struct SyncOrchestrator {
    writer: DedupWriter,
    schedule: String,
    op_timeout: Duration,
}

impl SyncOrchestrator {
    pub fn new(writer: DedupWriter, schedule: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            writer,
            schedule: schedule.into(),
            op_timeout,
        }
    }

    pub async fn run_once(&self, sources: &[SourceDescriptor], now: DateTime<Utc>) -> SyncRunResult {
        let run_id = Uuid::new_v4();
        let cutoff = utc_day_start(now);
        info!(
            %run_id,
            %cutoff,
            sources = sources.len(),
            schedule = %self.schedule,
            "sync run started"
        );

        let outcomes = join_all(
            sources
                .iter()
                .map(|descriptor| self.sync_source(run_id, descriptor, cutoff)),
        )
        .await;

        let mut counts = BTreeMap::new();
        let mut errors = Vec::new();
        for (descriptor, outcome) in sources.iter().zip(outcomes) {
            match outcome {
                Ok(report) => {
                    counts.insert(descriptor.source_tag.clone(), report.created);
                }
                Err(err) => {
                    counts.insert(descriptor.source_tag.clone(), 0);
                    errors.push(format!("Error syncing from {}: {}", descriptor.label(), err));
                }
            }
        }

        let result = SyncRunResult {
            run_id,
            started_at: now,
            cutoff,
            schedule: self.schedule.clone(),
            counts,
            errors,
        };
        info!(
            %run_id,
            created = result.total_created(),
            failed_sources = result.errors.len(),
            counts = ?result.counts,
            errors = ?result.errors,
            "sync run complete"
        );
        result
    }

    async fn sync_source(
        &self,
        run_id: Uuid,
        descriptor: &SourceDescriptor,
        cutoff: DateTime<Utc>,
    ) -> Result<SourceReport, SourceSyncError> {
        let outcome = self.fetch_and_write(descriptor, cutoff).await;
        match &outcome {
            Ok(report) => info!(
                %run_id,
                source = %descriptor.source_tag,
                fetched = report.fetched,
                created = report.created,
                skipped = report.skipped,
                "source sync complete"
            ),
            Err(err) => warn!(
                %run_id,
                source = %descriptor.source_tag,
                store = %descriptor.store.describe(),
                error = %err,
                "source sync failed"
            ),
        }
        outcome
    }

    async fn fetch_and_write(
        &self,
        descriptor: &SourceDescriptor,
        cutoff: DateTime<Utc>,
    ) -> Result<SourceReport, SourceSyncError> {
        let adapter = adapter_for(descriptor.clone());
        let records = timeout(self.op_timeout, adapter.fetch_since(cutoff))
            .await
            .map_err(|_| SourceSyncError::Timeout {
                operation: "fetch",
                limit: self.op_timeout,
            })??;

        let mut report = SourceReport {
            fetched: records.len(),
            ..SourceReport::default()
        };
        for record in &records {
            let outcome = timeout(
                self.op_timeout,
                self.writer.write_if_absent(&descriptor.source_tag, record),
            )
            .await
            .map_err(|_| SourceSyncError::Timeout {
                operation: "write",
                limit: self.op_timeout,
            })??;
            match outcome {
                WriteOutcome::Created => report.created += 1,
                WriteOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }
}

/// Appends one immutable document per run to the audit collection.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn DocumentStore>,
    collection: String,
    op_timeout: Duration,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            store,
            collection: collection.into(),
            op_timeout,
        }
    }

    pub async fn persist(&self, result: &SyncRunResult) -> Result<String, AuditPersistError> {
        let document = result.to_audit_document();
        let error = match timeout(self.op_timeout, self.store.append(&self.collection, &document)).await {
            Ok(Ok(id)) => return Ok(id),
            Ok(Err(err)) => err,
            Err(_) => StoreError::Unavailable(format!(
                "append timed out after {}s",
                self.op_timeout.as_secs()
            )),
        };
        Err(AuditPersistError {
            collection: self.collection.clone(),
            error,
        })
    }
}

/// A configured sync pass plus its audit trail, ready to be triggered.
pub struct SyncJob {
    orchestrator: SyncOrchestrator,
    audit: AuditLogger,
    sources: Vec<SourceDescriptor>,
    running: Mutex<()>,
}

impl SyncJob {
    pub fn new(orchestrator: SyncOrchestrator, audit: AuditLogger, sources: Vec<SourceDescriptor>) -> Self {
        Self {
            orchestrator,
            audit,
            sources,
            running: Mutex::new(()),
        }
    }

    /// One run followed by one audit write. An audit failure is logged and
    /// does not affect the already committed lead writes.
    pub async fn run_and_audit(&self, now: DateTime<Utc>) -> SyncRunResult {
        let _guard = self.running.lock().await;
        self.run_locked(now).await
    }

    /// Scheduler entry: skips the tick when the previous run is still active.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Option<SyncRunResult> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous sync run still active; skipping this tick");
            return None;
        };
        Some(self.run_locked(now).await)
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> SyncRunResult {
        let result = self.orchestrator.run_once(&self.sources, now).await;
        match self.audit.persist(&result).await {
            Ok(audit_id) => info!(run_id = %result.run_id, %audit_id, "sync run audited"),
            Err(err) => error!(run_id = %result.run_id, error = %err, "failed to persist sync audit"),
        }
        result
    }
}

/// Registers the sync job on the configured cron expression. The caller
/// starts and shuts down the returned scheduler.
pub async fn build_scheduler(job: Arc<SyncJob>, schedule: &ScheduleConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron_job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
        let job = job.clone();
        Box::pin(async move {
            job.run_scheduled(Utc::now()).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", schedule.cron))?;
    sched.add(cron_job).await.context("adding scheduler job")?;
    info!(
        cron = %schedule.cron,
        description = %schedule.description,
        reporting_time_zone = %schedule.time_zone,
        "sync schedule registered (cron evaluated in UTC)"
    );
    Ok(sched)
}

/// Loads the deployment config and connects every store once.
pub async fn build_job(config: &SyncConfig) -> Result<(SyncJob, DeploymentConfig)> {
    let deployment = DeploymentConfig::load(&config.config_path).await?;
    let central = deployment
        .central
        .store
        .connect(config.http_timeout())
        .await
        .context("connecting central store")?;
    let sources = build_source_descriptors(&deployment, config.http_timeout()).await?;

    let writer = DedupWriter::new(central.clone(), deployment.central.lead_collection.clone());
    let orchestrator = SyncOrchestrator::new(
        writer,
        deployment.schedule.description.clone(),
        config.op_timeout(),
    );
    let audit = AuditLogger::new(
        central,
        deployment.central.audit_collection.clone(),
        config.op_timeout(),
    );
    Ok((SyncJob::new(orchestrator, audit, sources), deployment))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunResult> {
    let config = SyncConfig::from_env();
    let (job, _deployment) = build_job(&config).await?;
    Ok(job.run_and_audit(Utc::now()).await)
}

/// Runs the scheduled job until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let (job, deployment) = build_job(&config).await?;
    let mut sched = build_scheduler(Arc::new(job), &deployment.schedule).await?;
    sched.start().await.context("starting scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested; stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Applies the document-table schema when the central store is Postgres.
pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let deployment = DeploymentConfig::load(&config.config_path).await?;
    let StoreConfig::Postgres { url_env } = &deployment.central.store else {
        bail!("central store is not postgres; nothing to migrate");
    };
    let url = std::env::var(url_env).with_context(|| format!("reading {url_env}"))?;
    let store = PgDocumentStore::connect(&url, config.http_timeout())
        .await
        .context("connecting central store")?;
    store.migrate().await.context("applying migrations")?;
    info!(store = %store.describe(), "central store migrated");
    Ok(())
}
