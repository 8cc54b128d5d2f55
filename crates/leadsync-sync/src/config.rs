//! Process configuration: env knobs plus the YAML deployment registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use leadsync_adapters::SourceDescriptor;
use leadsync_core::{TimestampKind, AUDIT_ERRORS_KEY};
use leadsync_storage::{AccessToken, DocumentStore, FirestoreConfig, FirestoreStore, PgDocumentStore};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub op_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("LEADSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./leadsync.yaml")),
            op_timeout_secs: std::env::var("LEADSYNC_OP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_timeout_secs: std::env::var("LEADSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub central: CentralConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_schedule_description")]
    pub description: String,
    /// Reporting metadata only. The cron expression and the cutoff are both
    /// evaluated in UTC.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            description: default_schedule_description(),
            time_zone: default_time_zone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    pub store: StoreConfig,
    #[serde(default = "default_lead_collection")]
    pub lead_collection: String,
    #[serde(default = "default_audit_collection")]
    pub audit_collection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_tag: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub store: StoreConfig,
    pub collection: String,
    pub timestamp_field: String,
    pub timestamp_kind: TimestampKind,
    #[serde(default)]
    pub id_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Firestore {
        project_id: String,
        #[serde(default)]
        database: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        access_token_env: Option<String>,
        #[serde(default)]
        access_token_file: Option<PathBuf>,
        #[serde(default)]
        page_size: Option<u32>,
    },
    Postgres {
        url_env: String,
    },
}

fn default_cron() -> String {
    "0 */15 * * * *".to_string()
}

fn default_schedule_description() -> String {
    "every 15 minutes".to_string()
}

fn default_time_zone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_lead_collection() -> String {
    "leads".to_string()
}

fn default_audit_collection() -> String {
    "sync_logs".to_string()
}

fn default_enabled() -> bool {
    true
}

impl DeploymentConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Tags key both central ids and audit counts, so they must be unique,
    /// underscore-free (central ids join on `_`) and never `errors`.
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let tag = source.source_tag.as_str();
            if tag.trim().is_empty() {
                bail!("source_tag must not be empty");
            }
            if tag.contains('_') {
                bail!("source_tag {tag:?} must not contain '_'");
            }
            if tag == AUDIT_ERRORS_KEY {
                bail!("source_tag {tag:?} is reserved");
            }
            if !seen.insert(tag) {
                bail!("duplicate source_tag {tag:?}");
            }
            if source.timestamp_field.trim().is_empty() {
                bail!("source {tag:?} has an empty timestamp_field");
            }
            if source.timestamp_field.contains('.') {
                bail!(
                    "source {tag:?} timestamp_field {:?} must be a top-level field",
                    source.timestamp_field
                );
            }
        }
        if self.central.lead_collection == self.central.audit_collection {
            bail!("lead_collection and audit_collection must differ");
        }
        Ok(())
    }
}

impl StoreConfig {
    fn firestore_config(&self, http_timeout: Duration) -> Option<FirestoreConfig> {
        let StoreConfig::Firestore {
            project_id,
            database,
            base_url,
            access_token_env,
            access_token_file,
            page_size,
        } = self
        else {
            return None;
        };
        let mut config = FirestoreConfig::new(project_id.clone());
        if let Some(database) = database {
            config.database = database.clone();
        }
        if let Some(base_url) = base_url {
            config.base_url = base_url.clone();
        }
        config.access_token = match (access_token_file, access_token_env) {
            (Some(path), _) => AccessToken::File(path.clone()),
            (None, Some(name)) => AccessToken::Env(name.clone()),
            (None, None) => AccessToken::None,
        };
        if let Some(page_size) = page_size {
            config.page_size = *page_size;
        }
        config.timeout = http_timeout;
        Some(config)
    }

    /// Opens one handle; called once per configured store at startup.
    pub async fn connect(&self, http_timeout: Duration) -> Result<Arc<dyn DocumentStore>> {
        match self {
            StoreConfig::Firestore { project_id, .. } => {
                let config = self
                    .firestore_config(http_timeout)
                    .context("firestore store config")?;
                let store = FirestoreStore::new(config)
                    .with_context(|| format!("building firestore client for {project_id}"))?;
                Ok(Arc::new(store))
            }
            StoreConfig::Postgres { url_env } => {
                let url = std::env::var(url_env).with_context(|| format!("reading {url_env}"))?;
                let store = PgDocumentStore::connect(&url, http_timeout)
                    .await
                    .with_context(|| format!("connecting postgres store from {url_env}"))?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Connects every enabled source. Sources that share a store config share
/// one handle.
pub async fn build_source_descriptors(
    config: &DeploymentConfig,
    http_timeout: Duration,
) -> Result<Vec<SourceDescriptor>> {
    let mut handles: Vec<(StoreConfig, Arc<dyn DocumentStore>)> = Vec::new();
    let mut out = Vec::new();
    for source in config.enabled_sources() {
        let store = match handles.iter().find(|(cfg, _)| cfg == &source.store) {
            Some((_, store)) => store.clone(),
            None => {
                let store = source
                    .store
                    .connect(http_timeout)
                    .await
                    .with_context(|| format!("connecting source {}", source.source_tag))?;
                handles.push((source.store.clone(), store.clone()));
                store
            }
        };
        out.push(SourceDescriptor {
            source_tag: source.source_tag.clone(),
            display_name: source.display_name.clone(),
            store,
            collection: source.collection.clone(),
            timestamp_field: source.timestamp_field.clone(),
            timestamp_kind: source.timestamp_kind,
            id_field: source.id_field.clone(),
        });
    }
    Ok(out)
}
