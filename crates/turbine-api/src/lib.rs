use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use turbine_core::{
    build_environment_url, build_matrix, environment_links, filter_recent, group_by_key,
    parse_turbine_url, ComponentDeployment, DeploymentKey, Environment, EnvironmentLink,
    MatrixView, MessageAck, NamespaceComponentTable, RuntimeMessage, Settings,
    VisibleEnvironments, VisitedEnvironment,
};
use turbine_store_sqlite::{
    ComponentStore, IntegrityReport, RecentEnvironmentsStore, SchemaStatus, SettingsStore,
    SharedBackend, SqliteBackend, VisibleEnvironmentsStore,
};

pub mod background;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub keys: Vec<DeploymentKey>,
    pub records: usize,
}

/// Facade over the four persisted stores, shared by the CLI, the HTTP service
/// and the background event handlers.
#[derive(Clone)]
pub struct TurbineApi {
    sqlite: Option<Arc<SqliteBackend>>,
    recent: RecentEnvironmentsStore,
    components: ComponentStore,
    settings: SettingsStore,
    visible: VisibleEnvironmentsStore,
}

impl TurbineApi {
    /// Build the facade over an arbitrary backend. Database maintenance
    /// operations are unavailable unless the backend is `SQLite`.
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_parts(backend, None)
    }

    /// Open the `SQLite` database at `db_path` and apply pending migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(db_path: &Path) -> Result<Self> {
        let api = Self::open_unmigrated(db_path)?;
        api.sqlite()?.migrate()?;
        Ok(api)
    }

    /// Open the `SQLite` database without touching its schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open_unmigrated(db_path: &Path) -> Result<Self> {
        let sqlite = Arc::new(SqliteBackend::open(db_path)?);
        let backend: SharedBackend = sqlite.clone();
        Ok(Self::with_parts(backend, Some(sqlite)))
    }

    fn with_parts(backend: SharedBackend, sqlite: Option<Arc<SqliteBackend>>) -> Self {
        Self {
            sqlite,
            recent: RecentEnvironmentsStore::new(Arc::clone(&backend)),
            components: ComponentStore::new(Arc::clone(&backend)),
            settings: SettingsStore::new(Arc::clone(&backend)),
            visible: VisibleEnvironmentsStore::new(backend),
        }
    }

    fn sqlite(&self) -> Result<&SqliteBackend> {
        self.sqlite
            .as_deref()
            .ok_or_else(|| anyhow!("database maintenance requires a SQLite backend"))
    }

    /// # Errors
    /// Returns an error when settings cannot be loaded.
    pub fn settings(&self) -> Result<Settings> {
        self.settings.get()
    }

    /// Persist a new base URL, stripped of trailing slashes.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn save_settings(&self, base_url: &str) -> Result<Settings> {
        let saved = self.settings.save(&Settings::new(base_url))?;
        tracing::info!(base_url = %saved.base_url, "settings saved");
        Ok(saved)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn reset_settings(&self) -> Result<Settings> {
        self.settings.save(&Settings::default())
    }

    /// Record a page visit. Returns `None` when no base URL is configured or
    /// the URL is not a Turbine environment page.
    ///
    /// # Errors
    /// Returns an error when settings cannot be loaded or the upsert fails.
    pub fn record_visit(&self, url: &str) -> Result<Option<VisitedEnvironment>> {
        let settings = self.settings.get()?;
        if !settings.is_configured() {
            tracing::debug!("base url not configured; visit ignored");
            return Ok(None);
        }
        let Some(visit) = parse_turbine_url(url, &settings.base_url) else {
            return Ok(None);
        };
        let stored = self.recent.upsert(visit)?;
        tracing::debug!(
            namespace = %stored.namespace,
            environment = %stored.environment,
            "visit recorded"
        );
        Ok(Some(stored))
    }

    /// Recent environments, newest first, optionally filtered by namespace substring.
    ///
    /// # Errors
    /// Returns an error when the recent list cannot be loaded.
    pub fn recent(&self, query: Option<&str>) -> Result<Vec<VisitedEnvironment>> {
        let all = self.recent.list_all()?;
        match query {
            Some(query) => Ok(filter_recent(&all, query).into_iter().cloned().collect()),
            None => Ok(all),
        }
    }

    /// # Errors
    /// Returns an error when the remove fails.
    pub fn remove_recent(&self, id: &str) -> Result<bool> {
        self.recent.remove(id)
    }

    /// # Errors
    /// Returns an error when the clear fails.
    pub fn clear_recent(&self) -> Result<()> {
        self.recent.clear()
    }

    /// Switch targets for one recent entry.
    ///
    /// # Errors
    /// Returns an error when the entry is unknown or no base URL is configured.
    pub fn recent_links(&self, id: &str) -> Result<Vec<EnvironmentLink>> {
        let entry = self
            .recent
            .get(id)?
            .ok_or_else(|| anyhow!("recent environment {id} not found"))?;
        let base_url = self.configured_base_url()?;
        Ok(environment_links(&base_url, &entry))
    }

    /// Build a navigable URL for `namespace` in `environment`.
    ///
    /// # Errors
    /// Returns an error when no base URL is configured.
    pub fn navigation_url(
        &self,
        namespace: &str,
        environment: Environment,
        path: Option<&str>,
    ) -> Result<String> {
        let base_url = self.configured_base_url()?;
        Ok(build_environment_url(&base_url, namespace, environment, path))
    }

    fn configured_base_url(&self) -> Result<String> {
        let settings = self.settings.get()?;
        if !settings.is_configured() {
            return Err(anyhow!("base url is not configured"));
        }
        Ok(settings.base_url)
    }

    /// Store a scraped batch, replacing the snapshot of every
    /// namespace/environment key it contains.
    ///
    /// # Errors
    /// Returns an error when any replace fails; earlier keys stay replaced.
    pub fn ingest(&self, records: Vec<ComponentDeployment>) -> Result<IngestResult> {
        let count = records.len();
        let grouped = group_by_key(records);
        let mut keys = Vec::with_capacity(grouped.len());
        for (key, batch) in grouped {
            self.components.replace(&key.namespace, key.environment, batch)?;
            keys.push(key);
        }
        tracing::info!(records = count, keys = keys.len(), "component batch stored");
        Ok(IngestResult {
            keys,
            records: count,
        })
    }

    /// # Errors
    /// Returns an error when a record belongs to another key or persistence fails.
    pub fn replace_components(
        &self,
        namespace: &str,
        environment: Environment,
        records: Vec<ComponentDeployment>,
    ) -> Result<()> {
        self.components.replace(namespace, environment, records)
    }

    /// # Errors
    /// Returns an error when component data cannot be loaded.
    pub fn components(&self) -> Result<Vec<ComponentDeployment>> {
        self.components.get_all()
    }

    /// # Errors
    /// Returns an error when component data cannot be loaded.
    pub fn component_table(&self) -> Result<NamespaceComponentTable> {
        self.components.get_table()
    }

    /// Component table reduced to the visible environment columns.
    ///
    /// # Errors
    /// Returns an error when component data or visibility cannot be loaded.
    pub fn component_matrix(&self) -> Result<MatrixView> {
        let table = self.components.get_table()?;
        let visible = self.visible.get()?;
        Ok(build_matrix(&table, &visible))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_namespace(&self, namespace: &str) -> Result<usize> {
        let removed = self.components.delete_namespace(namespace)?;
        tracing::info!(namespace, removed, "namespace components deleted");
        Ok(removed)
    }

    /// # Errors
    /// Returns an error when the clear fails.
    pub fn clear_components(&self) -> Result<()> {
        self.components.clear()
    }

    /// # Errors
    /// Returns an error when the backend read fails.
    pub fn visible_environments(&self) -> Result<VisibleEnvironments> {
        self.visible.get()
    }

    /// Replace the visible set.
    ///
    /// # Errors
    /// Returns an error when no known environment is given or persistence fails.
    pub fn set_visible_environments(
        &self,
        environments: Vec<Environment>,
    ) -> Result<VisibleEnvironments> {
        let visible = VisibleEnvironments::from_environments(environments)
            .map_err(|err| anyhow!("{err}"))?;
        self.visible.save(&visible)?;
        Ok(visible)
    }

    /// # Errors
    /// Returns an error when the read-modify-write cycle fails.
    pub fn toggle_environment(&self, environment: Environment) -> Result<VisibleEnvironments> {
        self.visible.toggle(environment)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn show_all_environments(&self) -> Result<VisibleEnvironments> {
        self.visible.show_all()
    }

    /// Apply a runtime message and acknowledge it.
    pub fn handle_message(&self, message: RuntimeMessage) -> MessageAck {
        match message {
            RuntimeMessage::ComponentData(records) => match self.ingest(records) {
                Ok(_) => MessageAck::ok(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to store component data");
                    MessageAck::failed(err.to_string())
                }
            },
        }
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the backend is not `SQLite` or the query fails.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.sqlite()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let sqlite = self.sqlite()?;
        let before = sqlite.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        sqlite.migrate()?;
        let after = sqlite.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the backend is not `SQLite` or a check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.sqlite()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backend is not `SQLite` or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.sqlite()?.backup_database(out_file)
    }
}
