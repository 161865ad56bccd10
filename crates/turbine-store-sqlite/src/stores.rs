use anyhow::{anyhow, Result};
use turbine_core::{
    build_component_table, replace_snapshot, upsert_recent, ComponentDeployment, DeploymentKey,
    Environment, NamespaceComponentTable, Settings, VisibleEnvironments, VisitedEnvironment,
    COMPONENT_DEPLOYMENTS_KEY, MAX_RECENT_ITEMS, RECENT_ENVIRONMENTS_KEY, SETTINGS_KEY,
    VISIBLE_ENVIRONMENTS_KEY,
};

use crate::{load_json, save_json, SharedBackend};

/// Most-recent-first list of visited namespaces, one entry per namespace.
#[derive(Clone)]
pub struct RecentEnvironmentsStore {
    backend: SharedBackend,
    max_items: usize,
}

impl RecentEnvironmentsStore {
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            max_items: MAX_RECENT_ITEMS,
        }
    }

    /// Load the stored list, newest first.
    ///
    /// # Errors
    /// Returns an error when the backend read or JSON decoding fails.
    pub fn list_all(&self) -> Result<Vec<VisitedEnvironment>> {
        let stored: Option<Vec<VisitedEnvironment>> =
            load_json(self.backend.as_ref(), RECENT_ENVIRONMENTS_KEY)?;
        Ok(stored.unwrap_or_default())
    }

    /// Find one entry by its identifier.
    ///
    /// # Errors
    /// Returns an error when the stored list cannot be loaded.
    pub fn get(&self, id: &str) -> Result<Option<VisitedEnvironment>> {
        Ok(self.list_all()?.into_iter().find(|entry| entry.id.0 == id))
    }

    /// Insert or refresh the entry for `record.namespace` and move it to the front.
    ///
    /// # Errors
    /// Returns an error when the read-modify-write cycle fails.
    pub fn upsert(&self, record: VisitedEnvironment) -> Result<VisitedEnvironment> {
        let updated = upsert_recent(self.list_all()?, record, self.max_items);
        save_json(self.backend.as_ref(), RECENT_ENVIRONMENTS_KEY, &updated)?;
        updated
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("recent environments list is empty after upsert"))
    }

    /// Delete the entry with `id`. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns an error when the read-modify-write cycle fails.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.list_all()?;
        let before = entries.len();
        entries.retain(|entry| entry.id.0 != id);
        if entries.len() == before {
            return Ok(false);
        }
        save_json(self.backend.as_ref(), RECENT_ENVIRONMENTS_KEY, &entries)?;
        Ok(true)
    }

    /// Empty the store.
    ///
    /// # Errors
    /// Returns an error when the backend delete fails.
    pub fn clear(&self) -> Result<()> {
        self.backend.remove(RECENT_ENVIRONMENTS_KEY)
    }
}

/// Flat list of scraped component deployments, one snapshot per namespace/environment.
#[derive(Clone)]
pub struct ComponentStore {
    backend: SharedBackend,
}

impl ComponentStore {
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Load every stored deployment record.
    ///
    /// # Errors
    /// Returns an error when the backend read or JSON decoding fails.
    pub fn get_all(&self) -> Result<Vec<ComponentDeployment>> {
        let stored: Option<Vec<ComponentDeployment>> =
            load_json(self.backend.as_ref(), COMPONENT_DEPLOYMENTS_KEY)?;
        Ok(stored.unwrap_or_default())
    }

    /// Supersede the stored snapshot for `namespace`/`environment`.
    ///
    /// # Errors
    /// Returns an error when a record belongs to another key or persistence fails.
    pub fn replace(
        &self,
        namespace: &str,
        environment: Environment,
        records: Vec<ComponentDeployment>,
    ) -> Result<()> {
        let key = DeploymentKey::new(namespace, environment);
        let updated = replace_snapshot(self.get_all()?, &key, records)
            .map_err(|err| anyhow!("snapshot replace rejected: {err}"))?;
        save_json(self.backend.as_ref(), COMPONENT_DEPLOYMENTS_KEY, &updated)
    }

    /// Group the flat list into the namespace/component/environment table.
    ///
    /// # Errors
    /// Returns an error when the stored list cannot be loaded.
    pub fn get_table(&self) -> Result<NamespaceComponentTable> {
        Ok(build_component_table(&self.get_all()?))
    }

    /// Drop every record of `namespace` across all environments. Returns the number removed.
    ///
    /// # Errors
    /// Returns an error when the read-modify-write cycle fails.
    pub fn delete_namespace(&self, namespace: &str) -> Result<usize> {
        let mut records = self.get_all()?;
        let before = records.len();
        records.retain(|record| record.namespace != namespace);
        let removed = before - records.len();
        if removed > 0 {
            save_json(self.backend.as_ref(), COMPONENT_DEPLOYMENTS_KEY, &records)?;
        }
        Ok(removed)
    }

    /// Remove all component data.
    ///
    /// # Errors
    /// Returns an error when the backend delete fails.
    pub fn clear(&self) -> Result<()> {
        self.backend.remove(COMPONENT_DEPLOYMENTS_KEY)
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    backend: SharedBackend,
}

impl SettingsStore {
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Load settings, falling back to the unconfigured default.
    ///
    /// # Errors
    /// Returns an error when the backend read or JSON decoding fails.
    pub fn get(&self) -> Result<Settings> {
        let stored: Option<Settings> = load_json(self.backend.as_ref(), SETTINGS_KEY)?;
        Ok(stored.unwrap_or_default())
    }

    /// Replace the settings record; the base URL is normalized first.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn save(&self, settings: &Settings) -> Result<Settings> {
        let normalized = Settings::new(&settings.base_url);
        save_json(self.backend.as_ref(), SETTINGS_KEY, &normalized)?;
        Ok(normalized)
    }

    /// # Errors
    /// Returns an error when settings cannot be loaded.
    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.get()?.is_configured())
    }
}

#[derive(Clone)]
pub struct VisibleEnvironmentsStore {
    backend: SharedBackend,
}

impl VisibleEnvironmentsStore {
    #[must_use]
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Load the visible matrix columns; unset or unusable values mean "all".
    ///
    /// # Errors
    /// Returns an error when the backend read fails.
    pub fn get(&self) -> Result<VisibleEnvironments> {
        let loaded: Result<Option<Vec<Environment>>> =
            load_json(self.backend.as_ref(), VISIBLE_ENVIRONMENTS_KEY);
        let stored = match loaded {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring undecodable visible environments");
                None
            }
        };
        Ok(stored
            .and_then(|environments| VisibleEnvironments::from_environments(environments).ok())
            .unwrap_or_default())
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn save(&self, visible: &VisibleEnvironments) -> Result<()> {
        save_json(self.backend.as_ref(), VISIBLE_ENVIRONMENTS_KEY, visible)
    }

    /// Flip one column and persist the result.
    ///
    /// # Errors
    /// Returns an error when the read-modify-write cycle fails.
    pub fn toggle(&self, environment: Environment) -> Result<VisibleEnvironments> {
        let mut visible = self.get()?;
        if visible.toggle(environment) {
            self.save(&visible)?;
        }
        Ok(visible)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn show_all(&self) -> Result<VisibleEnvironments> {
        let visible = VisibleEnvironments::default();
        self.save(&visible)?;
        Ok(visible)
    }
}
