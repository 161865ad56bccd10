use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ComponentDeployment, CoreError, Environment};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeploymentKey {
    pub namespace: String,
    pub environment: Environment,
}

impl DeploymentKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, environment: Environment) -> Self {
        Self {
            namespace: namespace.into(),
            environment,
        }
    }

    fn matches(&self, record: &ComponentDeployment) -> bool {
        record.namespace == self.namespace && record.environment == self.environment
    }
}

/// Swap the stored snapshot for `key` with `records`, leaving other keys untouched.
///
/// Every incoming record must carry `key`; a batch mixing namespaces or
/// environments is rejected rather than silently misattributed.
///
/// # Errors
/// Returns [`CoreError::Validation`] when a record does not belong to `key`.
pub fn replace_snapshot(
    mut existing: Vec<ComponentDeployment>,
    key: &DeploymentKey,
    records: Vec<ComponentDeployment>,
) -> Result<Vec<ComponentDeployment>, CoreError> {
    if let Some(stray) = records.iter().find(|record| !key.matches(record)) {
        return Err(CoreError::Validation(format!(
            "component {} belongs to {}/{}, not to snapshot {}/{}",
            stray.component_name,
            stray.namespace,
            stray.environment,
            key.namespace,
            key.environment
        )));
    }

    existing.retain(|record| !key.matches(record));
    existing.extend(records);
    Ok(existing)
}

#[must_use]
pub fn group_by_key(
    records: Vec<ComponentDeployment>,
) -> BTreeMap<DeploymentKey, Vec<ComponentDeployment>> {
    let mut groups: BTreeMap<DeploymentKey, Vec<ComponentDeployment>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record);
    }
    groups
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComponentVersionInfo {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub extracted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NamespaceComponents {
    pub components: BTreeMap<String, BTreeMap<Environment, ComponentVersionInfo>>,
    pub environments: BTreeSet<Environment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NamespaceComponentTable {
    pub namespaces: BTreeMap<String, NamespaceComponents>,
}

impl NamespaceComponentTable {
    #[must_use]
    pub fn namespace(&self, namespace: &str) -> Option<&NamespaceComponents> {
        self.namespaces.get(namespace)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

#[must_use]
pub fn build_component_table(records: &[ComponentDeployment]) -> NamespaceComponentTable {
    let mut table = NamespaceComponentTable::default();
    for record in records {
        let namespace = table
            .namespaces
            .entry(record.namespace.clone())
            .or_default();
        namespace.environments.insert(record.environment);
        let info = ComponentVersionInfo {
            version: record.version.clone(),
            extracted_at: record.extracted_at,
        };
        namespace
            .components
            .entry(record.component_name.clone())
            .or_default()
            .insert(record.environment, info);
    }
    table
}

/// Matrix columns the user chose to display. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct VisibleEnvironments(BTreeSet<Environment>);

impl Default for VisibleEnvironments {
    fn default() -> Self {
        Self(Environment::KNOWN.into_iter().collect())
    }
}

impl VisibleEnvironments {
    /// Build from a stored list, keeping known tags only.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when no known environment remains.
    pub fn from_environments(
        environments: impl IntoIterator<Item = Environment>,
    ) -> Result<Self, CoreError> {
        let set: BTreeSet<Environment> = environments
            .into_iter()
            .filter(|environment| environment.is_known())
            .collect();
        if set.is_empty() {
            return Err(CoreError::Validation(
                "at least one environment must stay visible".to_string(),
            ));
        }
        Ok(Self(set))
    }

    #[must_use]
    pub fn contains(&self, environment: Environment) -> bool {
        self.0.contains(&environment)
    }

    /// Flip one column. Hiding the last visible column is refused.
    ///
    /// Returns whether the set changed.
    pub fn toggle(&mut self, environment: Environment) -> bool {
        if !environment.is_known() {
            return false;
        }
        if self.0.contains(&environment) {
            if self.0.len() == 1 {
                return false;
            }
            self.0.remove(&environment)
        } else {
            self.0.insert(environment)
        }
    }

    pub fn show_all(&mut self) {
        *self = Self::default();
    }

    pub fn iter(&self) -> impl Iterator<Item = Environment> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatrixRow {
    pub component: String,
    pub cells: Vec<Option<ComponentVersionInfo>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NamespaceMatrix {
    pub namespace: String,
    pub environments: Vec<Environment>,
    pub rows: Vec<MatrixRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatrixView {
    pub namespaces: Vec<NamespaceMatrix>,
}

/// Case-insensitive display order, with the raw name breaking ties.
fn display_order(name: &str) -> (String, String) {
    (name.to_lowercase(), name.to_string())
}

#[must_use]
pub fn build_matrix(table: &NamespaceComponentTable, visible: &VisibleEnvironments) -> MatrixView {
    let mut namespaces: Vec<NamespaceMatrix> = table
        .namespaces
        .iter()
        .map(|(namespace, data)| {
            let environments: Vec<Environment> = data
                .environments
                .iter()
                .copied()
                .filter(|environment| visible.contains(*environment))
                .collect();
            let mut rows: Vec<MatrixRow> = data
                .components
                .iter()
                .map(|(component, versions)| MatrixRow {
                    component: component.clone(),
                    cells: environments
                        .iter()
                        .map(|environment| versions.get(environment).cloned())
                        .collect(),
                })
                .collect();
            rows.sort_by_cached_key(|row| display_order(&row.component));
            NamespaceMatrix {
                namespace: namespace.clone(),
                environments,
                rows,
            }
        })
        .collect();
    namespaces.sort_by_cached_key(|matrix| display_order(&matrix.namespace));
    MatrixView { namespaces }
}

impl MatrixView {
    #[must_use]
    pub fn render_text(&self) -> String {
        if self.namespaces.is_empty() {
            return "No component data available\n".to_string();
        }

        let mut out = String::new();
        for namespace in &self.namespaces {
            let count = namespace.rows.len();
            let plural = if count == 1 { "" } else { "s" };
            let _ = writeln!(out, "{} ({count} component{plural})", namespace.namespace);

            let mut header = vec!["Component".to_string()];
            for environment in &namespace.environments {
                header.push(environment.as_str().to_uppercase());
            }
            let mut lines = vec![header];
            for row in &namespace.rows {
                let mut line = vec![row.component.clone()];
                for cell in &row.cells {
                    let version = match cell {
                        Some(info) => info.version.clone(),
                        None => "-".to_string(),
                    };
                    line.push(version);
                }
                lines.push(line);
            }

            let mut widths = vec![0_usize; lines[0].len()];
            for line in &lines {
                for (width, cell) in widths.iter_mut().zip(line) {
                    *width = (*width).max(cell.chars().count());
                }
            }
            for line in &lines {
                let padded: Vec<String> = line
                    .iter()
                    .zip(&widths)
                    .map(|(cell, &width)| format!("{cell:<width$}"))
                    .collect();
                let _ = writeln!(out, "  {}", padded.join("  ").trim_end());
            }
            out.push('\n');
        }
        out
    }
}
