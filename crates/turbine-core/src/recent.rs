use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::namespace::build_environment_url;
use crate::{Environment, QaUat1Preference, VisitedEnvironment};

/// Merge `incoming` into a most-recent-first list keyed by namespace.
///
/// A determined qa/uat1 preference on the existing entry survives an undetermined
/// incoming one. The result never holds more than `max_items` entries.
#[must_use]
pub fn upsert_recent(
    mut existing: Vec<VisitedEnvironment>,
    mut incoming: VisitedEnvironment,
    max_items: usize,
) -> Vec<VisitedEnvironment> {
    let namespace = incoming.namespace.clone();
    if let Some(previous) = existing.iter().find(|entry| entry.namespace == namespace) {
        incoming.qa_uat1_preference =
            QaUat1Preference::merge(previous.qa_uat1_preference, incoming.qa_uat1_preference);
    }

    existing.retain(|entry| entry.namespace != namespace);
    let mut updated = Vec::with_capacity(existing.len() + 1);
    updated.push(incoming);
    updated.extend(existing);
    updated.truncate(max_items);
    updated
}

/// Case-insensitive namespace search; an empty query keeps every entry.
#[must_use]
pub fn filter_recent<'a>(
    entries: &'a [VisitedEnvironment],
    query: &str,
) -> Vec<&'a VisitedEnvironment> {
    let needle = query.to_lowercase();
    entries
        .iter()
        .filter(|entry| entry.namespace.to_lowercase().contains(&needle))
        .collect()
}

#[must_use]
pub fn format_relative(timestamp: OffsetDateTime, now: OffsetDateTime) -> String {
    let elapsed = now - timestamp;
    let minutes = elapsed.whole_minutes();
    let hours = elapsed.whole_hours();

    if minutes < 1 {
        "Just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if hours < 24 {
        format!("{hours}h ago")
    } else {
        format!("{}d ago", elapsed.whole_days())
    }
}

/// Environments offered for switching, hiding the unused one of qa/uat1.
#[must_use]
pub fn switchable_environments(preference: QaUat1Preference) -> Vec<Environment> {
    Environment::KNOWN
        .into_iter()
        .filter(|environment| {
            !matches!(
                (preference, environment),
                (QaUat1Preference::Qa, Environment::Uat1)
                    | (QaUat1Preference::Uat1, Environment::Qa)
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentLink {
    pub environment: Environment,
    pub url: String,
    pub active: bool,
}

#[must_use]
pub fn environment_links(base_url: &str, entry: &VisitedEnvironment) -> Vec<EnvironmentLink> {
    switchable_environments(entry.qa_uat1_preference)
        .into_iter()
        .map(|environment| EnvironmentLink {
            environment,
            url: build_environment_url(base_url, &entry.namespace, environment, None),
            active: environment == entry.environment,
        })
        .collect()
}
