//! Tab-lifecycle and runtime-message handlers.
//!
//! Storage failures are logged and swallowed here; callers only see the
//! absence of a result.

use serde::{Deserialize, Serialize};
use turbine_core::{MessageAck, RuntimeMessage, VisitedEnvironment};

use crate::TurbineApi;

pub const TAB_STATUS_COMPLETE: &str = "complete";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabUpdated {
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabActivated {
    #[serde(default)]
    pub url: Option<String>,
}

/// A tab finished loading. Only `complete` updates with a URL are recorded.
#[must_use]
pub fn on_tab_updated(api: &TurbineApi, event: &TabUpdated) -> Option<VisitedEnvironment> {
    if event.status != TAB_STATUS_COMPLETE {
        return None;
    }
    record(api, event.url.as_deref()?)
}

/// The user switched to an existing tab.
#[must_use]
pub fn on_tab_activated(api: &TurbineApi, event: &TabActivated) -> Option<VisitedEnvironment> {
    record(api, event.url.as_deref()?)
}

fn record(api: &TurbineApi, url: &str) -> Option<VisitedEnvironment> {
    match api.record_visit(url) {
        Ok(visit) => visit,
        Err(err) => {
            tracing::warn!(error = %err, url, "failed to record visit");
            None
        }
    }
}

#[must_use]
pub fn handle_runtime_message(api: &TurbineApi, message: RuntimeMessage) -> MessageAck {
    api.handle_message(message)
}
