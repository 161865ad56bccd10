//! Page-side half of the navigator: scrape a deployments page into
//! [`ComponentDeployment`] records and hand batches to the aggregator.

use std::path::PathBuf;

mod extract;
mod sink;
mod watch;

pub use extract::{
    extract_component_data, has_deployments_container, is_deployments_page, DeploymentSelectors,
    CONTAINER_SELECTOR, ENV_TYPE_SELECTOR, NAME_SELECTOR, PANE_SELECTOR, VERSION_SELECTOR,
};
pub use sink::{ChannelSink, HttpMessageSink, MessageSink, MESSAGES_PATH};
pub use watch::{
    run_watcher, DebounceConfig, FilePageSource, MutationRecord, PageSnapshot, PageSource,
    WatchReport,
};

pub use turbine_core::ComponentDeployment;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("invalid page url {url}: {message}")]
    InvalidPageUrl { url: String, message: String },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("failed to read page snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("message delivery failed: {0}")]
    Delivery(String),
}
