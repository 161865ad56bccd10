use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use turbine_core::RuntimeMessage;

use crate::extract::{extract_component_data, has_deployments_container, PANE_SELECTOR};
use crate::{ExtractError, MessageSink};

const CONTAINER_CLASS: &str = "deployments-wrapper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Delay before the first extraction after page load.
    pub initial_delay: Duration,
    /// Quiet period that must follow the last relevant mutation.
    pub quiet_period: Duration,
    /// Delay before the single retry when the container is missing at setup.
    pub container_retry_delay: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            quiet_period: Duration::from_millis(500),
            container_retry_delay: Duration::from_millis(2000),
        }
    }
}

/// One observed DOM change under the deployments container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationRecord {
    pub target_classes: Vec<String>,
    /// The mutated node sits inside a deployment pane.
    pub inside_pane: bool,
    /// The mutated node has a deployment pane below it.
    pub contains_pane: bool,
}

impl MutationRecord {
    /// A child-list change on the container itself.
    #[must_use]
    pub fn container() -> Self {
        Self {
            target_classes: vec![CONTAINER_CLASS.to_string()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_relevant(&self) -> bool {
        self.inside_pane
            || self.contains_pane
            || self
                .target_classes
                .iter()
                .any(|class| class == CONTAINER_CLASS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
}

/// Current state of the observed page.
pub trait PageSource: Send + Sync {
    /// # Errors
    /// Returns an error when the page content cannot be read.
    fn snapshot(&self) -> Result<PageSnapshot, ExtractError>;
}

/// A saved page on disk, re-read on every extraction.
#[derive(Debug, Clone)]
pub struct FilePageSource {
    url: String,
    path: PathBuf,
}

impl FilePageSource {
    #[must_use]
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }

    /// Emit a container mutation whenever the file's modification time changes.
    ///
    /// The poller stops once the returned receiver is dropped.
    #[must_use]
    pub fn spawn_mutation_poller(&self, interval: Duration) -> mpsc::Receiver<MutationRecord> {
        let (sender, receiver) = mpsc::channel(16);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut last_modified = modified_at(&path);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }
                let current = modified_at(&path);
                if current != last_modified {
                    last_modified = current;
                    if sender.send(MutationRecord::container()).await.is_err() {
                        break;
                    }
                }
            }
        });
        receiver
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

impl PageSource for FilePageSource {
    fn snapshot(&self) -> Result<PageSnapshot, ExtractError> {
        let html = fs::read_to_string(&self.path).map_err(|source| ExtractError::Snapshot {
            path: self.path.clone(),
            source,
        })?;
        Ok(PageSnapshot {
            url: self.url.clone(),
            html,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub extractions: usize,
    pub batches_sent: usize,
    pub records_sent: usize,
    /// Whether mutation observation was ever attached to the container.
    pub observing: bool,
}

/// Drive extraction for one page until the mutation stream closes.
///
/// One extraction runs after `initial_delay` plus the quiet period. Relevant
/// mutations re-arm a single pending deadline, so a burst yields one
/// extraction. Mutations are ignored until the container has been found,
/// either at setup or on the one retry. Non-empty batches go to `sink`.
pub async fn run_watcher<P, S>(
    source: &P,
    sink: &S,
    config: DebounceConfig,
    mut mutations: mpsc::Receiver<MutationRecord>,
) -> WatchReport
where
    P: PageSource + ?Sized,
    S: MessageSink + ?Sized,
{
    let started = Instant::now();
    let mut report = WatchReport::default();
    let mut initial = Some(started + config.initial_delay);
    let mut pending: Option<Instant> = None;
    let mut observing = container_present(source);
    let mut retry = (!observing).then(|| started + config.container_retry_delay);
    let mut stream_open = true;
    report.observing = observing;

    if !observing {
        tracing::debug!(
            retry_ms = config.container_retry_delay.as_millis(),
            "deployments container missing; retrying observer setup once"
        );
    }

    while stream_open || initial.is_some() || pending.is_some() || retry.is_some() {
        tokio::select! {
            biased;
            () = wait_for(initial) => {
                initial = None;
                pending = Some(Instant::now() + config.quiet_period);
            }
            () = wait_for(retry) => {
                retry = None;
                observing = container_present(source);
                report.observing = observing;
                if !observing {
                    tracing::debug!("deployments container still missing; ignoring mutations");
                }
            }
            () = wait_for(pending) => {
                pending = None;
                extract_and_send(source, sink, &mut report);
            }
            received = mutations.recv(), if stream_open => match received {
                Some(record) if observing && record.is_relevant() => {
                    pending = Some(Instant::now() + config.quiet_period);
                }
                Some(_) => {}
                None => stream_open = false,
            }
        }
    }

    report
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn container_present<P: PageSource + ?Sized>(source: &P) -> bool {
    let present = source
        .snapshot()
        .and_then(|snapshot| has_deployments_container(&snapshot.html));
    match present {
        Ok(present) => present,
        Err(err) => {
            tracing::debug!(error = %err, "container lookup failed");
            false
        }
    }
}

fn extract_and_send<P, S>(source: &P, sink: &S, report: &mut WatchReport)
where
    P: PageSource + ?Sized,
    S: MessageSink + ?Sized,
{
    report.extractions += 1;
    let extracted = source.snapshot().and_then(|snapshot| {
        extract_component_data(&snapshot.url, &snapshot.html, OffsetDateTime::now_utc())
    });
    let records = match extracted {
        Ok(records) => records,
        Err(err) => {
            tracing::debug!(error = %err, "extraction failed");
            return;
        }
    };

    if records.is_empty() {
        tracing::debug!(selector = PANE_SELECTOR, "no deployment panes found");
        return;
    }

    report.batches_sent += 1;
    report.records_sent += records.len();
    sink.deliver(RuntimeMessage::ComponentData(records));
}
