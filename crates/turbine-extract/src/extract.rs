use scraper::{ElementRef, Html, Selector};
use time::OffsetDateTime;
use turbine_core::{environment_path_token, split_environment_suffix, ComponentDeployment};
use url::Url;

use crate::ExtractError;

pub const PANE_SELECTOR: &str = "turbine-deployment-pane";
pub const NAME_SELECTOR: &str = r#".deployment__body--name a[href^="/components/"]"#;
pub const VERSION_SELECTOR: &str =
    ".deployment__body--versions .badge-release, .deployment__body--versions .badge-snapshot";
pub const ENV_TYPE_SELECTOR: &str = ".deployment__body--env-type .badge__env-type";
pub const CONTAINER_SELECTOR: &str = ".deployments-wrapper";

const ENVIRONMENTS_SEGMENT: &str = "/environments/";
const DEPLOYMENTS_VIEW_SEGMENT: &str = "/view/DEPLOYMENTS";

/// Compiled CSS selectors for the host page's deployment markup.
pub struct DeploymentSelectors {
    pane: Selector,
    name: Selector,
    version: Selector,
    env_type: Selector,
}

impl DeploymentSelectors {
    /// # Errors
    /// Returns [`ExtractError::Selector`] when a selector fails to compile.
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            pane: compile(PANE_SELECTOR)?,
            name: compile(NAME_SELECTOR)?,
            version: compile(VERSION_SELECTOR)?,
            env_type: compile(ENV_TYPE_SELECTOR)?,
        })
    }
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

/// Whether `path` is a deployments view of some environment.
#[must_use]
pub fn is_deployments_page(path: &str) -> bool {
    path.contains(ENVIRONMENTS_SEGMENT) && path.contains(DEPLOYMENTS_VIEW_SEGMENT)
}

/// Whether the mutation-observation root is present in `html`.
///
/// # Errors
/// Returns [`ExtractError::Selector`] when the container selector fails to compile.
pub fn has_deployments_container(html: &str) -> Result<bool, ExtractError> {
    let container = compile(CONTAINER_SELECTOR)?;
    let document = Html::parse_document(html);
    Ok(document.select(&container).next().is_some())
}

/// Scrape every deployment pane on the page into records stamped with `now`.
///
/// Pages outside a deployments view yield an empty list. Panes missing a
/// component name or version are skipped.
///
/// # Errors
/// Returns [`ExtractError::InvalidPageUrl`] when `page_url` is not an absolute
/// URL, or [`ExtractError::Selector`] when selector compilation fails.
pub fn extract_component_data(
    page_url: &str,
    html: &str,
    now: OffsetDateTime,
) -> Result<Vec<ComponentDeployment>, ExtractError> {
    let url = Url::parse(page_url).map_err(|err| ExtractError::InvalidPageUrl {
        url: page_url.to_string(),
        message: err.to_string(),
    })?;

    let path = url.path();
    if !is_deployments_page(path) {
        return Ok(Vec::new());
    }
    let Some(token) = environment_path_token(path) else {
        return Ok(Vec::new());
    };
    let (namespace, environment) = split_environment_suffix(token);

    let selectors = DeploymentSelectors::new()?;
    let document = Html::parse_document(html);
    let deployments: Vec<ComponentDeployment> = document
        .select(&selectors.pane)
        .filter_map(|pane| {
            let component_name = first_text(pane, &selectors.name)?;
            let version = first_text(pane, &selectors.version)?;
            let env_type = first_text(pane, &selectors.env_type)
                .unwrap_or_else(|| environment.as_str().to_string());
            Some(ComponentDeployment {
                component_name,
                version,
                namespace: namespace.to_string(),
                environment,
                env_type,
                extracted_at: now,
            })
        })
        .collect();

    tracing::debug!(
        namespace,
        environment = %environment,
        count = deployments.len(),
        "extracted component deployments"
    );
    Ok(deployments)
}

/// Trimmed text of the first match, `None` when absent or blank.
fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let element = scope.select(selector).next()?;
    let text = element.text().collect::<String>().trim().to_string();
    (!text.is_empty()).then_some(text)
}
