use time::OffsetDateTime;
use url::Url;

use crate::{Environment, QaUat1Preference, RecordId, VisitedEnvironment};

pub const DEFAULT_VIEW_PATH: &str = "view/DEPLOYMENTS";

const ENVIRONMENTS_SEGMENT: &str = "/environments/";

/// Split a `{namespace}-{env}` token into its base namespace and environment.
///
/// Only the six known tags are recognised, compared without ASCII case. A token
/// without a recognised suffix is returned whole with [`Environment::Unknown`].
#[must_use]
pub fn split_environment_suffix(token: &str) -> (&str, Environment) {
    for environment in Environment::KNOWN {
        let tag = environment.as_str();
        let Some(split_at) = token.len().checked_sub(tag.len()) else {
            continue;
        };
        let (Some(prefix), Some(suffix)) = (token.get(..split_at), token.get(split_at..)) else {
            continue;
        };
        if !suffix.eq_ignore_ascii_case(tag) {
            continue;
        }
        if let Some(namespace) = prefix.strip_suffix('-') {
            return (namespace, environment);
        }
    }

    (token, Environment::Unknown)
}

#[must_use]
pub fn get_base_namespace(token: &str) -> &str {
    split_environment_suffix(token).0
}

#[must_use]
pub fn build_namespace_with_env(namespace: &str, environment: Environment) -> String {
    format!("{namespace}-{}", environment.as_str())
}

/// Return the first non-empty `{token}` following an `/environments/` segment.
#[must_use]
pub fn environment_path_token(path: &str) -> Option<&str> {
    path.match_indices(ENVIRONMENTS_SEGMENT)
        .find_map(|(index, segment)| {
            let rest = path.get(index + segment.len()..)?;
            let token = rest.split('/').next()?;
            (!token.is_empty()).then_some(token)
        })
}

/// Parse a Turbine page URL into a visit record stamped with the current time.
#[must_use]
pub fn parse_turbine_url(url: &str, base_url: &str) -> Option<VisitedEnvironment> {
    parse_turbine_url_at(url, base_url, OffsetDateTime::now_utc())
}

/// Parse a Turbine page URL into a visit record stamped with `now`.
///
/// Returns `None` when either URL is malformed, the hosts differ, or the path
/// carries no `/environments/{token}` segment.
#[must_use]
pub fn parse_turbine_url_at(
    url: &str,
    base_url: &str,
    now: OffsetDateTime,
) -> Option<VisitedEnvironment> {
    let page = Url::parse(url).ok()?;
    let base = Url::parse(base_url).ok()?;
    let same_host = page.host_str()? == base.host_str()?
        && page.port_or_known_default() == base.port_or_known_default();
    if !same_host {
        return None;
    }

    let token = environment_path_token(page.path())?;
    let (namespace, environment) = split_environment_suffix(token);

    Some(VisitedEnvironment {
        id: RecordId::derive(namespace, environment, now),
        namespace: namespace.to_string(),
        environment,
        url: url.to_string(),
        last_visited_at: now,
        qa_uat1_preference: QaUat1Preference::from_environment(environment),
    })
}

/// Build `{base_url}/environments/{namespace_with_env}/{path}`.
#[must_use]
pub fn build_turbine_url(base_url: &str, namespace_with_env: &str, path: Option<&str>) -> String {
    let path = path.unwrap_or(DEFAULT_VIEW_PATH).trim_start_matches('/');
    format!(
        "{}/environments/{namespace_with_env}/{path}",
        base_url.trim_end_matches('/')
    )
}

#[must_use]
pub fn build_environment_url(
    base_url: &str,
    namespace: &str,
    environment: Environment,
    path: Option<&str>,
) -> String {
    let token = build_namespace_with_env(namespace, environment);
    build_turbine_url(base_url, &token, path)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    const BASE: &str = "https://turbine.example.cloud";

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn parse(url: &str) -> Option<VisitedEnvironment> {
        parse_turbine_url_at(url, BASE, fixture_time())
    }

    #[test]
    fn deployments_url_yields_namespace_and_environment() {
        let visit = parse_turbine_url_at(
            "https://host/environments/billing-service-prod/view/DEPLOYMENTS",
            "https://host",
            fixture_time(),
        )
        .unwrap_or_else(|| panic!("expected a visit record"));

        assert_eq!(visit.namespace, "billing-service");
        assert_eq!(visit.environment, Environment::Prod);
        assert_eq!(visit.qa_uat1_preference, QaUat1Preference::Undetermined);
        assert_eq!(visit.last_visited_at, fixture_time());
        assert_eq!(
            visit.url,
            "https://host/environments/billing-service-prod/view/DEPLOYMENTS"
        );
    }

    #[test]
    fn host_mismatch_is_rejected() {
        let other = "https://other.example.cloud/environments/svc-dev/view/DEPLOYMENTS";
        let lookalike = "https://turbine.example.cloud.evil/environments/svc-dev";
        assert!(parse(other).is_none());
        assert!(parse(lookalike).is_none());
    }

    #[test]
    fn port_is_part_of_the_host() {
        let at = |url: &str, base: &str| parse_turbine_url_at(url, base, fixture_time());
        let page = "http://localhost:4000/environments/svc-dev/view/DEPLOYMENTS";

        assert!(at(page, "http://localhost:3000").is_none());
        assert!(at(page, "http://localhost").is_none());
        assert!(at(page, "http://localhost:4000/").is_some());
        let explicit_default = "https://host:443/environments/svc-dev";
        assert!(at(explicit_default, "https://host").is_some());
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(parse("not a url").is_none());
        let no_base = parse_turbine_url_at("https://host/environments/svc-dev", "", fixture_time());
        assert!(no_base.is_none());
        assert!(parse(&format!("{BASE}/components/svc-dev")).is_none());
        assert!(parse(&format!("{BASE}/environments/")).is_none());
        assert!(parse(&format!("{BASE}/myenvironments/svc-dev")).is_none());
    }

    #[test]
    fn token_without_suffix_is_unknown_environment() {
        let visit = parse(&format!("{BASE}/environments/legacy-stack/view/PODS"))
            .unwrap_or_else(|| panic!("expected a visit record"));
        assert_eq!(visit.namespace, "legacy-stack");
        assert_eq!(visit.environment, Environment::Unknown);
    }

    #[test]
    fn token_at_end_of_path_is_accepted() {
        let visit = parse(&format!("{BASE}/environments/orders-uat1"))
            .unwrap_or_else(|| panic!("expected a visit record"));
        assert_eq!(visit.namespace, "orders");
        assert_eq!(visit.environment, Environment::Uat1);
        assert_eq!(visit.qa_uat1_preference, QaUat1Preference::Uat1);
    }

    #[test]
    fn qa_visit_sets_qa_preference() {
        let visit = parse(&format!("{BASE}/environments/orders-QA/view/DEPLOYMENTS"))
            .unwrap_or_else(|| panic!("expected a visit record"));
        assert_eq!(visit.environment, Environment::Qa);
        assert_eq!(visit.qa_uat1_preference, QaUat1Preference::Qa);
    }

    #[test]
    fn only_the_final_suffix_is_stripped() {
        let cases = [
            ("a-dev-prod", ("a-dev", Environment::Prod)),
            ("prod", ("prod", Environment::Unknown)),
            ("svcprod", ("svcprod", Environment::Unknown)),
            ("svc-préprod", ("svc-préprod", Environment::Unknown)),
        ];
        for (token, expected) in cases {
            assert_eq!(split_environment_suffix(token), expected);
        }
    }

    #[test]
    fn url_builders_concatenate_path_segments() {
        assert_eq!(
            build_turbine_url(BASE, "orders-qa", None),
            "https://turbine.example.cloud/environments/orders-qa/view/DEPLOYMENTS"
        );
        assert_eq!(
            build_environment_url(BASE, "orders", Environment::Prep, Some("view/PODS")),
            "https://turbine.example.cloud/environments/orders-prep/view/PODS"
        );
    }

    proptest! {
        #[test]
        fn suffix_match_is_case_insensitive(
            namespace in "[a-z][a-z0-9-]{0,24}[a-z0-9]",
            index in 0_usize..6,
            upper in any::<bool>(),
        ) {
            let environment = Environment::KNOWN[index];
            let tag = if upper {
                environment.as_str().to_ascii_uppercase()
            } else {
                environment.as_str().to_string()
            };
            let url = format!("{BASE}/environments/{namespace}-{tag}/view/DEPLOYMENTS");
            let visit = parse(&url);
            prop_assert!(visit.is_some());
            let visit = visit.unwrap_or_else(|| unreachable!());
            prop_assert_eq!(visit.namespace, namespace);
            prop_assert_eq!(visit.environment, environment);
        }

        #[test]
        fn base_namespace_round_trips(
            namespace in "[a-z][a-z0-9-]{0,24}[a-z0-9]",
            index in 0_usize..6,
        ) {
            let environment = Environment::KNOWN[index];
            let token = build_namespace_with_env(&namespace, environment);
            prop_assert_eq!(
                build_namespace_with_env(get_base_namespace(&token), environment),
                token
            );
        }

        #[test]
        fn foreign_hosts_never_parse(host in "[a-z]{3,12}\\.example\\.org") {
            let url = format!("https://{host}/environments/svc-prod/view/DEPLOYMENTS");
            prop_assert!(parse(&url).is_none());
        }
    }
}
