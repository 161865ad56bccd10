use serde::{Deserialize, Serialize};

use crate::DEFAULT_BASE_URL;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Settings {
    pub base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// Strip trailing slashes so `{base_url}/environments/...` never doubles up.
#[must_use]
pub fn normalize_base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}
