use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Router settings supplied by the embedding application.
///
/// How these are persisted is the application's business; the router
/// only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Where cached media files live, semi-permanently.
    pub cache_dir: PathBuf,
    /// Scratch directory for human-named copies.
    pub temp_dir: PathBuf,
    /// Longest text a single dispatch will accept.
    #[serde(default = "default_text_limit")]
    pub text_limit: usize,
    /// How long a remembered failure blocks identical requests.
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,
    /// Configured extra values keyed by service ID, then extra key
    /// (e.g. `extras["ispeech"]["apikey"]`).
    #[serde(default)]
    pub extras: HashMap<String, HashMap<String, String>>,
}

impl RouterConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            temp_dir: temp_dir.into(),
            text_limit: default_text_limit(),
            failure_ttl_secs: default_failure_ttl_secs(),
            extras: HashMap::new(),
        }
    }

    /// Configured value for a service extra, trimmed; empty counts as
    /// absent.
    pub fn extra_value(&self, svc_id: &str, key: &str) -> Option<String> {
        let value = self.extras.get(svc_id)?.get(key)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        }
    }
}

fn default_text_limit() -> usize {
    2000
}

fn default_failure_ttl_secs() -> u64 {
    3600
}
