use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::RouterError;

/// Default window during which a remembered failure short-circuits
/// repeat requests for the same cache path.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(3600);

/// Time-bounded memo of synthesis failures keyed by cache path.
///
/// Memory-only by design: it exists to absorb short bursts of identical
/// failing requests, and restarting the process is an acceptable reset.
/// Only touched on the controlling task, so it needs no locking.
pub struct FailureMemo {
    ttl: Duration,
    entries: HashMap<PathBuf, (Instant, RouterError)>,
}

impl FailureMemo {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Remember a failure for the given cache path.
    pub fn record(&mut self, path: PathBuf, error: RouterError) {
        debug!(path = %path.display(), %error, "memoizing failure");
        self.entries.insert(path, (Instant::now(), error));
    }

    /// Return the remembered failure for a path, evicting it first if
    /// it has outlived the TTL.
    pub fn check(&mut self, path: &Path) -> Option<RouterError> {
        match self.entries.get(path) {
            Some((when, error)) if when.elapsed() < self.ttl => Some(error.clone()),
            Some(_) => {
                self.entries.remove(path);
                None
            }
            None => None,
        }
    }

    /// Number of live entries, after purging everything expired.
    pub fn count(&mut self) -> usize {
        let ttl = self.ttl;
        self.entries.retain(|_, (when, _)| when.elapsed() < ttl);
        self.entries.len()
    }

    /// Forget every remembered failure.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
