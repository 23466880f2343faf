use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

// ── Capability Traits ──────────────────────────────────

/// Capability tag advertised by a service, used for policy decisions
/// (e.g. only INTERNET services participate in failure memoization).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTrait {
    Internet,
    Transcoding,
    Dictionary,
}

// ── Option Values ──────────────────────────────────────

/// A single option value as it travels through validation, the cache
/// key, and down to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            Self::Str(_) => None,
        }
    }

    /// Equality that treats `Int(1)` and `Float(1.0)` as the same value,
    /// for membership checks against enumerated value lists.
    pub fn loosely_eq(&self, other: &OptionValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for OptionValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

/// Option map as passed by callers and handed to backends.
pub type Options = HashMap<String, OptionValue>;

// ── Option / Extra Schemas ─────────────────────────────

/// Normalization/coercion hook applied to an incoming value before it
/// is checked against the value domain. Returns an error message when
/// the raw value cannot be coerced at all.
pub type Transform = Box<dyn Fn(&OptionValue) -> Result<OptionValue, String> + Send + Sync>;

/// The domain an option value must fall into.
pub enum OptionValues {
    /// Enumerated `(value, label)` pairs.
    List(Vec<(OptionValue, String)>),
    /// Inclusive numeric range, with an optional display unit.
    Range {
        low: f64,
        high: f64,
        unit: Option<String>,
    },
}

/// One user-settable option a service exposes (e.g. voice, speed).
///
/// An absent `default` makes the option required. Keys must already be
/// normalized and may not collide with the reserved playback-tag keys.
pub struct OptionSpec {
    pub key: String,
    pub label: String,
    pub values: OptionValues,
    pub transform: Transform,
    pub default: Option<OptionValue>,
}

impl OptionSpec {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        values: OptionValues,
        transform: Transform,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            values,
            transform,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<OptionValue>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A global, per-service credential-like input (e.g. an API key).
/// Unlike options, extras never factor into the cache path.
#[derive(Debug, Clone)]
pub struct ExtraSpec {
    pub key: String,
    pub label: String,
    pub required: bool,
}

impl ExtraSpec {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Stock transforms shared by service implementations.
pub mod transform {
    use super::{OptionValue, Transform};

    /// Pass the value through untouched.
    pub fn identity() -> Transform {
        Box::new(|value| Ok(value.clone()))
    }

    /// Coerce to a float, accepting numeric strings.
    pub fn float() -> Transform {
        Box::new(|value| match value {
            OptionValue::Float(n) => Ok(OptionValue::Float(*n)),
            OptionValue::Int(n) => Ok(OptionValue::Float(*n as f64)),
            OptionValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(OptionValue::Float)
                .map_err(|_| format!("'{s}' is not a number")),
        })
    }

    /// Coerce to an integer, accepting numeric strings.
    pub fn int() -> Transform {
        Box::new(|value| match value {
            OptionValue::Int(n) => Ok(OptionValue::Int(*n)),
            OptionValue::Float(n) => Ok(OptionValue::Int(*n as i64)),
            OptionValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|_| format!("'{s}' is not an integer")),
        })
    }

    /// Trim surrounding whitespace from a string value.
    pub fn trimmed() -> Transform {
        Box::new(|value| match value {
            OptionValue::Str(s) => Ok(OptionValue::Str(s.trim().to_owned())),
            other => Ok(other.clone()),
        })
    }
}

// ── Per-Call Context ───────────────────────────────────

/// Counter for billable/throttleable network operations, owned by the
/// call rather than the backend instance so that two concurrent calls
/// to the same backend cannot corrupt each other's count.
#[derive(Debug, Clone, Default)]
pub struct NetCounter(Arc<AtomicUsize>);

impl NetCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one network operation.
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a backend needs to perform one synthesis: the (possibly
/// `modify`-adjusted) text, validated options plus injected extras, the
/// output path it must create, the prerun result if any, and the
/// per-call network-op counter.
pub struct SynthesisJob {
    pub text: String,
    pub options: Options,
    pub out_path: PathBuf,
    pub prerun: Option<serde_json::Value>,
    pub net: NetCounter,
}

// ── Backend Trait ──────────────────────────────────────

/// A pluggable TTS provider.
///
/// Implementations are thin wrappers around an HTTP API or a local
/// command; the router owns caching, single-flight, failure memoing
/// and callback delivery, so `run` only has to produce the file.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable description of the provider.
    fn describe(&self) -> String;

    /// The options this provider accepts.
    fn options(&self) -> Vec<OptionSpec>;

    /// Global per-service inputs such as API keys. Default: none.
    fn extras(&self) -> Vec<ExtraSpec> {
        Vec::new()
    }

    /// Provider-specific text adjustment applied after the caller's own
    /// sanitization. Default: identity.
    fn modify(&self, text: &str) -> String {
        text.to_owned()
    }

    /// Optional asynchronous pre-step (e.g. a token exchange) that runs
    /// before `run`; a returned value is stored on the job. Default: no-op.
    async fn prerun(&self, _job: &SynthesisJob) -> Result<Option<serde_json::Value>, BackendError> {
        Ok(None)
    }

    /// Synthesize `job.text` into a file at `job.out_path`, or fail.
    async fn run(&self, job: &SynthesisJob) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_value_display() {
        assert_eq!(OptionValue::Str("en_US".into()).to_string(), "en_US");
        assert_eq!(OptionValue::Int(5).to_string(), "5");
        assert_eq!(OptionValue::Float(1.25).to_string(), "1.25");
    }

    #[test]
    fn loose_equality_crosses_numeric_kinds() {
        assert!(OptionValue::Int(1).loosely_eq(&OptionValue::Float(1.0)));
        assert!(!OptionValue::Int(1).loosely_eq(&OptionValue::Float(1.5)));
        assert!(OptionValue::Str("a".into()).loosely_eq(&OptionValue::Str("a".into())));
        assert!(!OptionValue::Str("1".into()).loosely_eq(&OptionValue::Int(1)));
    }

    #[test]
    fn float_transform_accepts_numeric_strings() {
        let t = transform::float();
        assert_eq!(
            t(&OptionValue::Str(" 1.5 ".into())).unwrap(),
            OptionValue::Float(1.5)
        );
        assert!(t(&OptionValue::Str("fast".into())).is_err());
    }

    #[test]
    fn net_counter_accumulates() {
        let net = NetCounter::new();
        net.bump();
        net.add(2);
        assert_eq!(net.count(), 3);

        // clones observe the same underlying count
        let other = net.clone();
        other.bump();
        assert_eq!(net.count(), 4);
    }
}
