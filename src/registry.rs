use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::interface::{Backend, ExtraSpec, OptionSpec, OptionValues, ServiceTrait};

/// Option keys that collide with the playback-tag syntax and may never
/// be used by a service.
const RESERVED_KEYS: &[&str] = &["group", "preset", "service", "style"];

/// Constructs a backend instance on first use. Construction may hit the
/// filesystem or probe for binaries, which is why it is deferred.
pub type BackendFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn Backend>> + Send + Sync>;

enum BackendState {
    /// Not constructed yet.
    Pending(BackendFactory),
    Ready(Arc<dyn Backend>),
    /// Construction failed once; permanent for this process run.
    Unavailable(String),
}

struct ServiceEntry {
    name: String,
    traits: Vec<ServiceTrait>,
    state: BackendState,
    options: Option<Arc<[OptionSpec]>>,
    extras: Option<Arc<[ExtraSpec]>>,
    desc: Option<String>,
}

impl ServiceEntry {
    fn load(&mut self) {
        if !matches!(self.state, BackendState::Pending(_)) {
            return;
        }

        info!(service = %self.name, "initializing service");
        let state = std::mem::replace(
            &mut self.state,
            BackendState::Unavailable("initialization interrupted".into()),
        );
        let BackendState::Pending(factory) = state else {
            return;
        };

        self.state = match factory() {
            Ok(backend) => {
                info!(service = %self.name, "service initialized");
                BackendState::Ready(backend)
            }
            Err(err) => {
                warn!(service = %self.name, error = %err, "service initialization failed");
                BackendState::Unavailable(err.to_string())
            }
        };
    }
}

/// A successfully resolved service, ready to be dispatched to.
#[derive(Clone)]
pub struct ResolvedService {
    pub svc_id: String,
    pub name: String,
    pub traits: Vec<ServiceTrait>,
    pub backend: Arc<dyn Backend>,
}

impl ResolvedService {
    pub fn has_trait(&self, t: ServiceTrait) -> bool {
        self.traits.contains(&t)
    }
}

// manual impl: the backend trait object has no Debug bound
impl fmt::Debug for ResolvedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedService")
            .field("svc_id", &self.svc_id)
            .field("name", &self.name)
            .field("traits", &self.traits)
            .finish_non_exhaustive()
    }
}

/// Lookup and lazy construction of concrete service backends.
///
/// Sitting between callers and the service implementations lets
/// backends load lazily and their option schemas be built once,
/// transparently to both sides. Owned by the application context;
/// no global state.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceEntry>,
    aliases: HashMap<String, String>,
    dead: HashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce a service ID or option key to lowercase ASCII
    /// alphanumerics, the canonical form used everywhere internally.
    pub fn normalize(raw: &str) -> String {
        raw.chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    /// Register a service under its canonical ID. The backend is not
    /// constructed until first resolved.
    pub fn register(
        &mut self,
        svc_id: &str,
        name: &str,
        traits: &[ServiceTrait],
        factory: BackendFactory,
    ) {
        let key = Self::normalize(svc_id);
        let name = if name.is_empty() { key.clone() } else { name.to_owned() };
        self.services.insert(
            key,
            ServiceEntry {
                name,
                traits: traits.to_vec(),
                state: BackendState::Pending(factory),
                options: None,
                extras: None,
                desc: None,
            },
        );
    }

    /// Map an alternate service ID onto an official one.
    pub fn register_alias(&mut self, from: &str, to: &str) {
        self.aliases
            .insert(Self::normalize(from), Self::normalize(to));
    }

    /// Record a retired service ID together with the message shown to
    /// anyone who still asks for it.
    pub fn register_dead(&mut self, svc_id: &str, message: &str) {
        self.dead
            .insert(Self::normalize(svc_id), message.to_owned());
    }

    /// Resolve a service ID (following aliases) to a ready backend,
    /// constructing it on first use.
    pub fn resolve(&mut self, raw: &str) -> Result<ResolvedService, RouterError> {
        let (key, entry) = self.entry_mut(raw)?;
        entry.load();

        match &entry.state {
            BackendState::Ready(backend) => Ok(ResolvedService {
                svc_id: key,
                name: entry.name.clone(),
                traits: entry.traits.clone(),
                backend: Arc::clone(backend),
            }),
            _ => Err(RouterError::Validation(format!(
                "the {} service is not currently available",
                entry.name
            ))),
        }
    }

    /// The validated option schema for a service, built once and cached.
    pub fn options(&mut self, raw: &str) -> Result<Arc<[OptionSpec]>, RouterError> {
        let resolved = self.resolve(raw)?;
        let (_, entry) = self.entry_mut(&resolved.svc_id)?;

        if let Some(specs) = &entry.options {
            return Ok(Arc::clone(specs));
        }

        debug!(service = %entry.name, "building the options list");
        let built: Arc<[OptionSpec]> =
            validate_option_specs(&resolved.svc_id, resolved.backend.options()).into();
        entry.options = Some(Arc::clone(&built));
        Ok(built)
    }

    /// The validated extras schema for a service, built once and cached.
    pub fn extras(&mut self, raw: &str) -> Result<Arc<[ExtraSpec]>, RouterError> {
        let resolved = self.resolve(raw)?;
        let (_, entry) = self.entry_mut(&resolved.svc_id)?;

        if let Some(specs) = &entry.extras {
            return Ok(Arc::clone(specs));
        }

        debug!(service = %entry.name, "building the extras list");
        let built: Arc<[ExtraSpec]> =
            validate_extra_specs(&resolved.svc_id, resolved.backend.extras()).into();
        entry.extras = Some(Arc::clone(&built));
        Ok(built)
    }

    /// The service's self-description, fetched once and cached.
    pub fn describe(&mut self, raw: &str) -> Result<String, RouterError> {
        let resolved = self.resolve(raw)?;
        let (_, entry) = self.entry_mut(&resolved.svc_id)?;

        if let Some(desc) = &entry.desc {
            return Ok(desc.clone());
        }

        debug!(service = %entry.name, "retrieving the description");
        let desc = resolved.backend.describe();
        entry.desc = Some(desc.clone());
        Ok(desc)
    }

    /// Display names of all registered services advertising a trait,
    /// sorted case-insensitively.
    pub fn by_trait(&self, t: ServiceTrait) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .values()
            .filter(|entry| entry.traits.contains(&t))
            .map(|entry| entry.name.clone())
            .collect();
        names.sort_by_key(|name| name.to_lowercase());
        names
    }

    /// Whether a service has a trait; `None` when the service does not
    /// exist at all.
    pub fn has_trait(&self, raw: &str, t: ServiceTrait) -> Option<bool> {
        let key = self.follow_aliases(raw);
        self.services
            .get(&key)
            .map(|entry| entry.traits.contains(&t))
    }

    /// Every service that can actually be constructed, as
    /// `(svc_id, display name)` sorted by name. Forces lazy
    /// initialization of anything still pending.
    pub fn list(&mut self) -> Vec<(String, String)> {
        debug!("building the list of services");
        let mut avail: Vec<(String, String)> = self
            .services
            .iter_mut()
            .filter_map(|(key, entry)| {
                entry.load();
                match entry.state {
                    BackendState::Ready(_) => Some((key.clone(), entry.name.clone())),
                    _ => None,
                }
            })
            .collect();
        avail.sort_by_key(|(_, name)| name.to_lowercase());
        avail
    }

    /// Human message for a service ID that cannot be used, preferring
    /// the dead-service explanation when one was registered.
    pub fn unavailable_message(&self, raw: &str) -> String {
        let key = self.follow_aliases(raw);
        self.dead
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("'{raw}' service is not available."))
    }

    fn follow_aliases(&self, raw: &str) -> String {
        let key = Self::normalize(raw);
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    fn entry_mut(&mut self, raw: &str) -> Result<(String, &mut ServiceEntry), RouterError> {
        let key = self.follow_aliases(raw);
        if !self.services.contains_key(&key) {
            return Err(RouterError::Validation(match self.dead.get(&key) {
                Some(message) => message.clone(),
                None => format!("there is no '{key}' service"),
            }));
        }
        // the lookup cannot fail after the check above
        let Some(entry) = self.services.get_mut(&key) else {
            return Err(RouterError::Validation(format!("there is no '{key}' service")));
        };
        Ok((key, entry))
    }
}

/// Schema checks for option specs. Malformed specs are programmer
/// errors in the service implementation, so they fail loudly at build
/// time rather than surfacing at call time.
fn validate_option_specs(svc_id: &str, specs: Vec<OptionSpec>) -> Vec<OptionSpec> {
    specs
        .into_iter()
        .map(|mut spec| {
            assert!(
                !spec.key.is_empty() && ServiceRegistry::normalize(&spec.key) == spec.key,
                "bad {svc_id} option key '{}'",
                spec.key
            );
            assert!(
                !RESERVED_KEYS.contains(&spec.key.as_str()),
                "'{}' is reserved for use in playback tags",
                spec.key
            );
            assert!(
                !spec.label.is_empty(),
                "missing '{}' label for {svc_id}",
                spec.key
            );
            match &spec.values {
                OptionValues::List(items) => assert!(
                    !items.is_empty(),
                    "empty '{}' value list for {svc_id}",
                    spec.key
                ),
                OptionValues::Range { low, high, .. } => assert!(
                    low <= high,
                    "inverted '{}' value range for {svc_id}",
                    spec.key
                ),
            }

            if !spec.label.ends_with(':') {
                spec.label.push(':');
            }

            if let (Some(default), OptionValues::List(items)) = (&spec.default, &mut spec.values) {
                if items.len() > 1 {
                    for (value, label) in items.iter_mut() {
                        if value.loosely_eq(default) {
                            label.push_str(" [default]");
                        }
                    }
                }
            }

            spec
        })
        .collect()
}

fn validate_extra_specs(svc_id: &str, specs: Vec<ExtraSpec>) -> Vec<ExtraSpec> {
    specs
        .into_iter()
        .map(|mut spec| {
            assert!(
                !spec.key.is_empty() && ServiceRegistry::normalize(&spec.key) == spec.key,
                "bad {svc_id} extra key '{}'",
                spec.key
            );
            assert!(
                !spec.label.is_empty(),
                "missing '{}' label for {svc_id}",
                spec.key
            );
            if !spec.label.ends_with(':') {
                spec.label.push(':');
            }
            spec
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{transform, OptionValue, SynthesisJob};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        option_builds: Arc<AtomicUsize>,
        reserved_key: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn describe(&self) -> String {
            "A fake service for registry tests".into()
        }

        fn options(&self) -> Vec<OptionSpec> {
            self.option_builds.fetch_add(1, Ordering::SeqCst);
            let key = if self.reserved_key { "preset" } else { "voice" };
            vec![
                OptionSpec::new(
                    key,
                    "Voice",
                    OptionValues::List(vec![
                        (OptionValue::from("en"), "English".into()),
                        (OptionValue::from("fr"), "French".into()),
                    ]),
                    transform::trimmed(),
                )
                .with_default("en"),
                OptionSpec::new(
                    "speed",
                    "Speed:",
                    OptionValues::Range {
                        low: 0.5,
                        high: 2.0,
                        unit: Some("×".into()),
                    },
                    transform::float(),
                ),
            ]
        }

        fn extras(&self) -> Vec<ExtraSpec> {
            vec![ExtraSpec::new("apikey", "API Key").required()]
        }

        async fn run(&self, _job: &SynthesisJob) -> Result<(), crate::error::BackendError> {
            Ok(())
        }
    }

    fn registry_with(
        svc_id: &str,
        name: &str,
        traits: &[ServiceTrait],
        fails: bool,
        reserved_key: bool,
    ) -> (ServiceRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let mut registry = ServiceRegistry::new();
        let constructions = Arc::new(AtomicUsize::new(0));
        let option_builds = Arc::new(AtomicUsize::new(0));

        let constructions_in = Arc::clone(&constructions);
        let option_builds_in = Arc::clone(&option_builds);
        registry.register(
            svc_id,
            name,
            traits,
            Box::new(move || {
                constructions_in.fetch_add(1, Ordering::SeqCst);
                if fails {
                    anyhow::bail!("missing system dependency");
                }
                Ok(Arc::new(FakeBackend {
                    option_builds: Arc::clone(&option_builds_in),
                    reserved_key,
                }) as Arc<dyn Backend>)
            }),
        );

        (registry, constructions, option_builds)
    }

    #[test]
    fn normalize_strips_to_lowercase_alphanumerics() {
        assert_eq!(ServiceRegistry::normalize("Google TTS!"), "googletts");
        assert_eq!(ServiceRegistry::normalize("naver_clova-premium"), "naverclovapremium");
        assert_eq!(ServiceRegistry::normalize("éspeak"), "speak");
    }

    #[test]
    fn resolve_constructs_lazily_and_only_once() {
        let (mut registry, constructions, _) =
            registry_with("fake", "Fake", &[ServiceTrait::Internet], false, false);
        assert_eq!(constructions.load(Ordering::SeqCst), 0);

        registry.resolve("fake").unwrap();
        registry.resolve("FAKE").unwrap();
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aliases_resolve_to_the_official_id() {
        let (mut registry, _, _) = registry_with("fake", "Fake", &[], false, false);
        registry.register_alias("phony", "fake");

        let resolved = registry.resolve("Phony").unwrap();
        assert_eq!(resolved.svc_id, "fake");
    }

    #[test]
    fn resolved_services_are_debug_printable() {
        let (mut registry, _, _) =
            registry_with("fake", "Fake", &[ServiceTrait::Internet], false, false);
        let resolved = registry.resolve("fake").unwrap();
        let rendered = format!("{resolved:?}");
        assert!(rendered.contains("\"fake\""), "got {rendered}");
        assert!(rendered.contains("Internet"), "got {rendered}");
    }

    #[test]
    fn unknown_services_fail_with_a_message() {
        let (mut registry, _, _) = registry_with("fake", "Fake", &[], false, false);
        let err = registry.resolve("ghost").unwrap_err();
        assert!(err.to_string().contains("there is no 'ghost' service"));
    }

    #[test]
    fn dead_services_report_their_epitaph() {
        let mut registry = ServiceRegistry::new();
        registry.register_dead("ttsapicom", "tts-api.com has gone offline");

        let err = match registry.resolve("tts-api.com") {
            Err(err) => err,
            Ok(_) => panic!("dead service resolved"),
        };
        assert_eq!(err.to_string(), "tts-api.com has gone offline");
        assert_eq!(
            registry.unavailable_message("tts-api.com"),
            "tts-api.com has gone offline"
        );
    }

    #[test]
    fn failed_construction_is_permanent_for_the_process() {
        let (mut registry, constructions, _) =
            registry_with("fake", "Fake", &[], true, false);

        assert!(registry.resolve("fake").is_err());
        let err = registry.resolve("fake").unwrap_err();
        assert!(err.to_string().contains("not currently available"));
        // the factory is never retried
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn options_build_once_with_labels_and_defaults_merged() {
        let (mut registry, _, option_builds) =
            registry_with("fake", "Fake", &[], false, false);

        let specs = registry.options("fake").unwrap();
        let again = registry.options("fake").unwrap();
        assert_eq!(option_builds.load(Ordering::SeqCst), 1);
        assert_eq!(specs.len(), again.len());

        let voice = &specs[0];
        assert_eq!(voice.label, "Voice:");
        let OptionValues::List(items) = &voice.values else {
            panic!("voice should be a list");
        };
        assert_eq!(items[0].1, "English [default]");
        assert_eq!(items[1].1, "French");

        // label already ending in ':' is left alone
        assert_eq!(specs[1].label, "Speed:");
    }

    #[test]
    fn extras_get_trailing_colons() {
        let (mut registry, _, _) = registry_with("fake", "Fake", &[], false, false);
        let extras = registry.extras("fake").unwrap();
        assert_eq!(extras[0].label, "API Key:");
        assert!(extras[0].required);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn reserved_option_keys_fail_loudly() {
        let (mut registry, _, _) = registry_with("fake", "Fake", &[], false, true);
        let _ = registry.options("fake");
    }

    #[test]
    fn by_trait_sorts_case_insensitively() {
        let mut registry = ServiceRegistry::new();
        for (id, name) in [("b", "baidu"), ("a", "Amazon"), ("z", "azure")] {
            registry.register(
                id,
                name,
                &[ServiceTrait::Internet],
                Box::new(|| anyhow::bail!("never constructed")),
            );
        }
        registry.register("local", "eSpeak", &[ServiceTrait::Transcoding], Box::new(|| {
            anyhow::bail!("never constructed")
        }));

        assert_eq!(
            registry.by_trait(ServiceTrait::Internet),
            vec!["Amazon", "azure", "baidu"]
        );
        assert_eq!(registry.by_trait(ServiceTrait::Dictionary), Vec::<String>::new());
    }

    #[test]
    fn has_trait_distinguishes_missing_services() {
        let (mut registry, _, _) =
            registry_with("fake", "Fake", &[ServiceTrait::Internet], false, false);
        registry.register_alias("phony", "fake");

        assert_eq!(registry.has_trait("fake", ServiceTrait::Internet), Some(true));
        assert_eq!(registry.has_trait("phony", ServiceTrait::Dictionary), Some(false));
        assert_eq!(registry.has_trait("ghost", ServiceTrait::Internet), None);
    }

    #[test]
    fn list_skips_unconstructible_services() {
        let (mut registry, _, _) = registry_with("ok", "Zeta", &[], false, false);
        let broken_builds = Arc::new(AtomicUsize::new(0));
        let broken_in = Arc::clone(&broken_builds);
        registry.register(
            "broken",
            "Alpha",
            &[],
            Box::new(move || {
                broken_in.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }),
        );

        let avail = registry.list();
        assert_eq!(avail, vec![("ok".to_string(), "Zeta".to_string())]);
        assert_eq!(broken_builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn describe_is_cached() {
        let (mut registry, _, _) = registry_with("fake", "Fake", &[], false, false);
        let desc = registry.describe("fake").unwrap();
        assert!(desc.contains("fake service") || desc.contains("registry tests"));
        assert_eq!(registry.describe("fake").unwrap(), desc);
    }
}
