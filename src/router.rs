use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::cache;
use crate::config::RouterConfig;
use crate::error::{BackendError, RouterError};
use crate::failures::FailureMemo;
use crate::group::GroupState;
use crate::human;
use crate::interface::{
    NetCounter, OptionValue, OptionValues, Options, ServiceTrait, SynthesisJob,
};
use crate::pool::{Completion, WorkerPool};
use crate::registry::{ResolvedService, ServiceRegistry};

// ── Callbacks ──────────────────────────────────────────

/// The caller's view of a dispatch outcome.
///
/// `okay` and `fail` are required by construction; `done`, `miss` and
/// `then` are optional. For any single request the delivery order is
/// always `done → miss? → okay|fail → then`, each at most once —
/// except `miss`, which a group dispatch reports once per attempted
/// preset.
pub struct Callbacks {
    pub(crate) done: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) miss: Option<Box<dyn FnMut(&str, usize) + Send>>,
    pub(crate) okay: Box<dyn FnOnce(PathBuf) + Send>,
    pub(crate) fail: Box<dyn FnOnce(RouterError, String) + Send>,
    pub(crate) then: Option<Box<dyn FnOnce() + Send>>,
}

impl Callbacks {
    pub fn new(
        okay: impl FnOnce(PathBuf) + Send + 'static,
        fail: impl FnOnce(RouterError, String) + Send + 'static,
    ) -> Self {
        Self {
            done: None,
            miss: None,
            okay: Box::new(okay),
            fail: Box::new(fail),
            then: None,
        }
    }

    /// Called before the okay/fail callback.
    pub fn on_done(mut self, done: impl FnOnce() + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    /// Called with the service ID and network-op count whenever a cache
    /// miss actually ran the service.
    pub fn on_miss(mut self, miss: impl FnMut(&str, usize) + Send + 'static) -> Self {
        self.miss = Some(Box::new(miss));
        self
    }

    /// Called after the okay/fail callback.
    pub fn on_then(mut self, then: impl FnOnce() + Send + 'static) -> Self {
        self.then = Some(Box::new(then));
        self
    }

    /// Single delivery point, so the relative callback order holds on
    /// every path through the router.
    pub(crate) fn deliver(
        mut self,
        miss: Option<(&str, usize)>,
        result: Result<PathBuf, RouterError>,
        text: &str,
    ) {
        if let Some(done) = self.done.take() {
            done();
        }
        if let Some((svc_id, count)) = miss {
            if let Some(miss) = self.miss.as_mut() {
                miss(svc_id, count);
            }
        }
        match result {
            Ok(path) => (self.okay)(path),
            Err(err) => (self.fail)(err, text.to_owned()),
        }
        if let Some(then) = self.then.take() {
            then();
        }
    }
}

// ── Requests ───────────────────────────────────────────

/// One synthesis request. Not retained after its callbacks have fired.
#[derive(Debug, Clone)]
pub struct Request {
    pub svc_id: String,
    pub text: String,
    pub options: Options,
    /// Template for a human-named copy of the cached file (see the
    /// `human` module for the token syntax).
    pub want_human: Option<String>,
    /// Field lookup context for template tokens.
    pub note: Option<HashMap<String, String>>,
}

impl Request {
    pub fn new(svc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            svc_id: svc_id.into(),
            text: text.into(),
            options: Options::new(),
            want_human: None,
            note: None,
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn want_human(mut self, template: impl Into<String>) -> Self {
        self.want_human = Some(template.into());
        self
    }

    pub fn note(mut self, note: HashMap<String, String>) -> Self {
        self.note = Some(note);
        self
    }
}

/// Whether backend work runs on a background worker (normal operation)
/// or inline on the calling task (deterministic test mode). Both funnel
/// through the same completion logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Background,
    Inline,
}

/// Where a finished call reports to: directly to caller callbacks, or
/// into a group's fallback iteration.
pub(crate) enum Reply {
    Caller(Callbacks),
    Group(u64),
}

/// A dispatched request waiting on its worker.
pub(crate) struct CallRecord {
    pub(crate) svc_id: String,
    pub(crate) name: String,
    pub(crate) text: String,
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) traits: Vec<ServiceTrait>,
    pub(crate) net: NetCounter,
    pub(crate) want_human: Option<String>,
    pub(crate) note: Option<HashMap<String, String>>,
    pub(crate) reply: Reply,
}

struct Prepared {
    resolved: ResolvedService,
    text: String,
    options: Options,
    path: PathBuf,
    cache_hit: bool,
}

// ── Router ─────────────────────────────────────────────

/// Dispatch management of available services.
///
/// Sits between callers and the service implementations: resolves a
/// service ID to a lazily-built backend, content-addresses the request
/// onto a cache path, keeps at most one synthesis in flight per path,
/// runs backend work on background workers while marshaling completion
/// back to the controlling task, and memoizes recent failures so broken
/// backends are not hammered.
///
/// All state is mutated only on the task that owns the router (the
/// controlling task), which is what lets the busy set and failure memo
/// go unlocked.
pub struct Router {
    pub(crate) registry: ServiceRegistry,
    pub(crate) config: RouterConfig,
    pub(crate) busy: HashSet<PathBuf>,
    pub(crate) failures: FailureMemo,
    pub(crate) pool: WorkerPool,
    pub(crate) pending: HashMap<u64, CallRecord>,
    pub(crate) groups: HashMap<u64, GroupState>,
    pub(crate) next_group_id: u64,
    pub(crate) rng: StdRng,
}

impl Router {
    pub fn new(registry: ServiceRegistry, config: RouterConfig) -> Self {
        let failures = FailureMemo::new(Duration::from_secs(config.failure_ttl_secs));
        Self {
            registry,
            config,
            busy: HashSet::new(),
            failures,
            pool: WorkerPool::new(),
            pending: HashMap::new(),
            groups: HashMap::new(),
            next_group_id: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the RNG used for random-mode group shuffles, making the
    /// attempt order reproducible.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.registry
    }

    /// Live remembered failures, after purging expired entries.
    pub fn failure_count(&mut self) -> usize {
        self.failures.count()
    }

    /// Delete the memo of remembered failures.
    pub fn forget_failures(&mut self) {
        self.failures.clear();
    }

    /// Whether any dispatched request is still waiting on its worker.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Dispatch one request. Never fails synchronously: every outcome,
    /// including validation problems, arrives through the callbacks.
    /// Background completions are delivered by `drain`.
    pub async fn dispatch(&mut self, request: Request, callbacks: Callbacks, mode: DispatchMode) {
        self.dispatch_reply(request, Reply::Caller(callbacks), mode)
            .await;
    }

    /// The controlling loop: consume worker completions and fire their
    /// callbacks until no request is pending.
    pub async fn drain(&mut self) {
        while self.has_pending() {
            let Some(completion) = self.pool.next().await else {
                break;
            };
            self.complete(completion).await;
        }
    }

    pub(crate) async fn dispatch_reply(&mut self, request: Request, reply: Reply, mode: DispatchMode) {
        debug!(svc_id = %request.svc_id, options = ?request.options, "dispatch call");

        let prepared = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => {
                return self.deliver(reply, None, Err(err), &request.text).await;
            }
        };
        let Prepared {
            resolved,
            text,
            options,
            path,
            cache_hit,
        } = prepared;

        debug!(
            svc_id = %resolved.svc_id,
            path = %path.display(),
            cache = if cache_hit { "hit" } else { "miss" },
            "parsed dispatch",
        );

        if cache_hit {
            let presented = self.presented(
                path,
                &resolved.svc_id,
                &text,
                &options,
                request.want_human.as_deref(),
                request.note.as_ref(),
            );
            return self.deliver(reply, None, Ok(presented), &text).await;
        }

        if let Some(err) = self.failures.check(&path) {
            return self.deliver(reply, None, Err(err), &text).await;
        }

        // nothing cached and nobody else on this path: actually run
        self.busy.insert(path.clone());
        let net = NetCounter::new();
        let record = CallRecord {
            svc_id: resolved.svc_id.clone(),
            name: resolved.name.clone(),
            text: text.clone(),
            path: path.clone(),
            options: options.clone(),
            traits: resolved.traits.clone(),
            net: net.clone(),
            want_human: request.want_human.clone(),
            note: request.note.clone(),
            reply,
        };

        let backend = resolved.backend;
        let task = async move {
            let mut job = SynthesisJob {
                text,
                options,
                out_path: path,
                prerun: None,
                net,
            };
            job.prerun = backend.prerun(&job).await?;
            backend.run(&job).await
        };

        match mode {
            DispatchMode::Background => {
                let worker_id = self.pool.spawn(task);
                self.pending.insert(worker_id, record);
            }
            DispatchMode::Inline => {
                let outcome = task.await;
                self.finish(record, outcome).await;
            }
        }
    }

    /// Resolve the service and normalize/validate everything about the
    /// request, reporting all option problems at once. Also rejects a
    /// request whose cache path is currently being synthesized.
    fn prepare(&mut self, request: &Request) -> Result<Prepared, RouterError> {
        if request.text.is_empty() {
            return Err(RouterError::Validation(
                "no speakable text is present".into(),
            ));
        }
        if request.text.chars().count() > self.config.text_limit {
            return Err(RouterError::Validation("text to speak is too long".into()));
        }

        let resolved = self.registry.resolve(&request.svc_id)?;
        let specs = self.registry.options(&resolved.svc_id)?;

        // normalize keys and drop anything the service does not know
        let mut options: Options = request
            .options
            .iter()
            .filter_map(|(key, value)| {
                let key = ServiceRegistry::normalize(key);
                specs
                    .iter()
                    .any(|spec| spec.key == key)
                    .then(|| (key, value.clone()))
            })
            .collect();

        let mut problems = Vec::new();
        for spec in specs.iter() {
            let supplied = options.get(&spec.key).cloned();
            match supplied {
                Some(raw) => match (spec.transform)(&raw) {
                    Ok(value) => match &spec.values {
                        OptionValues::Range { low, high, .. } => match value.as_f64() {
                            Some(n) if (*low..=*high).contains(&n) => {
                                options.insert(spec.key.clone(), value);
                            }
                            _ => problems.push(format!(
                                "invalid value '{raw}' for '{}' attribute (outside of {low}..{high})",
                                spec.key
                            )),
                        },
                        OptionValues::List(items) => {
                            if items.iter().any(|(candidate, _)| candidate.loosely_eq(&value)) {
                                options.insert(spec.key.clone(), value);
                            } else {
                                let choices: Vec<&str> = items
                                    .iter()
                                    .filter_map(|(v, _)| v.as_str())
                                    .collect();
                                problems.push(format!(
                                    "'{raw}' is not an option for '{}' attribute (try {})",
                                    spec.key,
                                    choices.join(", ")
                                ));
                            }
                        }
                    },
                    Err(message) => problems.push(format!(
                        "invalid value '{raw}' for '{}' attribute ({message})",
                        spec.key
                    )),
                },
                None => match &spec.default {
                    Some(default) => {
                        options.insert(spec.key.clone(), default.clone());
                    }
                    None => problems.push(format!("'{}' attribute is required", spec.key)),
                },
            }
        }

        if !problems.is_empty() {
            return Err(RouterError::Validation(format!(
                "running the '{}' ({}) service failed: {}.",
                resolved.svc_id,
                resolved.name,
                problems.join("; ")
            )));
        }

        let text = resolved.backend.modify(&request.text);
        if text.is_empty() {
            return Err(RouterError::Validation(format!(
                "text not usable by {}",
                resolved.name
            )));
        }

        let path = cache::cache_path(&self.config.cache_dir, &resolved.svc_id, &text, &options);

        // An in-flight synthesis may already have written part of its
        // output file, so the busy set must be consulted before the
        // file's existence is trusted as a cache hit.
        if self.busy.contains(&path) {
            return Err(RouterError::Busy {
                svc_id: resolved.svc_id.clone(),
                path,
            });
        }
        let cache_hit = path.exists();

        // Extras never factor into the cache path, so they are only
        // looked up when the service will actually be called.
        if !cache_hit {
            let extras = self.registry.extras(&resolved.svc_id)?;
            for extra in extras.iter() {
                match self.config.extra_value(&resolved.svc_id, &extra.key) {
                    Some(value) => {
                        options.insert(extra.key.clone(), OptionValue::Str(value));
                    }
                    None if extra.required => {
                        return Err(RouterError::Validation(format!(
                            "{} required to access {}",
                            extra.label.trim_end_matches(':'),
                            resolved.svc_id
                        )));
                    }
                    None => {}
                }
            }
        }

        Ok(Prepared {
            resolved,
            text,
            options,
            path,
            cache_hit,
        })
    }

    /// Completion handler, always on the controlling task: clear the
    /// busy marker, classify the outcome, memoize non-transient
    /// internet failures, and deliver.
    pub(crate) async fn finish(&mut self, record: CallRecord, outcome: Result<(), BackendError>) {
        let CallRecord {
            svc_id,
            name,
            text,
            path,
            options,
            traits,
            net,
            want_human,
            note,
            reply,
        } = record;

        self.busy.remove(&path);

        let result: Result<PathBuf, RouterError> = match outcome {
            Ok(()) if path.exists() => Ok(path.clone()),
            Ok(()) => Err(RouterError::Backend(BackendError::NoOutput(name))),
            Err(err) => Err(RouterError::Backend(err)),
        };

        if let Err(err) = &result {
            let memoizable = match err {
                RouterError::Backend(backend_err) => !backend_err.is_transient(),
                _ => false,
            };
            if memoizable && traits.contains(&ServiceTrait::Internet) {
                self.failures.record(path.clone(), err.clone());
            }
        }

        let result = result.map(|path| {
            self.presented(
                path,
                &svc_id,
                &text,
                &options,
                want_human.as_deref(),
                note.as_ref(),
            )
        });

        let miss = Some((svc_id, net.count()));
        self.deliver(reply, miss, result, &text).await;
    }

    pub(crate) async fn deliver(
        &mut self,
        reply: Reply,
        miss: Option<(String, usize)>,
        result: Result<PathBuf, RouterError>,
        text: &str,
    ) {
        match reply {
            Reply::Caller(callbacks) => callbacks.deliver(
                miss.as_ref().map(|(svc_id, count)| (svc_id.as_str(), *count)),
                result,
                text,
            ),
            Reply::Group(group_id) => self.group_step(group_id, miss, result).await,
        }
    }

    /// Human-named copy when requested; a failed copy falls back to the
    /// cache path rather than failing the whole request.
    fn presented(
        &self,
        path: PathBuf,
        svc_id: &str,
        text: &str,
        options: &Options,
        want_human: Option<&str>,
        note: Option<&HashMap<String, String>>,
    ) -> PathBuf {
        let Some(template) = want_human else {
            return path;
        };
        match human::humanize(
            &path,
            &self.config.temp_dir,
            template,
            svc_id,
            text,
            options,
            note,
        ) {
            Ok(human_path) => human_path,
            Err(err) => {
                warn!(error = %err, "could not write human-named copy");
                path
            }
        }
    }

    async fn complete(&mut self, completion: Completion) {
        let worker_id = completion.worker_id;
        let Some(record) = self.pending.remove(&worker_id) else {
            self.pool.mark_delivered(worker_id);
            return;
        };
        self.finish(record, completion.outcome).await;
        self.pool.mark_delivered(worker_id);
    }
}
