//! Dispatch management of interchangeable text-to-speech services.
//!
//! The router sits between a caller and the concrete service
//! implementations: it resolves a service ID to a lazily-constructed
//! backend, derives a deterministic cache path from the request,
//! guarantees at most one in-flight synthesis per path, runs backend
//! work on background workers while completions are marshaled back to
//! the controlling task, memoizes recent failures, and supports
//! ordered/random fallback across saved presets.
//!
//! ```no_run
//! use voxroute::{Callbacks, DispatchMode, Request, Router, RouterConfig, ServiceRegistry};
//!
//! # async fn demo(registry: ServiceRegistry) {
//! let config = RouterConfig::new("/var/cache/tts", "/tmp/tts");
//! let mut router = Router::new(registry, config);
//!
//! let callbacks = Callbacks::new(
//!     |path| println!("audio at {}", path.display()),
//!     |err, text| eprintln!("could not speak {text:?}: {err}"),
//! );
//! router
//!     .dispatch(
//!         Request::new("google", "hello world").option("voice", "en-US"),
//!         callbacks,
//!         DispatchMode::Background,
//!     )
//!     .await;
//! router.drain().await;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod failures;
pub mod group;
pub mod human;
pub mod interface;
pub mod pool;
pub mod registry;
pub mod router;


pub use cache::cache_path;
pub use config::RouterConfig;
pub use error::{BackendError, RouterError};
pub use failures::{FailureMemo, DEFAULT_FAILURE_TTL};
pub use group::{Group, GroupMode, Preset};
pub use interface::{
    transform, Backend, ExtraSpec, NetCounter, OptionSpec, OptionValue, OptionValues, Options,
    ServiceTrait, SynthesisJob,
};
pub use pool::WorkerPool;
pub use registry::{BackendFactory, ResolvedService, ServiceRegistry};
pub use router::{Callbacks, DispatchMode, Request, Router};
