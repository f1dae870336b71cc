//! Deterministic A/B experiment assignment with exposure and conversion tracking.
//!
//! # Overview
//!
//! Experiment definitions live in a remote ("edge") configuration store. The [`Client`] fetches
//! them through an [`ExperimentSource`], caches them for a few minutes, and falls back to a static
//! list whenever the store is unreachable. Visitors are identified by a random id persisted in
//! [`Storage`], and bucketed into variants by hashing that id together with the experiment id, so
//! the same visitor always sees the same variant without any server-side state.
//!
//! Exposures and conversions are recorded by the [`Tracker`]: each conversion carries a snapshot
//! of every experiment the visitor was exposed to, and every event is forwarded to the registered
//! [`AnalyticsSink`]s. [`ExperimentHook`] packages assignment, exposure tracking, and
//! configuration defaults for presentation code.
//!
//! The [`ingress`] module implements the server side of the analytics routes, and the
//! `edge-experiments-server` binary (feature `server`) serves it over HTTP.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! The experiment system is an enhancement layer and must never break the page it runs on. Fetch
//! failures degrade to the fallback list, visitors outside an experiment get `None`, and tracking
//! failures are logged and swallowed. Errors are only returned where the caller needs a
//! confirmation, such as [`Client::clear_all`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the
//! `edge_experiments` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into fetches and assignments.
//!
//! # Examples
//!
//! ```
//! # use edge_experiments::{ClientConfig, ExperimentHook};
//! let client = ClientConfig::from_base_url("http://127.0.0.1:1")
//!     .to_client()
//!     .unwrap();
//!
//! let mut hook = ExperimentHook::new("hero-cta-test", serde_json::Map::new());
//! hook.resolve(&client);
//! if hook.is_in_experiment() {
//!     hook.track_conversion(&client, Some("resume_download"), None);
//! }
//! ```
//!
//! A runnable demo lives in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod clock;
mod config;
mod configuration_fetcher;
mod configuration_store;
mod error;
mod eval;
mod events;
mod experiment;
mod hook;
mod identity;
pub mod ingress;
mod poller;
mod sharder;
mod sink;
mod storage;
mod tracker;

pub use client::Client;
pub use clock::{Clock, SystemClock};
pub use config::ClientConfig;
pub use configuration_fetcher::{
    ExperimentFetcher, ExperimentSource, FetchedExperiments, HttpExperimentSource,
};
pub use configuration_store::{CacheEntry, ExperimentCache};
pub use error::{Error, Result};
pub use eval::eval_experiment;
pub use events::{ConversionEvent, ExposureRecord, ExposureSnapshot, EXPOSURE_EVENT};
pub use experiment::{
    fallback_experiments, ConfigSource, Experiment, ExperimentStatus, Variant, VariantConfig,
    WEIGHT_TOLERANCE,
};
pub use hook::{merge_config, ExperimentHook, CONTROL_VARIANT_ID};
pub use identity::{ExecutionContext, IdentityResolver, SERVER_USER_ID, USER_ID_KEY};
pub use poller::{PollerThread, PollerThreadConfig};
pub use sharder::{RollingHashSharder, Sharder};
pub use sink::{AnalyticsSink, HttpSink, LogSink};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tracker::{SubscriptionId, Tracker, TrackerEvent, CONVERSIONS_KEY, EXPOSURES_KEY};
