use std::{collections::BTreeMap, sync::Arc};

use crate::{
    configuration_fetcher::ExperimentFetcher,
    configuration_store::ExperimentCache,
    eval::eval_experiment,
    events::{ConversionEvent, ExposureRecord, ExposureSnapshot},
    experiment::{Experiment, Variant},
    identity::IdentityResolver,
    poller::{PollerThread, PollerThreadConfig},
    sharder::RollingHashSharder,
    tracker::{SubscriptionId, Tracker, TrackerEvent},
    ClientConfig, Result,
};

/// The entry point for experiment assignment and tracking.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```
/// # use edge_experiments::{Client, ClientConfig};
/// let client = Client::new(ClientConfig::from_base_url("https://example.com")).unwrap();
/// ```
pub struct Client {
    fetcher: Arc<ExperimentFetcher>,
    identity: Arc<IdentityResolver>,
    tracker: Tracker,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        let source = config.build_source()?;
        let cache = Arc::new(ExperimentCache::with_clock(
            config.cache_ttl,
            config.clock.clone(),
        ));
        let fetcher = Arc::new(ExperimentFetcher::from_boxed(
            source,
            cache,
            config.fallback,
        ));

        let identity = Arc::new(IdentityResolver::new(
            config.storage.clone(),
            config.context,
        ));
        let tracker = Tracker::new(
            identity.clone(),
            config.storage,
            config.sinks,
            Box::new(config.clock),
            config.max_conversions,
        );

        Ok(Client {
            fetcher,
            identity,
            tracker,
        })
    }

    /// All experiment definitions, from the cache, the remote source, or the fallback list.
    pub fn get_experiments(&self) -> Arc<Vec<Experiment>> {
        self.fetcher.get_experiments()
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.fetcher.get_experiment(experiment_id)
    }

    /// The current visitor's id. See [`IdentityResolver::get_user_id`].
    pub fn get_user_id(&self) -> String {
        self.identity.get_user_id()
    }

    /// Get the variant assigned to the current visitor.
    ///
    /// Returns `None` when the experiment is unknown, not running, or the visitor falls outside
    /// its traffic allocation. Does not track an exposure.
    pub fn get_experiment_variant(&self, experiment_id: &str) -> Option<Variant> {
        let experiments = self.get_experiments();
        let user_id = self.get_user_id();

        eval_experiment(&experiments, experiment_id, &user_id, &RollingHashSharder).cloned()
    }

    /// Variants assigned to the current visitor in every running experiment, keyed by experiment
    /// id. Experiments the visitor is excluded from are absent. Does not track exposures.
    pub fn get_assignments(&self) -> BTreeMap<String, Variant> {
        self.fetcher.assignments(&self.get_user_id())
    }

    pub fn track_exposure(&self, experiment_id: &str, variant_id: &str) -> Option<ExposureRecord> {
        self.tracker.track_exposure(experiment_id, variant_id)
    }

    pub fn track_conversion(
        &self,
        event_name: &str,
        data: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Option<ConversionEvent> {
        self.tracker.track_conversion(event_name, data)
    }

    pub fn exposures(&self) -> ExposureSnapshot {
        self.tracker.exposures()
    }

    pub fn conversions(&self) -> Vec<ConversionEvent> {
        self.tracker.conversions()
    }

    /// Remove all tracked exposures and conversions. The visitor id is kept.
    pub fn clear_all(&self) -> Result<()> {
        self.tracker.clear_all()
    }

    /// See [`Tracker::subscribe`].
    pub fn subscribe(
        &self,
        listener: impl Fn(&TrackerEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.tracker.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.tracker.unsubscribe(id)
    }

    pub fn fetcher(&self) -> &Arc<ExperimentFetcher> {
        &self.fetcher
    }

    /// Start a poller thread that keeps the experiment cache warm.
    pub fn start_poller_thread(&self, config: PollerThreadConfig) -> Result<PollerThread> {
        PollerThread::start(self.fetcher.clone(), config)
    }
}
