use std::{sync::Arc, time::Duration};

use crate::{
    clock::{Clock, SystemClock},
    configuration_fetcher::{ExperimentSource, HttpExperimentSource},
    configuration_store::ExperimentCache,
    experiment::{fallback_experiments, Experiment},
    identity::ExecutionContext,
    sink::AnalyticsSink,
    storage::{MemoryStorage, Storage},
    tracker::Tracker,
    Client, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use edge_experiments::{ClientConfig, LogSink};
/// let client = ClientConfig::from_base_url("https://example.com")
///     .sink(LogSink)
///     .sink(|event: &str, data: &serde_json::Value| {
///         println!("{event}: {data}");
///     })
///     .to_client()
///     .unwrap();
/// ```
pub struct ClientConfig {
    pub(crate) base_url: String,
    pub(crate) source: Option<Box<dyn ExperimentSource + Send + Sync>>,
    pub(crate) fallback: Vec<Experiment>,
    pub(crate) cache_ttl: Duration,
    pub(crate) fetch_timeout: Duration,
    pub(crate) storage: Arc<dyn Storage + Send + Sync>,
    pub(crate) sinks: Vec<Box<dyn AnalyticsSink + Send + Sync>>,
    pub(crate) context: ExecutionContext,
    pub(crate) max_conversions: usize,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
}

impl ClientConfig {
    /// Create a default configuration fetching experiments from the API routes under `base_url`.
    ///
    /// ```
    /// # use edge_experiments::ClientConfig;
    /// ClientConfig::from_base_url("https://example.com");
    /// ```
    pub fn from_base_url(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            source: None,
            fallback: fallback_experiments(),
            cache_ttl: ExperimentCache::DEFAULT_TTL,
            fetch_timeout: HttpExperimentSource::DEFAULT_TIMEOUT,
            storage: Arc::new(MemoryStorage::new()),
            sinks: Vec::new(),
            context: ExecutionContext::Client,
            max_conversions: Tracker::DEFAULT_MAX_CONVERSIONS,
            clock: Arc::new(SystemClock),
        }
    }

    /// Fetch experiments from `source` instead of the HTTP API.
    pub fn experiment_source(mut self, source: impl ExperimentSource + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the static list served when fetching fails.
    pub fn fallback_experiments(mut self, fallback: Vec<Experiment>) -> Self {
        self.fallback = fallback;
        self
    }

    /// How long a fetched experiment list is served before fetching again. Defaults to 5 minutes.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Timeout for a single fetch of the experiment list. Defaults to 5 seconds.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Visitor-local storage for identity, exposures, and conversions. Defaults to
    /// [`MemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn Storage + Send + Sync>) -> Self {
        self.storage = storage;
        self
    }

    /// Register an analytics sink. Sinks receive events in registration order.
    pub fn sink(mut self, sink: impl AnalyticsSink + Send + Sync + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn execution_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Maximum number of conversion events kept in storage. Defaults to
    /// [`Tracker::DEFAULT_MAX_CONVERSIONS`].
    pub fn max_conversions(mut self, max_conversions: usize) -> Self {
        self.max_conversions = max_conversions;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// # Errors
    ///
    /// Fails if the base URL cannot be parsed or the HTTP client cannot be created.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    pub(crate) fn build_source(
        &mut self,
    ) -> Result<Box<dyn ExperimentSource + Send + Sync>> {
        match self.source.take() {
            Some(source) => Ok(source),
            None => Ok(Box::new(HttpExperimentSource::api(
                &self.base_url,
                self.fetch_timeout,
            )?)),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use crate::{configuration_fetcher::FetchedExperiments, experiment::ConfigSource};

        ClientConfig::from_base_url("http://localhost").experiment_source(|| -> Result<_> {
            Ok(FetchedExperiments {
                experiments: fallback_experiments(),
                source: ConfigSource::EdgeConfig,
            })
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::from_base_url("http://localhost:3000")
    }
}
