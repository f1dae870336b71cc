//! Fetching experiment definitions from the edge configuration store.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    configuration_store::{CacheEntry, ExperimentCache},
    experiment::{fallback_experiments, ConfigSource, Experiment, Variant},
    sharder::RollingHashSharder,
    Error, Result,
};

/// An experiment list as returned by an [`ExperimentSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedExperiments {
    pub experiments: Vec<Experiment>,
    pub source: ConfigSource,
}

/// Something that can produce the current experiment definitions.
///
/// Implementations are allowed to fail; [`ExperimentFetcher`] takes care of degrading to the
/// static fallback list.
pub trait ExperimentSource {
    fn fetch_experiments(&self) -> Result<FetchedExperiments>;
}

impl<T: Fn() -> Result<FetchedExperiments>> ExperimentSource for T {
    fn fetch_experiments(&self) -> Result<FetchedExperiments> {
        self()
    }
}

/// `TryParse` allows a single experiment to fail parsing without failing the parsing of the whole
/// list.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

/// Body of the `GET /api/experiments` route.
#[derive(Debug, Deserialize)]
struct ExperimentsResponse {
    success: bool,
    #[serde(default)]
    source: Option<ConfigSource>,
    experiments: Vec<TryParse<Experiment>>,
}

#[derive(Debug, Clone, Copy)]
enum ResponseFormat {
    /// `{ success, source, experiments }` as served by the experiments API route.
    Envelope,
    /// A bare JSON array, as stored under an edge config item.
    Items,
}

/// Experiment source backed by an HTTP endpoint.
pub struct HttpExperimentSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    format: ResponseFormat,
}

const EXPERIMENTS_ENDPOINT: &str = "/api/experiments";

impl HttpExperimentSource {
    /// Default timeout for a single fetch.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Fetch from the experiments API route under `base_url`.
    ///
    /// ```
    /// # use edge_experiments::HttpExperimentSource;
    /// let source = HttpExperimentSource::api("https://example.com", HttpExperimentSource::DEFAULT_TIMEOUT);
    /// assert!(source.is_ok());
    /// ```
    pub fn api(base_url: &str, timeout: Duration) -> Result<HttpExperimentSource> {
        let url = Url::parse(&format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            EXPERIMENTS_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUrl)?;
        HttpExperimentSource::new(url, ResponseFormat::Envelope, timeout)
    }

    /// Fetch a bare experiment array from an edge config item URL.
    pub fn edge_config_item(item_url: &str, timeout: Duration) -> Result<HttpExperimentSource> {
        let url = Url::parse(item_url).map_err(Error::InvalidBaseUrl)?;
        HttpExperimentSource::new(url, ResponseFormat::Items, timeout)
    }

    fn new(url: Url, format: ResponseFormat, timeout: Duration) -> Result<HttpExperimentSource> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpExperimentSource {
            client,
            url,
            format,
        })
    }

    fn parse(&self, body: &[u8]) -> Result<FetchedExperiments> {
        let (experiments, source) = match self.format {
            ResponseFormat::Envelope => {
                let response: ExperimentsResponse = serde_json::from_slice(body)
                    .map_err(|err| Error::MalformedResponse(err.to_string()))?;
                if !response.success {
                    return Err(Error::MalformedResponse(
                        "response reported success: false".to_owned(),
                    ));
                }
                (
                    response.experiments,
                    response.source.unwrap_or(ConfigSource::EdgeConfig),
                )
            }
            ResponseFormat::Items => {
                let items: Vec<TryParse<Experiment>> = serde_json::from_slice(body)
                    .map_err(|err| Error::MalformedResponse(err.to_string()))?;
                (items, ConfigSource::EdgeConfig)
            }
        };

        let experiments = experiments
            .into_iter()
            .filter_map(|item| match item {
                TryParse::Parsed(experiment) => Some(experiment),
                TryParse::ParseFailed(value) => {
                    log::warn!(target: "edge_experiments",
                               experiment:serde = value;
                               "skipping experiment that failed to parse");
                    None
                }
            })
            .collect();

        Ok(FetchedExperiments {
            experiments,
            source,
        })
    }
}

impl ExperimentSource for HttpExperimentSource {
    fn fetch_experiments(&self) -> Result<FetchedExperiments> {
        log::debug!(target: "edge_experiments", url:display = self.url; "fetching experiments");
        let response = self.client.get(self.url.clone()).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status));
        }

        let body = response.bytes()?;
        self.parse(&body)
    }
}

/// Serves experiment lists out of an [`ExperimentCache`], refreshing from an [`ExperimentSource`]
/// when the cache goes stale and degrading to a static list when the source fails.
pub struct ExperimentFetcher {
    source: Box<dyn ExperimentSource + Send + Sync>,
    cache: Arc<ExperimentCache>,
    fallback: Vec<Experiment>,
}

impl ExperimentFetcher {
    /// Create a fetcher that falls back to [`fallback_experiments`].
    pub fn new(
        source: impl ExperimentSource + Send + Sync + 'static,
        cache: Arc<ExperimentCache>,
    ) -> ExperimentFetcher {
        ExperimentFetcher::with_fallback(source, cache, fallback_experiments())
    }

    pub fn with_fallback(
        source: impl ExperimentSource + Send + Sync + 'static,
        cache: Arc<ExperimentCache>,
        fallback: Vec<Experiment>,
    ) -> ExperimentFetcher {
        ExperimentFetcher::from_boxed(Box::new(source), cache, fallback)
    }

    pub(crate) fn from_boxed(
        source: Box<dyn ExperimentSource + Send + Sync>,
        cache: Arc<ExperimentCache>,
        fallback: Vec<Experiment>,
    ) -> ExperimentFetcher {
        ExperimentFetcher {
            source,
            cache,
            fallback,
        }
    }

    pub fn cache(&self) -> &Arc<ExperimentCache> {
        &self.cache
    }

    /// Get the current experiment list. Never fails.
    ///
    /// Returns the cached list while it is fresh; otherwise fetches a new one. If the fetch fails,
    /// the fallback list is returned and cached for the TTL window so that a failing source is not
    /// hammered.
    pub fn get_experiments(&self) -> Arc<Vec<Experiment>> {
        self.get_entry().experiments.clone()
    }

    /// Same as [`ExperimentFetcher::get_experiments`] but also reports where the list came from.
    pub fn get_entry(&self) -> Arc<CacheEntry> {
        match self.cache.get_fresh() {
            Some(entry) => entry,
            None => self.refresh(),
        }
    }

    /// Find an experiment by id in the current list.
    pub fn get_experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.get_experiments()
            .iter()
            .find(|experiment| experiment.id == experiment_id)
            .cloned()
    }

    /// Bucket `user_id` into every running experiment of the current list, keyed by experiment id.
    ///
    /// Experiments whose traffic allocation excludes the visitor are left out.
    pub fn assignments(&self, user_id: &str) -> BTreeMap<String, Variant> {
        let assignments: BTreeMap<String, Variant> = self
            .get_experiments()
            .iter()
            .filter(|experiment| experiment.is_running())
            .filter_map(|experiment| {
                experiment
                    .get_variant_for_user(user_id, &RollingHashSharder)
                    .map(|variant| (experiment.id.clone(), variant.clone()))
            })
            .collect();

        log::trace!(target: "edge_experiments",
                    user_id,
                    count = assignments.len();
                    "assigned running experiments");

        assignments
    }

    /// Fetch from the source unconditionally and replace the cache entry.
    pub fn refresh(&self) -> Arc<CacheEntry> {
        match self.source.fetch_experiments() {
            Ok(fetched) => {
                log::debug!(target: "edge_experiments",
                            source:display = fetched.source,
                            count = fetched.experiments.len();
                            "loaded experiments");
                self.cache.set(fetched.experiments, fetched.source)
            }
            Err(err) => {
                log::warn!(target: "edge_experiments",
                           "failed to fetch experiments, using fallback list: {:?}", err);
                self.cache
                    .set(self.fallback.clone(), ConfigSource::Fallback)
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
