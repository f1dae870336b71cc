//! Server side of the analytics and experiment routes.
//!
//! [`AnalyticsIngress`] holds framework-independent handlers: each takes the raw request body and
//! returns a status code with a JSON body, so any HTTP server can mount them. The
//! `edge-experiments-server` binary mounts them on axum.
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::{
    clock::{Clock, SystemClock},
    configuration_fetcher::ExperimentFetcher,
    events::EXPOSURE_EVENT,
};

mod event_store;
mod stats;

pub use event_store::{EventStore, StoredEvent};
pub use stats::{compute_stats, significance, Significance, VariantStats};

/// Status code and JSON body produced by a handler.
pub type Response = (StatusCode, Value);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExposureBody {
    experiment_id: Option<String>,
    variant_id: Option<String>,
    user_id: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributedExposure {
    variant_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionBody {
    #[serde(alias = "event")]
    event_name: Option<String>,
    data: Option<serde_json::Map<String, Value>>,
    user_id: Option<String>,
    timestamp: Option<i64>,
    experiments: Option<BTreeMap<String, AttributedExposure>>,
}

#[derive(Debug, Deserialize)]
struct TrackBody {
    event: Option<String>,
    data: Option<serde_json::Map<String, Value>>,
}

/// Handlers for the experiment and analytics routes, backed by an [`EventStore`].
pub struct AnalyticsIngress {
    fetcher: Arc<ExperimentFetcher>,
    store: EventStore,
    clock: Box<dyn Clock + Send + Sync>,
}

impl AnalyticsIngress {
    pub fn new(fetcher: Arc<ExperimentFetcher>, store: EventStore) -> AnalyticsIngress {
        AnalyticsIngress {
            fetcher,
            store,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> AnalyticsIngress {
        self.clock = Box::new(clock);
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// `GET /api/experiments`
    pub fn experiments(&self) -> Response {
        let entry = self.fetcher.get_entry();
        (
            StatusCode::OK,
            json!({
                "success": true,
                "source": entry.source,
                "experiments": *entry.experiments,
            }),
        )
    }

    /// `GET /api/experiments/:id`
    pub fn experiment(&self, experiment_id: &str) -> Response {
        let entry = self.fetcher.get_entry();
        match entry.experiments.iter().find(|it| it.id == experiment_id) {
            Some(experiment) => (
                StatusCode::OK,
                json!({
                    "success": true,
                    "experiment": experiment,
                    "source": entry.source,
                }),
            ),
            None => error(StatusCode::NOT_FOUND, "Experiment not found"),
        }
    }

    /// `GET /api/assignments`
    ///
    /// Buckets a visitor into every running experiment. A request without a visitor id gets a
    /// fresh one, returned as `userId` so the caller can persist it.
    pub fn assignments(&self, user_id: Option<&str>) -> Response {
        let user_id = match user_id.filter(|it| !it.is_empty()) {
            Some(user_id) => user_id.to_owned(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let assignments: BTreeMap<String, String> = self
            .fetcher
            .assignments(&user_id)
            .into_iter()
            .map(|(experiment_id, variant)| (experiment_id, variant.id))
            .collect();

        (
            StatusCode::OK,
            json!({
                "success": true,
                "userId": user_id,
                "assignments": assignments,
            }),
        )
    }

    /// `POST /api/analytics/exposure`
    pub fn exposure(&self, body: &[u8]) -> Response {
        let body: ExposureBody = match parse(body) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let (Some(experiment_id), Some(variant_id), Some(user_id)) = (
            non_empty(body.experiment_id),
            non_empty(body.variant_id),
            non_empty(body.user_id),
        ) else {
            return error(StatusCode::BAD_REQUEST, "Missing required fields");
        };

        log::debug!(target: "edge_experiments",
                    experiment_id:display = experiment_id,
                    variant_id:display = variant_id;
                    "received exposure");

        self.store_events(vec![StoredEvent {
            experiment_id,
            variant_id,
            event_type: EXPOSURE_EVENT.to_owned(),
            user_id,
            timestamp: self.timestamp(body.timestamp),
            data: None,
        }])
    }

    /// `POST /api/analytics/conversion`
    ///
    /// Stores one event per experiment in the attribution snapshot. Without a snapshot, falls back
    /// to `experimentId`/`variantId` in the event data.
    pub fn conversion(&self, body: &[u8]) -> Response {
        let body: ConversionBody = match parse(body) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let (Some(event_name), Some(user_id)) =
            (non_empty(body.event_name), non_empty(body.user_id))
        else {
            return error(StatusCode::BAD_REQUEST, "Missing required fields");
        };

        let mut attributions: Vec<(String, String)> = body
            .experiments
            .unwrap_or_default()
            .into_iter()
            .map(|(experiment_id, exposure)| (experiment_id, exposure.variant_id))
            .collect();
        if attributions.is_empty() {
            if let Some(tags) = body.data.as_ref().and_then(experiment_tags) {
                attributions.push(tags);
            }
        }

        log::debug!(target: "edge_experiments",
                    event_name:display = event_name,
                    attributed = attributions.len();
                    "received conversion");

        let timestamp = self.timestamp(body.timestamp);
        let events = attributions
            .into_iter()
            .map(|(experiment_id, variant_id)| StoredEvent {
                experiment_id,
                variant_id,
                event_type: event_name.clone(),
                user_id: user_id.clone(),
                timestamp,
                data: body.data.clone(),
            })
            .collect();

        self.store_events(events)
    }

    /// `POST /api/analytics/track`
    ///
    /// `user_id` comes from the `x-user-id` header; without it a throwaway id is generated.
    /// Events whose data does not carry `experimentId` and `variantId` are acknowledged but not
    /// stored.
    pub fn track(&self, body: &[u8], user_id: Option<&str>) -> Response {
        let body: TrackBody = match parse(body) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(event) = non_empty(body.event) else {
            return error(StatusCode::BAD_REQUEST, "Missing required fields");
        };

        let mut data = body.data.unwrap_or_default();
        let Some((experiment_id, variant_id)) = experiment_tags(&data) else {
            log::debug!(target: "edge_experiments", event:display = event; "non-experiment event tracked");
            return (StatusCode::OK, json!({ "success": true }));
        };
        data.remove("experimentId");
        data.remove("variantId");

        let timestamp = self.clock.now();
        let user_id = match user_id.filter(|it| !it.is_empty()) {
            Some(user_id) => user_id.to_owned(),
            None => format!("user-{}", timestamp.timestamp_millis()),
        };

        let event = StoredEvent {
            experiment_id,
            variant_id,
            event_type: event,
            user_id,
            timestamp,
            data: Some(data),
        };
        if let Err(err) = self.store.add(event.clone()) {
            log::warn!(target: "edge_experiments", "failed to store tracked event: {:?}", err);
            return error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to track event");
        }

        (
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Conversion tracked and saved",
                "event": event,
            }),
        )
    }

    /// `GET /api/analytics/conversion`
    pub fn stats(&self) -> Response {
        let events = self.store.events();
        let stats = compute_stats(&events);
        (
            StatusCode::OK,
            json!({
                "success": true,
                "totalEvents": events.len(),
                "stats": stats,
                "events": events,
            }),
        )
    }

    /// `DELETE /api/analytics/conversion`
    pub fn clear(&self) -> Response {
        match self.store.clear() {
            Ok(()) => {
                log::info!(target: "edge_experiments", "cleared analytics data");
                (
                    StatusCode::OK,
                    json!({
                        "success": true,
                        "message": "All analytics data cleared",
                    }),
                )
            }
            Err(err) => {
                log::warn!(target: "edge_experiments", "failed to clear analytics data: {:?}", err);
                error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to clear analytics data",
                )
            }
        }
    }

    fn store_events(&self, events: Vec<StoredEvent>) -> Response {
        for event in events {
            if let Err(err) = self.store.add(event) {
                log::warn!(target: "edge_experiments", "failed to store event: {:?}", err);
                return error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        }
        (StatusCode::OK, json!({ "success": true }))
    }

    fn timestamp(&self, millis: Option<i64>) -> DateTime<Utc> {
        millis
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(|| self.clock.now())
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| {
        log::debug!(target: "edge_experiments", "rejecting request body: {:?}", err);
        error(StatusCode::BAD_REQUEST, "Invalid request body")
    })
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, json!({ "error": message }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|it| !it.is_empty())
}

/// `experimentId` and `variantId` string fields of an event's data.
fn experiment_tags(data: &serde_json::Map<String, Value>) -> Option<(String, String)> {
    let experiment_id = data.get("experimentId")?.as_str().filter(|it| !it.is_empty())?;
    let variant_id = data.get("variantId")?.as_str().filter(|it| !it.is_empty())?;
    Some((experiment_id.to_owned(), variant_id.to_owned()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::StatusCode;
    use serde_json::json;

    use super::{AnalyticsIngress, EventStore};
    use crate::{
        clock::test_clock::ManualClock,
        configuration_fetcher::{ExperimentFetcher, FetchedExperiments},
        configuration_store::ExperimentCache,
        events::EXPOSURE_EVENT,
        experiment::{fallback_experiments, ConfigSource},
        Error, Result,
    };

    fn ingress_with(store: EventStore) -> AnalyticsIngress {
        let fetcher = ExperimentFetcher::new(
            || -> Result<FetchedExperiments> {
                Ok(FetchedExperiments {
                    experiments: fallback_experiments(),
                    source: ConfigSource::EdgeConfig,
                })
            },
            Arc::new(ExperimentCache::new()),
        );
        AnalyticsIngress::new(Arc::new(fetcher), store).with_clock(ManualClock::new())
    }

    fn ingress() -> AnalyticsIngress {
        ingress_with(EventStore::in_memory())
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn lists_experiments_with_source() {
        let (status, response) = ingress().experiments();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["success"], json!(true));
        assert_eq!(response["source"], json!("edge-config"));
        assert_eq!(response["experiments"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn lists_fallback_when_source_fails() {
        let fetcher = ExperimentFetcher::new(
            || -> Result<FetchedExperiments> { Err(Error::MalformedResponse("down".to_owned())) },
            Arc::new(ExperimentCache::new()),
        );
        let ingress = AnalyticsIngress::new(Arc::new(fetcher), EventStore::in_memory());

        let (status, response) = ingress.experiments();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["source"], json!("fallback"));
    }

    #[test]
    fn finds_single_experiment() {
        let ingress = ingress();

        let (status, response) = ingress.experiment("hero-cta-test");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["experiment"]["id"], json!("hero-cta-test"));
        assert_eq!(response["source"], json!("edge-config"));

        let (status, response) = ingress.experiment("missing");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(response, json!({"error": "Experiment not found"}));
    }

    #[test]
    fn stores_exposure() {
        let ingress = ingress();

        let (status, response) = ingress.exposure(&body(json!({
            "experimentId": "hero-cta-test",
            "variantId": "variant-a",
            "userId": "visitor-1",
            "timestamp": 1_700_000_000_000i64,
        })));

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response, json!({"success": true}));
        let events = ingress.store().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EXPOSURE_EVENT);
        assert_eq!(events[0].timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn rejects_incomplete_exposure() {
        let ingress = ingress();

        let (status, response) = ingress.exposure(&body(json!({
            "experimentId": "hero-cta-test",
            "variantId": "",
            "userId": "visitor-1",
        })));

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, json!({"error": "Missing required fields"}));
        assert!(ingress.store().is_empty());
    }

    #[test]
    fn rejects_malformed_bodies() {
        let ingress = ingress();

        for response in [
            ingress.exposure(b"{not json"),
            ingress.conversion(b""),
            ingress.track(b"[1, 2", None),
        ] {
            assert_eq!(response.0, StatusCode::BAD_REQUEST);
            assert_eq!(response.1, json!({"error": "Invalid request body"}));
        }
    }

    #[test]
    fn attributes_conversion_to_snapshot() {
        let ingress = ingress();

        let (status, _) = ingress.conversion(&body(json!({
            "eventName": "resume_download",
            "userId": "visitor-1",
            "timestamp": 1_700_000_000_000i64,
            "experiments": {
                "hero-cta-test": {
                    "experimentId": "hero-cta-test",
                    "variantId": "variant-a",
                    "userId": "visitor-1",
                    "timestamp": 1_699_999_999_000i64,
                },
                "theme-default-test": {
                    "experimentId": "theme-default-test",
                    "variantId": "control",
                    "userId": "visitor-1",
                    "timestamp": 1_699_999_999_000i64,
                },
            },
        })));

        assert_eq!(status, StatusCode::OK);
        let events = ingress.store().events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|it| it.event_type == "resume_download"));
        assert_eq!(events[0].experiment_id, "hero-cta-test");
        assert_eq!(events[0].variant_id, "variant-a");
        assert_eq!(events[1].experiment_id, "theme-default-test");
    }

    #[test]
    fn attributes_conversion_to_data_tags() {
        let ingress = ingress();

        ingress.conversion(&body(json!({
            "event": "conversion_hero-cta-test",
            "userId": "visitor-1",
            "data": {"experimentId": "hero-cta-test", "variantId": "control"},
        })));

        let events = ingress.store().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].variant_id, "control");
    }

    #[test]
    fn unattributed_conversion_is_acknowledged() {
        let ingress = ingress();

        let (status, response) = ingress.conversion(&body(json!({
            "eventName": "contact_submit",
            "userId": "visitor-1",
        })));

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response, json!({"success": true}));
        assert!(ingress.store().is_empty());

        let (status, _) = ingress.conversion(&body(json!({"userId": "visitor-1"})));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn tracks_experiment_events_only() {
        let ingress = ingress();

        let (status, response) = ingress.track(
            &body(json!({
                "event": "resume_download",
                "data": {"experimentId": "hero-cta-test", "variantId": "variant-a", "format": "pdf"},
            })),
            Some("visitor-1"),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["event"]["userId"], json!("visitor-1"));
        assert_eq!(response["event"]["data"], json!({"format": "pdf"}));

        let (status, response) = ingress.track(
            &body(json!({"event": "page_view", "data": {"path": "/"}})),
            Some("visitor-1"),
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response, json!({"success": true}));

        assert_eq!(ingress.store().len(), 1);
    }

    #[test]
    fn track_without_user_header_generates_id() {
        let ingress = ingress();

        let (_, response) = ingress.track(
            &body(json!({
                "event": "resume_download",
                "data": {"experimentId": "hero-cta-test", "variantId": "control"},
            })),
            None,
        );

        assert!(response["event"]["userId"]
            .as_str()
            .unwrap()
            .starts_with("user-"));
    }

    #[test]
    fn assigns_running_experiments_for_visitor() {
        let (status, response) = ingress().assignments(Some("visitor-1"));

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["userId"], "visitor-1");
        // hero-cta-test: visitor-1 is included at 0.0924 and selects at 0.9046.
        assert_eq!(response["assignments"]["hero-cta-test"], "variant-b");
    }

    #[test]
    fn assignments_without_visitor_generate_id() {
        let (status, response) = ingress().assignments(None);

        assert_eq!(status, StatusCode::OK);
        let user_id = response["userId"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(user_id).is_ok());
        assert!(response["assignments"].is_object());
    }

    #[test]
    fn stats_then_clear() {
        let ingress = ingress();
        for (variant, user) in [("control", "a"), ("control", "b"), ("variant-a", "c")] {
            ingress.exposure(&body(json!({
                "experimentId": "hero-cta-test",
                "variantId": variant,
                "userId": user,
            })));
        }
        ingress.conversion(&body(json!({
            "eventName": "resume_download",
            "userId": "a",
            "data": {"experimentId": "hero-cta-test", "variantId": "control"},
        })));

        let (status, response) = ingress.stats();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["totalEvents"], json!(4));
        assert_eq!(response["stats"][0]["variantId"], json!("control"));
        assert_eq!(response["stats"][0]["totalViews"], json!(2));
        assert_eq!(response["stats"][0]["totalConversions"], json!(1));
        assert_eq!(response["stats"][0]["conversionRate"], json!(0.5));

        let (status, response) = ingress.clear();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["message"], json!("All analytics data cleared"));

        let (_, response) = ingress.stats();
        assert_eq!(response["totalEvents"], json!(0));
        assert_eq!(response["stats"], json!([]));
    }

    #[test]
    fn store_failure_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let ingress = ingress_with(EventStore::open(dir.path()));

        let (status, _) = ingress.exposure(&body(json!({
            "experimentId": "hero-cta-test",
            "variantId": "control",
            "userId": "visitor-1",
        })));

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
