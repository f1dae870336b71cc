//! HTTP server exposing the experiment and analytics routes.
//!
//! Configuration comes from the environment:
//! - `PORT`: port to listen on, defaults to 3000.
//! - `EDGE_CONFIG_URL`: URL of the edge config item holding the experiment array. Without it the
//!   static fallback list is served.
//! - `ANALYTICS_DATA_FILE`: where analytics events are persisted, defaults to
//!   `.analytics-data.json`.
use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use edge_experiments::{
    fallback_experiments,
    ingress::{AnalyticsIngress, EventStore, Response},
    ConfigSource, ExperimentCache, ExperimentFetcher, ExperimentSource, FetchedExperiments,
    HttpExperimentSource, PollerThread, PollerThreadConfig, USER_ID_KEY,
};

struct ServerConfig {
    port: u16,
    edge_config_url: Option<String>,
    data_file: String,
}

impl ServerConfig {
    fn from_env() -> anyhow::Result<ServerConfig> {
        let port = match std::env::var("PORT") {
            Ok(port) => port.parse().context("PORT must be a port number")?,
            Err(_) => 3000,
        };
        Ok(ServerConfig {
            port,
            edge_config_url: std::env::var("EDGE_CONFIG_URL")
                .ok()
                .filter(|it| !it.is_empty()),
            data_file: std::env::var("ANALYTICS_DATA_FILE")
                .unwrap_or_else(|_| EventStore::DEFAULT_FILE.to_owned()),
        })
    }
}

fn experiment_source(
    config: &ServerConfig,
) -> anyhow::Result<Box<dyn ExperimentSource + Send + Sync>> {
    match &config.edge_config_url {
        Some(url) => {
            let source =
                HttpExperimentSource::edge_config_item(url, HttpExperimentSource::DEFAULT_TIMEOUT)
                    .context("invalid EDGE_CONFIG_URL")?;
            Ok(Box::new(source))
        }
        None => {
            log::warn!(target: "edge_experiments_server", "EDGE_CONFIG_URL is not set, serving fallback experiments");
            Ok(Box::new(|| -> edge_experiments::Result<FetchedExperiments> {
                Ok(FetchedExperiments {
                    experiments: fallback_experiments(),
                    source: ConfigSource::Fallback,
                })
            }))
        }
    }
}

/// Sync main: the blocking HTTP clients must be created and dropped outside of the async runtime.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new().default_filter_or("edge_experiments=info,edge_experiments_server=info"),
    )
    .init();

    let config = ServerConfig::from_env()?;

    let source = experiment_source(&config)?;
    let fetcher = Arc::new(ExperimentFetcher::new(
        move || source.fetch_experiments(),
        Arc::new(ExperimentCache::new()),
    ));
    let poller = PollerThread::start(fetcher.clone(), PollerThreadConfig::default())?;

    let store = EventStore::open(&config.data_file);
    log::info!(target: "edge_experiments_server",
               data_file:display = config.data_file,
               events = store.len();
               "opened analytics store");
    let ingress = Arc::new(AnalyticsIngress::new(fetcher, store));

    tokio::runtime::Runtime::new()?.block_on(serve(config.port, ingress.clone()))?;

    poller.shutdown()?;
    Ok(())
}

async fn serve(port: u16, ingress: Arc<AnalyticsIngress>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/experiments", get(list_experiments))
        .route("/api/experiments/:id", get(get_experiment))
        .route("/api/assignments", get(assignments))
        .route("/api/analytics/exposure", post(exposure))
        .route(
            "/api/analytics/conversion",
            post(conversion).get(stats).delete(clear),
        )
        .route("/api/analytics/track", post(track))
        .layer(CorsLayer::permissive())
        .with_state(ingress);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!(target: "edge_experiments_server", addr:display = addr; "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!(target: "edge_experiments_server", "shutting down");
        })
        .await?;

    Ok(())
}

type Ingress = State<Arc<AnalyticsIngress>>;

/// Run a handler on the blocking pool: the store writes files and the fetcher does blocking I/O.
async fn blocking(
    ingress: Arc<AnalyticsIngress>,
    handler: impl FnOnce(&AnalyticsIngress) -> Response + Send + 'static,
) -> (StatusCode, Json<Value>) {
    match tokio::task::spawn_blocking(move || handler(&ingress)).await {
        Ok((status, body)) => (status, Json(body)),
        Err(err) => {
            log::error!(target: "edge_experiments_server", "handler failed: {:?}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "edge-experiments",
    }))
}

async fn list_experiments(State(ingress): Ingress) -> (StatusCode, Json<Value>) {
    blocking(ingress, |it| it.experiments()).await
}

async fn get_experiment(
    State(ingress): Ingress,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    blocking(ingress, move |it| it.experiment(&id)).await
}

/// Visitor id from the `x-user-id` header, or the `experiment-user-id` cookie.
fn visitor_id(headers: &HeaderMap) -> Option<String> {
    if let Some(user_id) = headers.get("x-user-id").and_then(|value| value.to_str().ok()) {
        return Some(user_id.to_owned());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == USER_ID_KEY)
        .map(|(_, value)| value.to_owned())
}

async fn assignments(State(ingress): Ingress, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let user_id = visitor_id(&headers);
    blocking(ingress, move |it| it.assignments(user_id.as_deref())).await
}

async fn exposure(State(ingress): Ingress, body: Bytes) -> (StatusCode, Json<Value>) {
    blocking(ingress, move |it| it.exposure(&body)).await
}

async fn conversion(State(ingress): Ingress, body: Bytes) -> (StatusCode, Json<Value>) {
    blocking(ingress, move |it| it.conversion(&body)).await
}

async fn track(
    State(ingress): Ingress,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    blocking(ingress, move |it| it.track(&body, user_id.as_deref())).await
}

async fn stats(State(ingress): Ingress) -> (StatusCode, Json<Value>) {
    blocking(ingress, |it| it.stats()).await
}

async fn clear(State(ingress): Ingress) -> (StatusCode, Json<Value>) {
    blocking(ingress, |it| it.clear()).await
}
