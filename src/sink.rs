use reqwest::Url;

use crate::{events::EXPOSURE_EVENT, Error, Result};

/// A trait for forwarding exposure and conversion events to an analytics backend.
///
/// Sinks are registered up front in [`ClientConfig`](crate::ClientConfig) and receive every event
/// the [`Tracker`](crate::Tracker) records. `data` is the JSON form of an
/// [`ExposureRecord`](crate::ExposureRecord) for [`EXPOSURE_EVENT`], and of a
/// [`ConversionEvent`](crate::ConversionEvent) for everything else.
///
/// # Examples
///
/// ```no_run
/// # use edge_experiments::AnalyticsSink;
/// struct MySink;
///
/// impl AnalyticsSink for MySink {
///     fn send(&self, event: &str, data: &serde_json::Value) -> edge_experiments::Result<()> {
///         // Forward the event to your analytics service here.
///         Ok(())
///     }
/// }
/// ```
///
/// # Notes
///
/// `send` is called on the thread that tracked the event, before tracking returns. It must not
/// block: hand slow work off to another thread. A failing or panicking sink is logged and does
/// not prevent other sinks from receiving the event.
pub trait AnalyticsSink {
    fn send(&self, event: &str, data: &serde_json::Value) -> Result<()>;
}

impl<T: Fn(&str, &serde_json::Value)> AnalyticsSink for T {
    fn send(&self, event: &str, data: &serde_json::Value) -> Result<()> {
        self(event, data);
        Ok(())
    }
}

/// Writes events to the `log` facade at `info` level. Handy during development.
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn send(&self, event: &str, data: &serde_json::Value) -> Result<()> {
        log::info!(target: "edge_experiments", event, data:serde; "analytics event");
        Ok(())
    }
}

const EXPOSURE_ENDPOINT: &str = "/api/analytics/exposure";
const CONVERSION_ENDPOINT: &str = "/api/analytics/conversion";

/// Posts events to the analytics ingress routes (see [`ingress`](crate::ingress)).
///
/// Every event is delivered from a short-lived background thread; delivery is best-effort with
/// no retries.
pub struct HttpSink {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    exposure_url: Url,
    conversion_url: Url,
}

impl HttpSink {
    pub fn new(base_url: &str) -> Result<HttpSink> {
        let base_url = base_url.trim_end_matches('/');
        let parse = |endpoint: &str| {
            Url::parse(&format!("{}{}", base_url, endpoint)).map_err(Error::InvalidBaseUrl)
        };
        Ok(HttpSink {
            client: reqwest::blocking::Client::new(),
            exposure_url: parse(EXPOSURE_ENDPOINT)?,
            conversion_url: parse(CONVERSION_ENDPOINT)?,
        })
    }

    fn url_for(&self, event: &str) -> &Url {
        if event == EXPOSURE_EVENT {
            &self.exposure_url
        } else {
            &self.conversion_url
        }
    }
}

impl AnalyticsSink for HttpSink {
    fn send(&self, event: &str, data: &serde_json::Value) -> Result<()> {
        let client = self.client.clone();
        let url = self.url_for(event).clone();
        let event = event.to_owned();
        let data = data.clone();

        std::thread::Builder::new()
            .name("edge-experiments-sink".to_owned())
            .spawn(move || match client.post(url).json(&data).send() {
                Ok(response) if !response.status().is_success() => {
                    log::warn!(target: "edge_experiments",
                               event:display = event,
                               status:display = response.status();
                               "analytics endpoint rejected event");
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(target: "edge_experiments",
                               event:display = event;
                               "failed to send event to analytics endpoint: {:?}", err);
                }
            })?;

        Ok(())
    }
}
