//! Exposure and conversion records produced by the [`Tracker`](crate::Tracker).
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name under which exposures are forwarded to analytics sinks.
pub const EXPOSURE_EVENT: &str = "experiment_exposure";

/// The recorded fact that a visitor was shown a particular variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRecord {
    pub experiment_id: String,
    pub variant_id: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Latest exposure per experiment id.
pub type ExposureSnapshot = BTreeMap<String, ExposureRecord>;

/// A recorded goal completion, attributed to every experiment the visitor was exposed to at the
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub experiments: ExposureSnapshot,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{ConversionEvent, ExposureRecord};

    #[test]
    fn exposure_wire_format() {
        let exposure = ExposureRecord {
            experiment_id: "hero-cta-test".to_owned(),
            variant_id: "variant-a".to_owned(),
            user_id: "visitor-1".to_owned(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        };

        assert_eq!(
            serde_json::to_value(&exposure).unwrap(),
            json!({
                "experimentId": "hero-cta-test",
                "variantId": "variant-a",
                "userId": "visitor-1",
                "timestamp": 1_700_000_000_123i64,
            })
        );
    }

    #[test]
    fn conversion_without_data_or_experiments() {
        let conversion: ConversionEvent = serde_json::from_value(json!({
            "eventName": "resume_download",
            "userId": "visitor-1",
            "timestamp": 1_700_000_000_000i64,
        }))
        .unwrap();

        assert_eq!(conversion.data, None);
        assert!(conversion.experiments.is_empty());
    }
}
