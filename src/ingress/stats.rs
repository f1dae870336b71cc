use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StoredEvent;
use crate::events::EXPOSURE_EVENT;

/// Aggregated counts for one experiment variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub experiment_id: String,
    pub variant_id: String,
    /// Number of exposure events.
    pub total_views: u64,
    /// Number of non-exposure events.
    pub total_conversions: u64,
    /// `total_conversions / total_views`, or `0` without views.
    pub conversion_rate: f64,
    pub event_breakdown: BTreeMap<String, u64>,
}

impl VariantStats {
    fn new(experiment_id: &str, variant_id: &str) -> VariantStats {
        VariantStats {
            experiment_id: experiment_id.to_owned(),
            variant_id: variant_id.to_owned(),
            total_views: 0,
            total_conversions: 0,
            conversion_rate: 0.0,
            event_breakdown: BTreeMap::new(),
        }
    }
}

/// Group `events` by experiment and variant, in order of first appearance.
pub fn compute_stats(events: &[StoredEvent]) -> Vec<VariantStats> {
    let mut stats: Vec<VariantStats> = Vec::new();

    for event in events {
        let index = match stats.iter().position(|it| {
            it.experiment_id == event.experiment_id && it.variant_id == event.variant_id
        }) {
            Some(index) => index,
            None => {
                stats.push(VariantStats::new(&event.experiment_id, &event.variant_id));
                stats.len() - 1
            }
        };
        let entry = &mut stats[index];

        if event.event_type == EXPOSURE_EVENT {
            entry.total_views += 1;
        } else {
            entry.total_conversions += 1;
        }
        *entry
            .event_breakdown
            .entry(event.event_type.clone())
            .or_default() += 1;
    }

    for entry in &mut stats {
        entry.conversion_rate = if entry.total_views > 0 {
            entry.total_conversions as f64 / entry.total_views as f64
        } else {
            0.0
        };
    }

    stats
}

/// Outcome of comparing a variant's conversion rate against control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Significance {
    /// `p_value < 0.05`.
    pub significant: bool,
    pub p_value: f64,
    /// `(1 - p_value) * 100`.
    pub confidence_level: f64,
}

impl Significance {
    const NOT_SIGNIFICANT: Significance = Significance {
        significant: false,
        p_value: 1.0,
        confidence_level: 0.0,
    };
}

/// Two-proportion z-test of `variant` against `control`.
///
/// Each argument is `(conversions, views)`. Without views on either side the result is not
/// significant.
///
/// ```
/// # use edge_experiments::ingress::significance;
/// let result = significance((10, 100), (25, 100));
/// assert!(result.significant);
/// ```
pub fn significance(control: (u64, u64), variant: (u64, u64)) -> Significance {
    let (control_conversions, control_views) = control;
    let (variant_conversions, variant_views) = variant;
    if control_views == 0 || variant_views == 0 {
        return Significance::NOT_SIGNIFICANT;
    }

    let (n1, n2) = (control_views as f64, variant_views as f64);
    let p1 = control_conversions as f64 / n1;
    let p2 = variant_conversions as f64 / n2;
    let pooled = (control_conversions + variant_conversions) as f64 / (n1 + n2);
    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if standard_error == 0.0 || !standard_error.is_finite() {
        return Significance::NOT_SIGNIFICANT;
    }

    let z = (p1 - p2).abs() / standard_error;
    let p_value = 2.0 * (1.0 - normal_cdf(z));

    Significance {
        significant: p_value < 0.05,
        p_value,
        confidence_level: (1.0 - p_value) * 100.0,
    }
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26; absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x >= 0.0 { 1.0 } else { -1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{compute_stats, erf, significance};
    use crate::{events::EXPOSURE_EVENT, ingress::StoredEvent};

    fn event(variant_id: &str, event_type: &str) -> StoredEvent {
        StoredEvent {
            experiment_id: "hero-cta-test".to_owned(),
            variant_id: variant_id.to_owned(),
            event_type: event_type.to_owned(),
            user_id: "visitor".to_owned(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    #[test]
    fn groups_by_variant() {
        let stats = compute_stats(&[
            event("control", EXPOSURE_EVENT),
            event("variant-a", EXPOSURE_EVENT),
            event("control", EXPOSURE_EVENT),
            event("control", "resume_download"),
            event("variant-a", "contact_submit"),
            event("variant-a", "contact_submit"),
        ]);

        assert_eq!(stats.len(), 2);

        assert_eq!(stats[0].variant_id, "control");
        assert_eq!(stats[0].total_views, 2);
        assert_eq!(stats[0].total_conversions, 1);
        assert_eq!(stats[0].conversion_rate, 0.5);
        assert_eq!(stats[0].event_breakdown["resume_download"], 1);

        assert_eq!(stats[1].variant_id, "variant-a");
        assert_eq!(stats[1].conversion_rate, 2.0);
        assert_eq!(stats[1].event_breakdown["contact_submit"], 2);
    }

    #[test]
    fn no_views_means_zero_rate() {
        let stats = compute_stats(&[event("control", "resume_download")]);

        assert_eq!(stats[0].total_views, 0);
        assert_eq!(stats[0].conversion_rate, 0.0);
    }

    #[test]
    fn empty_events_yield_no_stats() {
        assert!(compute_stats(&[]).is_empty());
    }

    #[test]
    fn erf_matches_known_values() {
        assert!(erf(0.0).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
    }

    #[test]
    fn detects_large_difference() {
        let result = significance((10, 100), (25, 100));

        assert!(result.significant);
        assert!(result.p_value < 0.01);
        assert!(result.confidence_level > 99.0);
    }

    #[test]
    fn equal_rates_are_not_significant() {
        let result = significance((10, 100), (10, 100));

        assert!(!result.significant);
        assert!(result.confidence_level < 1e-3);
    }

    #[test]
    fn missing_samples_are_not_significant() {
        assert!(!significance((0, 0), (5, 10)).significant);
        assert_eq!(significance((0, 10), (0, 10)).p_value, 1.0);
    }
}
