use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Variant configuration consumed by presentation code (e.g., call-to-action text and style).
pub type VariantConfig = serde_json::Map<String, serde_json::Value>;

/// Tolerance used when checking that variant weights add up to 1.
pub const WEIGHT_TOLERANCE: f64 = 1e-2;

/// A named A/B/n test definition with a traffic allocation and a set of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    /// Unique experiment identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle status. Only [`ExperimentStatus::Running`] experiments are assigned.
    pub status: ExperimentStatus,
    /// Fraction of all visitors eligible for inclusion, in `[0, 1]`.
    pub traffic: f64,
    /// Variants in the order they are walked during bucketing.
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// One treatment within an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// Identifier, unique within its experiment.
    pub id: String,
    pub name: String,
    /// Relative share of the experiment's traffic once included, in `[0, 1]`.
    pub weight: f64,
    #[serde(default)]
    pub config: VariantConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    #[display(fmt = "draft")]
    Draft,
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "paused")]
    Paused,
    #[display(fmt = "completed")]
    Completed,
}

/// Where an experiment list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ConfigSource {
    #[serde(rename = "edge-config")]
    #[display(fmt = "edge-config")]
    EdgeConfig,
    #[serde(rename = "fallback")]
    #[display(fmt = "fallback")]
    Fallback,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|variant| variant.weight).sum()
    }

    /// Return a list of problems with this definition. An empty list means the experiment is
    /// well-formed.
    ///
    /// Malformed experiments are still accepted by bucketing (which degrades to the first variant
    /// or exclusion); this is meant for diagnostics.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.is_empty() {
            problems.push("experiment id is empty".to_owned());
        }
        if !(0.0..=1.0).contains(&self.traffic) {
            problems.push(format!("traffic {} is outside of [0, 1]", self.traffic));
        }
        if self.variants.is_empty() {
            problems.push("experiment has no variants".to_owned());
        } else if (self.total_weight() - 1.0).abs() > WEIGHT_TOLERANCE {
            problems.push(format!(
                "variant weights sum to {} instead of 1",
                self.total_weight()
            ));
        }
        for variant in &self.variants {
            if !(0.0..=1.0).contains(&variant.weight) {
                problems.push(format!(
                    "variant {} weight {} is outside of [0, 1]",
                    variant.id, variant.weight
                ));
            }
        }
        problems
    }
}

/// Static experiment list used whenever the edge configuration store is unavailable.
pub fn fallback_experiments() -> Vec<Experiment> {
    fn variant(id: &str, name: &str, weight: f64, config: serde_json::Value) -> Variant {
        Variant {
            id: id.to_owned(),
            name: name.to_owned(),
            weight,
            config: match config {
                serde_json::Value::Object(map) => map,
                _ => VariantConfig::new(),
            },
        }
    }

    vec![
        Experiment {
            id: "hero-cta-test".to_owned(),
            name: "Hero CTA Button Test".to_owned(),
            status: ExperimentStatus::Running,
            traffic: 0.8,
            variants: vec![
                variant(
                    "control",
                    "Original Download Resume",
                    0.5,
                    serde_json::json!({
                        "ctaText": "Download Resume",
                        "ctaStyle": "primary",
                        "showSecondaryButton": false,
                    }),
                ),
                variant(
                    "variant-a",
                    "Get My Resume",
                    0.3,
                    serde_json::json!({
                        "ctaText": "Get My Resume",
                        "ctaStyle": "gradient",
                        "showSecondaryButton": true,
                        "secondaryText": "View Online",
                    }),
                ),
                variant(
                    "variant-b",
                    "Hire Me Now",
                    0.2,
                    serde_json::json!({
                        "ctaText": "Hire Me Now",
                        "ctaStyle": "outline",
                        "showSecondaryButton": true,
                        "secondaryText": "Download Resume",
                    }),
                ),
            ],
            created_at: None,
            updated_at: None,
        },
        Experiment {
            id: "theme-default-test".to_owned(),
            name: "Default Theme Test".to_owned(),
            status: ExperimentStatus::Running,
            traffic: 0.5,
            variants: vec![
                variant(
                    "control",
                    "Default Light",
                    0.5,
                    serde_json::json!({
                        "defaultTheme": "default",
                        "defaultDarkMode": false,
                    }),
                ),
                variant(
                    "variant-a",
                    "Cyberpunk Dark",
                    0.5,
                    serde_json::json!({
                        "defaultTheme": "cyberpunk",
                        "defaultDarkMode": true,
                    }),
                ),
            ],
            created_at: None,
            updated_at: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use super::{fallback_experiments, Experiment, ExperimentStatus};

    #[test]
    fn fallback_experiments_are_valid() {
        for experiment in fallback_experiments() {
            assert!(
                experiment.validate().is_empty(),
                "{}: {:?}",
                experiment.id,
                experiment.validate()
            );
            assert!(experiment.is_running());
        }
    }

    #[test]
    fn parse_experiments_fixture() {
        let f = File::open("tests/data/experiments.json")
            .expect("Failed to open tests/data/experiments.json");
        let experiments: Vec<Experiment> = serde_json::from_reader(BufReader::new(f)).unwrap();

        assert_eq!(experiments.len(), 3);
        assert_eq!(experiments[2].status, ExperimentStatus::Paused);
        assert_eq!(
            experiments[0].created_at.as_deref(),
            Some("2025-01-10T00:00:00Z")
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ExperimentStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(ExperimentStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn missing_variants_parse_as_empty() {
        let experiment: Experiment = serde_json::from_str(
            r#"{"id": "x", "name": "X", "status": "draft", "traffic": 1}"#,
        )
        .unwrap();

        assert!(experiment.variants.is_empty());
        assert_eq!(experiment.validate(), vec!["experiment has no variants"]);
    }

    #[test]
    fn validate_reports_weights_not_summing_to_one() {
        let mut experiment = fallback_experiments().remove(0);
        experiment.variants[0].weight = 0.1;

        let problems = experiment.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("variant weights sum to"));
    }
}
