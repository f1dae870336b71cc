use crate::{
    experiment::{Experiment, Variant},
    sharder::Sharder,
};

/// Look up `experiment_id` in `experiments` and bucket `user_id` into it.
///
/// Returns `None` for unknown experiments, experiments that are not running, and visitors outside
/// of the experiment's traffic allocation.
pub fn eval_experiment<'a>(
    experiments: &'a [Experiment],
    experiment_id: &str,
    user_id: &str,
    sharder: &impl Sharder,
) -> Option<&'a Variant> {
    let Some(experiment) = experiments.iter().find(|it| it.id == experiment_id) else {
        log::trace!(target: "edge_experiments", experiment_id; "unknown experiment");
        return None;
    };

    if !experiment.is_running() {
        log::trace!(target: "edge_experiments",
                    experiment_id,
                    status:display = experiment.status;
                    "experiment is not running");
        return None;
    }

    let variant = experiment.get_variant_for_user(user_id, sharder);

    log::trace!(target: "edge_experiments",
                experiment_id,
                user_id,
                variant_id = variant.map(|it| it.id.as_str());
                "evaluated an experiment");

    variant
}

impl Experiment {
    /// Deterministically bucket `user_id` into this experiment.
    ///
    /// Status is not checked here; see [`eval_experiment`].
    pub fn get_variant_for_user(&self, user_id: &str, sharder: &impl Sharder) -> Option<&Variant> {
        if !self.includes(user_id, sharder) {
            return None;
        }

        let point = sharder.bucket(&format!("{}-{}-variant", user_id, self.id));

        let mut cumulative_weight = 0.0;
        self.variants
            .iter()
            .find(|variant| {
                cumulative_weight += variant.weight;
                point < cumulative_weight
            })
            // Weights summing to less than 1 leave a gap at the top of the range.
            .or_else(|| self.variants.first())
    }

    /// Return `true` if `user_id` falls within this experiment's traffic allocation.
    fn includes(&self, user_id: &str, sharder: &impl Sharder) -> bool {
        sharder.bucket(&format!("{}-{}", user_id, self.id)) < self.traffic
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use crate::{
        experiment::{fallback_experiments, Experiment, ExperimentStatus, Variant, VariantConfig},
        sharder::{DeterministicSharder, RollingHashSharder},
    };

    use super::eval_experiment;

    fn experiment(id: &str, traffic: f64, weights: &[f64]) -> Experiment {
        Experiment {
            id: id.to_owned(),
            name: id.to_owned(),
            status: ExperimentStatus::Running,
            traffic,
            variants: weights
                .iter()
                .enumerate()
                .map(|(i, weight)| Variant {
                    id: format!("v{i}"),
                    name: format!("Variant {i}"),
                    weight: *weight,
                    config: VariantConfig::new(),
                })
                .collect(),
            created_at: None,
            updated_at: None,
        }
    }

    fn random_user_ids(n: usize) -> Vec<String> {
        (0..n).map(|_| uuid::Uuid::new_v4().to_string()).collect()
    }

    #[test]
    fn known_assignments() {
        let experiments = fallback_experiments();
        let assign = |user_id: &str| {
            eval_experiment(&experiments, "hero-cta-test", user_id, &RollingHashSharder)
                .map(|variant| variant.id.as_str())
        };

        // inclusion 0.092, selection 0.905
        assert_eq!(assign("visitor-1"), Some("variant-b"));
        // inclusion 0.610, selection 0.516
        assert_eq!(assign("visitor-2"), Some("variant-a"));
        // inclusion 0.688, selection 0.064
        assert_eq!(assign("visitor-3"), Some("control"));
    }

    #[test]
    fn excludes_users_outside_of_traffic() {
        let mut experiment = fallback_experiments().remove(0);
        experiment.traffic = 0.5;

        // inclusion hash of visitor-2 is 0.610
        assert_eq!(
            experiment.get_variant_for_user("visitor-2", &RollingHashSharder),
            None
        );
        assert!(experiment
            .get_variant_for_user("visitor-1", &RollingHashSharder)
            .is_some());
    }

    #[test]
    fn zero_traffic_excludes_everyone() {
        let experiment = experiment("exp", 0.0, &[1.0]);
        for user_id in random_user_ids(1000) {
            assert_eq!(
                experiment.get_variant_for_user(&user_id, &RollingHashSharder),
                None
            );
        }
    }

    #[test]
    fn selects_by_cumulative_weight() {
        let experiment = experiment("exp", 1.0, &[0.2, 0.3, 0.5]);
        let sharder = |point: f64| {
            DeterministicSharder(HashMap::from([
                ("user-exp".to_owned(), 0.0),
                ("user-exp-variant".to_owned(), point),
            ]))
        };
        let pick = |point: f64| {
            experiment
                .get_variant_for_user("user", &sharder(point))
                .map(|variant| variant.id.clone())
        };

        assert_eq!(pick(0.0).as_deref(), Some("v0"));
        assert_eq!(pick(0.19).as_deref(), Some("v0"));
        assert_eq!(pick(0.2).as_deref(), Some("v1"));
        assert_eq!(pick(0.49).as_deref(), Some("v1"));
        assert_eq!(pick(0.5).as_deref(), Some("v2"));
        assert_eq!(pick(0.99).as_deref(), Some("v2"));
    }

    #[test]
    fn falls_back_to_first_variant_when_weights_fall_short() {
        let experiment = experiment("exp", 1.0, &[0.1, 0.1]);
        let sharder = DeterministicSharder(HashMap::from([
            ("user-exp".to_owned(), 0.0),
            ("user-exp-variant".to_owned(), 0.9),
        ]));

        assert_eq!(
            experiment
                .get_variant_for_user("user", &sharder)
                .map(|variant| variant.id.as_str()),
            Some("v0")
        );
    }

    #[test]
    fn zero_variants_yield_none() {
        let experiment = experiment("exp", 1.0, &[]);
        for user_id in random_user_ids(100) {
            assert_eq!(
                experiment.get_variant_for_user(&user_id, &RollingHashSharder),
                None
            );
        }
    }

    #[test]
    fn unknown_experiment_yields_none() {
        assert_eq!(
            eval_experiment(
                &fallback_experiments(),
                "does-not-exist",
                "visitor-1",
                &RollingHashSharder
            ),
            None
        );
    }

    #[test]
    fn non_running_experiments_never_yield_a_variant() {
        for status in [
            ExperimentStatus::Draft,
            ExperimentStatus::Paused,
            ExperimentStatus::Completed,
        ] {
            let mut experiment = experiment("exp", 1.0, &[0.5, 0.5]);
            experiment.status = status;
            let experiments = vec![experiment];

            for user_id in random_user_ids(1000) {
                assert_eq!(
                    eval_experiment(&experiments, "exp", &user_id, &RollingHashSharder),
                    None
                );
            }
        }
    }

    #[test]
    fn assignment_is_deterministic() {
        let experiments: Vec<Experiment> = (0..10)
            .map(|i| experiment(&format!("exp-{i}"), 0.1 * (i + 1) as f64, &[0.25, 0.25, 0.5]))
            .collect();

        for user_id in random_user_ids(100) {
            for experiment in &experiments {
                let first = experiment.get_variant_for_user(&user_id, &RollingHashSharder);
                for _ in 0..5 {
                    assert_eq!(
                        experiment.get_variant_for_user(&user_id, &RollingHashSharder),
                        first
                    );
                }
            }
        }
    }

    #[test]
    fn traffic_is_conserved() {
        let experiment = experiment("traffic-test", 0.5, &[0.5, 0.5]);
        let users = random_user_ids(100_000);

        let included = users
            .iter()
            .filter(|user_id| {
                experiment
                    .get_variant_for_user(user_id, &RollingHashSharder)
                    .is_some()
            })
            .count();

        let fraction = included as f64 / users.len() as f64;
        assert!((fraction - 0.5).abs() < 0.02, "included fraction {fraction}");
    }

    #[test]
    fn weights_are_conserved() {
        let experiment = experiment("weight-test", 1.0, &[0.5, 0.5]);
        let users = random_user_ids(100_000);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for user_id in &users {
            let variant = experiment
                .get_variant_for_user(user_id, &RollingHashSharder)
                .expect("full traffic includes everyone");
            *counts.entry(variant.id.clone()).or_default() += 1;
        }

        assert_eq!(
            counts.keys().cloned().collect::<HashSet<_>>(),
            HashSet::from(["v0".to_owned(), "v1".to_owned()])
        );
        for (variant_id, count) in counts {
            let share = count as f64 / users.len() as f64;
            assert!((share - 0.5).abs() < 0.02, "{variant_id} share {share}");
        }
    }
}
