//! Adapter exposing a resolved experiment to presentation code.
use serde_json::Value;

use crate::{
    events::ConversionEvent,
    experiment::{Variant, VariantConfig},
    Client,
};

/// Variant id reported in conversion data when the visitor is not in the experiment.
pub const CONTROL_VARIANT_ID: &str = "control";

#[derive(Debug, Clone, PartialEq)]
enum HookState {
    Loading,
    Resolved(Option<Variant>),
}

/// Binds one experiment to caller-supplied default configuration.
///
/// The hook starts out loading and serves the defaults. [`ExperimentHook::resolve`] assigns the
/// current visitor through a [`Client`], records the exposure, and from then on
/// [`ExperimentHook::config`] serves the variant configuration layered over the defaults.
///
/// # Examples
/// ```
/// # use edge_experiments::{ClientConfig, ExperimentHook};
/// # let client = ClientConfig::from_base_url("http://127.0.0.1:1").to_client().unwrap();
/// let mut defaults = serde_json::Map::new();
/// defaults.insert("ctaText".to_owned(), "Download Resume".into());
///
/// let mut hook = ExperimentHook::new("hero-cta-test", defaults);
/// assert!(hook.is_loading());
///
/// hook.resolve(&client);
/// assert!(!hook.is_loading());
/// assert!(hook.config().contains_key("ctaText"));
/// ```
#[derive(Debug, Clone)]
pub struct ExperimentHook {
    experiment_id: String,
    defaults: VariantConfig,
    state: HookState,
}

impl ExperimentHook {
    pub fn new(experiment_id: impl Into<String>, defaults: VariantConfig) -> Self {
        ExperimentHook {
            experiment_id: experiment_id.into(),
            defaults,
            state: HookState::Loading,
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Assign the current visitor and track the exposure if they are in the experiment.
    ///
    /// Does nothing once resolved, so the exposure is recorded at most once per hook.
    pub fn resolve(&mut self, client: &Client) {
        if let HookState::Resolved(_) = self.state {
            return;
        }

        let variant = client.get_experiment_variant(&self.experiment_id);
        if let Some(variant) = &variant {
            client.track_exposure(&self.experiment_id, &variant.id);
        }
        self.state = HookState::Resolved(variant);
    }

    /// Point the hook at another experiment. Resets to the loading state if the id changed.
    pub fn set_experiment_id(&mut self, experiment_id: impl Into<String>) {
        let experiment_id = experiment_id.into();
        if experiment_id != self.experiment_id {
            self.experiment_id = experiment_id;
            self.state = HookState::Loading;
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state == HookState::Loading
    }

    pub fn variant(&self) -> Option<&Variant> {
        match &self.state {
            HookState::Resolved(variant) => variant.as_ref(),
            HookState::Loading => None,
        }
    }

    pub fn variant_id(&self) -> Option<&str> {
        self.variant().map(|it| it.id.as_str())
    }

    pub fn is_in_experiment(&self) -> bool {
        self.variant().is_some()
    }

    /// The variant configuration merged over the defaults, or the defaults alone while loading or
    /// when the visitor is not in the experiment.
    pub fn config(&self) -> VariantConfig {
        match self.variant() {
            Some(variant) => merge_config(&variant.config, &self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// On/off flag semantics: enabled when the variant id is `enabled` or its config carries
    /// `enabled: true`. Otherwise `default`.
    pub fn feature_enabled(&self, default: bool) -> bool {
        let enabled = self.variant().is_some_and(|variant| {
            variant.id == "enabled" || variant.config.get("enabled") == Some(&Value::Bool(true))
        });
        enabled || default
    }

    /// Track a conversion tagged with this experiment.
    ///
    /// `event_name` defaults to `conversion_{experiment_id}`. The data carries `experimentId` and
    /// `variantId` (`"control"` when unassigned) unless the caller supplies those keys.
    pub fn track_conversion(
        &self,
        client: &Client,
        event_name: Option<&str>,
        data: Option<serde_json::Map<String, Value>>,
    ) -> Option<ConversionEvent> {
        let event_name = match event_name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("conversion_{}", self.experiment_id),
        };

        let mut tagged = serde_json::Map::new();
        tagged.insert(
            "experimentId".to_owned(),
            Value::String(self.experiment_id.clone()),
        );
        tagged.insert(
            "variantId".to_owned(),
            Value::String(self.variant_id().unwrap_or(CONTROL_VARIANT_ID).to_owned()),
        );
        tagged.extend(data.unwrap_or_default());

        client.track_conversion(&event_name, Some(tagged))
    }
}

/// Layer `variant` over `defaults`: keys present in the variant win, defaults fill in the rest.
///
/// The merge is shallow; nested objects are replaced, not merged.
pub fn merge_config(variant: &VariantConfig, defaults: &VariantConfig) -> VariantConfig {
    let mut merged = defaults.clone();
    merged.extend(variant.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
