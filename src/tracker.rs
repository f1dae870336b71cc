use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use crate::{
    clock::Clock,
    events::{ConversionEvent, ExposureRecord, ExposureSnapshot, EXPOSURE_EVENT},
    identity::{ExecutionContext, IdentityResolver},
    sink::AnalyticsSink,
    storage::{get_json, set_json, Storage},
    Error, Result,
};

/// Storage key holding the [`ExposureSnapshot`].
pub const EXPOSURES_KEY: &str = "experiment-exposures";
/// Storage key holding the list of [`ConversionEvent`]s.
pub const CONVERSIONS_KEY: &str = "experiment-conversions";

/// Notification delivered to [`Tracker::subscribe`] listeners after tracked state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Exposure(ExposureRecord),
    Conversion(ConversionEvent),
    Cleared,
}

/// Handle returned by [`Tracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

/// Records exposures and conversions in visitor-local [`Storage`] and forwards them to the
/// registered [`AnalyticsSink`]s.
///
/// Tracking never fails from the caller's point of view: storage and sink errors are logged and
/// swallowed.
pub struct Tracker {
    identity: Arc<IdentityResolver>,
    storage: Arc<dyn Storage + Send + Sync>,
    sinks: Vec<Box<dyn AnalyticsSink + Send + Sync>>,
    clock: Box<dyn Clock + Send + Sync>,
    max_conversions: usize,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    /// Serializes read-modify-write cycles over `storage`.
    write_lock: Mutex<()>,
}

impl Tracker {
    /// Default number of conversion events kept in storage.
    pub const DEFAULT_MAX_CONVERSIONS: usize = 1_000;

    pub fn new(
        identity: Arc<IdentityResolver>,
        storage: Arc<dyn Storage + Send + Sync>,
        sinks: Vec<Box<dyn AnalyticsSink + Send + Sync>>,
        clock: Box<dyn Clock + Send + Sync>,
        max_conversions: usize,
    ) -> Tracker {
        Tracker {
            identity,
            storage,
            sinks,
            clock,
            max_conversions,
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Record that the current visitor was shown `variant_id` of `experiment_id`.
    ///
    /// Replaces any earlier exposure for the same experiment. Returns `None` in a server context,
    /// where nothing is tracked.
    pub fn track_exposure(&self, experiment_id: &str, variant_id: &str) -> Option<ExposureRecord> {
        if self.identity.context() == ExecutionContext::Server {
            log::debug!(target: "edge_experiments", experiment_id; "skipping exposure outside of client context");
            return None;
        }

        let exposure = ExposureRecord {
            experiment_id: experiment_id.to_owned(),
            variant_id: variant_id.to_owned(),
            user_id: self.identity.get_user_id(),
            timestamp: self.clock.now(),
        };

        if let Err(err) = self.store_exposure(&exposure) {
            log::warn!(target: "edge_experiments", experiment_id; "failed to store exposure: {:?}", err);
        }

        log::trace!(target: "edge_experiments", exposure:serde; "tracked exposure");
        self.dispatch(EXPOSURE_EVENT, &exposure);
        self.notify(&TrackerEvent::Exposure(exposure.clone()));

        Some(exposure)
    }

    /// Record a conversion for the current visitor, attributed to every experiment they are
    /// currently exposed to.
    ///
    /// Returns `None` in a server context, where nothing is tracked.
    pub fn track_conversion(
        &self,
        event_name: &str,
        data: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Option<ConversionEvent> {
        if self.identity.context() == ExecutionContext::Server {
            log::debug!(target: "edge_experiments", event_name; "skipping conversion outside of client context");
            return None;
        }

        let conversion = ConversionEvent {
            event_name: event_name.to_owned(),
            data,
            user_id: self.identity.get_user_id(),
            timestamp: self.clock.now(),
            experiments: self.exposures(),
        };

        if let Err(err) = self.store_conversion(&conversion) {
            log::warn!(target: "edge_experiments", event_name; "failed to store conversion: {:?}", err);
        }

        log::trace!(target: "edge_experiments", conversion:serde; "tracked conversion");
        self.dispatch(event_name, &conversion);
        self.notify(&TrackerEvent::Conversion(conversion.clone()));

        Some(conversion)
    }

    /// Current exposure snapshot, keyed by experiment id.
    pub fn exposures(&self) -> ExposureSnapshot {
        get_json(&*self.storage, EXPOSURES_KEY).unwrap_or_default()
    }

    /// Stored conversions, oldest first.
    pub fn conversions(&self) -> Vec<ConversionEvent> {
        get_json(&*self.storage, CONVERSIONS_KEY).unwrap_or_default()
    }

    /// Remove all stored exposures and conversions. This cannot be undone.
    pub fn clear_all(&self) -> Result<()> {
        {
            let _guard = self.lock()?;
            self.storage.remove(EXPOSURES_KEY)?;
            self.storage.remove(CONVERSIONS_KEY)?;
        }
        log::debug!(target: "edge_experiments", "cleared exposures and conversions");
        self.notify(&TrackerEvent::Cleared);
        Ok(())
    }

    /// Register `listener` to be called after every exposure, conversion, and clear.
    ///
    /// Listeners are called without any tracker lock held, so they may subscribe or unsubscribe
    /// (including themselves). A listener that panics is logged and skipped.
    pub fn subscribe(&self, listener: impl Fn(&TrackerEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|(it, _)| *it != id);
        }
    }

    fn store_exposure(&self, exposure: &ExposureRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut exposures = self.exposures();
        exposures.insert(exposure.experiment_id.clone(), exposure.clone());
        set_json(&*self.storage, EXPOSURES_KEY, &exposures)
    }

    fn store_conversion(&self, conversion: &ConversionEvent) -> Result<()> {
        let _guard = self.lock()?;
        let mut conversions = self.conversions();
        conversions.push(conversion.clone());
        if conversions.len() > self.max_conversions {
            let excess = conversions.len() - self.max_conversions;
            conversions.drain(..excess);
        }
        set_json(&*self.storage, CONVERSIONS_KEY, &conversions)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Storage("tracker lock poisoned".to_owned()))
    }

    /// Fan `record` out to every sink. Each sink is isolated from the failures of the others.
    fn dispatch(&self, event: &str, record: &impl serde::Serialize) {
        if self.sinks.is_empty() {
            return;
        }

        let data = match serde_json::to_value(record) {
            Ok(data) => data,
            Err(err) => {
                log::warn!(target: "edge_experiments", event; "failed to serialize event: {:?}", err);
                return;
            }
        };

        for sink in &self.sinks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| sink.send(event, &data))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!(target: "edge_experiments", event; "analytics sink failed: {:?}", err);
                }
                Err(_) => {
                    log::warn!(target: "edge_experiments", event; "analytics sink panicked");
                }
            }
        }
    }

    fn notify(&self, event: &TrackerEvent) {
        // Snapshot so the lock is released before any listener runs.
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, it)| it.clone()).collect(),
            Err(_) => return,
        };

        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::warn!(target: "edge_experiments", "tracker listener panicked");
            }
        }
    }
}
