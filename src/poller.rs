//! A background poller thread that periodically refreshes the experiment cache.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{configuration_fetcher::ExperimentFetcher, experiment::ConfigSource, Error, Result};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between refreshes.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`]. Keep it below the cache TTL so
    /// that requests never see a stale cache.
    pub interval: Duration,
    /// Randomized duration subtracted from `interval` on every iteration. This helps to avoid
    /// multiple server instances synchronizing and producing spiky load on the configuration store.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(6);

    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// An experiment poller thread.
///
/// Use [`Client::start_poller_thread`](crate::Client::start_poller_thread) to get an instance of
/// it.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first refresh completes, then the source of the latest refresh.
    /// Holds `Some(Err(...))` if the thread panicked.
    result: Arc<(Mutex<Option<Result<ConfigSource>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] if the thread cannot be spawned.
    pub fn start(fetcher: Arc<ExperimentFetcher>, config: PollerThreadConfig) -> Result<PollerThread> {
        // `sync_channel` makes `stop_sender` `Sync`. A buffer of 1 is enough: if it is full,
        // another stop command is already pending.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value| {
                if let Ok(mut lock) = result.0.lock() {
                    *lock = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("edge-experiments-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        log::debug!(target: "edge_experiments", "refreshing experiments");
                        let entry = fetcher.refresh();
                        update_result(Ok(entry.source));

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Loop back to refresh.
                            }
                            Ok(()) => {
                                log::debug!(target: "edge_experiments", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // `recv_timeout` returns immediately once the sender is gone.
                                log::debug!(target: "edge_experiments", "poller thread disconnected");
                                return;
                            }
                        }
                    }));

                    if outcome.is_err() {
                        log::warn!(target: "edge_experiments", "poller thread panicked");
                        update_result(Err(Error::PollerThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first refresh completes and report where the experiments came from.
    ///
    /// A failing remote source is not an error here: the fetcher degrades to the fallback list and
    /// this returns [`ConfigSource::Fallback`].
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`]
    pub fn wait_for_experiments(&self) -> Result<ConfigSource> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Either the thread is gone or a stop command is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
