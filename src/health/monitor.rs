use super::HealthCheckResult;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::fleet::ServerId;
use crate::session::{SessionError, SessionHandle};
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

/// Monitor knobs: probe cadence, per-probe deadline and how many consecutive
/// failures flip the session to unhealthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
}

/// Callback table registered by the monitor's owner at construction.
///
/// `on_check` fires for every probe. `on_unhealthy` fires exactly once per
/// crossing of the consecutive-failure threshold; `on_recovered` fires
/// exactly once per subsequent successful probe.
pub struct HealthCallbacks {
    pub on_check: Box<dyn Fn(&HealthCheckResult) + Send + Sync>,
    pub on_unhealthy: Box<dyn Fn(u32, &HealthCheckResult) + Send + Sync>,
    pub on_recovered: Box<dyn Fn(&HealthCheckResult) + Send + Sync>,
}

#[derive(Default)]
struct ProbeBookkeeping {
    consecutive_failures: u32,
    above_threshold: bool,
}

/// Periodically pings one session handle on a dedicated thread.
///
/// The first probe runs immediately on [`start`](HealthMonitor::start), then
/// every `interval`. Probes never overlap: the worker thread runs them one
/// after another, and [`probe_now`](HealthMonitor::probe_now) serialises with
/// the worker through the probe lock.
pub struct HealthMonitor {
    server: ServerId,
    config: HealthMonitorConfig,
    callbacks: Arc<HealthCallbacks>,
    session: Arc<Mutex<Option<Arc<dyn SessionHandle>>>>,
    bookkeeping: Arc<Mutex<ProbeBookkeeping>>,
    // Held for the duration of each probe so checks cannot overlap.
    probe_lock: Arc<Mutex<()>>,
    worker: Mutex<Option<StartedThreadContext>>,
}

impl HealthMonitor {
    pub fn new(server: ServerId, config: HealthMonitorConfig, callbacks: HealthCallbacks) -> Self {
        Self {
            server,
            config,
            callbacks: Arc::new(callbacks),
            session: Arc::default(),
            bookkeeping: Arc::default(),
            probe_lock: Arc::default(),
            worker: Mutex::new(None),
        }
    }

    /// Swaps the probed session. `None` leaves subsequent probes failing
    /// with [`SessionError::NotConnected`] until a session is set again.
    pub fn set_session(&self, session: Option<Arc<dyn SessionHandle>>) {
        *self.session.lock().expect("session slot lock poisoned") = session;
    }

    /// Starts the periodic prober. A second start without a stop in between
    /// is ignored.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if worker.is_some() {
            warn!(server = %self.server, "health monitor already running");
            return;
        }

        let session = self.session.clone();
        let bookkeeping = self.bookkeeping.clone();
        let probe_lock = self.probe_lock.clone();
        let callbacks = self.callbacks.clone();
        let config = self.config;
        let server = self.server.clone();

        let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
            Self::run_probe(&server, &config, &session, &bookkeeping, &probe_lock, &callbacks);
            if stop_consumer.is_cancelled(config.interval) {
                break;
            }
        };

        *worker = Some(
            NotStartedThreadContext::new(format!("{} health monitor", self.server), callback)
                .start(),
        );
    }

    /// Cancels the schedule and waits for an in-flight probe to resolve.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .expect("worker lock poisoned")
            .take();
        if let Some(worker) = worker {
            let name = worker.thread_name().to_string();
            if let Err(err) = worker.stop_blocking() {
                error!(server = %self.server, %err, "error stopping '{name}'");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("worker lock poisoned").is_some()
    }

    pub fn reset_failure_count(&self) {
        let mut bookkeeping = self.bookkeeping.lock().expect("bookkeeping lock poisoned");
        bookkeeping.consecutive_failures = 0;
        bookkeeping.above_threshold = false;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.bookkeeping
            .lock()
            .expect("bookkeeping lock poisoned")
            .consecutive_failures
    }

    /// Runs a single probe on the caller's thread, outside the schedule.
    pub fn probe_now(&self) -> HealthCheckResult {
        Self::run_probe(
            &self.server,
            &self.config,
            &self.session,
            &self.bookkeeping,
            &self.probe_lock,
            &self.callbacks,
        )
    }

    fn run_probe(
        server: &ServerId,
        config: &HealthMonitorConfig,
        session: &Mutex<Option<Arc<dyn SessionHandle>>>,
        bookkeeping: &Mutex<ProbeBookkeeping>,
        probe_lock: &Mutex<()>,
        callbacks: &HealthCallbacks,
    ) -> HealthCheckResult {
        let _probing = probe_lock.lock().expect("probe lock poisoned");

        let current = session
            .lock()
            .expect("session slot lock poisoned")
            .clone();
        let started = Instant::now();
        let outcome = match current {
            Some(session) => session.ping(config.timeout),
            None => Err(SessionError::NotConnected),
        };
        let result = HealthCheckResult {
            healthy: outcome.is_ok(),
            latency: started.elapsed(),
            error: outcome.err().map(|err| err.to_string()),
            timestamp: SystemTime::now(),
        };

        if result.healthy {
            let recovered = {
                let mut bookkeeping = bookkeeping.lock().expect("bookkeeping lock poisoned");
                let recovered = bookkeeping.above_threshold;
                bookkeeping.consecutive_failures = 0;
                bookkeeping.above_threshold = false;
                recovered
            };
            (callbacks.on_check)(&result);
            if recovered {
                debug!(%server, "session recovered");
                (callbacks.on_recovered)(&result);
            }
        } else {
            let (failures, first_crossing) = {
                let mut bookkeeping = bookkeeping.lock().expect("bookkeeping lock poisoned");
                bookkeeping.consecutive_failures += 1;
                let failures = bookkeeping.consecutive_failures;
                let first_crossing =
                    failures == config.unhealthy_threshold && !bookkeeping.above_threshold;
                if failures >= config.unhealthy_threshold {
                    bookkeeping.above_threshold = true;
                }
                (failures, first_crossing)
            };
            (callbacks.on_check)(&result);
            if first_crossing {
                debug!(%server, failures, "consecutive failure threshold crossed");
                (callbacks.on_unhealthy)(failures, &result);
            }
        }

        result
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
