use super::backoff::RestartBackoff;
use super::state::{ServerState, ServerStateSnapshot};
use super::status::ServerStatus;
use crate::command::executable_data::ExecutableData;
use crate::command::runner::{ExitCallback, ProcessExit, ProcessRunner};
use crate::context::Context;
use crate::event::broadcaster::bounded::BoundedBroadcast;
use crate::event::{RestartReason, ServerEvent, ServerEventDetail};
use crate::fleet::config::{ConnectionConfig, LifecyclePolicy};
use crate::fleet::supervisor::ServerSummary;
use crate::fleet::ServerId;
use crate::health::monitor::{HealthCallbacks, HealthMonitor, HealthMonitorConfig};
use crate::health::HealthCheckResult;
use crate::http::endpoint::HttpEndpoint;
use crate::session::{SessionFactory, SessionHandle, Transport};
use crate::utils::threads::spawn_named_thread;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

const STATE_LOCK: &str = "server state lock poisoned";

/// The state machine of one managed server.
///
/// Owns the transport (a child process or an HTTP endpoint), the session
/// handle, the health monitor and the restart loop, and emits every state
/// transition on the lifecycle event channel. All state mutations are
/// serialised behind one lock; blocking work (process shutdown, backoff
/// sleeps, connects) happens outside it.
///
/// Cloning is cheap and shares the same server.
#[derive(Clone)]
pub struct ServerLifecycle {
    shared: Arc<LifecycleShared>,
}

struct LifecycleShared {
    id: ServerId,
    connection: ConnectionConfig,
    policy: LifecyclePolicy,
    backoff: RestartBackoff,
    session_factory: Arc<dyn SessionFactory>,
    events: BoundedBroadcast<ServerEvent>,
    state: Mutex<ServerState>,
    restart_in_flight: AtomicBool,
    // Interrupts backoff sleeps when a stop is requested.
    stop_ctx: Context<bool>,
    monitor: HealthMonitor,
}

impl ServerLifecycle {
    pub fn new(
        id: ServerId,
        connection: ConnectionConfig,
        policy: LifecyclePolicy,
        session_factory: Arc<dyn SessionFactory>,
        events: BoundedBroadcast<ServerEvent>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<LifecycleShared>| {
            let monitor = HealthMonitor::new(
                id.clone(),
                HealthMonitorConfig {
                    interval: policy.health_check_interval,
                    timeout: policy.health_check_timeout,
                    unhealthy_threshold: policy.unhealthy_threshold,
                },
                monitor_callbacks(weak.clone()),
            );
            LifecycleShared {
                id,
                connection,
                backoff: RestartBackoff::new(
                    policy.restart_backoff_base,
                    policy.restart_backoff_max,
                ),
                policy,
                session_factory,
                events,
                state: Mutex::new(ServerState::new()),
                restart_in_flight: AtomicBool::new(false),
                stop_ctx: Context::new(),
                monitor,
            }
        });
        Self { shared }
    }

    pub fn id(&self) -> &ServerId {
        &self.shared.id
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.state.lock().expect(STATE_LOCK).status
    }

    pub fn state_snapshot(&self) -> ServerStateSnapshot {
        self.shared.state.lock().expect(STATE_LOCK).snapshot()
    }

    /// The active session handle; `None` unless connected or unhealthy.
    pub fn session_handle(&self) -> Option<Arc<dyn SessionHandle>> {
        let state = self.shared.state.lock().expect(STATE_LOCK);
        state.status.is_engaged().then(|| state.session.clone()).flatten()
    }

    pub fn summary(&self) -> ServerSummary {
        let state = self.shared.state.lock().expect(STATE_LOCK);
        ServerSummary {
            name: self.shared.id.clone(),
            status: state.status,
            healthy: state.status == ServerStatus::Connected
                && state
                    .last_health_check
                    .as_ref()
                    .map(|check| check.healthy)
                    .unwrap_or(true),
            time_in_status: state.status_changed_instant.elapsed(),
            pid: state.pid,
            last_latency_ms: state
                .last_health_check
                .as_ref()
                .map(HealthCheckResult::latency_ms),
            restart_attempts: state.restart_stats.attempts,
            error: state.last_error.clone(),
        }
    }

    /// Enters the connect path. Legal from `disconnected`, `failed` and
    /// `stopped`; logged and ignored anywhere else. Blocks until the connect
    /// attempt resolves; the outcome surfaces as events.
    pub fn start(&self) {
        do_start(&self.shared);
    }

    /// Requests a stop: arrests the health monitor and any restart loop,
    /// closes the session and transport, stops the child process under the
    /// shutdown deadline and transitions to `stopped`.
    pub fn stop(&self) {
        do_stop(&self.shared);
    }

    /// Manual restart. Rejected with a warning on a stopped server.
    pub fn restart(&self) {
        do_restart(&self.shared);
    }

    /// Reports a transport-level disconnect observed outside the core (an
    /// HTTP-side session termination). Restarts when the policy allows it,
    /// otherwise transitions to `disconnected`.
    pub fn notify_disconnected(&self) {
        do_notify_disconnected(&self.shared);
    }

    #[cfg(test)]
    pub(crate) fn health_monitor_running(&self) -> bool {
        self.shared.monitor.is_running()
    }
}

fn monitor_callbacks(weak: Weak<LifecycleShared>) -> HealthCallbacks {
    let on_check = weak.clone();
    let on_unhealthy = weak.clone();
    let on_recovered = weak;
    HealthCallbacks {
        on_check: Box::new(move |result| {
            if let Some(shared) = on_check.upgrade() {
                shared.record_health_check(result);
            }
        }),
        on_unhealthy: Box::new(move |failures, result| {
            if let Some(shared) = on_unhealthy.upgrade() {
                handle_unhealthy(&shared, failures, result);
            }
        }),
        on_recovered: Box::new(move |result| {
            if let Some(shared) = on_recovered.upgrade() {
                shared.handle_recovered(result);
            }
        }),
    }
}

impl LifecycleShared {
    /// Emits an event on the lifecycle channel. Runs under the state lock so
    /// per-server emission order is total; timestamps are clamped to stay
    /// non-decreasing per server.
    fn emit_locked(&self, state: &mut ServerState, detail: ServerEventDetail) {
        let now = SystemTime::now();
        let timestamp = if now < state.last_event_at {
            state.last_event_at
        } else {
            now
        };
        state.last_event_at = timestamp;
        self.events.broadcast(ServerEvent {
            server: self.id.clone(),
            timestamp,
            detail,
        });
    }

    /// Applies a status transition if legal, emitting `status-changed`.
    /// Illegal transitions are rejected in place with a warning; once a stop
    /// is requested only the transition into `stopped` is accepted.
    fn transition_locked(&self, state: &mut ServerState, to: ServerStatus) -> bool {
        let from = state.status;
        if state.stop_requested && to != ServerStatus::Stopped {
            debug!(server = %self.id, %from, %to, "transition dropped, stop requested");
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(server = %self.id, %from, %to, "rejected illegal status transition");
            return false;
        }
        state.status = to;
        state.status_changed_at = SystemTime::now();
        state.status_changed_instant = Instant::now();
        self.emit_locked(
            state,
            ServerEventDetail::StatusChanged {
                previous: from,
                new: to,
            },
        );
        true
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().expect(STATE_LOCK).stop_requested
    }

    /// Closes the session and releases the transport, swallowing errors.
    /// Bumps the generation so the released process's exit watcher reports
    /// into the void instead of raising a crash.
    fn teardown_transport(&self) {
        let (session, runner, endpoint) = {
            let mut state = self.state.lock().expect(STATE_LOCK);
            state.generation += 1;
            state.pid = None;
            (
                state.session.take(),
                state.runner.take(),
                state.endpoint.take(),
            )
        };
        if let Some(session) = session {
            if let Err(err) = session.close() {
                debug!(server = %self.id, %err, "error closing session");
            }
        }
        if let Some(runner) = runner {
            if let Err(err) = runner.stop() {
                warn!(server = %self.id, %err, "error stopping subordinate process");
            }
        }
        if let Some(endpoint) = endpoint {
            endpoint.mark_disconnected();
        }
    }

    fn disarm_monitor(&self) {
        self.monitor.stop();
        self.monitor.set_session(None);
    }

    /// Bookkeeping for every probe outcome.
    fn record_health_check(&self, result: &HealthCheckResult) {
        let mut state = self.state.lock().expect(STATE_LOCK);
        if state.stop_requested || !state.status.is_engaged() {
            return;
        }
        state.last_health_check = Some(result.clone());
        state.consecutive_health_check_failures = if result.healthy {
            0
        } else {
            state.consecutive_health_check_failures + 1
        };
    }

    fn handle_recovered(&self, result: &HealthCheckResult) {
        let mut state = self.state.lock().expect(STATE_LOCK);
        if state.status != ServerStatus::Unhealthy {
            debug!(server = %self.id, status = %state.status, "recovery ignored in current status");
            return;
        }
        info!(server = %self.id, "server recovered");
        self.emit_locked(
            &mut state,
            ServerEventDetail::Healthy {
                check: result.clone(),
            },
        );
        self.transition_locked(&mut state, ServerStatus::Connected);
    }
}

fn do_start(shared: &Arc<LifecycleShared>) {
    {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        match state.status {
            ServerStatus::Disconnected | ServerStatus::Failed | ServerStatus::Stopped => {}
            status => {
                debug!(server = %shared.id, %status, "start ignored in current status");
                return;
            }
        }
        state.stop_requested = false;
        info!(server = %shared.id, "starting server");
        shared.emit_locked(&mut state, ServerEventDetail::Connecting);
        shared.transition_locked(&mut state, ServerStatus::Connecting);
    }
    shared.stop_ctx.reset();

    match try_connect(shared) {
        Ok(pid) => {
            on_connect_success(shared, pid);
        }
        Err(error) => {
            let mut state = shared.state.lock().expect(STATE_LOCK);
            state.last_error = Some(error.clone());
            warn!(server = %shared.id, %error, "connection failed");
            shared.emit_locked(&mut state, ServerEventDetail::ConnectionFailed { error });
            shared.transition_locked(&mut state, ServerStatus::Failed);
        }
    }
}

/// Materialises the transport and establishes the session. On failure the
/// partially established transport is closed and the error message returned.
fn try_connect(shared: &Arc<LifecycleShared>) -> Result<Option<u32>, String> {
    match &shared.connection {
        ConnectionConfig::Stdio(stdio) => {
            let mut exec = ExecutableData::new(stdio.command.clone())
                .with_args(stdio.args.clone())
                .with_env(stdio.env.clone());
            if let Some(cwd) = &stdio.cwd {
                exec = exec.with_cwd(cwd.clone());
            }

            let generation = {
                let mut state = shared.state.lock().expect(STATE_LOCK);
                state.generation += 1;
                state.generation
            };
            let weak = Arc::downgrade(shared);
            let on_exit: ExitCallback = Box::new(move |exit| {
                if let Some(shared) = weak.upgrade() {
                    handle_process_exit(&shared, generation, exit);
                }
            });

            let (runner, pipes) = ProcessRunner::spawn(
                &shared.id,
                &exec,
                shared.policy.shutdown_timeout,
                on_exit,
            )
            .map_err(|err| format!("failed to launch `{}`: {err}", stdio.command))?;

            let pid = runner.spawned_pid();
            {
                let mut state = shared.state.lock().expect(STATE_LOCK);
                state.pid = Some(pid);
                state.runner = Some(runner);
            }

            establish_session(shared, Transport::Stdio { pid, pipes })
                .map(|()| Some(pid))
                .inspect_err(|_| shared.teardown_transport())
        }
        ConnectionConfig::Http(http) => {
            let endpoint = Arc::new(HttpEndpoint::new(http.url.clone(), http.headers.clone()));
            let url = endpoint.validate().map_err(|err| err.to_string())?;
            {
                let mut state = shared.state.lock().expect(STATE_LOCK);
                state.generation += 1;
                state.endpoint = Some(endpoint.clone());
            }

            establish_session(
                shared,
                Transport::Http {
                    url,
                    headers: http.headers.clone(),
                },
            )
            .map(|()| {
                endpoint.mark_connected();
                None
            })
            .inspect_err(|_| shared.teardown_transport())
        }
    }
}

fn establish_session(shared: &Arc<LifecycleShared>, transport: Transport) -> Result<(), String> {
    let session = shared
        .session_factory
        .create(transport)
        .map_err(|err| err.to_string())?;
    session.handshake().map_err(|err| err.to_string())?;
    shared.state.lock().expect(STATE_LOCK).session = Some(session);
    Ok(())
}

fn on_connect_success(shared: &Arc<LifecycleShared>, pid: Option<u32>) {
    let session = {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        if state.stop_requested {
            drop(state);
            shared.teardown_transport();
            return;
        }
        state.restart_stats.attempts = 0;
        info!(server = %shared.id, ?pid, "server connected");
        shared.emit_locked(&mut state, ServerEventDetail::Connected { pid });
        shared.transition_locked(&mut state, ServerStatus::Connected);
        state.session.clone()
    };

    if shared.policy.health_check_enabled {
        shared.monitor.reset_failure_count();
        shared.monitor.set_session(session);
        shared.monitor.start();
    }
}

/// Reaction to the exit watcher of a stdio subordinate. Exits of superseded
/// processes and exits during a requested stop are consumed silently.
fn handle_process_exit(shared: &Arc<LifecycleShared>, generation: u64, exit: ProcessExit) {
    let will_restart = {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        if state.generation != generation {
            debug!(server = %shared.id, "ignoring exit of a superseded process");
            return;
        }
        if state.stop_requested {
            debug!(server = %shared.id, "expected exit during stop");
            return;
        }
        if !state.status.is_engaged() {
            // An exit mid-connect surfaces through the connect path itself.
            debug!(server = %shared.id, status = %state.status, "exit observed outside an engaged status");
            return;
        }
        let will_restart = shared.policy.auto_restart_enabled
            && state.restart_stats.attempts < shared.policy.max_restart_attempts;
        warn!(server = %shared.id, exit = exit.describe(), will_restart, "server crashed");
        shared.emit_locked(
            &mut state,
            ServerEventDetail::Crashed {
                exit_code: exit.code,
                signal: exit.signal.clone(),
                will_restart,
            },
        );
        will_restart
    };

    shared.disarm_monitor();
    shared.teardown_transport();

    if will_restart {
        perform_restart(shared, RestartReason::Crashed);
    } else {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        state.last_error = Some(exit.describe());
        shared.transition_locked(&mut state, ServerStatus::Failed);
    }
}

fn handle_unhealthy(shared: &Arc<LifecycleShared>, failures: u32, result: &HealthCheckResult) {
    {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        if state.status != ServerStatus::Connected || state.stop_requested {
            debug!(server = %shared.id, status = %state.status, "unhealthy signal ignored in current status");
            return;
        }
        warn!(server = %shared.id, consecutive_failures = failures, "server is unhealthy");
        let last_check = state.last_health_check.clone().or(Some(result.clone()));
        shared.emit_locked(
            &mut state,
            ServerEventDetail::Unhealthy {
                consecutive_failures: failures,
                last_check,
            },
        );
        shared.transition_locked(&mut state, ServerStatus::Unhealthy);
    }

    if shared.policy.auto_restart_enabled {
        perform_restart(shared, RestartReason::Unhealthy);
    }
}

/// Kicks off the restart loop on its own named thread. A single restart may
/// be in flight per server; concurrent requests are rejected.
fn perform_restart(shared: &Arc<LifecycleShared>, reason: RestartReason) {
    if shared.restart_in_flight.swap(true, Ordering::SeqCst) {
        warn!(server = %shared.id, %reason, "restart already in progress");
        return;
    }
    if shared.stop_requested() {
        shared.restart_in_flight.store(false, Ordering::SeqCst);
        return;
    }

    let thread_shared = shared.clone();
    spawn_named_thread(format!("{} restart", shared.id), move || {
        run_restart_loop(&thread_shared, reason);
        thread_shared.restart_in_flight.store(false, Ordering::SeqCst);
    });
}

fn run_restart_loop(shared: &Arc<LifecycleShared>, reason: RestartReason) {
    shared.disarm_monitor();
    shared.teardown_transport();

    {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        if !shared.transition_locked(&mut state, ServerStatus::Restarting) {
            return;
        }
    }

    let max_attempts = shared.policy.max_restart_attempts;
    let mut attempt = shared
        .state
        .lock()
        .expect(STATE_LOCK)
        .restart_stats
        .attempts;

    while attempt < max_attempts {
        if shared.stop_requested() {
            return;
        }
        attempt += 1;
        {
            let mut state = shared.state.lock().expect(STATE_LOCK);
            state.restart_stats.attempts = attempt;
            state.restart_stats.last_attempt = Some(SystemTime::now());
            info!(server = %shared.id, attempt, max_attempts, %reason, "restarting server");
            shared.emit_locked(
                &mut state,
                ServerEventDetail::Restarting {
                    attempt,
                    max_attempts,
                    reason,
                },
            );
        }

        let delay = shared.backoff.delay(attempt);
        if !delay.is_zero() && shared.stop_ctx.wait_timeout(delay) {
            debug!(server = %shared.id, "restart cancelled during backoff");
            return;
        }
        if shared.stop_requested() {
            return;
        }

        {
            let mut state = shared.state.lock().expect(STATE_LOCK);
            shared.emit_locked(&mut state, ServerEventDetail::Connecting);
            if !shared.transition_locked(&mut state, ServerStatus::Connecting) {
                return;
            }
        }

        match try_connect(shared) {
            Ok(pid) => {
                if shared.stop_requested() {
                    shared.teardown_transport();
                    return;
                }
                on_connect_success(shared, pid);
                let mut state = shared.state.lock().expect(STATE_LOCK);
                state.restart_stats.last_success = Some(true);
                shared.emit_locked(
                    &mut state,
                    ServerEventDetail::RestartSucceeded {
                        attempts: attempt,
                        pid,
                    },
                );
                return;
            }
            Err(error) => {
                let mut state = shared.state.lock().expect(STATE_LOCK);
                state.last_error = Some(error.clone());
                warn!(server = %shared.id, attempt, %error, "restart attempt failed");
                shared.emit_locked(&mut state, ServerEventDetail::ConnectionFailed { error });
                if !shared.transition_locked(&mut state, ServerStatus::Restarting) {
                    return;
                }
            }
        }
    }

    if shared.stop_requested() {
        return;
    }
    let error = format!("Failed to restart after {attempt} attempts");
    let mut state = shared.state.lock().expect(STATE_LOCK);
    state.restart_stats.last_success = Some(false);
    state.last_error = Some(error.clone());
    warn!(server = %shared.id, attempts = attempt, "restart attempts exhausted");
    shared.emit_locked(
        &mut state,
        ServerEventDetail::RestartFailed {
            attempts: attempt,
            error,
        },
    );
    shared.transition_locked(&mut state, ServerStatus::Failed);
}

fn do_stop(shared: &Arc<LifecycleShared>) {
    let previous = {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        if state.status == ServerStatus::Stopped {
            debug!(server = %shared.id, "stop ignored, already stopped");
            return;
        }
        if state.stop_requested {
            debug!(server = %shared.id, "stop already in progress");
            return;
        }
        state.stop_requested = true;
        state.status
    };

    info!(server = %shared.id, "stopping server");
    shared.stop_ctx.cancel_all(true);
    shared.disarm_monitor();
    shared.teardown_transport();

    let graceful = previous.is_engaged();
    let mut state = shared.state.lock().expect(STATE_LOCK);
    shared.emit_locked(&mut state, ServerEventDetail::Stopped { graceful });
    shared.transition_locked(&mut state, ServerStatus::Stopped);
}

fn do_restart(shared: &Arc<LifecycleShared>) {
    {
        let state = shared.state.lock().expect(STATE_LOCK);
        if state.status == ServerStatus::Stopped {
            warn!(server = %shared.id, "restart ignored for a stopped server, call start instead");
            return;
        }
    }
    shared.monitor.reset_failure_count();
    shared
        .state
        .lock()
        .expect(STATE_LOCK)
        .consecutive_health_check_failures = 0;
    perform_restart(shared, RestartReason::Manual);
}

fn do_notify_disconnected(shared: &Arc<LifecycleShared>) {
    let will_restart = {
        let state = shared.state.lock().expect(STATE_LOCK);
        if state.status != ServerStatus::Connected || state.stop_requested {
            debug!(server = %shared.id, status = %state.status, "disconnect notification ignored");
            return;
        }
        shared.policy.auto_restart_enabled
            && state.restart_stats.attempts < shared.policy.max_restart_attempts
    };

    shared.disarm_monitor();
    shared.teardown_transport();

    if will_restart {
        perform_restart(shared, RestartReason::Crashed);
    } else {
        let mut state = shared.state.lock().expect(STATE_LOCK);
        shared.transition_locked(&mut state, ServerStatus::Disconnected);
    }
}
