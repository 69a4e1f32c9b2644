use super::config::{validate_connection, FleetConfig, LifecyclePolicy, ServerConfig};
use super::error::FleetError;
use super::server_id::ServerId;
use crate::event::broadcaster::bounded::BoundedBroadcast;
use crate::event::channel::EventConsumer;
use crate::event::{FleetEvent, ServerEvent, ServerEventKind};
use crate::server::lifecycle::ServerLifecycle;
use crate::server::status::ServerStatus;
use crate::session::{SessionFactory, SessionHandle};
use crate::utils::threads::spawn_named_thread;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

/// One row of the fleet state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub name: ServerId,
    pub status: ServerStatus,
    pub healthy: bool,
    pub time_in_status: Duration,
    pub pid: Option<u32>,
    pub last_latency_ms: Option<u64>,
    pub restart_attempts: u32,
    pub error: Option<String>,
}

/// Supervises a fleet of server lifecycles keyed by name.
///
/// Every lifecycle publishes into the supervisor's lifecycle channel, so one
/// subscription observes the whole fleet. Per-server operations delegate to
/// the lifecycle; only structural errors (unknown name, duplicate add,
/// malformed config) surface as `Result`s.
pub struct FleetSupervisor {
    servers: Mutex<HashMap<ServerId, (ServerLifecycle, bool)>>,
    defaults: super::config::LifecycleOverrides,
    session_factory: Arc<dyn SessionFactory>,
    server_events: BoundedBroadcast<ServerEvent>,
    fleet_events: BoundedBroadcast<FleetEvent>,
    started: AtomicBool,
}

impl FleetSupervisor {
    /// Validates the configuration and builds the fleet. No server is
    /// started yet.
    pub fn new(
        config: FleetConfig,
        session_factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, FleetError> {
        config.validate()?;

        let supervisor = Self {
            servers: Mutex::default(),
            defaults: config.defaults.clone(),
            session_factory,
            server_events: BoundedBroadcast::default(),
            fleet_events: BoundedBroadcast::default(),
            started: AtomicBool::new(false),
        };
        for server_config in config.servers {
            supervisor.insert_lifecycle(server_config)?;
        }
        Ok(supervisor)
    }

    fn insert_lifecycle(&self, config: ServerConfig) -> Result<(), FleetError> {
        let mut servers = self.servers.lock().expect("server map lock poisoned");
        if servers.contains_key(&config.name) {
            return Err(FleetError::DuplicateServer(config.name.to_string()));
        }
        let policy = LifecyclePolicy::resolve(&self.defaults, &config.lifecycle);
        let lifecycle = ServerLifecycle::new(
            config.name.clone(),
            config.connection,
            policy,
            self.session_factory.clone(),
            self.server_events.clone(),
        );
        servers.insert(config.name, (lifecycle, config.auto_start));
        Ok(())
    }

    /// Starts every auto-start server in parallel with settled semantics:
    /// individual failures surface as events and never abort the others.
    /// Emits `manager:ready` once all start attempts have resolved.
    /// Idempotent while the fleet is running.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("fleet already started");
            return;
        }
        info!("starting fleet");

        let to_start: Vec<ServerLifecycle> = {
            let servers = self.servers.lock().expect("server map lock poisoned");
            servers
                .values()
                .filter(|(_, auto_start)| *auto_start)
                .map(|(lifecycle, _)| lifecycle.clone())
                .collect()
        };

        let handles: Vec<_> = to_start
            .into_iter()
            .map(|lifecycle| {
                spawn_named_thread(format!("{} start", lifecycle.id()), move || {
                    lifecycle.start()
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("server start thread panicked");
            }
        }

        let server_count = self.servers.lock().expect("server map lock poisoned").len();
        info!(server_count, "fleet ready");
        self.fleet_events.broadcast(FleetEvent::Ready {
            server_count,
            timestamp: SystemTime::now(),
        });
    }

    /// Stops every server in parallel, then emits `manager:shutdown`.
    /// Stopping an already stopped server is a no-op, so repeated calls are
    /// harmless.
    pub fn shutdown(&self) {
        info!("shutting down fleet");
        let to_stop: Vec<ServerLifecycle> = {
            let servers = self.servers.lock().expect("server map lock poisoned");
            servers
                .values()
                .map(|(lifecycle, _)| lifecycle.clone())
                .collect()
        };

        let handles: Vec<_> = to_stop
            .into_iter()
            .map(|lifecycle| {
                spawn_named_thread(format!("{} stop", lifecycle.id()), move || {
                    lifecycle.stop()
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("server stop thread panicked");
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!("fleet shut down");
        self.fleet_events.broadcast(FleetEvent::Shutdown {
            graceful: true,
            timestamp: SystemTime::now(),
        });
    }

    pub fn start_server(&self, name: &str) -> Result<(), FleetError> {
        self.lifecycle(name)?.start();
        Ok(())
    }

    pub fn stop_server(&self, name: &str) -> Result<(), FleetError> {
        self.lifecycle(name)?.stop();
        Ok(())
    }

    pub fn restart_server(&self, name: &str) -> Result<(), FleetError> {
        self.lifecycle(name)?.restart();
        Ok(())
    }

    /// Adds a server at runtime. The new server stays latent until
    /// `start_server` is called for it.
    pub fn add_server(&self, config: ServerConfig) -> Result<(), FleetError> {
        validate_connection(&config.connection, "connection")?;
        self.insert_lifecycle(config)
    }

    /// Removes a server from the fleet, stopping it first unless it is
    /// already stopped or disconnected.
    pub fn remove_server(&self, name: &str) -> Result<(), FleetError> {
        let (lifecycle, _) = {
            let mut servers = self.servers.lock().expect("server map lock poisoned");
            let key = servers
                .keys()
                .find(|id| id.get() == name)
                .cloned()
                .ok_or_else(|| FleetError::UnknownServer(name.to_string()))?;
            servers.remove(&key).expect("key just found")
        };
        if !matches!(
            lifecycle.status(),
            ServerStatus::Stopped | ServerStatus::Disconnected
        ) {
            lifecycle.stop();
        }
        Ok(())
    }

    /// A consistent snapshot of per-server summaries.
    pub fn state(&self) -> Vec<ServerSummary> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        let mut summaries: Vec<ServerSummary> = servers
            .values()
            .map(|(lifecycle, _)| lifecycle.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.get().cmp(b.name.get()));
        summaries
    }

    /// Emits the current fleet state on the fleet channel.
    pub fn snapshot(&self) {
        self.fleet_events.broadcast(FleetEvent::StateSnapshot {
            servers: self.state(),
            timestamp: SystemTime::now(),
        });
    }

    /// Session handles of every currently connected server. Degraded and
    /// quiescent servers are excluded.
    pub fn session_handles(&self) -> HashMap<ServerId, Arc<dyn SessionHandle>> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        servers
            .iter()
            .filter(|(_, (lifecycle, _))| lifecycle.status() == ServerStatus::Connected)
            .filter_map(|(id, (lifecycle, _))| {
                lifecycle
                    .session_handle()
                    .map(|session| (id.clone(), session))
            })
            .collect()
    }

    /// Wildcard subscription to every lifecycle event of the fleet.
    pub fn subscribe_server_events(&self) -> EventConsumer<ServerEvent> {
        self.server_events.subscribe()
    }

    /// Subscription to a subset of lifecycle event kinds.
    pub fn subscribe_server_events_to(
        &self,
        kinds: &[ServerEventKind],
    ) -> EventConsumer<ServerEvent> {
        self.server_events.subscribe_to(kinds)
    }

    /// Wildcard subscription to fleet-level events.
    pub fn subscribe_fleet_events(&self) -> EventConsumer<FleetEvent> {
        self.fleet_events.subscribe()
    }

    fn lifecycle(&self, name: &str) -> Result<ServerLifecycle, FleetError> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        servers
            .iter()
            .find(|(id, _)| id.get() == name)
            .map(|(_, (lifecycle, _))| lifecycle.clone())
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FleetEventKind, ServerEventDetail};
    use crate::fleet::config::{
        ConfigError, ConnectionConfig, HttpConnection, LifecycleOverrides, StdioConnection,
    };
    use crate::session::{SessionError, Transport};
    use assert_matches::assert_matches;
    use std::time::Instant;

    struct OkSession;

    impl SessionHandle for OkSession {
        fn handshake(&self) -> Result<(), SessionError> {
            Ok(())
        }

        fn ping(&self, _timeout: Duration) -> Result<(), SessionError> {
            Ok(())
        }

        fn close(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct OkFactory;

    impl SessionFactory for OkFactory {
        fn create(&self, _transport: Transport) -> Result<Arc<dyn SessionHandle>, SessionError> {
            Ok(Arc::new(OkSession))
        }
    }

    fn http_server(name: &str, auto_start: bool) -> ServerConfig {
        ServerConfig {
            name: ServerId::new(name).unwrap(),
            connection: ConnectionConfig::Http(HttpConnection {
                // The test factory never touches the network.
                url: format!("http://127.0.0.1:6/{name}"),
                headers: Default::default(),
            }),
            lifecycle: LifecycleOverrides::default(),
            auto_start,
        }
    }

    fn fleet(servers: Vec<ServerConfig>) -> FleetSupervisor {
        FleetSupervisor::new(
            FleetConfig {
                defaults: LifecycleOverrides::default(),
                servers,
            },
            Arc::new(OkFactory),
        )
        .unwrap()
    }

    fn wait_for_fleet_event(
        events: &EventConsumer<FleetEvent>,
        kind: FleetEventKind,
    ) -> FleetEvent {
        use crate::event::broadcaster::bounded::BroadcastEvent;
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(event) = events.as_ref().recv_timeout(Duration::from_millis(100)) {
                if event.kind() == kind {
                    return event;
                }
            }
        }
        panic!("timed out waiting for {kind:?}");
    }

    fn status_of(supervisor: &FleetSupervisor, name: &str) -> ServerStatus {
        supervisor
            .state()
            .into_iter()
            .find(|summary| summary.name.get() == name)
            .unwrap()
            .status
    }

    #[test]
    fn start_connects_auto_start_servers_and_emits_ready() {
        let supervisor = fleet(vec![
            http_server("alpha", true),
            http_server("beta", true),
            http_server("latent", false),
        ]);
        let fleet_events = supervisor.subscribe_fleet_events();

        supervisor.start();

        let ready = wait_for_fleet_event(&fleet_events, FleetEventKind::Ready);
        assert_matches!(ready, FleetEvent::Ready { server_count: 3, .. });

        assert_eq!(status_of(&supervisor, "alpha"), ServerStatus::Connected);
        assert_eq!(status_of(&supervisor, "beta"), ServerStatus::Connected);
        assert_eq!(status_of(&supervisor, "latent"), ServerStatus::Disconnected);

        let handles = supervisor.session_handles();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains_key(&ServerId::new("alpha").unwrap()));
        assert!(handles.contains_key(&ServerId::new("beta").unwrap()));

        supervisor.shutdown();
    }

    #[test]
    fn shutdown_stops_every_server_and_emits_shutdown() {
        let supervisor = fleet(vec![http_server("alpha", true), http_server("beta", true)]);
        let fleet_events = supervisor.subscribe_fleet_events();

        supervisor.start();
        wait_for_fleet_event(&fleet_events, FleetEventKind::Ready);

        supervisor.shutdown();

        let shutdown = wait_for_fleet_event(&fleet_events, FleetEventKind::Shutdown);
        assert_matches!(shutdown, FleetEvent::Shutdown { graceful: true, .. });
        for summary in supervisor.state() {
            assert_eq!(summary.status, ServerStatus::Stopped);
        }
        assert!(supervisor.session_handles().is_empty());
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let supervisor = fleet(vec![http_server("alpha", true)]);
        let fleet_events = supervisor.subscribe_fleet_events();

        supervisor.start();
        wait_for_fleet_event(&fleet_events, FleetEventKind::Ready);

        supervisor.start();
        std::thread::sleep(Duration::from_millis(150));
        assert!(fleet_events.as_ref().try_recv().is_err());

        supervisor.shutdown();
    }

    #[test]
    fn per_server_operations_delegate() {
        let supervisor = fleet(vec![http_server("alpha", false)]);
        let server_events = supervisor.subscribe_server_events();

        supervisor.start_server("alpha").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while status_of(&supervisor, "alpha") != ServerStatus::Connected {
            assert!(Instant::now() < deadline, "server never connected");
            std::thread::sleep(Duration::from_millis(10));
        }

        supervisor.restart_server("alpha").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            assert!(Instant::now() < deadline, "restart never succeeded");
            if let Ok(event) = server_events.as_ref().recv_timeout(Duration::from_secs(1)) {
                if matches!(event.detail, ServerEventDetail::RestartSucceeded { .. }) {
                    break;
                }
            }
        }

        supervisor.stop_server("alpha").unwrap();
        assert_eq!(status_of(&supervisor, "alpha"), ServerStatus::Stopped);
    }

    #[test]
    fn unknown_names_are_structural_errors() {
        let supervisor = fleet(vec![]);
        assert_eq!(
            supervisor.start_server("ghost"),
            Err(FleetError::UnknownServer("ghost".to_string()))
        );
        assert_eq!(
            supervisor.stop_server("ghost"),
            Err(FleetError::UnknownServer("ghost".to_string()))
        );
        assert_eq!(
            supervisor.restart_server("ghost"),
            Err(FleetError::UnknownServer("ghost".to_string()))
        );
        assert_eq!(
            supervisor.remove_server("ghost"),
            Err(FleetError::UnknownServer("ghost".to_string()))
        );
    }

    #[test]
    fn add_server_rejects_duplicates_and_stays_latent() {
        let supervisor = fleet(vec![http_server("alpha", true)]);

        assert_eq!(
            supervisor.add_server(http_server("alpha", true)),
            Err(FleetError::DuplicateServer("alpha".to_string()))
        );

        supervisor.add_server(http_server("beta", true)).unwrap();
        assert_eq!(status_of(&supervisor, "beta"), ServerStatus::Disconnected);

        supervisor.start_server("beta").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while status_of(&supervisor, "beta") != ServerStatus::Connected {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn add_server_validates_the_connection() {
        let supervisor = fleet(vec![]);
        let broken = ServerConfig {
            name: ServerId::new("broken").unwrap(),
            connection: ConnectionConfig::Stdio(StdioConnection {
                command: "".to_string(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            }),
            lifecycle: LifecycleOverrides::default(),
            auto_start: true,
        };
        assert_matches!(
            supervisor.add_server(broken),
            Err(FleetError::Config(ConfigError::InvalidField { path, .. })) => {
                assert_eq!(path, "connection.stdio.command");
            }
        );
    }

    #[test]
    fn remove_server_stops_and_forgets() {
        let supervisor = fleet(vec![http_server("alpha", true)]);
        supervisor.start();

        supervisor.remove_server("alpha").unwrap();

        assert!(supervisor.state().is_empty());
        assert_eq!(
            supervisor.start_server("alpha"),
            Err(FleetError::UnknownServer("alpha".to_string()))
        );
    }

    #[test]
    fn snapshot_emits_sorted_fleet_state() {
        let supervisor = fleet(vec![http_server("zulu", true), http_server("alpha", true)]);
        let fleet_events = supervisor.subscribe_fleet_events();
        supervisor.start();
        wait_for_fleet_event(&fleet_events, FleetEventKind::Ready);

        supervisor.snapshot();

        let snapshot = wait_for_fleet_event(&fleet_events, FleetEventKind::StateSnapshot);
        assert_matches!(snapshot, FleetEvent::StateSnapshot { servers, .. } => {
            let names: Vec<&str> = servers.iter().map(|s| s.name.get()).collect();
            assert_eq!(names, vec!["alpha", "zulu"]);
            assert!(servers.iter().all(|s| s.status == ServerStatus::Connected));
        });

        supervisor.shutdown();
    }

    #[test]
    fn filtered_subscription_only_sees_selected_kinds() {
        let supervisor = fleet(vec![http_server("alpha", true)]);
        let connected_only =
            supervisor.subscribe_server_events_to(&[ServerEventKind::Connected]);

        supervisor.start();

        let event = connected_only
            .as_ref()
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        assert_matches!(event.detail, ServerEventDetail::Connected { .. });

        supervisor.shutdown();
        std::thread::sleep(Duration::from_millis(150));
        // The stop events never reach this subscriber.
        assert!(connected_only.as_ref().try_recv().is_err());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = FleetConfig {
            defaults: LifecycleOverrides::default(),
            servers: vec![http_server("twin", true), http_server("twin", true)],
        };
        let result = FleetSupervisor::new(config, Arc::new(OkFactory));
        assert_matches!(
            result.err(),
            Some(FleetError::Config(ConfigError::DuplicateName(name))) => {
                assert_eq!(name, "twin");
            }
        );
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn shutdown_kills_stdio_subordinates_within_the_deadline() {
        use nix::{sys::signal, unistd::Pid};

        let stdio = ServerConfig {
            name: ServerId::new("sleeper").unwrap(),
            connection: ConnectionConfig::Stdio(StdioConnection {
                command: "sleep".to_string(),
                args: vec!["30".to_string()],
                env: Default::default(),
                cwd: None,
            }),
            lifecycle: LifecycleOverrides {
                shutdown_timeout_ms: Some(2_000),
                ..Default::default()
            },
            auto_start: true,
        };
        let supervisor = fleet(vec![stdio]);
        let fleet_events = supervisor.subscribe_fleet_events();

        supervisor.start();
        wait_for_fleet_event(&fleet_events, FleetEventKind::Ready);
        let pid = supervisor.state()[0].pid.unwrap();
        assert!(signal::kill(Pid::from_raw(pid as i32), None).is_ok());

        let begun = Instant::now();
        supervisor.shutdown();
        assert!(begun.elapsed() < Duration::from_secs(10));

        wait_for_fleet_event(&fleet_events, FleetEventKind::Shutdown);
        assert_eq!(supervisor.state()[0].status, ServerStatus::Stopped);
        assert!(signal::kill(Pid::from_raw(pid as i32), None).is_err());
    }
}
