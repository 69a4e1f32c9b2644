//! End-to-end exercise of the public API: YAML intake, fleet bring-up,
//! health-driven degradation and recovery, and graceful shutdown.

use server_control::event::{FleetEvent, ServerEventDetail, ServerEventKind};
use server_control::fleet::config::FleetConfig;
use server_control::fleet::supervisor::FleetSupervisor;
use server_control::server::status::ServerStatus;
use server_control::session::{SessionError, SessionFactory, SessionHandle, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct FlaggedSession {
    ping_healthy: Arc<AtomicBool>,
}

impl SessionHandle for FlaggedSession {
    fn handshake(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn ping(&self, _timeout: Duration) -> Result<(), SessionError> {
        if self.ping_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Ping("backend gone".to_string()))
        }
    }

    fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct FlaggedFactory {
    ping_healthy: Arc<AtomicBool>,
}

impl SessionFactory for FlaggedFactory {
    fn create(&self, _transport: Transport) -> Result<Arc<dyn SessionHandle>, SessionError> {
        Ok(Arc::new(FlaggedSession {
            ping_healthy: self.ping_healthy.clone(),
        }))
    }
}

const FLEET_YAML: &str = r#"
defaults:
  health_check_interval_ms: 25
  health_check_timeout_ms: 200
  unhealthy_threshold: 2
  restart_backoff_base_ms: 10
  restart_backoff_max_ms: 100
servers:
  - name: tools
    connection:
      http:
        url: http://127.0.0.1:6/tools
  - name: search
    connection:
      http:
        url: http://127.0.0.1:6/search
    lifecycle:
      health_check_enabled: false
"#;

#[test]
fn fleet_runs_through_degradation_and_shutdown() {
    let config = FleetConfig::from_yaml(FLEET_YAML).unwrap();
    let ping_healthy = Arc::new(AtomicBool::new(true));
    let supervisor = FleetSupervisor::new(
        config,
        Arc::new(FlaggedFactory {
            ping_healthy: ping_healthy.clone(),
        }),
    )
    .unwrap();

    let server_events = supervisor.subscribe_server_events();
    let fleet_events = supervisor.subscribe_fleet_events();

    supervisor.start();

    let ready = fleet_events
        .as_ref()
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert!(matches!(ready, FleetEvent::Ready { server_count: 2, .. }));

    let state = supervisor.state();
    assert!(state.iter().all(|s| s.status == ServerStatus::Connected));
    assert_eq!(supervisor.session_handles().len(), 2);

    // Degrade the shared backend; only `tools` runs health checks, so only
    // it reports unhealthy and restarts.
    ping_healthy.store(false, Ordering::SeqCst);
    let unhealthy = wait_for_server_event(&server_events, ServerEventKind::Unhealthy);
    assert_eq!(unhealthy.server.get(), "tools");

    ping_healthy.store(true, Ordering::SeqCst);
    let recovered = wait_for_server_event(&server_events, ServerEventKind::RestartSucceeded);
    assert_eq!(recovered.server.get(), "tools");

    supervisor.snapshot();
    let snapshot = wait_for_fleet_snapshot(&fleet_events);
    assert!(matches!(
        snapshot,
        FleetEvent::StateSnapshot { ref servers, .. } if servers.len() == 2
    ));

    supervisor.shutdown();
    let stopped = wait_for_server_event(&server_events, ServerEventKind::Stopped);
    assert!(matches!(
        stopped.detail,
        ServerEventDetail::Stopped { .. }
    ));
    assert!(supervisor
        .state()
        .iter()
        .all(|s| s.status == ServerStatus::Stopped));
    assert!(supervisor.session_handles().is_empty());
}

fn wait_for_server_event(
    events: &server_control::event::channel::EventConsumer<server_control::event::ServerEvent>,
    kind: ServerEventKind,
) -> server_control::event::ServerEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(event) = events.as_ref().recv_timeout(Duration::from_millis(100)) {
            if event.detail.kind() == kind {
                return event;
            }
        }
    }
    panic!("timed out waiting for {kind:?}");
}

fn wait_for_fleet_snapshot(
    events: &server_control::event::channel::EventConsumer<FleetEvent>,
) -> FleetEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(event) = events.as_ref().recv_timeout(Duration::from_millis(100)) {
            if matches!(event, FleetEvent::StateSnapshot { .. }) {
                return event;
            }
        }
    }
    panic!("timed out waiting for a state snapshot");
}
