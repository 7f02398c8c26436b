//! Tests for the session module

use super::*;
use crate::domain::types::{Accuracy, Coordinates, Submission};
use crate::infra::clock::ManualClock;
use crate::io::location::SimulatedLocationProvider;
use crate::io::store::MemoryStore;
use crate::services::retry_queue::{QueueSettings, RetryQueue};
use crate::testing::{zone_definition, ScriptedApi};
use std::time::Duration as StdDuration;

const T0: u64 = 1_767_617_600_000;
const LAT: f64 = -33.4569;
/// ~189 m from the zone center
const INSIDE_LON: f64 = -70.6500;
/// ~411 m from the zone center
const OUTSIDE_LON: f64 = -70.6520;
const CENTER_LON: f64 = -70.6483;

/// Test harness that keeps the submission receiver alive so `try_send` succeeds
struct TestSession {
    session: SafeZoneSession,
    submit_rx: mpsc::Receiver<SubmitCmd>,
    ctx: SessionContext,
    store: Arc<MemoryStore>,
    host: Arc<SimulatedLocationProvider>,
    api: Arc<ScriptedApi>,
    clock: Arc<ManualClock>,
    metrics: Arc<Metrics>,
}

impl std::ops::Deref for TestSession {
    type Target = SafeZoneSession;
    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl std::ops::DerefMut for TestSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

async fn create_test_session() -> TestSession {
    create_test_session_with_buffer(64).await
}

async fn create_test_session_with_buffer(buffer: usize) -> TestSession {
    let store = Arc::new(MemoryStore::new());
    store.set(keys::USER_TYPE, "Patient".to_string()).await.unwrap();

    let api = Arc::new(ScriptedApi::succeeding());
    api.set_zone(Some(zone_definition(false)));

    let host = Arc::new(SimulatedLocationProvider::new());
    let clock = Arc::new(ManualClock::new(T0));
    let metrics = Arc::new(Metrics::new());
    let ctx = SessionContext {
        store: store.clone(),
        provider: host.clone(),
        api: api.clone(),
        clock: clock.clone(),
        metrics: metrics.clone(),
    };

    let (session, submit_rx) = build_session(&ctx, buffer);
    TestSession { session, submit_rx, ctx, store, host, api, clock, metrics }
}

fn build_session(ctx: &SessionContext, buffer: usize) -> (SafeZoneSession, mpsc::Receiver<SubmitCmd>) {
    let queue = Arc::new(RetryQueue::new(
        ctx.store.clone(),
        QueueSettings::default(),
        ctx.metrics.clone(),
    ));
    let submitter = Arc::new(Submitter::new(
        ctx.api.clone(),
        queue,
        ctx.store.clone(),
        ctx.clock.clone(),
        ctx.metrics.clone(),
    ));
    let (submit_tx, submit_rx) = mpsc::channel(buffer);
    let session = SafeZoneSession::new(&Config::default(), ctx.clone(), submitter, submit_tx);
    (session, submit_rx)
}

impl TestSession {
    /// Feed a raw fix through the simulated host and handle every callback
    async fn fix(&mut self, longitude: f64, speed: f64) -> usize {
        let sample = PositionSample {
            latitude: LAT,
            longitude,
            speed_mps: Some(speed),
            captured_at_ms: self.clock.now_ms(),
        };
        let events = self.host.observe(sample);
        let count = events.len();
        for event in events {
            self.session.handle(event).await;
        }
        count
    }

    fn advance_secs(&self, secs: u64) {
        self.clock.advance(StdDuration::from_secs(secs));
    }

    /// Submissions handed to the worker so far
    fn submissions(&mut self) -> Vec<Submission> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.submit_rx.try_recv() {
            out.push(cmd.submission);
        }
        out
    }

    async fn machine(&self) -> MachineState {
        self.session.load_state().await
    }

    /// Started session with the patient inside the zone at T0
    async fn started_inside(&mut self) {
        assert!(matches!(self.session.start().await, StartOutcome::Registered(_)));
        self.fix(INSIDE_LON, 1.0).await;
        self.submissions();
    }
}

fn at(longitude: f64, out_of_zone: bool) -> Submission {
    Submission::new(Coordinates::new(LAT, longitude), out_of_zone)
}

#[tokio::test]
async fn test_start_registers_geofence_and_mirrors_zone() {
    let mut t = create_test_session().await;
    t.api.set_zone(Some(zone_definition(true)));

    let outcome = t.start().await;

    let zone = t.host.geofence().unwrap();
    assert_eq!(outcome, StartOutcome::Registered(zone));
    assert_eq!(zone.radius_meters(), 200.0);

    let cached: Option<SafeZone> = load_json(t.store.as_ref(), keys::SAFE_ZONE).await.unwrap();
    assert_eq!(cached, Some(zone));
    assert!(t.load_safe_exit().await);
}

#[tokio::test]
async fn test_start_falls_back_to_cached_zone() {
    let mut t = create_test_session().await;
    let cached = zone_definition(false).safe_zone().unwrap();
    save_json(t.store.as_ref(), keys::SAFE_ZONE, &cached).await.unwrap();
    t.api.set_zone_unreachable(502);

    assert_eq!(t.start().await, StartOutcome::Registered(cached));
    assert_eq!(t.host.geofence(), Some(cached));
}

#[tokio::test]
async fn test_start_ignores_cached_zone_with_bad_radius() {
    let mut t = create_test_session().await;
    t.store
        .set(
            keys::SAFE_ZONE,
            r#"{"center": {"latitude": -33.4569, "longitude": -70.6483}, "radius_meters": 0.0}"#
                .to_string(),
        )
        .await
        .unwrap();
    t.api.set_zone_unreachable(502);

    assert_eq!(t.start().await, StartOutcome::NoZone);
    assert!(t.host.geofence().is_none());
}

#[tokio::test]
async fn test_start_without_zone_registers_nothing() {
    let mut t = create_test_session().await;
    let stale = zone_definition(false).safe_zone().unwrap();
    save_json(t.store.as_ref(), keys::SAFE_ZONE, &stale).await.unwrap();
    t.api.set_zone(None);

    assert_eq!(t.start().await, StartOutcome::NoZone);
    assert!(t.host.geofence().is_none());
    assert_eq!(t.store.get(keys::SAFE_ZONE).await.unwrap(), None);
}

#[tokio::test]
async fn test_start_halts_on_caregiver_device() {
    let mut t = create_test_session().await;
    t.store.set(keys::USER_TYPE, "Caregiver".to_string()).await.unwrap();

    assert_eq!(t.start().await, StartOutcome::Halted);
    assert!(t.is_halted());
    assert!(t.host.geofence().is_none());
}

#[tokio::test]
async fn test_reference_scenario_exit_then_debounced_return() {
    let mut t = create_test_session().await;
    t.start().await;

    // Inside at T0
    assert_eq!(t.fix(INSIDE_LON, 1.0).await, 1);
    assert_eq!(t.submissions(), vec![at(INSIDE_LON, false)]);
    assert_eq!(t.machine().await.zone, ZoneState::Inside);

    // Walks out past the perimeter
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.2).await;
    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON, true)]);
    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Outside);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::HighAccuracy);
    assert_eq!(t.host.active_profile().map(|p| p.accuracy), Some(Accuracy::High));

    // Back at the center 30 s later: the enter is debounced, the sample still reports
    t.advance_secs(30);
    t.fix(CENTER_LON, 1.2).await;
    assert_eq!(t.metrics.debounced_total(), 1);
    assert_eq!(t.submissions(), vec![at(CENTER_LON, true)]);

    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Outside);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::HighAccuracy);
}

#[tokio::test]
async fn test_duplicate_exit_is_absorbed() {
    let mut t = create_test_session().await;
    t.started_inside().await;

    t.advance_secs(61);
    t.handle(HostEvent::Exit { at: Coordinates::new(LAT, OUTSIDE_LON) }).await;
    t.advance_secs(61);
    t.handle(HostEvent::Exit { at: Coordinates::new(LAT, OUTSIDE_LON) }).await;

    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON, true)]);
    assert_eq!(t.metrics.duplicates_total(), 1);
    assert_eq!(t.host.position_update_calls().0, 1);
}

#[tokio::test]
async fn test_dwell_deadline_switches_to_balanced_then_enter_stops() {
    let mut t = create_test_session().await;
    t.started_inside().await;

    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    t.advance_secs(119);
    t.poll_timers().await;
    assert_eq!(t.machine().await.scheduler.intensity, TrackingIntensity::HighAccuracy);

    t.advance_secs(1);
    t.poll_timers().await;
    assert_eq!(t.machine().await.scheduler.intensity, TrackingIntensity::BalancedAccuracy);
    assert_eq!(t.host.active_profile().map(|p| p.accuracy), Some(Accuracy::Balanced));
    assert_eq!(t.host.position_update_calls(), (2, 2));

    // Home again: polling stops, late samples are ignored
    t.advance_secs(100);
    t.fix(INSIDE_LON, 1.0).await;
    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Inside);
    assert_eq!(state.scheduler, Default::default());
    assert!(t.host.active_profile().is_none());
}

#[tokio::test]
async fn test_safe_exit_override_records_without_escalating() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.set_safe_exit(true).await.unwrap();
    assert_eq!(t.api.safe_exit_calls(), vec![true]);

    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON, false)]);
    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Outside);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::Idle);
    assert!(t.host.active_profile().is_none());
}

#[tokio::test]
async fn test_role_change_halts_session_for_good() {
    let mut t = create_test_session().await;
    t.started_inside().await;

    t.store.set(keys::USER_TYPE, "Caregiver".to_string()).await.unwrap();
    t.advance_secs(61);
    t.handle(HostEvent::Exit { at: Coordinates::new(LAT, OUTSIDE_LON) }).await;

    assert!(t.is_halted());
    assert!(t.submissions().is_empty());
    assert!(t.host.geofence().is_none());
    assert!(t.host.active_profile().is_none());
    assert_eq!(t.metrics.report(0).role_halts_total, 1);

    // Restoring the role does not revive this session
    t.store.set(keys::USER_TYPE, "Patient".to_string()).await.unwrap();
    t.advance_secs(61);
    t.handle(HostEvent::Exit { at: Coordinates::new(LAT, OUTSIDE_LON) }).await;
    assert!(t.submissions().is_empty());
    assert_eq!(t.machine().await.zone, ZoneState::Unknown);
    assert_eq!(t.metrics.events_total(), 3);
}

#[tokio::test]
async fn test_provider_error_is_discarded() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    let before = t.machine().await;

    t.handle(HostEvent::Error("location services off".to_string())).await;

    assert_eq!(t.machine().await, before);
    assert!(t.submissions().is_empty());
    assert!(!t.is_halted());
    assert_eq!(t.metrics.report(0).provider_errors_total, 1);
}

#[tokio::test]
async fn test_permission_denied_on_escalation_halts_after_reporting() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.host.set_permission_denied(true);

    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    // The breach still goes out
    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON, true)]);
    assert!(t.is_halted());
    assert!(t.host.geofence().is_none());

    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Unknown);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::Idle);
}

#[tokio::test]
async fn test_state_survives_respawn() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    // Host tears the task down; a fresh session resumes from the store
    let (mut respawned, mut rx) = build_session(&t.ctx, 8);
    t.host.stop_position_updates().await.unwrap();
    assert!(matches!(respawned.start().await, StartOutcome::Registered(_)));
    assert_eq!(t.host.active_profile().map(|p| p.accuracy), Some(Accuracy::High));

    t.advance_secs(30);
    respawned.handle(HostEvent::Enter { at: Coordinates::new(LAT, CENTER_LON) }).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(respawned.load_state().await.zone, ZoneState::Outside);

    // Dwell deadline carried over too
    t.advance_secs(90);
    respawned.poll_timers().await;
    assert_eq!(
        respawned.load_state().await.scheduler.intensity,
        TrackingIntensity::BalancedAccuracy
    );
}

#[tokio::test]
async fn test_full_submit_channel_falls_back_to_queue() {
    let mut t = create_test_session_with_buffer(1).await;
    t.start().await;
    t.fix(INSIDE_LON, 1.0).await;

    // Channel still holds the enter submission
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    let queued = t.submitter.queue().entries().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].submission(), at(OUTSIDE_LON, true));
    assert_eq!(queued[0].enqueued_at_ms, T0 + 61_000);
    assert_eq!(t.metrics.report(0).submit_channel_full_total, 1);
}

#[tokio::test]
async fn test_samples_refresh_last_known_and_status() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;
    t.submissions();

    t.advance_secs(6);
    t.fix(OUTSIDE_LON - 0.0005, 1.1).await;

    let status = t.status().await;
    assert_eq!(status.zone_state, ZoneState::Outside);
    assert_eq!(status.intensity, TrackingIntensity::HighAccuracy);
    assert_eq!(status.outside, Some(true));
    assert!(!status.safe_exit);
    let last = status.last_known.unwrap();
    assert_eq!(last.longitude, OUTSIDE_LON - 0.0005);
    assert!((status.distance_m.unwrap() - 466.2).abs() < 1.0);

    let cache: Option<crate::services::change_cache::ChangeCache> =
        load_json(t.store.as_ref(), keys::LAST_SENT).await.unwrap();
    assert_eq!(cache.unwrap().last_sent_at_ms, Some(T0 + 67_000));
}

#[tokio::test]
async fn test_fetch_history_sorted_by_timestamp() {
    let t = create_test_session().await;
    let entries: Vec<HistoryEntry> = serde_json::from_str(
        r#"[
            {"latitude": "1.0", "longitude": "1.0", "timestamp": "2026-10-16T12:05:00Z", "is_out_of_zone": true},
            {"latitude": "2.0", "longitude": "2.0", "timestamp": "2026-10-16T12:00:00Z", "is_out_of_zone": false}
        ]"#,
    )
    .unwrap();
    t.api.set_history(entries);

    let history = t.fetch_history().await.unwrap();
    assert_eq!(history[0].latitude, 2.0);
    assert_eq!(history[1].latitude, 1.0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;

    t.stop().await;
    t.stop().await;

    assert!(t.host.geofence().is_none());
    assert!(t.host.active_profile().is_none());
    let state = t.machine().await;
    assert_eq!(state.scheduler.dwell_deadline_ms, None);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::Idle);
    assert_eq!(state.zone, ZoneState::Unknown);
    assert_eq!(state.last_processed_at_ms, None);

    // A late dwell poll after stop does nothing
    t.advance_secs(500);
    t.poll_timers().await;
    assert!(t.host.active_profile().is_none());
}

#[tokio::test]
async fn test_restart_after_stop_reports_current_breach() {
    let mut t = create_test_session().await;
    t.started_inside().await;
    t.advance_secs(61);
    t.fix(OUTSIDE_LON, 1.0).await;
    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON, true)]);

    t.stop().await;
    t.advance_secs(600);

    // Fresh registration while still out: the host reports the exit again
    assert!(matches!(t.start().await, StartOutcome::Registered(_)));
    assert!(t.host.active_profile().is_none());
    assert_eq!(t.fix(OUTSIDE_LON - 0.001, 1.0).await, 1);

    assert_eq!(t.submissions(), vec![at(OUTSIDE_LON - 0.001, true)]);
    let state = t.machine().await;
    assert_eq!(state.zone, ZoneState::Outside);
    assert_eq!(state.scheduler.intensity, TrackingIntensity::HighAccuracy);
    assert_eq!(t.host.active_profile().map(|p| p.accuracy), Some(Accuracy::High));
}

#[tokio::test]
async fn test_run_loop_processes_events_and_stops_on_shutdown() {
    let TestSession { mut session, mut submit_rx, host, .. } = create_test_session().await;
    session.start().await;

    let (event_tx, event_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        session.run(event_rx, shutdown_rx).await;
        session
    });

    event_tx.send(HostEvent::Exit { at: Coordinates::new(LAT, OUTSIDE_LON) }).await.unwrap();
    let cmd = tokio::time::timeout(StdDuration::from_secs(5), submit_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cmd.submission, at(OUTSIDE_LON, true));
    assert!(host.active_profile().is_some());

    shutdown_tx.send(true).unwrap();
    let session = handle.await.unwrap();

    assert!(!session.is_halted());
    assert!(host.active_profile().is_none());
    assert!(host.geofence().is_none());
}

#[tokio::test]
async fn test_drain_timer_flushes_queue_without_traffic() {
    let mut t = create_test_session().await;
    t.session.drain_interval = Some(StdDuration::from_millis(50));
    t.session.start().await;

    let breach = at(OUTSIDE_LON, true);
    t.session.submitter.enqueue(&breach).await;
    t.advance_secs(2);

    let TestSession { mut session, api, .. } = t;
    let (_event_tx, event_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        session.run(event_rx, shutdown_rx).await;
        session
    });

    tokio::time::timeout(StdDuration::from_secs(5), async {
        while api.submitted().is_empty() {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    let session = handle.await.unwrap();
    assert_eq!(api.submitted(), vec![breach]);
    assert!(session.submitter.queue().is_empty().await);
}

#[tokio::test]
async fn test_read_status_without_data() {
    let store = MemoryStore::new();
    let status = read_status(&store).await;
    assert_eq!(status.zone, None);
    assert_eq!(status.outside, None);
    assert_eq!(status.zone_state, ZoneState::Unknown);
    assert_eq!(status.intensity, TrackingIntensity::Idle);
}
