use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_core::{
    AlertKind, BridgeCommand, EmbeddedState, EmbeddedTransport, MediaSource, NativePlayer,
    NativeTransport, PlaybackStatus, Side, SideEvent, SyncController, SyncSection, Transport,
    TransportEvent, TransportResult,
};
use tandem_core::EmbeddedSection;
use tokio::sync::mpsc;

#[derive(Debug)]
struct PlayerState {
    position: f64,
    duration: Option<f64>,
    status: PlaybackStatus,
    seeks: Vec<(f64, f64, f64)>,
    rates: Vec<f64>,
    plays: usize,
    pauses: usize,
    volume: f32,
    muted: bool,
    released: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            position: 0.0,
            duration: Some(120.0),
            status: PlaybackStatus::Paused,
            seeks: Vec::new(),
            rates: Vec::new(),
            plays: 0,
            pauses: 0,
            volume: 1.0,
            muted: false,
            released: false,
        }
    }
}

#[derive(Clone, Default)]
struct FakePlayer {
    state: Arc<Mutex<PlayerState>>,
}

impl FakePlayer {
    fn with(position: f64, status: PlaybackStatus) -> Self {
        let player = FakePlayer::default();
        {
            let mut state = player.state();
            state.position = position;
            state.status = status;
        }
        player
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap()
    }

    fn transport(&self) -> Transport {
        Transport::Native(NativeTransport::new(Box::new(self.clone())))
    }

    fn forget(&self) {
        let mut state = self.state();
        state.seeks.clear();
        state.rates.clear();
        state.plays = 0;
        state.pauses = 0;
    }
}

impl NativePlayer for FakePlayer {
    fn load(&mut self, _source: &MediaSource) -> TransportResult<()> {
        Ok(())
    }

    fn play(&mut self) {
        let mut state = self.state();
        state.status = PlaybackStatus::Playing;
        state.plays += 1;
    }

    fn pause(&mut self) {
        let mut state = self.state();
        state.status = PlaybackStatus::Paused;
        state.pauses += 1;
    }

    fn seek(&mut self, to: f64, tolerance_before: f64, tolerance_after: f64) {
        let mut state = self.state();
        state.position = to;
        state.seeks.push((to, tolerance_before, tolerance_after));
    }

    fn set_rate(&mut self, rate: f64) {
        self.state().rates.push(rate);
    }

    fn position(&self) -> f64 {
        self.state().position
    }

    fn duration(&self) -> Option<f64> {
        self.state().duration
    }

    fn status(&self) -> PlaybackStatus {
        self.state().status
    }

    fn set_volume(&mut self, volume: f32) {
        self.state().volume = volume;
    }

    fn set_muted(&mut self, muted: bool) {
        self.state().muted = muted;
    }

    fn presentation_size(&self) -> Option<(u32, u32)> {
        Some((1920, 800))
    }

    fn release(&mut self) {
        self.state().released = true;
    }
}

fn controller() -> SyncController {
    SyncController::new(SyncSection::default())
}

/// Primary at 10s, offset 2s, secondary drifted to `secondary_at`, both
/// playing.
fn drifting(secondary_at: f64) -> (SyncController, FakePlayer, FakePlayer) {
    let mut controller = controller();
    controller.set_offset(2.0);
    let primary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    let secondary = FakePlayer::with(8.0, PlaybackStatus::Playing);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    secondary.state().position = secondary_at;
    secondary.forget();
    (controller, primary, secondary)
}

fn embedded() -> (Transport, mpsc::UnboundedReceiver<BridgeCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut transport = Transport::Embedded(EmbeddedTransport::new(tx, &EmbeddedSection::default()));
    transport
        .load(&MediaSource::Provider {
            provider: "youtube".into(),
            video_id: "dQw4w9WgXcQ".into(),
        })
        .unwrap();
    (transport, rx)
}

fn seeks_sent(rx: &mut mpsc::UnboundedReceiver<BridgeCommand>) -> Vec<f64> {
    let mut seeks = Vec::new();
    while let Ok(command) = rx.try_recv() {
        if let BridgeCommand::SeekTo { seconds, .. } = command {
            seeks.push(seconds);
        }
    }
    seeks
}

#[tokio::test]
async fn large_drift_triggers_hard_seek() {
    let (mut controller, _primary, secondary) = drifting(7.4);
    controller.tick();
    let state = secondary.state();
    assert_eq!(state.seeks.len(), 1);
    let (target, before, after) = state.seeks[0];
    assert!((target - 8.0).abs() < 1e-9);
    assert!(before > 0.0 && after > 0.0);
    assert_eq!(controller.transport(Side::Secondary).unwrap().rate(), 1.0);
}

#[tokio::test]
async fn moderate_drift_adjusts_rate_then_normalizes() {
    let (mut controller, _primary, secondary) = drifting(7.7);
    controller.tick();
    {
        let state = secondary.state();
        assert!(state.seeks.is_empty());
        assert_eq!(state.rates.len(), 1);
        assert!((state.rates[0] - 1.06).abs() < 1e-9);
    }

    secondary.state().position = 7.98;
    controller.tick();
    let state = secondary.state();
    assert!(state.seeks.is_empty());
    assert_eq!(state.rates.last().copied(), Some(1.0));
    assert_eq!(controller.transport(Side::Secondary).unwrap().rate(), 1.0);
}

#[tokio::test]
async fn drift_inside_deadband_leaves_rate_alone() {
    let (mut controller, _primary, secondary) = drifting(7.98);
    controller.tick();
    let state = secondary.state();
    assert!(state.seeks.is_empty());
    assert!(state.rates.is_empty());
}

#[tokio::test]
async fn no_correction_unless_both_playing() {
    let (mut controller, _primary, secondary) = drifting(7.0);
    secondary.state().status = PlaybackStatus::Waiting;
    controller.tick();
    assert!(secondary.state().seeks.is_empty());
}

#[tokio::test]
async fn secondary_update_is_ignored_while_primary_drives() {
    let (mut controller, _primary, secondary) = drifting(7.0);
    controller.handle_event(SideEvent::new(
        Side::Secondary,
        TransportEvent::Position {
            seconds: 7.0,
            duration: None,
        },
    ));
    assert!(secondary.state().seeks.is_empty());
    controller.tick();
    assert_eq!(secondary.state().seeks.len(), 1);
}

#[tokio::test]
async fn non_finite_position_skips_the_tick() {
    let (mut controller, primary, secondary) = drifting(7.0);
    primary.state().position = f64::NAN;
    controller.tick();
    assert!(secondary.state().seeks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn embedded_corrections_are_rate_limited() {
    let mut controller = controller();
    controller.set_offset(2.0);
    let primary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    let (secondary, mut commands) = embedded();
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary);

    let events = controller.event_sender();
    for event in [
        TransportEvent::Ready,
        TransportEvent::EmbeddedState(EmbeddedState::Playing),
        TransportEvent::Position {
            seconds: 5.0,
            duration: Some(300.0),
        },
    ] {
        events.send(SideEvent::new(Side::Secondary, event)).unwrap();
    }
    assert_eq!(controller.drain_events(), 3);
    seeks_sent(&mut commands);

    controller.tick();
    assert_eq!(seeks_sent(&mut commands), vec![8.0]);

    // The seek lands but playback is still far behind one second later.
    tokio::time::advance(Duration::from_secs(1)).await;
    controller.handle_event(SideEvent::new(Side::Secondary, TransportEvent::SeekCompleted));
    controller.handle_event(SideEvent::new(
        Side::Secondary,
        TransportEvent::Position {
            seconds: 5.5,
            duration: None,
        },
    ));
    controller.tick();
    assert!(seeks_sent(&mut commands).is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    controller.tick();
    assert_eq!(seeks_sent(&mut commands), vec![8.0]);
    assert!(primary.state().rates.is_empty());
}

#[tokio::test]
async fn independent_pause_updates_and_locks_offset() {
    let mut controller = controller();
    let primary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    let secondary = FakePlayer::with(4.0, PlaybackStatus::Paused);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    // The user parks the secondary at 4s while the primary keeps going.
    secondary.state().position = 4.0;
    secondary.forget();

    controller.tick();
    assert!((controller.offset() - 6.0).abs() < 1e-9);

    controller.pause();
    controller.tick();
    assert!((controller.offset() - 6.0).abs() < 1e-9);
    assert_eq!(controller.status(Side::Primary), Some(PlaybackStatus::Paused));

    controller.tick();
    assert!((controller.offset() - 6.0).abs() < 1e-9);
    assert!(secondary.state().seeks.is_empty());
}

#[tokio::test]
async fn match_frames_uses_current_positions() {
    let mut controller = controller();
    let primary = FakePlayer::with(42.0, PlaybackStatus::Paused);
    let secondary = FakePlayer::with(0.0, PlaybackStatus::Paused);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    secondary.state().position = 12.5;
    assert_eq!(controller.match_frames(), Some(29.5));
    assert_eq!(controller.offset(), 29.5);
}

#[tokio::test]
async fn realign_is_idempotent() {
    let (mut controller, primary, secondary) = drifting(7.0);
    controller.realign();
    assert_eq!(secondary.state().seeks.len(), 1);
    assert_eq!(secondary.state().position, 8.0);
    controller.realign();
    assert_eq!(secondary.state().seeks.len(), 1);
    assert_eq!(secondary.state().plays, 0);
    assert_eq!(primary.state().plays, 0);
}

#[tokio::test]
async fn offset_changes_realign_secondary_and_clamp() {
    let mut controller = controller();
    let primary = FakePlayer::with(30.0, PlaybackStatus::Paused);
    let secondary = FakePlayer::with(30.0, PlaybackStatus::Paused);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());

    controller.set_offset(5.0);
    assert_eq!(secondary.state().position, 25.0);
    controller.nudge(-1.0);
    assert_eq!(controller.offset(), 4.0);
    assert_eq!(secondary.state().position, 26.0);
    controller.set_offset(1_000.0);
    assert_eq!(controller.offset(), 600.0);
    assert_eq!(secondary.state().position, 0.0);
    controller.reset_offset();
    assert_eq!(controller.offset(), 0.0);
    assert_eq!(secondary.state().position, 30.0);
}

#[tokio::test]
async fn play_starts_both_sides_at_reaction_target() {
    let mut controller = controller();
    controller.set_offset(3.0);
    let primary = FakePlayer::with(20.0, PlaybackStatus::Paused);
    let secondary = FakePlayer::with(0.0, PlaybackStatus::Paused);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    secondary.state().position = 2.0;

    controller.play();
    assert_eq!(secondary.state().position, 17.0);
    assert_eq!(controller.status(Side::Primary), Some(PlaybackStatus::Playing));
    assert_eq!(controller.status(Side::Secondary), Some(PlaybackStatus::Playing));

    controller.pause();
    controller.pause();
    assert_eq!(controller.status(Side::Primary), Some(PlaybackStatus::Paused));
    assert_eq!(controller.status(Side::Secondary), Some(PlaybackStatus::Paused));
}

#[tokio::test]
async fn single_side_acts_alone() {
    let mut controller = controller();
    let secondary = FakePlayer::with(0.0, PlaybackStatus::Paused);
    controller.attach(Side::Secondary, secondary.transport());
    controller.play();
    assert_eq!(secondary.state().plays, 1);
    controller.seek(15.0);
    assert_eq!(secondary.state().position, 15.0);
    controller.tick();
    assert_eq!(controller.timeline().current_seconds(), 15.0);
}

#[tokio::test]
async fn seek_clamps_and_resumes_native_playback() {
    let (mut controller, primary, secondary) = drifting(8.0);
    controller.seek(500.0);
    assert_eq!(primary.state().position, 120.0);
    assert_eq!(secondary.state().position, 118.0);
    assert_eq!(controller.status(Side::Primary), Some(PlaybackStatus::Playing));
    assert_eq!(controller.status(Side::Secondary), Some(PlaybackStatus::Playing));

    controller.seek(-4.0);
    assert_eq!(primary.state().position, 0.0);
    assert_eq!(secondary.state().position, 0.0);
}

#[tokio::test]
async fn seek_with_embedded_primary_waits_for_completion() {
    let mut controller = controller();
    let (primary, mut commands) = embedded();
    let secondary = FakePlayer::with(0.0, PlaybackStatus::Paused);
    controller.attach(Side::Primary, primary);
    controller.attach(Side::Secondary, secondary.transport());
    secondary.state().status = PlaybackStatus::Playing;
    for event in [
        TransportEvent::Ready,
        TransportEvent::Position {
            seconds: 10.0,
            duration: Some(200.0),
        },
        TransportEvent::EmbeddedState(EmbeddedState::Playing),
    ] {
        controller.handle_event(SideEvent::new(Side::Primary, event));
    }
    while commands.try_recv().is_ok() {}
    secondary.forget();

    controller.seek(50.0);
    assert_eq!(secondary.state().position, 50.0);
    assert_eq!(controller.status(Side::Secondary), Some(PlaybackStatus::Paused));
    assert_eq!(secondary.state().plays, 0);

    controller.handle_event(SideEvent::new(
        Side::Primary,
        TransportEvent::EmbeddedState(EmbeddedState::Paused),
    ));
    assert_eq!(secondary.state().plays, 0);
    controller.handle_event(SideEvent::new(
        Side::Primary,
        TransportEvent::Position {
            seconds: 50.0,
            duration: None,
        },
    ));
    assert_eq!(secondary.state().plays, 1);
    let mut resumed = false;
    while let Ok(command) = commands.try_recv() {
        resumed |= command == BridgeCommand::Play;
    }
    assert!(resumed);
}

#[tokio::test]
async fn time_report_from_before_seek_keeps_session_paused() {
    let mut controller = controller();
    let (primary, mut commands) = embedded();
    let secondary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    controller.attach(Side::Primary, primary);
    controller.attach(Side::Secondary, secondary.transport());
    for event in [
        TransportEvent::Ready,
        TransportEvent::Position {
            seconds: 10.0,
            duration: Some(200.0),
        },
        TransportEvent::EmbeddedState(EmbeddedState::Playing),
    ] {
        controller.handle_event(SideEvent::new(Side::Primary, event));
    }
    while commands.try_recv().is_ok() {}
    secondary.forget();

    controller.seek(50.0);
    controller.handle_event(SideEvent::new(
        Side::Primary,
        TransportEvent::EmbeddedState(EmbeddedState::Paused),
    ));
    controller.handle_event(SideEvent::new(
        Side::Primary,
        TransportEvent::Position {
            seconds: 10.2,
            duration: None,
        },
    ));
    assert_eq!(secondary.state().plays, 0);
    assert_eq!(secondary.state().position, 50.0);
    assert_eq!(controller.position(Side::Primary), Some(50.0));
    assert!(!std::iter::from_fn(|| commands.try_recv().ok()).any(|c| c == BridgeCommand::Play));

    controller.handle_event(SideEvent::new(Side::Primary, TransportEvent::SeekCompleted));
    assert_eq!(secondary.state().plays, 1);
    assert!(std::iter::from_fn(|| commands.try_recv().ok()).any(|c| c == BridgeCommand::Play));
}

#[tokio::test]
async fn end_of_media_pauses_session_and_errors_alert() {
    let mut controller = controller();
    let mut alerts = controller.take_alerts().unwrap();
    let primary = FakePlayer::with(5.0, PlaybackStatus::Playing);
    let secondary = FakePlayer::with(5.0, PlaybackStatus::Playing);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());

    controller.handle_event(SideEvent::new(Side::Secondary, TransportEvent::Ended));
    assert_eq!(primary.state().status, PlaybackStatus::Paused);
    assert_eq!(secondary.state().status, PlaybackStatus::Paused);

    controller.handle_event(SideEvent::new(
        Side::Primary,
        TransportEvent::Error("decoder lost".into()),
    ));
    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.kind, AlertKind::PlaybackError);
    assert_eq!(alert.side, Some(Side::Primary));
    assert_eq!(alert.message, "decoder lost");
    assert!(alerts.try_recv().is_err());
}

#[tokio::test]
async fn timeline_follows_the_playing_side() {
    let mut controller = controller();
    let primary = FakePlayer::with(10.0, PlaybackStatus::Paused);
    let secondary = FakePlayer::with(10.0, PlaybackStatus::Paused);
    primary.state().duration = Some(90.0);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    assert_eq!(controller.timeline().duration_seconds(), 90.0);

    secondary.state().status = PlaybackStatus::Playing;
    secondary.state().position = 33.0;
    controller.tick();
    assert_eq!(controller.timeline().current_seconds(), 33.0);

    primary.state().duration = Some(f64::NAN);
    controller.tick();
    assert_eq!(controller.timeline().duration_seconds(), 120.0);
}

#[tokio::test]
async fn volume_metadata_and_shutdown() {
    let mut controller = controller();
    let primary = FakePlayer::with(0.0, PlaybackStatus::Playing);
    controller.attach(Side::Primary, primary.transport());
    assert_eq!(controller.primary_aspect_ratio(), Some(2.4));

    controller.set_volume(Side::Primary, 3.0);
    controller.set_muted(Side::Primary, true);
    assert_eq!(primary.state().volume, 1.0);
    assert!(primary.state().muted);

    controller.shutdown();
    assert!(primary.state().released);
    assert!(!controller.is_loaded(Side::Primary));
}

#[tokio::test(start_paused = true)]
async fn run_loop_processes_events_until_shutdown() {
    let mut controller = controller();
    let primary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    let secondary = FakePlayer::with(10.0, PlaybackStatus::Playing);
    controller.attach(Side::Primary, primary.transport());
    controller.attach(Side::Secondary, secondary.transport());
    secondary.state().position = 9.0;
    secondary.forget();

    let events = controller.event_sender();
    events
        .send(SideEvent::new(
            Side::Primary,
            TransportEvent::Position {
                seconds: 10.0,
                duration: None,
            },
        ))
        .unwrap();
    controller
        .run(tokio::time::sleep(Duration::from_millis(350)))
        .await;

    assert_eq!(secondary.state().seeks.len(), 1);
    assert!(primary.state().released);
    assert!(secondary.state().released);
}
