//! Keeps a secondary source time-aligned to a primary one.
//!
//! The controller is the single owner of both transports and of the offset.
//! All mutation happens on the task that drives it: transport notifications
//! arrive through the channel returned by [`SyncController::event_sender`]
//! and the periodic drift correction runs from [`SyncController::tick`],
//! either called directly (tests) or from [`SyncController::run`].

mod alert;
mod drift;
mod timeline;

use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SyncSection;
use crate::transport::{
    EmbeddedState, PlaybackStatus, SeekCompletion, Side, SideEvent, Transport, TransportEvent,
    TransportKind,
};

pub use alert::{AlertKind, AlertSink, SessionAlert};
pub use drift::{Correction, DriftPolicy};
pub use timeline::{reaction_target, Offset, Timeline};

#[derive(Debug, Clone, Copy)]
struct CommandedState {
    playing: bool,
    since: Instant,
}

enum Step {
    Shutdown,
    Event(Option<SideEvent>),
    Tick,
}

#[derive(Debug)]
pub struct SyncController {
    config: SyncSection,
    policy: DriftPolicy,
    primary: Option<Transport>,
    secondary: Option<Transport>,
    offset: Offset,
    timeline: Timeline,
    primary_aspect_ratio: Option<f64>,
    last_embedded_correction: Option<Instant>,
    split_playback: bool,
    pending_resume: bool,
    commanded: Option<CommandedState>,
    driving: bool,
    alerts: AlertSink,
    alert_receiver: Option<mpsc::UnboundedReceiver<SessionAlert>>,
    events_tx: mpsc::UnboundedSender<SideEvent>,
    events_rx: mpsc::UnboundedReceiver<SideEvent>,
}

impl SyncController {
    pub fn new(config: SyncSection) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (alerts, alert_receiver) = AlertSink::channel();
        Self {
            policy: DriftPolicy::new(&config),
            offset: Offset::new(config.offset_limit_seconds),
            config,
            primary: None,
            secondary: None,
            timeline: Timeline::default(),
            primary_aspect_ratio: None,
            last_embedded_correction: None,
            split_playback: false,
            pending_resume: false,
            commanded: None,
            driving: false,
            alerts,
            alert_receiver: Some(alert_receiver),
            events_tx,
            events_rx,
        }
    }

    /// Sender for transport notifications. Hand one clone to each player or
    /// bridge host.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SideEvent> {
        self.events_tx.clone()
    }

    /// Receiver for user-visible failure messages. Can be taken once.
    pub fn take_alerts(&mut self) -> Option<mpsc::UnboundedReceiver<SessionAlert>> {
        self.alert_receiver.take()
    }

    pub fn alert_sink(&self) -> AlertSink {
        self.alerts.clone()
    }

    pub fn offset(&self) -> f64 {
        self.offset.seconds()
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    pub fn primary_aspect_ratio(&self) -> Option<f64> {
        self.primary_aspect_ratio
    }

    pub fn is_loaded(&self, side: Side) -> bool {
        self.transport(side).is_some()
    }

    pub fn transport(&self, side: Side) -> Option<&Transport> {
        match side {
            Side::Primary => self.primary.as_ref(),
            Side::Secondary => self.secondary.as_ref(),
        }
    }

    fn transport_mut(&mut self, side: Side) -> Option<&mut Transport> {
        match side {
            Side::Primary => self.primary.as_mut(),
            Side::Secondary => self.secondary.as_mut(),
        }
    }

    pub fn status(&self, side: Side) -> Option<PlaybackStatus> {
        self.transport(side).map(Transport::status)
    }

    pub fn position(&self, side: Side) -> Option<f64> {
        self.transport(side).and_then(Transport::position)
    }

    fn both_loaded(&self) -> bool {
        self.primary.is_some() && self.secondary.is_some()
    }

    /// Installs an already-loaded transport for `side`, disposing any previous
    /// one.
    pub fn attach(&mut self, side: Side, transport: Transport) {
        if let Some(mut previous) = self.take_transport(side) {
            previous.dispose();
        }
        if side == Side::Primary {
            self.primary_aspect_ratio = transport.aspect_ratio();
        }
        info!(%side, kind = ?transport.kind(), "transport attached");
        match side {
            Side::Primary => self.primary = Some(transport),
            Side::Secondary => self.secondary = Some(transport),
        }
        self.split_playback = false;
        self.pending_resume = false;
        self.commanded = None;
        self.last_embedded_correction = None;
        self.refresh_timeline();
        self.realign_secondary();
    }

    pub fn unload(&mut self, side: Side) {
        if let Some(mut transport) = self.take_transport(side) {
            transport.dispose();
            info!(%side, "transport unloaded");
        }
        if side == Side::Primary {
            self.primary_aspect_ratio = None;
        }
        self.split_playback = false;
        self.pending_resume = false;
    }

    fn take_transport(&mut self, side: Side) -> Option<Transport> {
        match side {
            Side::Primary => self.primary.take(),
            Side::Secondary => self.secondary.take(),
        }
    }

    pub fn play(&mut self) {
        if self.both_loaded() {
            self.synchronized_start();
            return;
        }
        for side in [Side::Primary, Side::Secondary] {
            if let Some(transport) = self.transport_mut(side) {
                transport.play();
            }
        }
    }

    pub fn pause(&mut self) {
        self.pending_resume = false;
        for side in [Side::Primary, Side::Secondary] {
            if let Some(transport) = self.transport_mut(side) {
                transport.pause();
            }
        }
        if self.both_loaded() {
            self.commanded = Some(CommandedState {
                playing: false,
                since: Instant::now(),
            });
        }
    }

    pub fn seek(&mut self, to: f64) {
        self.refresh_duration();
        let clamped = self.timeline.clamp(to);
        if !self.both_loaded() {
            for side in [Side::Primary, Side::Secondary] {
                if let Some(transport) = self.transport_mut(side) {
                    transport.seek(clamped, 0.0, 0.0);
                }
            }
            self.timeline.set_current(clamped);
            return;
        }

        let was_playing = self.pending_resume
            || self.status(Side::Primary) == Some(PlaybackStatus::Playing)
            || self.status(Side::Secondary) == Some(PlaybackStatus::Playing);
        if was_playing {
            for side in [Side::Primary, Side::Secondary] {
                if let Some(transport) = self.transport_mut(side) {
                    transport.pause();
                }
            }
        }
        let target = self.offset.reaction_target(clamped);
        let completion = match self.primary.as_mut() {
            Some(primary) => primary.seek(clamped, 0.0, 0.0),
            None => SeekCompletion::Immediate,
        };
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.seek(target, 0.0, 0.0);
        }
        self.timeline.set_current(clamped);
        debug!(to = clamped, secondary = target, ?completion, "synchronized seek");

        if was_playing {
            match completion {
                SeekCompletion::Immediate => self.synchronized_start(),
                SeekCompletion::Pending => self.pending_resume = true,
            }
        }
    }

    pub fn set_offset(&mut self, seconds: f64) -> f64 {
        self.offset.set(seconds);
        self.realign_secondary();
        self.offset.seconds()
    }

    pub fn nudge(&mut self, delta: f64) -> f64 {
        self.offset.nudge(delta);
        self.realign_secondary();
        self.offset.seconds()
    }

    pub fn reset_offset(&mut self) {
        self.offset.reset();
        self.realign_secondary();
    }

    /// Adopts the current relationship between both sides as the offset,
    /// whatever their play state.
    pub fn match_frames(&mut self) -> Option<f64> {
        let (primary, secondary) = (self.position(Side::Primary)?, self.position(Side::Secondary)?);
        let offset = self.offset.set(primary - secondary);
        info!(offset, "offset matched to current frames");
        Some(offset)
    }

    pub fn realign(&mut self) {
        if !self.both_loaded() {
            return;
        }
        let both_playing = self.status(Side::Primary) == Some(PlaybackStatus::Playing)
            && self.status(Side::Secondary) == Some(PlaybackStatus::Playing);
        if both_playing {
            self.synchronized_start();
        } else {
            self.realign_secondary();
        }
    }

    pub fn set_volume(&mut self, side: Side, volume: f32) {
        if let Some(transport) = self.transport_mut(side) {
            transport.set_volume(volume);
        }
    }

    pub fn set_muted(&mut self, side: Side, muted: bool) {
        if let Some(transport) = self.transport_mut(side) {
            transport.set_muted(muted);
        }
    }

    /// Seeks the secondary to the primary's reaction target and starts both
    /// sides one after the other. Residual start latency is left to the
    /// drift loop.
    fn synchronized_start(&mut self) {
        self.realign_secondary();
        for side in [Side::Primary, Side::Secondary] {
            if let Some(transport) = self.transport_mut(side) {
                if transport.status() != PlaybackStatus::Playing {
                    transport.play();
                }
            }
        }
        if let Some(secondary) = self.secondary.as_mut() {
            if secondary.rate() != 1.0 {
                secondary.set_rate(1.0);
            }
        }
        self.commanded = Some(CommandedState {
            playing: true,
            since: Instant::now(),
        });
    }

    fn realign_secondary(&mut self) {
        if !self.both_loaded() {
            return;
        }
        let Some(primary) = self.position(Side::Primary) else {
            return;
        };
        let target = self.offset.reaction_target(primary);
        if let Some(current) = self.position(Side::Secondary) {
            if (current - target).abs() <= self.config.rate_deadband {
                return;
            }
        }
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.seek(target, 0.0, 0.0);
            debug!(target, "secondary realigned");
        }
    }

    /// Processes every notification currently queued. Returns how many were
    /// handled.
    pub fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: SideEvent) {
        let SideEvent { side, event } = event;
        let Some(transport) = self.transport_mut(side) else {
            debug!(%side, ?event, "event for unloaded side ignored");
            return;
        };
        let seek_settled = transport.observe(&event);

        if seek_settled && side == Side::Primary && self.pending_resume {
            self.pending_resume = false;
            self.synchronized_start();
        }

        match event {
            TransportEvent::Ready => debug!(%side, "transport ready"),
            TransportEvent::Ended | TransportEvent::EmbeddedState(EmbeddedState::Ended) => {
                info!(%side, "playback ended, pausing session");
                self.pause();
            }
            TransportEvent::Error(message) => {
                self.alerts
                    .raise(Some(side), AlertKind::PlaybackError, message);
            }
            TransportEvent::Position { .. }
            | TransportEvent::Status(_)
            | TransportEvent::EmbeddedState(_) => {
                self.on_position_update(side, Instant::now());
            }
            TransportEvent::SeekCompleted => {}
        }
    }

    /// Scheduler tick: one full correction cycle driven from the primary
    /// side when it is loaded.
    pub fn tick(&mut self) {
        let side = if self.primary.is_some() {
            Side::Primary
        } else {
            Side::Secondary
        };
        self.on_position_update(side, Instant::now());
    }

    /// Drives the controller until `shutdown` resolves, then tears it down.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                event = self.events_rx.recv() => Step::Event(event),
                _ = ticker.tick() => Step::Tick,
            };
            match step {
                Step::Shutdown | Step::Event(None) => break,
                Step::Event(Some(event)) => self.handle_event(event),
                Step::Tick => self.tick(),
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        for side in [Side::Primary, Side::Secondary] {
            if let Some(mut transport) = self.take_transport(side) {
                transport.dispose();
            }
        }
        self.pending_resume = false;
        self.split_playback = false;
        self.commanded = None;
        info!("sync session torn down");
    }

    fn primary_drives(&self) -> bool {
        self.secondary.is_some() && self.status(Side::Primary) == Some(PlaybackStatus::Playing)
    }

    fn on_position_update(&mut self, side: Side, now: Instant) {
        if self.driving {
            return;
        }
        if side == Side::Secondary && self.primary_drives() {
            return;
        }
        self.driving = true;
        self.refresh_timeline();
        self.track_independent_pause(now);
        self.correct_drift(now);
        self.driving = false;
    }

    fn refresh_duration(&mut self) {
        let duration = self
            .primary
            .as_ref()
            .and_then(Transport::duration)
            .or_else(|| self.secondary.as_ref().and_then(Transport::duration));
        self.timeline.set_duration(duration);
    }

    fn refresh_timeline(&mut self) {
        self.refresh_duration();
        let current = match (&self.primary, &self.secondary) {
            (Some(primary), Some(secondary)) => {
                if primary.status() == PlaybackStatus::Playing
                    || secondary.status() != PlaybackStatus::Playing
                {
                    primary.position()
                } else {
                    secondary.position()
                }
            }
            (Some(primary), None) => primary.position(),
            (None, Some(secondary)) => secondary.position(),
            (None, None) => None,
        };
        if let Some(current) = current {
            self.timeline.set_current(current);
        }
    }

    /// `true` while a commanded start or stop has not yet reached both sides.
    fn settling(&mut self, now: Instant) -> bool {
        let Some(commanded) = self.commanded else {
            return false;
        };
        let wanted = if commanded.playing {
            PlaybackStatus::Playing
        } else {
            PlaybackStatus::Paused
        };
        let reached = self.status(Side::Primary) == Some(wanted)
            && self.status(Side::Secondary) == Some(wanted);
        if reached || now.saturating_duration_since(commanded.since) >= self.config.start_settle() {
            self.commanded = None;
            return false;
        }
        true
    }

    fn track_independent_pause(&mut self, now: Instant) {
        if !self.both_loaded() {
            self.split_playback = false;
            return;
        }
        if self.settling(now) {
            return;
        }
        let primary = self.status(Side::Primary);
        let secondary = self.status(Side::Secondary);
        use PlaybackStatus::{Paused, Playing};
        match (primary, secondary) {
            (Some(Playing), Some(Paused)) | (Some(Paused), Some(Playing)) => {
                self.capture_offset();
                self.split_playback = true;
            }
            (Some(Paused), Some(Paused)) if self.split_playback => {
                self.capture_offset();
                self.split_playback = false;
                info!(offset = self.offset.seconds(), "offset locked after independent pause");
            }
            (Some(Playing), Some(Playing)) | (Some(Paused), Some(Paused)) => {
                self.split_playback = false;
            }
            _ => {}
        }
    }

    fn capture_offset(&mut self) {
        if let (Some(primary), Some(secondary)) =
            (self.position(Side::Primary), self.position(Side::Secondary))
        {
            self.offset.set(primary - secondary);
        }
    }

    fn correct_drift(&mut self, now: Instant) {
        let both_playing = self.status(Side::Primary) == Some(PlaybackStatus::Playing)
            && self.status(Side::Secondary) == Some(PlaybackStatus::Playing);
        if !both_playing {
            return;
        }
        let (Some(primary), Some(actual)) =
            (self.position(Side::Primary), self.position(Side::Secondary))
        else {
            return;
        };
        let desired = self.offset.reaction_target(primary);
        let tolerance = self.config.seek_tolerance_seconds;
        let last_correction = self.last_embedded_correction;
        let policy = self.policy.clone();
        let Some(secondary) = self.secondary.as_mut() else {
            return;
        };
        match secondary.kind() {
            TransportKind::Native => match policy.native(desired, actual) {
                Correction::HardSeek { target } => {
                    debug!(desired, actual, "hard seek on secondary");
                    secondary.seek(target, tolerance, tolerance);
                    secondary.set_rate(1.0);
                }
                Correction::NormalizeRate => {
                    if secondary.rate() != 1.0 {
                        secondary.set_rate(1.0);
                    }
                }
                Correction::AdjustRate(rate) => {
                    debug!(desired, actual, rate, "rate correction on secondary");
                    secondary.set_rate(rate);
                }
                Correction::None => {}
            },
            TransportKind::Embedded => {
                if let Correction::HardSeek { target } =
                    policy.embedded(desired, actual, last_correction, now)
                {
                    debug!(desired, actual, "seek correction on embedded secondary");
                    secondary.seek(target, tolerance, tolerance);
                    self.last_embedded_correction = Some(now);
                }
            }
        }
    }
}
