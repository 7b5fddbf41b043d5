//! Countdown Renderer: trial time remaining as a progress ring and a digital clock.
//!
//! [`Countdown`] is pure arithmetic over two timestamps. [`CountdownTimer`] drives
//! it on a tokio interval, hands each [`CountdownFrame`] to a [`CountdownRenderer`],
//! and performs expiry handling once remaining time reaches zero.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{EventBus, TrialEvent};
use crate::state::{parse_timestamp, TrialState};
use crate::store::TrialStore;

/// Trial length assumed when `started_at` is missing or unusable.
pub const DEFAULT_FALLBACK_DURATION: Duration = Duration::from_secs(5 * 60 * 60);

pub const RING_RADIUS: f64 = 54.0;
pub const RING_CIRCUMFERENCE: f64 = 2.0 * std::f64::consts::PI * RING_RADIUS;

const WARNING_BELOW_SECS: i64 = 30 * 60;
const CRITICAL_BELOW_SECS: i64 = 10 * 60;

pub const INVALID_DATE_LABEL: &str = "Invalid Date";

/// Ring colour by time remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorBand {
    /// More than 30 minutes left.
    Normal,
    /// Between 10 and 30 minutes left.
    Warning,
    /// Under 10 minutes left.
    Critical,
}

impl ColorBand {
    pub fn for_remaining(remaining_secs: i64) -> Self {
        if remaining_secs > WARNING_BELOW_SECS {
            ColorBand::Normal
        } else if remaining_secs >= CRITICAL_BELOW_SECS {
            ColorBand::Warning
        } else {
            ColorBand::Critical
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            ColorBand::Normal => "#051C55",
            ColorBand::Warning => "#FA921C",
            ColorBand::Critical => "#DC2626",
        }
    }
}

/// One paint of the countdown.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    pub remaining_secs: i64,
    pub elapsed_secs: i64,
    pub total_secs: i64,
    /// `elapsed / total`, clamped to `[0, 1]`.
    pub progress: f64,
    /// Ring stroke offset; `0` is a full ring, the circumference an empty one.
    pub stroke_offset: f64,
    pub band: ColorBand,
    /// `HH:MM:SS`
    pub clock: String,
}

impl FrameData {
    pub fn is_expired(&self) -> bool {
        self.remaining_secs == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CountdownFrame {
    /// `expires_at` could not be parsed; nothing else is drawn.
    Invalid,
    Running(FrameData),
}

impl CountdownFrame {
    pub fn is_expired(&self) -> bool {
        matches!(self, CountdownFrame::Running(d) if d.is_expired())
    }

    pub fn label(&self) -> &str {
        match self {
            CountdownFrame::Invalid => INVALID_DATE_LABEL,
            CountdownFrame::Running(d) => &d.clock,
        }
    }
}

/// `expires_at - fallback`, or five hours back when that leaves chrono's range.
fn fallback_start(expires_at: DateTime<Utc>, fallback: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(fallback)
        .ok()
        .and_then(|d| expires_at.checked_sub_signed(d))
        .or_else(|| expires_at.checked_sub_signed(chrono::Duration::hours(5)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Countdown toward `expires_at`. Construction never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    window: Option<Window>,
}

impl Countdown {
    /// Parses ISO-8601 timestamps. A bad `expires_at` yields an invalid countdown;
    /// a missing, bad, or non-earlier `started_at` falls back to `expires_at - fallback`.
    pub fn parse(expires_at: &str, started_at: Option<&str>, fallback: Duration) -> Self {
        let expires_at = match parse_timestamp("trial_expires_at", expires_at) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "countdown not started");
                return Self { window: None };
            }
        };
        let started_at = match started_at
            .and_then(|s| parse_timestamp("trial_started_at", s).ok())
            .filter(|s| *s < expires_at)
        {
            Some(s) => s,
            None => match fallback_start(expires_at, fallback) {
                Some(s) => s,
                None => {
                    tracing::warn!(%expires_at, "no representable trial start");
                    return Self { window: None };
                }
            },
        };
        Self {
            window: Some(Window {
                started_at,
                expires_at,
            }),
        }
    }

    /// Countdown over an already validated trial.
    pub fn for_trial(state: &TrialState) -> Self {
        Self {
            window: Some(Window {
                started_at: state.started_at,
                expires_at: state.expires_at,
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.window.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.window.map(|w| w.started_at)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.window.map(|w| w.expires_at)
    }

    pub fn frame_at(&self, now: DateTime<Utc>) -> CountdownFrame {
        let Some(w) = self.window else {
            return CountdownFrame::Invalid;
        };
        let total_ms = (w.expires_at - w.started_at).num_milliseconds().max(1);
        let remaining_ms = (w.expires_at - now).num_milliseconds().max(0);
        let elapsed_ms = (now - w.started_at).num_milliseconds().clamp(0, total_ms);

        // Round up so 00:00:00 is only ever shown once the trial has ended.
        let remaining_secs = (remaining_ms + 999) / 1000;
        let progress = if remaining_ms == 0 {
            1.0
        } else {
            (elapsed_ms as f64 / total_ms as f64).clamp(0.0, 1.0)
        };

        CountdownFrame::Running(FrameData {
            remaining_secs,
            elapsed_secs: elapsed_ms / 1000,
            total_secs: total_ms / 1000,
            progress,
            stroke_offset: RING_CIRCUMFERENCE * progress,
            band: ColorBand::for_remaining(remaining_secs),
            clock: format_clock(remaining_secs),
        })
    }
}

fn format_clock(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// SVG for one frame: background track, coloured progress ring, clock text.
pub fn render_ring_svg(frame: &CountdownFrame) -> String {
    let size = (RING_RADIUS * 2.0 + 12.0) as u32;
    let c = size as f64 / 2.0;
    match frame {
        CountdownFrame::Invalid => format!(
            r#"<svg class="trial-ring trial-ring--invalid" width="{size}" height="{size}" viewBox="0 0 {size} {size}"><text x="{c}" y="{c}" text-anchor="middle" dominant-baseline="middle">{INVALID_DATE_LABEL}</text></svg>"#
        ),
        CountdownFrame::Running(d) => format!(
            r##"<svg class="trial-ring" width="{size}" height="{size}" viewBox="0 0 {size} {size}"><circle cx="{c}" cy="{c}" r="{r}" fill="none" stroke="#E5E7EB" stroke-width="8"/><circle cx="{c}" cy="{c}" r="{r}" fill="none" stroke="{color}" stroke-width="8" stroke-linecap="round" stroke-dasharray="{circ:.3}" stroke-dashoffset="{offset:.3}" transform="rotate(-90 {c} {c})"/><text x="{c}" y="{c}" text-anchor="middle" dominant-baseline="middle" fill="{color}">{clock}</text></svg>"##,
            r = RING_RADIUS,
            color = d.band.color(),
            circ = RING_CIRCUMFERENCE,
            offset = d.stroke_offset,
            clock = d.clock,
        ),
    }
}

/// Source of wall-clock time for the countdown loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Receives every frame the timer produces.
pub trait CountdownRenderer: Send {
    fn render(&mut self, frame: &CountdownFrame);
}

impl<F> CountdownRenderer for F
where
    F: FnMut(&CountdownFrame) + Send,
{
    fn render(&mut self, frame: &CountdownFrame) {
        self(frame)
    }
}

/// How a countdown loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    Expired,
    Invalid,
    Destroyed,
}

/// Drives a [`Countdown`] on a tokio interval.
pub struct CountdownTimer {
    countdown: Countdown,
    tick: Duration,
    clock: Arc<dyn Clock>,
    store: Option<Arc<TrialStore>>,
    events: Option<EventBus>,
}

impl CountdownTimer {
    pub fn new(countdown: Countdown) -> Self {
        Self {
            countdown,
            tick: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
            store: None,
            events: None,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(10));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store whose trial keys are cleared on expiry.
    pub fn with_store(mut self, store: Arc<TrialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bus that receives [`TrialEvent::Expired`].
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the loop on its own task. Dropping the handle destroys the countdown.
    pub fn spawn<R, F>(self, renderer: R, on_expired: F) -> CountdownHandle
    where
        R: CountdownRenderer + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(renderer, on_expired, stop_rx));
        CountdownHandle {
            stop: Some(stop_tx),
            join,
        }
    }

    /// Renders every tick until expiry, an invalid date, or `stop` resolves.
    pub async fn run<R, F>(
        self,
        mut renderer: R,
        on_expired: F,
        mut stop: oneshot::Receiver<()>,
    ) -> CountdownOutcome
    where
        R: CountdownRenderer,
        F: FnOnce(),
    {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    tracing::debug!("countdown destroyed");
                    return CountdownOutcome::Destroyed;
                }
                _ = interval.tick() => {
                    let frame = self.countdown.frame_at(self.clock.now());
                    renderer.render(&frame);
                    match &frame {
                        CountdownFrame::Invalid => return CountdownOutcome::Invalid,
                        CountdownFrame::Running(d) if d.is_expired() => {
                            self.handle_expiry();
                            on_expired();
                            return CountdownOutcome::Expired;
                        }
                        CountdownFrame::Running(d) => {
                            tracing::trace!(remaining_secs = d.remaining_secs, "countdown tick");
                        }
                    }
                }
            }
        }
    }

    fn handle_expiry(&self) {
        tracing::info!("trial countdown reached zero");
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                tracing::warn!(error = %e, "failed to clear trial keys on expiry");
            }
        }
        if let Some(events) = &self.events {
            events.publish(TrialEvent::Expired);
        }
    }
}

/// Handle to a spawned countdown loop.
pub struct CountdownHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<CountdownOutcome>,
}

impl CountdownHandle {
    /// Stops the loop; the expiry callback will not fire.
    pub async fn destroy(mut self) -> CountdownOutcome {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join.await.unwrap_or(CountdownOutcome::Destroyed)
    }

    /// Waits for the loop to end on its own.
    pub async fn finished(mut self) -> CountdownOutcome {
        let _keep_alive = self.stop.take();
        (&mut self.join).await.unwrap_or(CountdownOutcome::Destroyed)
    }
}
