//! Capture gating: presence tracking, stabilisation countdown and a single
//! edge-triggered capture per continuous presence episode.
//!
//! One machine per client session, driven by that session's frame path only.

use crate::types::BoundingBox;
use std::time::{Duration, Instant};

/// Default time a face must stay in view before the frame is captured.
pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(3);

/// Time source for [`CaptureStateMachine::observe`].
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Tracking,
    Captured,
}

/// What a frame did to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureEvent {
    /// No face in view; countdown cleared.
    Idle,
    /// Face in view, countdown running. `display_count` is the 3-2-1 digit.
    Counting { display_count: u32, remaining: Duration },
    /// This frame was captured.
    Captured,
    /// A capture is already held; input ignored until reset.
    Holding,
}

pub struct CaptureStateMachine<P, C = SystemClock> {
    countdown: Duration,
    presence_since: Option<Instant>,
    captured: Option<P>,
    clock: C,
}

impl<P> Default for CaptureStateMachine<P> {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTDOWN)
    }
}

impl<P> CaptureStateMachine<P> {
    pub fn new(countdown: Duration) -> Self {
        Self::with_clock(countdown, SystemClock)
    }
}

impl<P, C: Clock> CaptureStateMachine<P, C> {
    pub fn with_clock(countdown: Duration, clock: C) -> Self {
        Self {
            countdown,
            presence_since: None,
            captured: None,
            clock,
        }
    }

    pub fn countdown(&self) -> Duration {
        self.countdown
    }

    pub fn state(&self) -> CaptureState {
        if self.captured.is_some() {
            CaptureState::Captured
        } else if self.presence_since.is_some() {
            CaptureState::Tracking
        } else {
            CaptureState::Idle
        }
    }

    pub fn is_captured(&self) -> bool {
        self.captured.is_some()
    }

    /// Feed one frame, timestamped by the injected clock.
    pub fn observe(&mut self, presence: bool, payload: P) -> CaptureEvent {
        let now = self.clock.now();
        self.on_frame(presence, payload, now)
    }

    /// Feed one frame observed at `now`.
    ///
    /// The payload is kept only on the frame that completes the countdown;
    /// every other payload is dropped.
    pub fn on_frame(&mut self, presence: bool, payload: P, now: Instant) -> CaptureEvent {
        if self.captured.is_some() {
            return CaptureEvent::Holding;
        }
        if !presence {
            if self.presence_since.take().is_some() {
                tracing::debug!("presence lost, countdown reset");
            }
            return CaptureEvent::Idle;
        }

        let since = *self.presence_since.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);

        match self.countdown.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => CaptureEvent::Counting {
                display_count: display_count(remaining),
                remaining,
            },
            _ => {
                self.captured = Some(payload);
                self.presence_since = None;
                tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "frame captured");
                CaptureEvent::Captured
            }
        }
    }

    /// Feed one frame with the detector's face boxes.
    ///
    /// Presence means at least one box; the largest box is returned as the
    /// face to frame the countdown around.
    pub fn on_detections<'a>(
        &mut self,
        faces: &'a [BoundingBox],
        payload: P,
        now: Instant,
    ) -> (CaptureEvent, Option<&'a BoundingBox>) {
        let focus = largest_face(faces);
        (self.on_frame(focus.is_some(), payload, now), focus)
    }

    pub fn captured(&self) -> Option<&P> {
        self.captured.as_ref()
    }

    /// Hand the captured payload downstream and return to `Idle`.
    pub fn take(&mut self) -> Option<P> {
        self.presence_since = None;
        self.captured.take()
    }

    /// Retake: drop any captured payload and return to `Idle`.
    pub fn reset(&mut self) {
        self.presence_since = None;
        self.captured = None;
    }
}

/// `max(1, ceil(remaining))` in whole seconds.
fn display_count(remaining: Duration) -> u32 {
    let secs = remaining.as_secs_f64().ceil() as u32;
    secs.max(1)
}

/// Largest box by area; first wins on equal areas.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best: Option<&BoundingBox>, f| match best {
        Some(b) if b.area() >= f.area() => Some(b),
        _ => Some(f),
    })
}
