//! Interval-driven capture loop with a wall-clock cutoff.
//!
//! The cutoff is a local time of day, so it is checked against the wall
//! clock. The interval between captures is measured on the monotonic clock
//! and does not move when the wall clock is stepped (DST, NTP).

use anyhow::Result;
use chrono::{NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::accelerator::Session;
use crate::camera::{Camera, decode_jpeg};
use crate::geometry::Pipeline;

/// A reading of both clocks taken at the same point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Moment {
    /// Local wall-clock time.
    pub wall: NaiveDateTime,
    pub mono: Instant,
}

pub trait Clock {
    fn now(&self) -> Moment;
}

pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> Moment {
        Moment {
            wall: chrono::Local::now().naive_local(),
            mono: Instant::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub cutoff: NaiveDateTime,
    /// Sleep between polls.
    pub poll: Duration,
}

impl Schedule {
    /// Cutoff falls on the same calendar day as `started`.
    pub fn starting_at(started: NaiveDateTime, interval: Duration, cutoff: NaiveTime, poll: Duration) -> Self {
        Self {
            interval,
            cutoff: started.date().and_time(cutoff),
            poll,
        }
    }
}

/// One class index per region, in region order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomVector(pub Vec<usize>);

impl fmt::Display for RoomVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Past the cutoff; the loop must stop.
    Shutdown,
    /// Interval not yet elapsed.
    Idle,
    Captured(RoomVector),
    /// The capture ran but failed; the loop carries on.
    Failed,
}

pub struct CaptureLoop<C: Camera + ?Sized> {
    camera: Box<C>,
    pipeline: Pipeline,
    session: Session,
    schedule: Schedule,
    last_capture: Instant,
    captures: u64,
}

impl<C: Camera + ?Sized> CaptureLoop<C> {
    pub fn new(camera: Box<C>, pipeline: Pipeline, session: Session, schedule: Schedule, started: Instant) -> Self {
        Self {
            camera,
            pipeline,
            session,
            schedule,
            last_capture: started,
            captures: 0,
        }
    }

    pub fn last_capture(&self) -> Instant {
        self.last_capture
    }

    pub fn captures(&self) -> u64 {
        self.captures
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Decides what to do at `now` and does it.
    pub fn poll(&mut self, now: Moment) -> PollOutcome {
        if now.wall > self.schedule.cutoff {
            return PollOutcome::Shutdown;
        }
        if now.mono.saturating_duration_since(self.last_capture) < self.schedule.interval {
            return PollOutcome::Idle;
        }

        self.last_capture = now.mono;
        self.captures += 1;
        println!("CAPTURING IMAGE: ");
        match self.capture_once() {
            Ok(vector) => {
                println!("Room vector {vector}");
                PollOutcome::Captured(vector)
            }
            Err(e) => {
                tracing::warn!("Capture {} failed: {e:#}", self.captures);
                PollOutcome::Failed
            }
        }
    }

    fn capture_once(&mut self) -> Result<RoomVector> {
        let jpeg = self.camera.capture_jpeg()?;
        let frame = decode_jpeg(&jpeg)?;
        let tensors = self.pipeline.run(&frame)?;
        let classes = tensors
            .iter()
            .map(|(kind, tensor)| self.session.predict_occupancy(tensor, kind.name()))
            .collect::<Result<Vec<_>>>()?;
        Ok(RoomVector(classes))
    }

    /// Polls until the cutoff passes or `stop` is raised.
    pub fn run(&mut self, clock: &dyn Clock, stop: &AtomicBool) {
        tracing::info!(
            "Capturing every {}s until {}",
            self.schedule.interval.as_secs(),
            self.schedule.cutoff
        );
        loop {
            if stop.load(Ordering::SeqCst) {
                tracing::info!("Stop requested after {} captures", self.captures);
                break;
            }
            if self.poll(clock.now()) == PollOutcome::Shutdown {
                tracing::info!("Cutoff {} reached after {} captures", self.schedule.cutoff, self.captures);
                break;
            }
            std::thread::sleep(self.schedule.poll);
        }
    }
}
