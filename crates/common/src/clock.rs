//! Clock and timing utilities for playback synchronization.
//!
//! Realtime playback anchors both schedules to one sync source: the audio
//! device position when audio plays, otherwise a software timer. This module
//! provides:
//! - The [`SyncSource`] abstraction and its software and manual clocks
//! - Drift measurement between the video schedule and the sync source
//! - Fixed-cadence tick control for tracking updates
//! - A sleep that an interrupt can cut short

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A playback clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment playback started).
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    /// The instant playback started.
    epoch: Instant,

    /// Wall-clock time at epoch (ISO 8601 string).
    epoch_wall: String,
}

impl PlaybackClock {
    /// Create a new clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get nanoseconds elapsed since the epoch.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Get seconds elapsed since the epoch.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at the epoch.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Convert an elapsed nanosecond value to seconds.
    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / 1_000_000_000.0
    }

    /// Convert seconds to nanoseconds.
    pub fn secs_to_ns(secs: f64) -> u64 {
        (secs * 1_000_000_000.0) as u64
    }
}

/// Source of the shared playback position both schedules pace against.
pub trait SyncSource: Send + Sync {
    /// Seconds of media presented since the last reset, at speed 1.
    fn position_secs(&self) -> f64;

    /// Re-anchor the baseline at the current instant.
    fn reset(&self);
}

/// Software timer used when no audio device drives the sync position.
#[derive(Debug)]
pub struct SoftwareTimer {
    clock: Mutex<PlaybackClock>,
}

impl SoftwareTimer {
    pub fn new() -> Self {
        Self {
            clock: Mutex::new(PlaybackClock::start()),
        }
    }
}

impl Default for SoftwareTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSource for SoftwareTimer {
    fn position_secs(&self) -> f64 {
        lock(&self.clock).elapsed_secs()
    }

    fn reset(&self) {
        *lock(&self.clock) = PlaybackClock::start();
    }
}

/// A clock advanced explicitly by its owner. Used for deterministic pacing
/// in tests and offline tools.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: Mutex<f64>,
    resets: Mutex<u32>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reported position.
    pub fn set(&self, secs: f64) {
        *lock(&self.secs) = secs;
    }

    /// Move the reported position forward.
    pub fn advance(&self, secs: f64) {
        *lock(&self.secs) += secs;
    }

    /// Number of times the baseline was reset.
    pub fn reset_count(&self) -> u32 {
        *lock(&self.resets)
    }
}

impl SyncSource for ManualClock {
    fn position_secs(&self) -> f64 {
        *lock(&self.secs)
    }

    fn reset(&self) {
        *lock(&self.secs) = 0.0;
        *lock(&self.resets) += 1;
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Timestamp in the reference stream (ns).
    pub reference_ns: u64,
    /// Timestamp in the measured stream (ns).
    pub measured_ns: u64,
}

impl DriftMeasurement {
    /// Build a measurement from second-based timestamps.
    pub fn from_secs(reference_secs: f64, measured_secs: f64) -> Self {
        Self {
            reference_ns: PlaybackClock::secs_to_ns(reference_secs.max(0.0)),
            measured_ns: PlaybackClock::secs_to_ns(measured_secs.max(0.0)),
        }
    }

    /// Drift in nanoseconds (positive = measured is ahead).
    pub fn drift_ns(&self) -> i64 {
        self.measured_ns as i64 - self.reference_ns as i64
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_ns() as f64 / 1_000_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}

/// Fixed-cadence tick controller.
#[derive(Debug)]
pub struct RateController {
    target_interval_ns: u64,
    last_tick_ns: Option<u64>,
}

impl RateController {
    /// Create a controller targeting the given Hz rate.
    pub fn new(target_hz: u32) -> Self {
        Self {
            target_interval_ns: 1_000_000_000 / target_hz.max(1) as u64,
            last_tick_ns: None,
        }
    }

    /// Returns true and records the tick when enough time has passed.
    /// The first call always returns true.
    pub fn should_tick(&mut self, current_ns: u64) -> bool {
        match self.last_tick_ns {
            None => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            Some(last) if current_ns >= last + self.target_interval_ns => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            _ => false,
        }
    }

    /// Target interval in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.target_interval_ns
    }
}

/// A sleep that [`CancellableSleep::cancel`] interrupts from another thread.
///
/// Once cancelled, every later sleep returns immediately until
/// [`CancellableSleep::rearm`] is called.
#[derive(Debug, Default)]
pub struct CancellableSleep {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancellableSleep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration`. Returns false if cancelled before it elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = lock(&self.cancelled);
        let (guard, _timeout) = self
            .wake
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !*guard
    }

    /// Wake every sleeper and make later sleeps return immediately.
    pub fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.wake.notify_all();
    }

    /// Allow sleeps again.
    pub fn rearm(&self) {
        *lock(&self.cancelled) = false;
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }
}
