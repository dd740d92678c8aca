//! Realtime output devices.
//!
//! Devices are shared between the schedule writing to them and the engine
//! interrupting them, so every method takes `&self`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use montage_common::clock::{CancellableSleep, PlaybackClock};
use montage_common::error::{MontageError, MontageResult};

use crate::buffers::Frame;

/// Parameters for opening an audio device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutConfig {
    pub sample_rate: u32,
    pub channels: usize,
    pub fragment_len: usize,
    pub speed: f64,
}

/// Parameters for opening a video device.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// A sink for rendered audio.
pub trait AudioDevice: Send + Sync {
    fn open(&self, config: &AudioOutConfig) -> MontageResult<()>;

    /// Queue one fragment. May block under device backpressure.
    fn write(&self, channels: &[&[f64]]) -> MontageResult<()>;

    /// Samples presented since open.
    fn position(&self) -> i64;

    /// Mark the last queued fragment as final.
    fn set_last_buffer(&self);

    /// Block until queued audio has played or the device is interrupted.
    fn wait_for_completion(&self);

    /// Abort pending writes and waits.
    fn interrupt(&self);

    fn close(&self);
}

/// A sink for rendered frames.
pub trait VideoDevice: Send + Sync {
    fn open(&self, config: &VideoOutConfig) -> MontageResult<()>;

    fn write_frame(&self, frame: &Frame) -> MontageResult<()>;

    fn interrupt(&self);

    fn close(&self);
}

/// Creates the devices for one armed command.
pub trait DeviceFactory: Send + Sync {
    fn audio(&self) -> Arc<dyn AudioDevice>;

    fn video(&self) -> Arc<dyn VideoDevice>;
}

/// Factory for headless devices paced by the wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDevices;

impl DeviceFactory for NullDevices {
    fn audio(&self) -> Arc<dyn AudioDevice> {
        Arc::new(NullAudioDevice::new())
    }

    fn video(&self) -> Arc<dyn VideoDevice> {
        Arc::new(NullVideoDevice::new())
    }
}

#[derive(Debug, Default)]
struct NullAudioState {
    config: Option<AudioOutConfig>,
    clock: Option<PlaybackClock>,
    written: i64,
    last_buffer: bool,
}

/// Audio device that discards samples but plays them out in real time.
///
/// Writes block once more than two fragments are queued ahead of the
/// clock, which gives the audio schedule realistic backpressure.
#[derive(Debug, Default)]
pub struct NullAudioDevice {
    state: Mutex<NullAudioState>,
    sleep: CancellableSleep,
}

impl NullAudioDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NullAudioState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seconds of queued audio not yet presented.
    fn queued_secs(state: &NullAudioState) -> f64 {
        match (&state.config, &state.clock) {
            (Some(config), Some(clock)) => {
                let rate = config.sample_rate as f64 * config.speed.abs().max(f64::EPSILON);
                (state.written as f64 / rate - clock.elapsed_secs()).max(0.0)
            }
            _ => 0.0,
        }
    }

    pub fn samples_written(&self) -> i64 {
        self.lock().written
    }

    pub fn is_last_buffer(&self) -> bool {
        self.lock().last_buffer
    }
}

impl AudioDevice for NullAudioDevice {
    fn open(&self, config: &AudioOutConfig) -> MontageResult<()> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(MontageError::device(format!(
                "Invalid audio parameters: {} Hz, {} channels",
                config.sample_rate, config.channels
            )));
        }
        self.sleep.rearm();
        *self.lock() = NullAudioState {
            config: Some(config.clone()),
            clock: None,
            written: 0,
            last_buffer: false,
        };
        Ok(())
    }

    fn write(&self, channels: &[&[f64]]) -> MontageResult<()> {
        let wait = {
            let mut state = self.lock();
            let config = state
                .config
                .clone()
                .ok_or_else(|| MontageError::device("Audio device is not open"))?;
            if state.clock.is_none() {
                state.clock = Some(PlaybackClock::start());
            }
            state.written += channels.first().map(|c| c.len()).unwrap_or(0) as i64;
            let rate = config.sample_rate as f64 * config.speed.abs().max(f64::EPSILON);
            let headroom = 2.0 * config.fragment_len as f64 / rate;
            Self::queued_secs(&state) - headroom
        };
        if wait > 0.0 {
            self.sleep.sleep(Duration::from_secs_f64(wait));
        }
        Ok(())
    }

    fn position(&self) -> i64 {
        let state = self.lock();
        match (&state.config, &state.clock) {
            (Some(config), Some(clock)) => {
                let rate = config.sample_rate as f64 * config.speed.abs();
                ((clock.elapsed_secs() * rate) as i64).min(state.written)
            }
            _ => 0,
        }
    }

    fn set_last_buffer(&self) {
        self.lock().last_buffer = true;
    }

    fn wait_for_completion(&self) {
        let remaining = Self::queued_secs(&self.lock());
        if remaining > 0.0 {
            self.sleep.sleep(Duration::from_secs_f64(remaining));
        }
    }

    fn interrupt(&self) {
        self.sleep.cancel();
    }

    fn close(&self) {
        let mut state = self.lock();
        state.config = None;
        state.clock = None;
    }
}

/// Video device that counts and discards frames.
#[derive(Debug, Default)]
pub struct NullVideoDevice {
    open: AtomicBool,
    frames: AtomicU64,
}

impl NullVideoDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl VideoDevice for NullVideoDevice {
    fn open(&self, config: &VideoOutConfig) -> MontageResult<()> {
        if config.width == 0 || config.height == 0 || config.frame_rate <= 0.0 {
            return Err(MontageError::device(format!(
                "Invalid video parameters: {}x{} @ {} fps",
                config.width, config.height, config.frame_rate
            )));
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn write_frame(&self, _frame: &Frame) -> MontageResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(MontageError::device("Video device is not open"));
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn interrupt(&self) {}

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(fragment_len: usize) -> AudioOutConfig {
        AudioOutConfig {
            sample_rate: 1000,
            channels: 1,
            fragment_len,
            speed: 1.0,
        }
    }

    #[test]
    fn test_null_audio_rejects_bad_parameters() {
        let device = NullAudioDevice::new();
        let mut bad = config(10);
        bad.channels = 0;
        assert!(device.open(&bad).is_err());
        assert!(device.write(&[&[0.0; 4]]).is_err());
    }

    #[test]
    fn test_null_audio_position_never_exceeds_written() {
        let device = NullAudioDevice::new();
        device.open(&config(10)).unwrap();
        device.write(&[&[0.0; 10]]).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(device.position(), 10);
        assert_eq!(device.samples_written(), 10);
    }

    #[test]
    fn test_interrupt_cuts_completion_wait() {
        let device = Arc::new(NullAudioDevice::new());
        device.open(&config(100_000)).unwrap();
        device.write(&[&vec![0.0; 100_000]]).unwrap();
        device.set_last_buffer();
        assert!(device.is_last_buffer());

        let started = Instant::now();
        let waiter = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || device.wait_for_completion())
        };
        std::thread::sleep(Duration::from_millis(20));
        device.interrupt();
        waiter.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_null_video_counts_frames() {
        let device = NullDevices.video();
        let config = VideoOutConfig {
            width: 4,
            height: 4,
            frame_rate: 25.0,
        };
        device.open(&config).unwrap();
        device.write_frame(&Frame::new(4, 4)).unwrap();
        device.close();
        assert!(device.write_frame(&Frame::new(4, 4)).is_err());
    }
}
