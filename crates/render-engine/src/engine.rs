//! Render engine: arms the audio and video schedules for one command and
//! runs them against realtime devices.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use montage_common::clock::{CancellableSleep, SoftwareTimer, SyncSource};
use montage_common::config::AppConfig;
use montage_common::error::{MontageError, MontageResult};
use montage_common::logging::SCHEDULE_TARGET;
use montage_timeline::{from_secs, to_secs, Direction, Edl, MediaKind};

use crate::audio::{AudioSchedule, SharedMeter};
use crate::cache::AssetCache;
use crate::device::{AudioDevice, AudioOutConfig, DeviceFactory, VideoDevice, VideoOutConfig};
use crate::graph::VirtualConsole;
use crate::plugin::PluginRegistry;
use crate::schedule::{PlaybackRange, ScheduleCursor, SchedulePolicy};
use crate::video::{AvSync, VideoSchedule};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What to play or render.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCommand {
    pub start_secs: f64,
    /// End of the range. `None` plays to the end of the timeline.
    pub end_secs: Option<f64>,
    pub direction: Direction,
    pub speed: f64,
    /// Open devices and pace against the sync position. Batch rendering
    /// drives the schedules directly instead.
    pub realtime: bool,
    /// Show the frame under `start_secs` and stop.
    pub single_frame: bool,
    pub looping: bool,
}

impl Default for TransportCommand {
    fn default() -> Self {
        Self {
            start_secs: 0.0,
            end_secs: None,
            direction: Direction::Forward,
            speed: 1.0,
            realtime: true,
            single_frame: false,
            looping: false,
        }
    }
}

impl TransportCommand {
    pub fn batch(start_secs: f64, end_secs: f64) -> Self {
        Self {
            start_secs,
            end_secs: Some(end_secs),
            realtime: false,
            ..Self::default()
        }
    }

    /// Playback range of `kind` in project units.
    pub fn range(&self, edl: &Edl, kind: MediaKind) -> PlaybackRange {
        let rate = edl.rate(kind);
        let start = from_secs(self.start_secs.max(0.0), rate);
        let end = match (self.single_frame, self.end_secs) {
            (true, _) => start + 1,
            (false, Some(end)) => from_secs(end, rate),
            (false, None) => edl.total_length(kind),
        };
        PlaybackRange::new(start, end)
    }
}

/// Callbacks for whatever displays playback progress.
pub trait PlaybackObserver: Send + Sync {
    /// Achieved video frame rate.
    fn framerate(&self, _fps: f64) {}

    /// Timeline position in seconds now audible or visible.
    fn tracking(&self, _secs: f64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl PlaybackObserver for NoopObserver {}

/// Held until the first video frame is presented; the audio schedule waits
/// on it before writing its first buffer.
#[derive(Debug, Default)]
pub struct FirstFrameLatch {
    held: Mutex<bool>,
    released: Condvar,
}

impl FirstFrameLatch {
    pub fn new(held: bool) -> Self {
        Self {
            held: Mutex::new(held),
            released: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let guard = lock(&self.held);
        let _guard = self
            .released
            .wait_while(guard, |held| *held)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    pub fn release(&self) {
        *lock(&self.held) = false;
        self.released.notify_all();
    }

    pub fn is_held(&self) -> bool {
        *lock(&self.held)
    }
}

/// Sync position derived from the samples an audio device has presented.
struct DeviceSync {
    device: Arc<dyn AudioDevice>,
    sample_rate: f64,
    speed: f64,
    baseline: AtomicI64,
}

impl SyncSource for DeviceSync {
    fn position_secs(&self) -> f64 {
        let played = self.device.position() - self.baseline.load(Ordering::Acquire);
        played as f64 / self.sample_rate / self.speed
    }

    fn reset(&self) {
        self.baseline.store(self.device.position(), Ordering::Release);
    }
}

/// State shared between the engine and its schedule threads.
pub struct EngineShared {
    interrupted: AtomicBool,
    interrupt_lock: Mutex<()>,
    latch: FirstFrameLatch,
    tracking: Mutex<f64>,
    sync: Arc<dyn SyncSource>,
    sleep: CancellableSleep,
    speed: f64,
    observer: Arc<dyn PlaybackObserver>,
    audio_device: Option<Arc<dyn AudioDevice>>,
    video_device: Option<Arc<dyn VideoDevice>>,
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("interrupted", &self.is_interrupted())
            .field("latch_held", &self.latch.is_held())
            .field("tracking", &self.tracking())
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl EngineShared {
    /// Shared state without devices, paced by `sync`.
    pub fn new(sync: Arc<dyn SyncSource>, latch_held: bool, speed: f64) -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            interrupt_lock: Mutex::new(()),
            latch: FirstFrameLatch::new(latch_held),
            tracking: Mutex::new(0.0),
            sync,
            sleep: CancellableSleep::new(),
            speed: if speed.abs() > f64::EPSILON { speed.abs() } else { 1.0 },
            observer: Arc::new(NoopObserver),
            audio_device: None,
            video_device: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PlaybackObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn with_devices(
        mut self,
        audio: Option<Arc<dyn AudioDevice>>,
        video: Option<Arc<dyn VideoDevice>>,
    ) -> Self {
        self.audio_device = audio;
        self.video_device = video;
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Stop both schedules: pending device writes, sleeps and the latch
    /// all return promptly.
    pub fn interrupt(&self) {
        let _guard = lock(&self.interrupt_lock);
        self.interrupted.store(true, Ordering::Release);
        if let Some(device) = &self.audio_device {
            device.interrupt();
        }
        if let Some(device) = &self.video_device {
            device.interrupt();
        }
        self.sleep.cancel();
        self.latch.release();
    }

    pub fn latch(&self) -> &FirstFrameLatch {
        &self.latch
    }

    pub fn sync(&self) -> &dyn SyncSource {
        self.sync.as_ref()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Sleep unless interrupted. Returns false if the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep.sleep(duration)
    }

    pub fn set_tracking(&self, secs: f64) {
        *lock(&self.tracking) = secs;
        self.observer.tracking(secs);
    }

    pub fn tracking(&self) -> f64 {
        *lock(&self.tracking)
    }

    pub fn report_framerate(&self, fps: f64) {
        tracing::debug!(target: SCHEDULE_TARGET, fps, "Achieved frame rate");
        self.observer.framerate(fps);
    }
}

/// Media kinds the armed command renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Duty {
    pub audio: bool,
    pub video: bool,
}

impl Duty {
    pub fn of(command: &TransportCommand, edl: &Edl) -> Self {
        Self {
            audio: !command.single_frame
                && edl.session.audio_channels > 0
                && edl.tracks_of(MediaKind::Audio).any(|t| t.play),
            video: edl.tracks_of(MediaKind::Video).any(|t| t.play),
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Armed,
    Running,
    Finished,
}

type ScheduleThread<S> = JoinHandle<(S, MontageResult<()>)>;

/// Owns the schedules of one armed command.
pub struct RenderEngine {
    config: AppConfig,
    devices: Arc<dyn DeviceFactory>,
    cache: Arc<AssetCache>,
    registry: Arc<PluginRegistry>,
    observer: Arc<dyn PlaybackObserver>,
    state: EngineState,
    command: Option<TransportCommand>,
    edl: Option<Arc<Edl>>,
    duty: Duty,
    audio: Option<AudioSchedule>,
    video: Option<VideoSchedule>,
    shared: Option<Arc<EngineShared>>,
    audio_thread: Option<ScheduleThread<AudioSchedule>>,
    video_thread: Option<ScheduleThread<VideoSchedule>>,
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("state", &self.state)
            .field("duty", &self.duty)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl RenderEngine {
    pub fn new(
        config: AppConfig,
        devices: Arc<dyn DeviceFactory>,
        cache: Arc<AssetCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            config,
            devices,
            cache,
            registry,
            observer: Arc::new(NoopObserver),
            state: EngineState::Idle,
            command: None,
            edl: None,
            duty: Duty::default(),
            audio: None,
            video: None,
            shared: None,
            audio_thread: None,
            video_thread: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PlaybackObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == EngineState::Armed
    }

    pub fn duty(&self) -> Duty {
        self.duty
    }

    pub fn edl(&self) -> Option<&Arc<Edl>> {
        self.edl.as_ref()
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioSchedule> {
        self.audio.as_mut()
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoSchedule> {
        self.video.as_mut()
    }

    pub fn meter(&self) -> Option<SharedMeter> {
        self.audio.as_ref().map(AudioSchedule::meter)
    }

    /// Handle for interrupting from another thread.
    pub fn shared(&self) -> Option<Arc<EngineShared>> {
        self.shared.clone()
    }

    pub fn tracking_position(&self) -> f64 {
        self.shared.as_ref().map(|s| s.tracking()).unwrap_or(0.0)
    }

    /// Audio fragment length adjusted for the playback speed.
    pub fn adjusted_fragment_len(fragment_len: i64, speed: f64) -> usize {
        let fragment_len = fragment_len.max(1);
        let speed = if speed.abs() > f64::EPSILON { speed.abs() } else { 1.0 };
        let scaled = (fragment_len as f64 / speed).round() as i64;
        fragment_len.max(scaled) as usize
    }

    /// Snapshot `edl`, decide duty, open devices for realtime commands and
    /// create the schedules.
    ///
    /// A failing audio device only drops audio duty. A failing video
    /// device closes whatever was opened and leaves the engine unarmed.
    pub fn arm(&mut self, command: TransportCommand, edl: Arc<Edl>) -> MontageResult<()> {
        match self.state {
            EngineState::Running => {
                return Err(MontageError::render("Cannot arm a running engine"));
            }
            EngineState::Armed | EngineState::Finished => self.disarm(),
            EngineState::Idle => {}
        }

        let mut duty = Duty::of(&command, &edl);
        if duty.is_idle() {
            return Err(MontageError::render("Nothing to play: no track has its play flag set"));
        }

        let speed = if command.speed.abs() > f64::EPSILON { command.speed.abs() } else { 1.0 };
        let fragment_len = Self::adjusted_fragment_len(self.config.playback.audio_fragment_len, speed);
        let session = &edl.session;

        let mut audio_device = None;
        let mut video_device = None;
        if command.realtime {
            if duty.audio {
                let device = self.devices.audio();
                let config = AudioOutConfig {
                    sample_rate: session.sample_rate,
                    channels: session.audio_channels,
                    fragment_len,
                    speed,
                };
                match device.open(&config) {
                    Ok(()) => audio_device = Some(device),
                    Err(e) => {
                        tracing::warn!(error = %e, "Audio device unavailable, playing without audio");
                        duty.audio = false;
                    }
                }
            }
            if duty.video {
                let device = self.devices.video();
                let config = VideoOutConfig {
                    width: session.output_width,
                    height: session.output_height,
                    frame_rate: session.frame_rate,
                };
                if let Err(e) = device.open(&config) {
                    if let Some(audio) = &audio_device {
                        audio.close();
                    }
                    tracing::error!(error = %e, "Video device failed to open");
                    return Err(e);
                }
                video_device = Some(device);
            }
        }

        let sync: Arc<dyn SyncSource> = match &audio_device {
            Some(device) => Arc::new(DeviceSync {
                device: Arc::clone(device),
                sample_rate: session.sample_rate as f64,
                speed,
                baseline: AtomicI64::new(0),
            }),
            None => Arc::new(SoftwareTimer::new()),
        };
        let shared = EngineShared::new(sync, duty.video && command.realtime, speed)
            .with_observer(Arc::clone(&self.observer))
            .with_devices(audio_device, video_device);

        self.audio = duty.audio.then(|| {
            let console = self.console(MediaKind::Audio, &edl, command.direction);
            let cursor = ScheduleCursor::new(
                command.range(&edl, MediaKind::Audio),
                command.direction,
                command.looping,
            );
            AudioSchedule::new(console, cursor, fragment_len, session.audio_channels)
        });
        self.video = duty.video.then(|| {
            let console = self.console(MediaKind::Video, &edl, command.direction);
            let cursor = ScheduleCursor::new(
                command.range(&edl, MediaKind::Video),
                command.direction,
                command.looping,
            );
            let sync = AvSync::new(
                session.frame_rate,
                self.config.playback.sync_threshold,
                self.config.playback.video_every_frame || !command.realtime,
            );
            VideoSchedule::new(console, cursor, sync)
        });

        shared.set_tracking(command.start_secs);
        tracing::info!(
            audio = duty.audio,
            video = duty.video,
            realtime = command.realtime,
            fragment_len,
            direction = ?command.direction,
            "Engine armed"
        );

        self.shared = Some(Arc::new(shared));
        self.duty = duty;
        self.command = Some(command);
        self.edl = Some(edl);
        self.state = EngineState::Armed;
        Ok(())
    }

    fn console(&self, kind: MediaKind, edl: &Arc<Edl>, direction: Direction) -> VirtualConsole {
        VirtualConsole::new(
            kind,
            Arc::clone(edl),
            direction,
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
        )
    }

    /// Launch each armed schedule on its own thread.
    pub fn start(&mut self) -> MontageResult<()> {
        if self.state != EngineState::Armed {
            return Err(MontageError::render("Engine is not armed"));
        }
        let realtime = self.command.as_ref().map(|c| c.realtime).unwrap_or(false);
        if !realtime {
            return Err(MontageError::render("Batch commands are driven by the package renderer"));
        }
        let shared = self
            .shared
            .clone()
            .ok_or_else(|| MontageError::render("Engine is not armed"))?;

        let _guard = lock(&shared.interrupt_lock);
        if let (Some(mut schedule), Some(device)) = (self.audio.take(), shared.audio_device.clone()) {
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("montage-audio".into())
                .spawn(move || {
                    let result = schedule.run(device.as_ref(), &thread_shared);
                    if result.is_err() {
                        thread_shared.interrupt();
                    }
                    (schedule, result)
                })?;
            self.audio_thread = Some(handle);
        }
        if let (Some(mut schedule), Some(device)) = (self.video.take(), shared.video_device.clone()) {
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("montage-video".into())
                .spawn(move || {
                    let result = schedule.run(device.as_ref(), &thread_shared);
                    if result.is_err() {
                        thread_shared.interrupt();
                    }
                    (schedule, result)
                })?;
            self.video_thread = Some(handle);
        }
        self.state = EngineState::Running;
        tracing::debug!(target: SCHEDULE_TARGET, "Schedules started");
        Ok(())
    }

    pub fn interrupt(&self) {
        if let Some(shared) = &self.shared {
            tracing::debug!(target: SCHEDULE_TARGET, "Interrupting engine");
            shared.interrupt();
        }
    }

    /// Join the schedules, settle the final tracking position and close the
    /// devices. Returns the final position in seconds.
    pub fn wait(&mut self) -> MontageResult<f64> {
        let shared = self
            .shared
            .clone()
            .ok_or_else(|| MontageError::render("Engine is not armed"))?;

        // A failed or panicked schedule interrupts the other one, which is
        // still joined so the devices close and the position settles.
        let mut first_error = None;
        if let Some(handle) = self.video_thread.take() {
            match handle.join() {
                Ok((schedule, result)) => {
                    self.video = Some(schedule);
                    if let Err(e) = result {
                        shared.interrupt();
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => {
                    shared.interrupt();
                    first_error.get_or_insert(MontageError::render("Video schedule panicked"));
                }
            }
        }
        if let Some(handle) = self.audio_thread.take() {
            match handle.join() {
                Ok((schedule, result)) => {
                    self.audio = Some(schedule);
                    if let Err(e) = result {
                        shared.interrupt();
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => {
                    shared.interrupt();
                    first_error.get_or_insert(MontageError::render("Audio schedule panicked"));
                }
            }
        }

        let position = if shared.is_interrupted() {
            shared.tracking()
        } else if let (Some(audio), Some(device)) = (&self.audio, &shared.audio_device) {
            to_secs(
                audio.cursor().project(device.position()),
                audio.console().rate(),
            )
        } else if let Some(video) = &self.video {
            to_secs(video.cursor().position(), video.console().rate())
        } else {
            shared.tracking()
        };
        shared.set_tracking(position);
        self.close_devices();
        self.state = EngineState::Finished;

        tracing::info!(position, interrupted = shared.is_interrupted(), "Playback finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(position),
        }
    }

    fn close_devices(&self) {
        if let Some(shared) = &self.shared {
            if let Some(device) = &shared.audio_device {
                device.close();
            }
            if let Some(device) = &shared.video_device {
                device.close();
            }
        }
    }

    /// Drop the schedules and return to idle. Interrupts and joins a
    /// running engine first.
    pub fn disarm(&mut self) {
        if self.state == EngineState::Running {
            self.interrupt();
            if let Err(e) = self.wait() {
                tracing::warn!(error = %e, "Schedule failed while disarming");
            }
        } else if self.state == EngineState::Armed {
            self.close_devices();
        }
        self.audio = None;
        self.video = None;
        self.shared = None;
        self.command = None;
        self.edl = None;
        self.duty = Duty::default();
        self.state = EngineState::Idle;
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        if self.state == EngineState::Running {
            self.disarm();
        }
    }
}
