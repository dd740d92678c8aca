//! Batch rendering of one package: a contiguous audio and video range
//! written to one output file.
//!
//! The renderer arms a private engine in batch mode and drives its
//! schedules directly. Audio is read in fixed fragments; each step renders
//! the video frames spanning the next audio fragment so the written
//! streams stay aligned. Before the package's first position the engine
//! runs for a preroll whose output is discarded, which warms up plugins
//! with internal history so a package matches a serial render at the same
//! absolute positions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use montage_common::clock::PlaybackClock;
use montage_common::config::{AppConfig, RenderConfig};
use montage_common::error::{MontageError, MontageResult};
use montage_common::logging::PACKAGE_TARGET;
use montage_timeline::{rescale, to_secs, Edl};

use crate::buffers::{Frame, Samples};
use crate::cache::AssetCache;
use crate::context::RenderContext;
use crate::device::NullDevices;
use crate::engine::{Duty, RenderEngine, TransportCommand};
use crate::output::{OutputFile, OutputFormat, OutputSpec};
use crate::plugin::PluginRegistry;

/// One unit of distributed rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPackage {
    /// First sample, at the project sample rate.
    pub audio_start: i64,
    pub audio_end: i64,
    /// First frame, at the project frame rate.
    pub video_start: i64,
    pub video_end: i64,
    pub path: PathBuf,
    /// Rendered in the background while editing; uses the background
    /// preroll.
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub done: bool,
}

/// How a package render ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    Done,
    /// Cancelled. The output was still flushed and closed.
    Aborted,
}

impl PackageOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            PackageOutcome::Done => 0,
            PackageOutcome::Aborted => 1,
        }
    }
}

/// Process exit code of a package result. Errors map to 2.
pub fn exit_code(result: &MontageResult<PackageOutcome>) -> i32 {
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(_) => 2,
    }
}

/// Lifecycle of a package render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Created,
    OutputOpen,
    EngineArmed,
    Running,
    Stopped,
    Closed,
    Failed,
}

/// Progress report of a package render.
#[derive(Debug, Clone)]
pub struct PackageProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Samples rendered so far, preroll included.
    pub samples_rendered: i64,

    /// Samples to render, preroll included.
    pub total_samples: i64,

    /// Video frames per second achieved so far.
    pub frames_per_second: f64,

    pub state: PackageState,
}

/// Progress callback for package rendering.
pub type ProgressCallback = Arc<dyn Fn(PackageProgress) + Send + Sync>;

/// Warm-up lengths rendered before a package's first position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preroll {
    pub audio: i64,
    pub video: i64,
}

impl Preroll {
    pub fn for_package(config: &RenderConfig, background: bool, sample_rate: f64, frame_rate: f64) -> Self {
        if background {
            let video = config.background_preroll_frames.max(0);
            Self {
                audio: (video as f64 / frame_rate * sample_rate) as i64,
                video,
            }
        } else {
            let secs = config.render_preroll_secs.max(0.0);
            Self {
                audio: (secs * sample_rate).round() as i64,
                video: (secs * frame_rate).round() as i64,
            }
        }
    }
}

/// Frames passed to the writer per call: at most one per processor and
/// never more than the writer or the configuration allow.
pub fn video_write_batch(config: &RenderConfig, writer_limit: Option<usize>) -> usize {
    let limit = writer_limit
        .unwrap_or(config.max_pending_frames)
        .min(config.max_pending_frames);
    config.processors.min(limit).max(1)
}

/// Renders packages of one timeline.
pub struct PackageRenderer {
    config: AppConfig,
    edl: Arc<Edl>,
    format: Arc<dyn OutputFormat>,
    cache: Arc<AssetCache>,
    registry: Arc<PluginRegistry>,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
    state: PackageState,
}

impl std::fmt::Debug for PackageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRenderer")
            .field("format", &self.format.name())
            .field("state", &self.state)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Mutable positions of one package render.
struct Progression {
    audio_position: i64,
    video_position: i64,
    audio_preroll: i64,
    video_preroll: i64,
    audio_read_len: i64,
    samples_rendered: i64,
    total_samples: i64,
    frames_rendered: u64,
}

impl PackageRenderer {
    pub fn new(
        config: AppConfig,
        edl: Arc<Edl>,
        format: Arc<dyn OutputFormat>,
        cache: Arc<AssetCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            config,
            edl,
            format,
            cache,
            registry,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
            state: PackageState::Created,
        }
    }

    /// Share a cancel flag with other renderers.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    fn set_state(&mut self, state: PackageState) {
        tracing::debug!(target: PACKAGE_TARGET, from = ?self.state, to = ?state, "Package state");
        self.state = state;
    }

    /// Render `package` into its output file.
    ///
    /// A failure to open the output is reported before anything is
    /// written. Cancellation still stops the engine and closes the output.
    pub fn render_package(&mut self, package: &RenderPackage) -> MontageResult<PackageOutcome> {
        self.state = PackageState::Created;
        let context = RenderContext::acquire();
        let result = self.render_with(package, &context);
        RenderContext::release(context);
        if let Err(e) = &result {
            tracing::error!(
                target: PACKAGE_TARGET,
                path = %package.path.display(),
                error = %e,
                "Package failed"
            );
            self.set_state(PackageState::Failed);
        }
        result
    }

    fn render_with(&mut self, package: &RenderPackage, context: &RenderContext) -> MontageResult<PackageOutcome> {
        let session = self.edl.session.clone();
        let sample_rate = session.sample_rate as f64;
        let frame_rate = session.frame_rate;
        if sample_rate <= 0.0 || frame_rate <= 0.0 {
            return Err(MontageError::config(format!(
                "Invalid session rates: {sample_rate} Hz, {frame_rate} fps"
            )));
        }

        let command = TransportCommand::batch(
            to_secs(package.audio_start, sample_rate),
            to_secs(package.audio_end, sample_rate),
        );
        let duty = Duty::of(&command, &self.edl);
        let spec = OutputSpec {
            path: package.path.clone(),
            audio: duty.audio,
            sample_rate: session.sample_rate,
            channels: session.audio_channels,
            video: duty.video,
            frame_rate,
            width: session.output_width,
            height: session.output_height,
        };
        let mut file = self.format.open(&spec)?;
        self.set_state(PackageState::OutputOpen);

        let mut engine = RenderEngine::new(
            self.config.clone(),
            Arc::new(NullDevices),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
        );
        if let Err(e) = engine.arm(command, Arc::clone(&self.edl)) {
            if let Err(close) = file.close() {
                tracing::warn!(target: PACKAGE_TARGET, error = %close, "Closing output failed");
            }
            return Err(e);
        }
        self.set_state(PackageState::EngineArmed);

        let preroll = Preroll::for_package(&self.config.render, package.background, sample_rate, frame_rate);
        let audio_read_len = ((self.config.render.audio_read_secs * sample_rate).round() as i64).max(1);
        let audio_position = package.audio_start - preroll.audio;
        let mut progression = Progression {
            audio_position,
            video_position: package.video_start - preroll.video,
            audio_preroll: preroll.audio,
            video_preroll: preroll.video,
            audio_read_len,
            samples_rendered: 0,
            total_samples: (package.audio_end - audio_position).max(1),
            frames_rendered: 0,
        };
        let batch = video_write_batch(&self.config.render, file.max_pending_frames());

        tracing::info!(
            target: PACKAGE_TARGET,
            path = %package.path.display(),
            audio = ?(package.audio_start, package.audio_end),
            video = ?(package.video_start, package.video_end),
            preroll = ?(preroll.audio, preroll.video),
            batch,
            "Rendering package"
        );

        self.set_state(PackageState::Running);
        let clock = PlaybackClock::start();
        let mut pending: Vec<Frame> = Vec::with_capacity(batch);
        let result = self.render_loop(
            package,
            &mut engine,
            file.as_mut(),
            &mut progression,
            &mut pending,
            batch,
            context,
            &clock,
        );

        // Flush whatever is pending even when cancelled.
        let result = result.and_then(|outcome| {
            if !pending.is_empty() {
                file.write_frames(&pending)?;
                pending.clear();
            }
            Ok(outcome)
        });

        engine.disarm();
        self.set_state(PackageState::Stopped);
        let closed = file.close();
        let outcome = result?;
        closed?;
        self.set_state(PackageState::Closed);

        tracing::info!(
            target: PACKAGE_TARGET,
            path = %package.path.display(),
            outcome = ?outcome,
            frames = progression.frames_rendered,
            secs = clock.elapsed_secs(),
            "Package finished"
        );
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn render_loop(
        &self,
        package: &RenderPackage,
        engine: &mut RenderEngine,
        file: &mut dyn OutputFile,
        progression: &mut Progression,
        pending: &mut Vec<Frame>,
        batch: usize,
        context: &RenderContext,
        clock: &PlaybackClock,
    ) -> MontageResult<PackageOutcome> {
        let session = &self.edl.session;
        let sample_rate = session.sample_rate as f64;
        let frame_rate = session.frame_rate;
        let channels = session.audio_channels;
        let mut outputs = vec![Samples::new(progression.audio_read_len as usize); channels];
        let mut frame = Frame::new(session.output_width, session.output_height);

        let mut audio_done = false;
        let mut video_done = false;
        while !audio_done || !video_done {
            let need_audio = !audio_done;
            let need_video = !video_done;
            let mut audio_len = 0;
            let mut samples_rendered = 0;
            if need_audio {
                audio_len = progression.audio_read_len;
                if progression.audio_position + audio_len >= package.audio_end {
                    audio_done = true;
                    audio_len = (package.audio_end - progression.audio_position).max(0);
                }
                samples_rendered = audio_len;
            }

            let mut video_len = 0;
            if need_video {
                video_len = if audio_done {
                    1
                } else {
                    rescale(progression.audio_position + audio_len, sample_rate, frame_rate)
                        - progression.video_position
                };
                if progression.video_position + video_len >= package.video_end {
                    video_done = true;
                    video_len = package.video_end - progression.video_position;
                }
                video_len = video_len.max(0);
                if audio_done {
                    samples_rendered = (video_len as f64 / frame_rate * sample_rate).round() as i64;
                }
            }

            if need_video {
                self.do_video(engine, file, progression, pending, &mut frame, video_len, batch, context)?;
            }
            if need_audio {
                self.do_audio(engine, file, progression, &mut outputs, audio_len)?;
            }

            progression.samples_rendered += samples_rendered;
            self.report(progression, clock);

            if self.is_cancelled() {
                tracing::info!(target: PACKAGE_TARGET, path = %package.path.display(), "Package cancelled");
                return Ok(PackageOutcome::Aborted);
            }
        }
        Ok(PackageOutcome::Done)
    }

    fn do_audio(
        &self,
        engine: &mut RenderEngine,
        file: &mut dyn OutputFile,
        progression: &mut Progression,
        outputs: &mut [Samples],
        len: i64,
    ) -> MontageResult<()> {
        if let Some(audio) = engine.audio_mut() {
            let len = len.max(0) as usize;
            audio.process_buffer(outputs, len, progression.audio_position)?;
            let skip = (progression.audio_preroll.max(0) as usize).min(len);
            let windows: Vec<&[f64]> = outputs.iter().map(|o| &o.window(len)[skip..]).collect();
            file.write_audio(&windows)?;
        }
        if progression.audio_preroll > 0 {
            progression.audio_preroll = (progression.audio_preroll - len).max(0);
        }
        progression.audio_position += len;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_video(
        &self,
        engine: &mut RenderEngine,
        file: &mut dyn OutputFile,
        progression: &mut Progression,
        pending: &mut Vec<Frame>,
        frame: &mut Frame,
        len: i64,
        batch: usize,
        context: &RenderContext,
    ) -> MontageResult<()> {
        for _ in 0..len {
            if let Some(video) = engine.video_mut() {
                video.process_buffer(frame, progression.video_position)?;
                context.record_frame();
                if progression.video_preroll > 0 {
                    progression.video_preroll -= 1;
                } else {
                    let mut output = frame.clone();
                    output.set_number(progression.video_position);
                    pending.push(output);
                    progression.frames_rendered += 1;
                    if pending.len() >= batch {
                        file.write_frames(pending)?;
                        pending.clear();
                    }
                }
            }
            progression.video_position += 1;
        }
        Ok(())
    }

    fn report(&self, progression: &Progression, clock: &PlaybackClock) {
        let Some(callback) = &self.progress else {
            return;
        };
        let elapsed = clock.elapsed_secs();
        callback(PackageProgress {
            progress: (progression.samples_rendered as f64 / progression.total_samples as f64).clamp(0.0, 1.0),
            samples_rendered: progression.samples_rendered,
            total_samples: progression.total_samples,
            frames_per_second: if elapsed > 0.0 {
                progression.frames_rendered as f64 / elapsed
            } else {
                0.0
            },
            state: self.state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryOutputFormat;
    use crate::source::GeneratorOpener;
    use montage_timeline::{Asset, AssetId, AudioParams, Edit, Generator, MediaKind, Session, Track, TrackId, VideoParams};
    use std::sync::Mutex;

    fn edl() -> Edl {
        let session = Session {
            sample_rate: 1000,
            frame_rate: 10.0,
            audio_channels: 1,
            output_width: 2,
            output_height: 2,
        };
        let asset = Asset::generated(
            AssetId(1),
            Generator::Ramp { period: 1000 },
            Some(AudioParams {
                channels: 1,
                sample_rate: 1000,
                length: 4000,
            }),
            Some(VideoParams {
                layers: 1,
                frame_rate: 10.0,
                width: 2,
                height: 2,
                length: 40,
            }),
        );
        Edl::new(session)
            .with_asset(asset)
            .with_track(Track::new(TrackId(1), MediaKind::Audio).with_edit(Edit::asset(0, 4000, AssetId(1))))
            .with_track(Track::new(TrackId(2), MediaKind::Video).with_edit(Edit::asset(0, 40, AssetId(1))))
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.render.render_preroll_secs = 0.0;
        config.render.processors = 4;
        config.render.audio_read_secs = 0.25;
        config
    }

    fn renderer(config: AppConfig, format: Arc<dyn OutputFormat>) -> PackageRenderer {
        PackageRenderer::new(
            config,
            Arc::new(edl()),
            format,
            Arc::new(AssetCache::new(Arc::new(GeneratorOpener), 1 << 20)),
            Arc::new(PluginRegistry::with_builtins()),
        )
    }

    fn package(path: &str, audio: (i64, i64), video: (i64, i64)) -> RenderPackage {
        RenderPackage {
            audio_start: audio.0,
            audio_end: audio.1,
            video_start: video.0,
            video_end: video.1,
            path: PathBuf::from(path),
            background: false,
            done: false,
        }
    }

    #[test]
    fn test_preroll_lengths() {
        let mut render = RenderConfig::default();
        render.render_preroll_secs = 0.5;
        render.background_preroll_frames = 3;
        assert_eq!(
            Preroll::for_package(&render, false, 48000.0, 30.0),
            Preroll { audio: 24000, video: 15 }
        );
        assert_eq!(
            Preroll::for_package(&render, true, 48000.0, 30.0),
            Preroll { audio: 4800, video: 3 }
        );
    }

    #[test]
    fn test_write_batch_limits() {
        let mut render = RenderConfig::default();
        render.processors = 8;
        render.max_pending_frames = 2;
        assert_eq!(video_write_batch(&render, None), 2);
        assert_eq!(video_write_batch(&render, Some(1)), 1);
        assert_eq!(video_write_batch(&render, Some(16)), 2);
        render.processors = 0;
        assert_eq!(video_write_batch(&render, None), 1);
    }

    #[test]
    fn test_package_writes_its_range() {
        let format = Arc::new(MemoryOutputFormat::new());
        let mut renderer = renderer(config(), Arc::clone(&format) as Arc<dyn OutputFormat>);
        let outcome = renderer
            .render_package(&package("a", (1000, 2000), (10, 20)))
            .unwrap();
        assert_eq!(outcome, PackageOutcome::Done);
        assert_eq!(renderer.state(), PackageState::Closed);

        let captured = format.capture(&PathBuf::from("a")).unwrap();
        assert!(captured.closed);
        assert_eq!(captured.audio[0].len(), 1000);
        // Ramp with period 1000 starts over at sample 1000.
        assert_eq!(captured.audio[0][0], -1.0);
        let numbers: Vec<i64> = captured.frames.iter().map(Frame::number).collect();
        assert_eq!(numbers, (10..20).collect::<Vec<_>>());
        assert!(captured.frame_batches.iter().all(|&n| n <= 2));
    }

    #[test]
    fn test_preroll_output_is_discarded() {
        let mut config = config();
        config.render.render_preroll_secs = 0.3;
        let format = Arc::new(MemoryOutputFormat::new().with_pending_limit(1));
        let mut renderer = renderer(config, Arc::clone(&format) as Arc<dyn OutputFormat>);
        renderer
            .render_package(&package("b", (1500, 2000), (15, 20)))
            .unwrap();
        let captured = format.capture(&PathBuf::from("b")).unwrap();
        assert_eq!(captured.audio[0].len(), 500);
        assert_eq!(captured.frames.first().map(Frame::number), Some(15));
        assert_eq!(captured.frames.len(), 5);
        assert!(captured.frame_batches.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_failed_open_writes_nothing() {
        let format = Arc::new(MemoryOutputFormat::failing());
        let mut renderer = renderer(config(), Arc::clone(&format) as Arc<dyn OutputFormat>);
        let result = renderer.render_package(&package("c", (0, 1000), (0, 10)));
        assert!(matches!(result, Err(MontageError::Output { .. })));
        assert_eq!(exit_code(&result), 2);
        assert_eq!(renderer.state(), PackageState::Failed);
        assert!(format.paths().is_empty());
    }

    #[test]
    fn test_cancel_aborts_and_closes() {
        let format = Arc::new(MemoryOutputFormat::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |p: PackageProgress| seen.lock().unwrap().push(p.samples_rendered))
        };
        let mut renderer = renderer(config(), Arc::clone(&format) as Arc<dyn OutputFormat>).with_progress(progress);
        renderer.cancel_flag().store(true, Ordering::Release);

        let result = renderer.render_package(&package("d", (0, 4000), (0, 40)));
        assert_eq!(exit_code(&result), 1);
        let captured = format.capture(&PathBuf::from("d")).unwrap();
        assert!(captured.closed);
        assert_eq!(captured.audio[0].len(), 250);
        assert_eq!(captured.frames.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![250]);
    }
}
