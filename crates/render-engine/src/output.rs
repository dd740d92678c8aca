//! Output files for batch rendering.
//!
//! Encoding is the file collaborator's concern. The engine writes planar
//! audio fragments and batches of frames through [`OutputFile`]; the
//! built-in [`RawOutputFormat`] stores them uncompressed next to a JSON
//! manifest.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use montage_common::error::{MontageError, MontageResult};

use crate::buffers::Frame;

/// Stream parameters of a file to create.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub path: PathBuf,
    pub audio: bool,
    pub sample_rate: u32,
    pub channels: usize,
    pub video: bool,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

/// A file format able to create output files.
pub trait OutputFormat: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, spec: &OutputSpec) -> MontageResult<Box<dyn OutputFile>>;
}

/// An open output file.
pub trait OutputFile: Send {
    /// Largest number of frames the writer accepts per `write_frames` call,
    /// if the format imposes one.
    fn max_pending_frames(&self) -> Option<usize> {
        None
    }

    /// Append planar audio. Every channel slice has the same length.
    fn write_audio(&mut self, channels: &[&[f64]]) -> MontageResult<()>;

    /// Append frames in presentation order.
    fn write_frames(&mut self, frames: &[Frame]) -> MontageResult<()>;

    fn close(&mut self) -> MontageResult<()>;
}

/// Manifest written next to raw output streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawManifest {
    pub format: String,
    pub sample_rate: u32,
    pub channels: usize,
    pub samples: u64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub frames: u64,
    /// Timeline number of the first written frame.
    pub first_frame: Option<i64>,
}

/// Interleaved little-endian f32 audio (`.pcm`), RGBA8 frames (`.rgba`) and
/// a `.json` manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawOutputFormat;

impl RawOutputFormat {
    pub fn audio_path(path: &Path) -> PathBuf {
        path.with_extension("pcm")
    }

    pub fn video_path(path: &Path) -> PathBuf {
        path.with_extension("rgba")
    }

    pub fn manifest_path(path: &Path) -> PathBuf {
        path.with_extension("json")
    }
}

impl OutputFormat for RawOutputFormat {
    fn name(&self) -> &str {
        "raw"
    }

    fn open(&self, spec: &OutputSpec) -> MontageResult<Box<dyn OutputFile>> {
        if let Some(parent) = spec.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let create = |path: PathBuf| -> MontageResult<BufWriter<File>> {
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|e| MontageError::output(format!("Cannot create {}: {e}", path.display())))
        };
        let audio = if spec.audio {
            Some(create(Self::audio_path(&spec.path))?)
        } else {
            None
        };
        let video = if spec.video {
            Some(create(Self::video_path(&spec.path))?)
        } else {
            None
        };
        tracing::info!(path = %spec.path.display(), audio = spec.audio, video = spec.video, "Opened raw output");
        Ok(Box::new(RawOutputFile {
            spec: spec.clone(),
            audio,
            video,
            samples: 0,
            frames: 0,
            first_frame: None,
        }))
    }
}

struct RawOutputFile {
    spec: OutputSpec,
    audio: Option<BufWriter<File>>,
    video: Option<BufWriter<File>>,
    samples: u64,
    frames: u64,
    first_frame: Option<i64>,
}

impl OutputFile for RawOutputFile {
    fn write_audio(&mut self, channels: &[&[f64]]) -> MontageResult<()> {
        let Some(writer) = self.audio.as_mut() else {
            return Err(MontageError::output("File has no audio stream"));
        };
        let len = channels.first().map(|c| c.len()).unwrap_or(0);
        let mut interleaved = Vec::with_capacity(len * self.spec.channels * 4);
        for i in 0..len {
            for channel in 0..self.spec.channels {
                let sample = channels.get(channel).and_then(|c| c.get(i)).copied().unwrap_or(0.0);
                interleaved.extend_from_slice(&(sample as f32).to_le_bytes());
            }
        }
        writer.write_all(&interleaved)?;
        self.samples += len as u64;
        Ok(())
    }

    fn write_frames(&mut self, frames: &[Frame]) -> MontageResult<()> {
        let Some(writer) = self.video.as_mut() else {
            return Err(MontageError::output("File has no video stream"));
        };
        for frame in frames {
            if frame.width() != self.spec.width || frame.height() != self.spec.height {
                return Err(MontageError::output(format!(
                    "Frame is {}x{}, file expects {}x{}",
                    frame.width(),
                    frame.height(),
                    self.spec.width,
                    self.spec.height
                )));
            }
            writer.write_all(&frame.to_rgba8())?;
            self.first_frame.get_or_insert(frame.number());
            self.frames += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> MontageResult<()> {
        if let Some(mut writer) = self.audio.take() {
            writer.flush()?;
        }
        if let Some(mut writer) = self.video.take() {
            writer.flush()?;
        }
        let manifest = RawManifest {
            format: "montage-raw".to_string(),
            sample_rate: self.spec.sample_rate,
            channels: self.spec.channels,
            samples: self.samples,
            frame_rate: self.spec.frame_rate,
            width: self.spec.width,
            height: self.spec.height,
            frames: self.frames,
            first_frame: self.first_frame,
        };
        let path = RawOutputFormat::manifest_path(&self.spec.path);
        std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
        tracing::info!(path = %path.display(), samples = self.samples, frames = self.frames, "Closed raw output");
        Ok(())
    }
}

/// Everything written to one in-memory output file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    /// Planar samples per channel.
    pub audio: Vec<Vec<f64>>,
    pub frames: Vec<Frame>,
    /// Size of every `write_frames` call.
    pub frame_batches: Vec<usize>,
    pub closed: bool,
}

/// Output format that keeps everything in memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutputFormat {
    captures: Arc<Mutex<HashMap<PathBuf, CapturedOutput>>>,
    pending_limit: Option<usize>,
    fail_open: bool,
}

impl MemoryOutputFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a writer limit through `max_pending_frames`.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = Some(limit);
        self
    }

    /// Make every `open` fail.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, CapturedOutput>> {
        self.captures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capture(&self, path: &Path) -> Option<CapturedOutput> {
        self.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl OutputFormat for MemoryOutputFormat {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, spec: &OutputSpec) -> MontageResult<Box<dyn OutputFile>> {
        if self.fail_open {
            return Err(MontageError::output(format!(
                "Cannot open {}",
                spec.path.display()
            )));
        }
        self.lock().insert(
            spec.path.clone(),
            CapturedOutput {
                audio: vec![Vec::new(); if spec.audio { spec.channels } else { 0 }],
                ..CapturedOutput::default()
            },
        );
        Ok(Box::new(MemoryOutputFile {
            path: spec.path.clone(),
            captures: Arc::clone(&self.captures),
            pending_limit: self.pending_limit,
        }))
    }
}

struct MemoryOutputFile {
    path: PathBuf,
    captures: Arc<Mutex<HashMap<PathBuf, CapturedOutput>>>,
    pending_limit: Option<usize>,
}

impl MemoryOutputFile {
    fn with_capture<T>(&self, f: impl FnOnce(&mut CapturedOutput) -> T) -> MontageResult<T> {
        let mut captures = self
            .captures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        captures
            .get_mut(&self.path)
            .map(f)
            .ok_or_else(|| MontageError::output(format!("{} was not opened", self.path.display())))
    }
}

impl OutputFile for MemoryOutputFile {
    fn max_pending_frames(&self) -> Option<usize> {
        self.pending_limit
    }

    fn write_audio(&mut self, channels: &[&[f64]]) -> MontageResult<()> {
        self.with_capture(|capture| {
            for (target, source) in capture.audio.iter_mut().zip(channels) {
                target.extend_from_slice(source);
            }
        })
    }

    fn write_frames(&mut self, frames: &[Frame]) -> MontageResult<()> {
        if let Some(limit) = self.pending_limit {
            if frames.len() > limit {
                return Err(MontageError::output(format!(
                    "{} frames exceed the writer limit of {limit}",
                    frames.len()
                )));
            }
        }
        self.with_capture(|capture| {
            capture.frames.extend_from_slice(frames);
            capture.frame_batches.push(frames.len());
        })
    }

    fn close(&mut self) -> MontageResult<()> {
        self.with_capture(|capture| capture.closed = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: PathBuf) -> OutputSpec {
        OutputSpec {
            path,
            audio: true,
            sample_rate: 100,
            channels: 2,
            video: true,
            frame_rate: 10.0,
            width: 2,
            height: 1,
        }
    }

    #[test]
    fn test_raw_output_writes_streams_and_manifest() {
        let dir = std::env::temp_dir().join(format!("montage_raw_{}", std::process::id()));
        let path = dir.join("out.raw");
        let mut file = RawOutputFormat.open(&spec(path.clone())).unwrap();
        file.write_audio(&[&[0.5, 1.0], &[-0.5, 0.0]]).unwrap();
        let mut frame = Frame::new(2, 1);
        frame.fill([1.0, 0.0, 0.0, 1.0]);
        frame.set_number(7);
        file.write_frames(&[frame]).unwrap();
        file.close().unwrap();

        let pcm = std::fs::read(RawOutputFormat::audio_path(&path)).unwrap();
        assert_eq!(pcm.len(), 2 * 2 * 4);
        assert_eq!(&pcm[4..8], &(-0.5f32).to_le_bytes());
        let rgba = std::fs::read(RawOutputFormat::video_path(&path)).unwrap();
        assert_eq!(rgba, vec![255, 0, 0, 255, 255, 0, 0, 255]);

        let manifest: RawManifest = serde_json::from_str(
            &std::fs::read_to_string(RawOutputFormat::manifest_path(&path)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.samples, 2);
        assert_eq!(manifest.frames, 1);
        assert_eq!(manifest.first_frame, Some(7));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_raw_output_rejects_wrong_frame_size() {
        let dir = std::env::temp_dir().join(format!("montage_raw_size_{}", std::process::id()));
        let mut file = RawOutputFormat.open(&spec(dir.join("out.raw"))).unwrap();
        assert!(file.write_frames(&[Frame::new(3, 3)]).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_output_enforces_pending_limit() {
        let format = MemoryOutputFormat::new().with_pending_limit(2);
        let path = PathBuf::from("memory/out");
        let mut file = format.open(&spec(path.clone())).unwrap();
        assert_eq!(file.max_pending_frames(), Some(2));
        file.write_frames(&[Frame::new(2, 1), Frame::new(2, 1)]).unwrap();
        assert!(file.write_frames(&vec![Frame::new(2, 1); 3]).is_err());
        file.write_audio(&[&[0.25], &[0.75]]).unwrap();
        file.close().unwrap();

        let capture = format.capture(&path).unwrap();
        assert_eq!(capture.frame_batches, vec![2]);
        assert_eq!(capture.audio, vec![vec![0.25], vec![0.75]]);
        assert!(capture.closed);
    }

    #[test]
    fn test_failing_format() {
        assert!(MemoryOutputFormat::failing()
            .open(&spec(PathBuf::from("x")))
            .is_err());
    }
}
