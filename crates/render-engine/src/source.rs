//! Media sources: the decode side of the asset collaborator.
//!
//! The engine only needs seek-and-read access to assets. File decoding is
//! supplied by a [`MediaOpener`]; the built-in [`GeneratorOpener`] produces
//! deterministic content for generator assets, which is what demos and
//! tests render.

use montage_common::error::{MontageError, MontageResult};
use montage_timeline::{Asset, AudioParams, Generator, MediaKind, VideoParams};

use crate::buffers::Frame;

/// An open asset, positioned independently per media kind.
pub trait MediaSource: Send {
    /// Seek to `position`, in the asset's native units for `kind`.
    fn set_position(&mut self, kind: MediaKind, position: i64);

    /// Fill `buffer` from `channel` and advance the audio position.
    fn read_samples(&mut self, channel: usize, buffer: &mut [f64]) -> MontageResult<()>;

    /// Fill `frame` from `layer` and advance the video position by one.
    fn read_frame(&mut self, layer: usize, frame: &mut Frame) -> MontageResult<()>;

    /// Approximate memory held while the source stays open.
    fn memory_usage(&self) -> u64 {
        0
    }
}

/// Opens assets for the asset cache.
pub trait MediaOpener: Send + Sync {
    fn open(&self, asset: &Asset) -> MontageResult<Box<dyn MediaSource>>;
}

/// Opener for generator assets. Assets backed by files are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratorOpener;

impl MediaOpener for GeneratorOpener {
    fn open(&self, asset: &Asset) -> MontageResult<Box<dyn MediaSource>> {
        match &asset.generator {
            Some(generator) => Ok(Box::new(GeneratorSource::new(
                generator.clone(),
                asset.audio.clone(),
                asset.video.clone(),
            ))),
            None => Err(MontageError::asset(format!(
                "No decoder available for {}",
                asset.path.display()
            ))),
        }
    }
}

/// Deterministic source backed by a [`Generator`].
#[derive(Debug, Clone)]
pub struct GeneratorSource {
    generator: Generator,
    audio: Option<AudioParams>,
    video: Option<VideoParams>,
    audio_position: i64,
    video_position: i64,
}

impl GeneratorSource {
    pub fn new(generator: Generator, audio: Option<AudioParams>, video: Option<VideoParams>) -> Self {
        Self {
            generator,
            audio,
            video,
            audio_position: 0,
            video_position: 0,
        }
    }

    fn sample_at(&self, params: &AudioParams, position: i64) -> f64 {
        if position < 0 || position >= params.length {
            return 0.0;
        }
        match &self.generator {
            Generator::Tone {
                frequency,
                amplitude,
            } => {
                let t = position as f64 / params.sample_rate.max(1) as f64;
                amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()
            }
            Generator::Solid { .. } => 0.0,
            Generator::Ramp { period } => {
                let period = (*period).max(1);
                position.rem_euclid(period) as f64 / period as f64 * 2.0 - 1.0
            }
        }
    }

    fn pixel_at(&self, params: &VideoParams, position: i64) -> [f32; 4] {
        if position < 0 || position >= params.length {
            return [0.0; 4];
        }
        match &self.generator {
            Generator::Tone { .. } => [0.5, 0.5, 0.5, 1.0],
            Generator::Solid { rgba } => *rgba,
            Generator::Ramp { period } => {
                let period = (*period).max(1);
                let level = position.rem_euclid(period) as f32 / period as f32;
                [level, level, level, 1.0]
            }
        }
    }
}

impl MediaSource for GeneratorSource {
    fn set_position(&mut self, kind: MediaKind, position: i64) {
        match kind {
            MediaKind::Audio => self.audio_position = position,
            MediaKind::Video => self.video_position = position,
        }
    }

    fn read_samples(&mut self, channel: usize, buffer: &mut [f64]) -> MontageResult<()> {
        let params = self
            .audio
            .as_ref()
            .ok_or_else(|| MontageError::asset("Generator has no audio stream"))?;
        if channel >= params.channels {
            return Err(MontageError::asset(format!(
                "Channel {channel} out of range ({} channels)",
                params.channels
            )));
        }
        for (i, sample) in buffer.iter_mut().enumerate() {
            *sample = self.sample_at(params, self.audio_position + i as i64);
        }
        self.audio_position += buffer.len() as i64;
        Ok(())
    }

    fn read_frame(&mut self, layer: usize, frame: &mut Frame) -> MontageResult<()> {
        let params = self
            .video
            .as_ref()
            .ok_or_else(|| MontageError::asset("Generator has no video stream"))?;
        if layer >= params.layers {
            return Err(MontageError::asset(format!(
                "Layer {layer} out of range ({} layers)",
                params.layers
            )));
        }
        frame.fill(self.pixel_at(params, self.video_position));
        self.video_position += 1;
        Ok(())
    }

    fn memory_usage(&self) -> u64 {
        self.video
            .as_ref()
            .map(|v| v.width as u64 * v.height as u64 * 16)
            .unwrap_or(4096)
    }
}
