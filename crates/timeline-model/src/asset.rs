//! Source media referenced by edits.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier of an asset in a timeline's asset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u32);

/// Audio stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub channels: usize,
    pub sample_rate: u32,
    /// Length in samples.
    pub length: i64,
}

/// Video stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub layers: usize,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    /// Length in frames.
    pub length: i64,
}

/// Deterministic built-in source content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Generator {
    /// Sine tone on every channel, solid grey frames.
    Tone { frequency: f64, amplitude: f64 },
    /// Constant color frames, silent audio.
    Solid { rgba: [f32; 4] },
    /// Sawtooth audio and frames whose brightness encodes the frame number,
    /// both repeating every `period` units.
    Ramp { period: i64 },
}

/// A media file or generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,

    /// File path, or a descriptive name for generators.
    pub path: PathBuf,

    #[serde(default)]
    pub audio: Option<AudioParams>,

    #[serde(default)]
    pub video: Option<VideoParams>,

    #[serde(default)]
    pub generator: Option<Generator>,
}

impl Asset {
    /// A generator asset with audio and video streams.
    pub fn generated(
        id: AssetId,
        generator: Generator,
        audio: Option<AudioParams>,
        video: Option<VideoParams>,
    ) -> Self {
        Self {
            id,
            path: PathBuf::from(format!("generator-{}", id.0)),
            audio,
            video,
            generator: Some(generator),
        }
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.audio.as_ref().map(|a| a.sample_rate as f64)
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.video.as_ref().map(|v| v.frame_rate)
    }
}
