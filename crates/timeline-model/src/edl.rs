//! The timeline (EDL) and playable-track snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset::{Asset, AssetId};
use crate::edit::EditSource;
use crate::plugin::{Plugin, PluginKey};
use crate::track::{Track, TrackId};
use crate::units::{Direction, MediaKind};

/// Session parameters shared by every track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sample_rate: u32,
    pub frame_rate: f64,
    pub audio_channels: usize,
    pub output_width: u32,
    pub output_height: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            frame_rate: 30.0,
            audio_channels: 2,
            output_width: 1920,
            output_height: 1080,
        }
    }
}

impl Session {
    /// Project rate of a media kind.
    pub fn rate(&self, kind: MediaKind) -> f64 {
        match kind {
            MediaKind::Audio => self.sample_rate as f64,
            MediaKind::Video => self.frame_rate,
        }
    }
}

/// Edit decision list: the complete timeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edl {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: String,

    pub session: Session,

    #[serde(default)]
    pub assets: Vec<Asset>,

    /// Tracks ordered top to bottom.
    #[serde(default)]
    pub tracks: Vec<Track>,

    /// Nested timelines referenced by `EditSource::Nested`.
    #[serde(default)]
    pub nested: Vec<Arc<Edl>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Tracks audible or visible at one position and direction.
///
/// Two snapshots compare equal exactly when the same tracks, in the same
/// order, contribute output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayableTracks {
    pub kind: Option<MediaKind>,
    pub tracks: Vec<TrackId>,
}

impl PlayableTracks {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Errors that can occur when loading timelines.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid timeline: {message}")]
    ValidationError { message: String },
}

impl Edl {
    pub fn new(session: Session) -> Self {
        Self {
            version: default_version(),
            session,
            assets: Vec::new(),
            tracks: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn with_asset(mut self, asset: Asset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    /// Add a nested timeline, returning its index for `Edit::nested`.
    pub fn add_nested(&mut self, edl: Edl) -> usize {
        self.nested.push(Arc::new(edl));
        self.nested.len() - 1
    }

    /// Load and validate a timeline from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TimelineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| TimelineError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut edl: Edl = serde_json::from_str(&json).map_err(|e| TimelineError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        edl.normalize();

        let problems = edl.validate();
        if !problems.is_empty() {
            return Err(TimelineError::ValidationError {
                message: problems.join("; "),
            });
        }
        Ok(edl)
    }

    /// Save a timeline as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TimelineError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| TimelineError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| TimelineError::IoError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn normalize(&mut self) {
        for track in &mut self.tracks {
            track.automation.normalize();
        }
    }

    /// Structural problems: dangling references, overlaps, bad rates.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.session.sample_rate == 0 {
            problems.push("sample_rate must be positive".to_string());
        }
        if self.session.frame_rate <= 0.0 {
            problems.push("frame_rate must be positive".to_string());
        }

        for track in &self.tracks {
            for problem in track.edits.validate() {
                problems.push(format!("track {}: {problem}", track.id.0));
            }
            for edit in track.edits.iter() {
                match edit.source {
                    EditSource::Asset { asset } if self.asset(asset).is_none() => {
                        problems.push(format!(
                            "track {}: edit at {} references missing asset {}",
                            track.id.0, edit.start, asset.0
                        ));
                    }
                    EditSource::Nested { index } if index >= self.nested.len() => {
                        problems.push(format!(
                            "track {}: edit at {} references missing nested timeline {index}",
                            track.id.0, edit.start
                        ));
                    }
                    _ => {}
                }
            }
            for (index, plugin) in track.plugins.iter().enumerate() {
                if let Some(owner) = plugin.shared {
                    if self.plugin(owner).map(|p| p.shared.is_some()) != Some(false) {
                        problems.push(format!(
                            "track {} plugin {index}: shared reference must name an owning plugin",
                            track.id.0
                        ));
                    }
                }
            }
        }

        for (index, nested) in self.nested.iter().enumerate() {
            for problem in nested.validate() {
                problems.push(format!("nested {index}: {problem}"));
            }
        }

        problems
    }

    pub fn rate(&self, kind: MediaKind) -> f64 {
        self.session.rate(kind)
    }

    /// Tracks of one media kind, top to bottom.
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn asset(&self, id: AssetId) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn plugin(&self, key: PluginKey) -> Option<&Plugin> {
        self.track(key.track).and_then(|t| t.plugins.get(key.index))
    }

    pub fn nested_edl(&self, index: usize) -> Option<&Arc<Edl>> {
        self.nested.get(index)
    }

    /// Snapshot of the tracks of `kind` contributing at `cursor`.
    pub fn playable_tracks(
        &self,
        kind: MediaKind,
        cursor: i64,
        direction: Direction,
    ) -> PlayableTracks {
        PlayableTracks {
            kind: Some(kind),
            tracks: self
                .tracks_of(kind)
                .filter(|t| t.is_playable(cursor, direction))
                .map(|t| t.id)
                .collect(),
        }
    }

    /// End of the last edit or plugin of `kind`, in project units.
    pub fn total_length(&self, kind: MediaKind) -> i64 {
        self.tracks_of(kind)
            .map(|t| {
                let plugins_end = t.plugins.iter().map(Plugin::end).max().unwrap_or(0);
                t.edits.length().max(plugins_end)
            })
            .max()
            .unwrap_or(0)
    }

    /// Length in seconds covering both media kinds.
    pub fn duration_secs(&self) -> f64 {
        let audio = self.total_length(MediaKind::Audio) as f64 / self.rate(MediaKind::Audio);
        let video = self.total_length(MediaKind::Video) as f64 / self.rate(MediaKind::Video);
        audio.max(video)
    }
}
