//! Tracks and their playability queries.

use serde::{Deserialize, Serialize};

use crate::automation::Automation;
use crate::edit::{Edit, EditList};
use crate::plugin::Plugin;
use crate::units::{Direction, MediaKind};

/// Stable identifier of a track within one timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u32);

/// How a video track combines with what lies beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Normal,
    Replace,
    Add,
    Multiply,
}

impl BlendMode {
    /// Map a mode-automation value to a blend mode.
    pub fn from_index(value: f64) -> Self {
        match value.round() as i64 {
            1 => BlendMode::Replace,
            2 => BlendMode::Add,
            3 => BlendMode::Multiply,
            _ => BlendMode::Normal,
        }
    }
}

/// Integer placement of a video track on the output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Projector {
    pub x: i32,
    pub y: i32,
}

/// A timeline track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,

    #[serde(default)]
    pub title: String,

    pub kind: MediaKind,

    /// Track participates in playback and rendering.
    #[serde(default = "default_play")]
    pub play: bool,

    #[serde(default)]
    pub edits: EditList,

    #[serde(default)]
    pub plugins: Vec<Plugin>,

    #[serde(default)]
    pub automation: Automation,

    /// Per output channel gain for audio. Empty means unity on every channel.
    #[serde(default)]
    pub pan: Vec<f64>,

    #[serde(default)]
    pub projector: Projector,
}

fn default_play() -> bool {
    true
}

impl Track {
    pub fn new(id: TrackId, kind: MediaKind) -> Self {
        Self {
            id,
            title: format!("{} {}", kind.as_str(), id.0),
            kind,
            play: true,
            edits: EditList::new(),
            plugins: Vec::new(),
            automation: Automation::default(),
            pan: Vec::new(),
            projector: Projector::default(),
        }
    }

    pub fn with_edit(mut self, edit: Edit) -> Self {
        self.edits.push(edit);
        self
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_automation(mut self, automation: Automation) -> Self {
        self.automation = automation;
        self
    }

    /// Gain of this track on output `channel`.
    pub fn pan_gain(&self, channel: usize) -> f64 {
        if self.pan.is_empty() {
            1.0
        } else {
            self.pan.get(channel).copied().unwrap_or(0.0)
        }
    }

    /// Whether the track contributes output at the unit addressed by `cursor`.
    pub fn is_playable(&self, cursor: i64, direction: Direction) -> bool {
        if !self.play || self.automation.is_muted(cursor, direction) {
            return false;
        }
        if self.kind == MediaKind::Video && self.automation.fade.value_at(cursor, direction) <= 0.0
        {
            return false;
        }
        self.edits.playable_edit(cursor, direction).is_some()
            || self
                .plugins
                .iter()
                .any(|p| p.on && p.synthesis && p.covers(cursor, direction))
    }

    /// Indices of the plugins whose range covers `cursor`, in chain order.
    pub fn active_plugins(&self, cursor: i64, direction: Direction) -> Vec<usize> {
        self.plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| p.covers(cursor, direction))
            .map(|(index, _)| index)
            .collect()
    }

    /// Narrow `length` to the next edit boundary that changes what is read.
    pub fn edit_change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        self.edits.change_duration(cursor, length, direction)
    }

    /// Narrow `length` to the next plugin range boundary.
    pub fn plugin_change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        self.plugins.iter().fold(length, |len, plugin| {
            plugin.change_duration(cursor, len, direction)
        })
    }

    /// Narrow `length` to the next automation point affecting playability
    /// or blend mode.
    pub fn automation_change_duration(
        &self,
        cursor: i64,
        length: i64,
        direction: Direction,
    ) -> i64 {
        let mut result = self.automation.mute.change_duration(cursor, length, direction);
        result = self.automation.mode.change_duration(cursor, result, direction);
        if self.kind == MediaKind::Video {
            result = self.automation.fade.change_duration(cursor, result, direction);
        }
        result
    }

    /// All change durations combined.
    pub fn change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        let length = self.edit_change_duration(cursor, length, direction);
        let length = self.plugin_change_duration(cursor, length, direction);
        self.automation_change_duration(cursor, length, direction)
    }

    /// Blend mode in effect at `cursor`.
    pub fn blend_mode(&self, cursor: i64, direction: Direction) -> BlendMode {
        BlendMode::from_index(self.automation.mode.step_at(cursor, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::automation::Interpolation;

    #[test]
    fn test_silent_track_becomes_playable() {
        let track = Track::new(TrackId(1), MediaKind::Audio)
            .with_edit(Edit::silence(0, 100))
            .with_edit(Edit::asset(100, 100, AssetId(1)));
        assert!(!track.is_playable(50, Direction::Forward));
        assert!(track.is_playable(100, Direction::Forward));
        assert_eq!(track.change_duration(50, 100, Direction::Forward), 50);
    }

    #[test]
    fn test_mute_and_play_flag() {
        let mut track =
            Track::new(TrackId(1), MediaKind::Audio).with_edit(Edit::asset(0, 100, AssetId(1)));
        track.automation.mute = track
            .automation
            .mute
            .clone()
            .with_point(0, 0.0, Interpolation::Step)
            .with_point(60, 1.0, Interpolation::Step);
        assert!(track.is_playable(59, Direction::Forward));
        assert!(!track.is_playable(60, Direction::Forward));
        assert_eq!(track.change_duration(10, 100, Direction::Forward), 50);

        track.play = false;
        assert!(!track.is_playable(10, Direction::Forward));
    }

    #[test]
    fn test_transparent_video_is_not_playable() {
        let mut track =
            Track::new(TrackId(2), MediaKind::Video).with_edit(Edit::asset(0, 10, AssetId(1)));
        track.automation.fade = track
            .automation
            .fade
            .clone()
            .with_point(0, 0.0, Interpolation::Step);
        assert!(!track.is_playable(0, Direction::Forward));
    }

    #[test]
    fn test_synthesis_plugin_makes_track_playable() {
        let track = Track::new(TrackId(3), MediaKind::Audio)
            .with_plugin(Plugin::new("tone", 0, 50).synthesis());
        assert!(track.is_playable(10, Direction::Forward));
        assert!(!track.is_playable(50, Direction::Forward));
        assert_eq!(track.active_plugins(10, Direction::Forward), vec![0]);
    }

    #[test]
    fn test_pan_gain_defaults_to_unity() {
        let mut track = Track::new(TrackId(1), MediaKind::Audio);
        assert_eq!(track.pan_gain(3), 1.0);
        track.pan = vec![1.0, 0.25];
        assert_eq!(track.pan_gain(1), 0.25);
        assert_eq!(track.pan_gain(2), 0.0);
    }
}
