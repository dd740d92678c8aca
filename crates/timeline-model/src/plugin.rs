//! Plugin slots on a track.

use serde::{Deserialize, Serialize};

use crate::keyframe::KeyframeList;
use crate::track::TrackId;
use crate::units::Direction;

/// Identity of the plugin slot that owns a processing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub track: TrackId,
    /// Index in the owning track's plugin list.
    pub index: usize,
}

/// A plugin slot: its own range and on/off flag, and either its own
/// processing implementation or an attachment to another track's plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub title: String,

    #[serde(default = "default_on")]
    pub on: bool,

    pub start: i64,

    pub length: i64,

    /// Registered processing implementation name.
    #[serde(default)]
    pub implementation: String,

    /// The plugin generates data on its own, making an empty track playable.
    #[serde(default)]
    pub synthesis: bool,

    /// When set, this slot feeds the plugin owned by another track instead
    /// of running its own instance.
    #[serde(default)]
    pub shared: Option<PluginKey>,

    #[serde(default)]
    pub keyframes: KeyframeList,
}

fn default_on() -> bool {
    true
}

impl Plugin {
    pub fn new(implementation: impl Into<String>, start: i64, length: i64) -> Self {
        let implementation = implementation.into();
        Self {
            title: implementation.clone(),
            on: true,
            start,
            length,
            implementation,
            synthesis: false,
            shared: None,
            keyframes: KeyframeList::new(),
        }
    }

    /// A slot attached to the plugin owned by `owner`.
    pub fn shared_with(owner: PluginKey, start: i64, length: i64) -> Self {
        Self {
            title: format!("shared:{}:{}", owner.track.0, owner.index),
            on: true,
            start,
            length,
            implementation: String::new(),
            synthesis: false,
            shared: Some(owner),
            keyframes: KeyframeList::new(),
        }
    }

    pub fn with_keyframes(mut self, keyframes: KeyframeList) -> Self {
        self.keyframes = keyframes;
        self
    }

    pub fn with_on(mut self, on: bool) -> Self {
        self.on = on;
        self
    }

    pub fn synthesis(mut self) -> Self {
        self.synthesis = true;
        self
    }

    pub fn end(&self) -> i64 {
        self.start + self.length
    }

    /// Whether the unit addressed by `cursor` lies in the plugin's range.
    pub fn covers(&self, cursor: i64, direction: Direction) -> bool {
        let unit = direction.unit_at(cursor);
        unit >= self.start && unit < self.end()
    }

    /// Narrow `length` to the distance until the plugin range starts or ends.
    pub fn change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        let mut result = length;
        for edge in [self.start, self.end()] {
            let distance = match direction {
                Direction::Forward => edge - cursor,
                Direction::Reverse => cursor - edge,
            };
            if distance > 0 && distance < result {
                result = distance;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_and_change_duration() {
        let plugin = Plugin::new("gain", 100, 50);
        assert!(plugin.covers(100, Direction::Forward));
        assert!(!plugin.covers(100, Direction::Reverse));
        assert!(plugin.covers(150, Direction::Reverse));
        assert_eq!(plugin.change_duration(0, 1000, Direction::Forward), 100);
        assert_eq!(plugin.change_duration(120, 1000, Direction::Forward), 30);
        assert_eq!(plugin.change_duration(200, 1000, Direction::Reverse), 50);
    }

    #[test]
    fn test_plugin_defaults_on() {
        let plugin: Plugin =
            serde_json::from_str(r#"{"title":"g","start":0,"length":10,"implementation":"gain"}"#)
                .unwrap();
        assert!(plugin.on);
        assert_eq!(plugin.keyframes.len(), 1);
    }
}
