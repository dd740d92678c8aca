//! Plugin parameter keyframes.
//!
//! A [`KeyframeList`] is strictly ordered by position and always holds a
//! default keyframe at position 0. Lookups are binary searches, so callers
//! never walk the list by hand.

use serde::{Deserialize, Serialize};

use crate::units::rescale;

/// A stored plugin-parameter snapshot at a timeline position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Position in project units of the owning track.
    pub position: i64,

    /// Opaque parameter blob interpreted by the plugin.
    #[serde(default)]
    pub data: String,
}

impl Keyframe {
    pub fn new(position: i64, data: impl Into<String>) -> Self {
        Self {
            position,
            data: data.into(),
        }
    }
}

/// Ordered keyframes of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Keyframe>", into = "Vec<Keyframe>")]
pub struct KeyframeList {
    frames: Vec<Keyframe>,
}

/// The keyframes bounding one keyframe segment.
#[derive(Debug, Clone, Copy)]
pub struct KeyframeSpan<'a> {
    /// Last keyframe at or before the segment start.
    pub prev: &'a Keyframe,
    /// First keyframe after the segment start, if any.
    pub next: Option<&'a Keyframe>,
}

impl Default for KeyframeList {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyframeList {
    /// A list holding only an empty default keyframe.
    pub fn new() -> Self {
        Self::with_default("")
    }

    /// A list holding only a default keyframe with the given parameters.
    pub fn with_default(data: impl Into<String>) -> Self {
        Self {
            frames: vec![Keyframe::new(0, data)],
        }
    }

    /// Insert a keyframe, replacing any keyframe at the same position.
    /// Negative positions are clamped onto the default keyframe.
    pub fn insert(&mut self, mut keyframe: Keyframe) {
        keyframe.position = keyframe.position.max(0);
        match self
            .frames
            .binary_search_by_key(&keyframe.position, |k| k.position)
        {
            Ok(index) => self.frames[index] = keyframe,
            Err(index) => self.frames.insert(index, keyframe),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Never true: the default keyframe is always present.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyframe> {
        self.frames.iter()
    }

    pub fn as_slice(&self) -> &[Keyframe] {
        &self.frames
    }

    /// Index of the last keyframe at or before `position`.
    pub fn prev_index(&self, position: i64) -> usize {
        self.frames
            .partition_point(|k| k.position <= position)
            .saturating_sub(1)
    }

    /// Last keyframe at or before `position` (the default before 0).
    pub fn prev_at(&self, position: i64) -> &Keyframe {
        &self.frames[self.prev_index(position)]
    }

    /// First keyframe strictly after `position`.
    pub fn next_after(&self, position: i64) -> Option<&Keyframe> {
        let index = self.frames.partition_point(|k| k.position <= position);
        self.frames.get(index)
    }

    /// The segment containing `position`.
    pub fn span_at(&self, position: i64) -> KeyframeSpan<'_> {
        KeyframeSpan {
            prev: self.prev_at(position),
            next: self.next_after(position),
        }
    }

    /// Index of the last keyframe whose position, converted from
    /// `project_rate` to `rate`, is at or before `local`.
    pub fn prev_index_local(&self, local: i64, rate: f64, project_rate: f64) -> usize {
        self.frames
            .partition_point(|k| rescale(k.position, project_rate, rate) <= local)
            .saturating_sub(1)
    }

    /// Position, converted to `rate`, of the first keyframe after `local`.
    pub fn next_local_after(&self, local: i64, rate: f64, project_rate: f64) -> Option<i64> {
        let index = self
            .frames
            .partition_point(|k| rescale(k.position, project_rate, rate) <= local);
        self.frames
            .get(index)
            .map(|k| rescale(k.position, project_rate, rate))
    }

    /// Stable identity of positions and parameters, used to detect that a
    /// plugin's keyframe set changed between evaluations.
    pub fn fingerprint(&self) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        };
        for keyframe in &self.frames {
            feed(&keyframe.position.to_le_bytes());
            feed(keyframe.data.as_bytes());
            feed(&[0xff]);
        }
        hash
    }
}

impl From<Vec<Keyframe>> for KeyframeList {
    fn from(frames: Vec<Keyframe>) -> Self {
        let mut list = KeyframeList { frames: Vec::new() };
        for keyframe in frames {
            list.insert(keyframe);
        }
        if list.frames.first().map(|k| k.position) != Some(0) {
            let data = list
                .frames
                .first()
                .map(|k| k.data.clone())
                .unwrap_or_default();
            list.frames.insert(0, Keyframe::new(0, data));
        }
        list
    }
}

impl From<KeyframeList> for Vec<Keyframe> {
    fn from(list: KeyframeList) -> Self {
        list.frames
    }
}
