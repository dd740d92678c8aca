//! Edits: placed clips on a track.

use serde::{Deserialize, Serialize};

use crate::asset::AssetId;
use crate::units::Direction;

/// What an edit reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditSource {
    /// No data; the track is silent or transparent here.
    Silence,
    /// An asset from the timeline's asset table.
    Asset { asset: AssetId },
    /// A nested timeline from the timeline's nested table.
    Nested { index: usize },
}

/// A half-open range `[start, start + length)` on a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    /// Start on the track, in project units.
    pub start: i64,

    pub length: i64,

    pub source: EditSource,

    /// Source position corresponding to `start`, in project units.
    #[serde(default)]
    pub source_offset: i64,

    /// Source audio channel or video layer.
    #[serde(default)]
    pub channel: usize,
}

impl Edit {
    pub fn asset(start: i64, length: i64, asset: AssetId) -> Self {
        Self {
            start,
            length,
            source: EditSource::Asset { asset },
            source_offset: 0,
            channel: 0,
        }
    }

    pub fn nested(start: i64, length: i64, index: usize) -> Self {
        Self {
            start,
            length,
            source: EditSource::Nested { index },
            source_offset: 0,
            channel: 0,
        }
    }

    pub fn silence(start: i64, length: i64) -> Self {
        Self {
            start,
            length,
            source: EditSource::Silence,
            source_offset: 0,
            channel: 0,
        }
    }

    pub fn with_source_offset(mut self, offset: i64) -> Self {
        self.source_offset = offset;
        self
    }

    pub fn with_channel(mut self, channel: usize) -> Self {
        self.channel = channel;
        self
    }

    pub fn end(&self) -> i64 {
        self.start + self.length
    }

    /// Whether reading this edit produces data.
    pub fn has_data(&self) -> bool {
        !matches!(self.source, EditSource::Silence) && self.length > 0
    }

    pub fn contains(&self, unit: i64) -> bool {
        unit >= self.start && unit < self.end()
    }

    /// Source position for a track position inside this edit.
    pub fn source_position(&self, track_position: i64) -> i64 {
        track_position - self.start + self.source_offset
    }
}

/// Ordered, non-overlapping edits of one track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Edit>", into = "Vec<Edit>")]
pub struct EditList {
    edits: Vec<Edit>,
}

impl EditList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an edit, keeping the list ordered by start.
    pub fn push(&mut self, edit: Edit) {
        let index = self.edits.partition_point(|e| e.start <= edit.start);
        self.edits.insert(index, edit);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edit> {
        self.edits.iter()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// End of the last edit.
    pub fn length(&self) -> i64 {
        self.edits.iter().map(Edit::end).max().unwrap_or(0)
    }

    /// The edit under the unit addressed by `cursor`.
    pub fn edit_at(&self, cursor: i64, direction: Direction) -> Option<&Edit> {
        let unit = direction.unit_at(cursor);
        let index = self.edits.partition_point(|e| e.start <= unit);
        index
            .checked_sub(1)
            .map(|i| &self.edits[i])
            .filter(|e| e.contains(unit))
    }

    /// The data-carrying edit under `cursor`, if any.
    pub fn playable_edit(&self, cursor: i64, direction: Direction) -> Option<&Edit> {
        self.edit_at(cursor, direction).filter(|e| e.has_data())
    }

    /// Narrow `length` to the distance until the next boundary of an edit
    /// carrying data, i.e. the next position where what is read changes.
    pub fn change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        let mut result = length;
        for edit in self.edits.iter().filter(|e| e.has_data()) {
            for edge in [edit.start, edit.end()] {
                let distance = match direction {
                    Direction::Forward => edge - cursor,
                    Direction::Reverse => cursor - edge,
                };
                if distance > 0 && distance < result {
                    result = distance;
                }
            }
        }
        result
    }

    /// Overlapping edits, reported as human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        self.edits
            .windows(2)
            .filter(|pair| pair[0].end() > pair[1].start)
            .map(|pair| {
                format!(
                    "edit at {} overlaps edit at {}",
                    pair[0].start, pair[1].start
                )
            })
            .collect()
    }
}

impl From<Vec<Edit>> for EditList {
    fn from(edits: Vec<Edit>) -> Self {
        let mut list = EditList::new();
        for edit in edits {
            list.push(edit);
        }
        list
    }
}

impl From<EditList> for Vec<Edit> {
    fn from(list: EditList) -> Self {
        list.edits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_a() -> EditList {
        vec![Edit::silence(0, 100), Edit::asset(100, 100, AssetId(1))].into()
    }

    #[test]
    fn test_edit_at_respects_direction() {
        let edits = track_a();
        assert!(edits.playable_edit(99, Direction::Forward).is_none());
        assert!(edits.playable_edit(100, Direction::Forward).is_some());
        assert!(edits.playable_edit(100, Direction::Reverse).is_none());
        assert!(edits.playable_edit(200, Direction::Reverse).is_some());
        assert!(edits.edit_at(200, Direction::Forward).is_none());
    }

    #[test]
    fn test_change_duration_over_silence() {
        let edits = track_a();
        assert_eq!(edits.change_duration(50, 100, Direction::Forward), 50);
        assert_eq!(edits.change_duration(100, 100, Direction::Forward), 100);
        assert_eq!(edits.change_duration(150, 100, Direction::Forward), 50);
    }

    #[test]
    fn test_change_duration_reverse() {
        let edits = track_a();
        assert_eq!(edits.change_duration(150, 100, Direction::Reverse), 50);
        assert_eq!(edits.change_duration(250, 100, Direction::Reverse), 50);
        assert_eq!(edits.change_duration(100, 100, Direction::Reverse), 100);
    }

    #[test]
    fn test_adjacent_edits_split_fragments() {
        let edits: EditList = vec![
            Edit::asset(0, 10, AssetId(1)),
            Edit::asset(10, 10, AssetId(2)),
        ]
        .into();
        assert_eq!(edits.change_duration(0, 100, Direction::Forward), 10);
        assert!(edits.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_overlap() {
        let edits: EditList = vec![
            Edit::asset(0, 20, AssetId(1)),
            Edit::asset(10, 10, AssetId(2)),
        ]
        .into();
        assert_eq!(edits.validate().len(), 1);
    }
}
