//! Position bookkeeping shared by the audio and video schedules.

use montage_common::error::MontageResult;
use montage_common::logging::SCHEDULE_TARGET;
use montage_timeline::{Direction, MediaKind};

/// Half-open range of playable positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRange {
    pub start: i64,
    pub end: i64,
}

impl PlaybackRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Playback position of one schedule within its range.
///
/// Forward playback starts at `range.start`, reverse at `range.end`. With
/// looping, reaching the far edge wraps to the near one and the schedule
/// never finishes on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCursor {
    position: i64,
    origin: i64,
    range: PlaybackRange,
    direction: Direction,
    looping: bool,
    done: bool,
}

impl ScheduleCursor {
    pub fn new(range: PlaybackRange, direction: Direction, looping: bool) -> Self {
        let position = match direction {
            Direction::Forward => range.start,
            Direction::Reverse => range.end,
        };
        Self {
            position,
            origin: position,
            range,
            direction,
            looping,
            done: range.is_empty(),
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn range(&self) -> PlaybackRange {
        self.range
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Units left before the far edge of the range.
    fn remaining(&self) -> i64 {
        match self.direction {
            Direction::Forward => self.range.end - self.position,
            Direction::Reverse => self.position - self.range.start,
        }
    }

    fn wrap(&mut self) {
        self.position = match self.direction {
            Direction::Forward => self.range.start,
            Direction::Reverse => self.range.end,
        };
        tracing::debug!(target: SCHEDULE_TARGET, position = self.position, "Loop wrap");
    }

    /// Trim `len` so the fragment stays inside the range. A looping cursor
    /// sitting on the far edge wraps first; the part of a request beyond
    /// the loop end is left for the following fragments. A non-looping
    /// cursor with nothing left is marked done and `len` becomes 0.
    pub fn get_boundaries(&mut self, len: &mut i64) {
        if self.range.is_empty() {
            *len = 0;
            self.done = true;
            return;
        }
        if self.looping && self.remaining() <= 0 {
            self.wrap();
        }
        let remaining = self.remaining();
        if *len > remaining {
            *len = remaining;
        }
        if *len <= 0 {
            *len = 0;
            self.done = true;
        }
    }

    /// Move by `len` units in the playback direction.
    pub fn advance_position(&mut self, len: i64) {
        self.position = self.direction.step(self.position, len);
        if self.remaining() <= 0 {
            if self.looping {
                self.wrap();
            } else {
                self.done = true;
            }
        }
    }

    /// Position reached after `played` units from where the cursor started.
    pub fn project(&self, played: i64) -> i64 {
        let span = self.range.len();
        if span <= 0 {
            return self.origin;
        }
        match self.direction {
            Direction::Forward => {
                let offset = self.origin - self.range.start + played;
                if self.looping {
                    self.range.start + offset.rem_euclid(span)
                } else {
                    (self.range.start + offset).min(self.range.end)
                }
            }
            Direction::Reverse => {
                let offset = self.range.end - self.origin + played;
                if self.looping {
                    self.range.end - offset.rem_euclid(span)
                } else {
                    (self.range.end - offset).max(self.range.start)
                }
            }
        }
    }
}

/// The per-media-kind half of a schedule.
///
/// A schedule drives its cursor through [`ScheduleCursor::get_boundaries`]
/// and [`SchedulePolicy::advance`], asking [`SchedulePolicy::test_reconfigure`]
/// before rendering each fragment whether the graph must be rebuilt.
pub trait SchedulePolicy {
    fn kind(&self) -> MediaKind;

    fn cursor(&self) -> &ScheduleCursor;

    fn cursor_mut(&mut self) -> &mut ScheduleCursor;

    /// Whether the graph must be rebuilt at `position`. Narrows `len` to the
    /// next point where that could change unless `len` is 1.
    fn test_reconfigure(&mut self, position: i64, len: &mut i64) -> bool;

    /// Render `len` units at `position` into the schedule's buffers.
    fn render_fragment(&mut self, position: i64, len: i64) -> MontageResult<()>;

    fn get_boundaries(&mut self, len: &mut i64) {
        self.cursor_mut().get_boundaries(len)
    }

    fn advance(&mut self, len: i64) {
        self.cursor_mut().advance_position(len)
    }

    /// Consume `units` of playback without rendering, honoring loop wraps.
    /// Returns the number of units actually consumed.
    fn drain(&mut self, units: i64) -> i64 {
        let mut left = units;
        while left > 0 && !self.cursor().is_done() {
            let mut len = left;
            self.get_boundaries(&mut len);
            if len <= 0 {
                break;
            }
            self.advance(len);
            left -= len;
        }
        units - left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_trims_to_range() {
        let mut cursor = ScheduleCursor::new(PlaybackRange::new(0, 10), Direction::Forward, false);
        let mut len = 8;
        cursor.get_boundaries(&mut len);
        assert_eq!(len, 8);
        cursor.advance_position(len);
        let mut len = 8;
        cursor.get_boundaries(&mut len);
        assert_eq!(len, 2);
        cursor.advance_position(len);
        assert!(cursor.is_done());
        let mut len = 8;
        cursor.get_boundaries(&mut len);
        assert_eq!(len, 0);
    }

    #[test]
    fn test_loop_drains_remainder() {
        let mut cursor = ScheduleCursor::new(PlaybackRange::new(0, 10), Direction::Forward, true);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let mut len = 4;
            cursor.get_boundaries(&mut len);
            seen.push((cursor.position(), len));
            cursor.advance_position(len);
        }
        assert_eq!(seen, vec![(0, 4), (4, 4), (8, 2), (0, 4)]);
        assert!(!cursor.is_done());
    }

    #[test]
    fn test_reverse_starts_at_end() {
        let mut cursor = ScheduleCursor::new(PlaybackRange::new(5, 10), Direction::Reverse, false);
        assert_eq!(cursor.position(), 10);
        let mut len = 8;
        cursor.get_boundaries(&mut len);
        assert_eq!(len, 5);
        cursor.advance_position(len);
        assert_eq!(cursor.position(), 5);
        assert!(cursor.is_done());
    }

    #[test]
    fn test_project_wraps_when_looping() {
        let looping = ScheduleCursor::new(PlaybackRange::new(10, 20), Direction::Forward, true);
        assert_eq!(looping.project(25), 15);
        let once = ScheduleCursor::new(PlaybackRange::new(10, 20), Direction::Forward, false);
        assert_eq!(once.project(25), 20);
        let reverse = ScheduleCursor::new(PlaybackRange::new(10, 20), Direction::Reverse, true);
        assert_eq!(reverse.project(3), 17);
    }

    #[test]
    fn test_empty_range_is_done() {
        let cursor = ScheduleCursor::new(PlaybackRange::new(5, 5), Direction::Forward, true);
        assert!(cursor.is_done());
    }
}
