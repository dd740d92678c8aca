//! Position units, playback direction and rate conversion.

use serde::{Deserialize, Serialize};

/// Media kind of a track or schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Playback direction.
///
/// A forward cursor `p` with length `n` covers `[p, p + n)`. A reverse
/// cursor `p` covers `[p - n, p)`, visited from `p - 1` downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// +1 forward, -1 reverse.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }

    pub fn is_reverse(self) -> bool {
        self == Direction::Reverse
    }

    /// The unit addressed by a cursor.
    pub fn unit_at(self, cursor: i64) -> i64 {
        match self {
            Direction::Forward => cursor,
            Direction::Reverse => cursor - 1,
        }
    }

    /// Cursor after consuming `length` units.
    pub fn step(self, cursor: i64, length: i64) -> i64 {
        cursor + length * self.sign()
    }

    /// Lowest unit covered by a fragment starting at `cursor`.
    pub fn range_start(self, cursor: i64, length: i64) -> i64 {
        match self {
            Direction::Forward => cursor,
            Direction::Reverse => cursor - length,
        }
    }
}

/// Convert a position between rates, rounding toward negative infinity.
///
/// Identical rates return the position unchanged.
pub fn rescale(position: i64, from_rate: f64, to_rate: f64) -> i64 {
    if from_rate == to_rate || from_rate <= 0.0 {
        return position;
    }
    (position as f64 * to_rate / from_rate).floor() as i64
}

/// Convert a position to seconds.
pub fn to_secs(position: i64, rate: f64) -> f64 {
    if rate <= 0.0 {
        0.0
    } else {
        position as f64 / rate
    }
}

/// Convert seconds to a position, rounding to the nearest unit.
pub fn from_secs(secs: f64, rate: f64) -> i64 {
    (secs * rate).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_units() {
        assert_eq!(Direction::Forward.unit_at(10), 10);
        assert_eq!(Direction::Reverse.unit_at(10), 9);
        assert_eq!(Direction::Reverse.step(10, 4), 6);
        assert_eq!(Direction::Reverse.range_start(10, 4), 6);
        assert_eq!(Direction::Forward.range_start(10, 4), 10);
    }

    #[test]
    fn test_rescale_floors() {
        assert_eq!(rescale(1000, 48000.0, 48000.0), 1000);
        assert_eq!(rescale(48000, 48000.0, 44100.0), 44100);
        assert_eq!(rescale(1, 48000.0, 44100.0), 0);
        assert_eq!(rescale(-1, 48000.0, 44100.0), -1);
        assert_eq!(rescale(30, 30.0, 25.0), 25);
    }

    #[test]
    fn test_secs_conversion() {
        assert_eq!(from_secs(0.5, 48000.0), 24000);
        assert!((to_secs(24000, 48000.0) - 0.5).abs() < 1e-12);
        assert_eq!(to_secs(10, 0.0), 0.0);
    }
}
