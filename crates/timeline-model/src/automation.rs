//! Automation curves: fade, mute, mode and mask.

use serde::{Deserialize, Serialize};

use crate::units::Direction;

/// How a curve moves from one point to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Linear,
    Step,
}

/// One point of an automation curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoPoint {
    pub position: i64,
    pub value: f64,
    #[serde(default)]
    pub interpolation: Interpolation,
}

/// An ordered automation curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autos {
    /// Value when the curve has no points.
    pub default: f64,

    #[serde(default)]
    points: Vec<AutoPoint>,
}

impl Autos {
    pub fn constant(default: f64) -> Self {
        Self {
            default,
            points: Vec::new(),
        }
    }

    /// Insert a point, replacing any point at the same position.
    pub fn insert(&mut self, position: i64, value: f64, interpolation: Interpolation) {
        let point = AutoPoint {
            position,
            value,
            interpolation,
        };
        match self.points.binary_search_by_key(&position, |p| p.position) {
            Ok(index) => self.points[index] = point,
            Err(index) => self.points.insert(index, point),
        }
    }

    /// Builder form of [`Autos::insert`].
    pub fn with_point(mut self, position: i64, value: f64, interpolation: Interpolation) -> Self {
        self.insert(position, value, interpolation);
        self
    }

    pub fn points(&self) -> &[AutoPoint] {
        &self.points
    }

    /// Restore ordering after deserialization.
    pub(crate) fn normalize(&mut self) {
        self.points.sort_by_key(|p| p.position);
        self.points.dedup_by_key(|p| p.position);
    }

    /// Value at the unit addressed by `cursor` in `direction`.
    pub fn value_at(&self, cursor: i64, direction: Direction) -> f64 {
        let unit = direction.unit_at(cursor);
        let next_index = self.points.partition_point(|p| p.position <= unit);
        match (next_index.checked_sub(1), self.points.get(next_index)) {
            (None, None) => self.default,
            (None, Some(next)) => next.value,
            (Some(prev), None) => self.points[prev].value,
            (Some(prev), Some(next)) => {
                let prev = &self.points[prev];
                if prev.interpolation == Interpolation::Step || next.position == prev.position {
                    prev.value
                } else {
                    let t = (unit - prev.position) as f64 / (next.position - prev.position) as f64;
                    prev.value + (next.value - prev.value) * t
                }
            }
        }
    }

    /// Value of the point governing the unit addressed by `cursor`,
    /// ignoring interpolation. Constant between two points, so switch
    /// curves (mute, mode) never change inside a fragment bounded by
    /// [`Autos::change_duration`].
    pub fn step_at(&self, cursor: i64, direction: Direction) -> f64 {
        let unit = direction.unit_at(cursor);
        let next_index = self.points.partition_point(|p| p.position <= unit);
        match next_index.checked_sub(1) {
            Some(prev) => self.points[prev].value,
            None => self.points.first().map(|p| p.value).unwrap_or(self.default),
        }
    }

    /// First point strictly beyond `cursor` in `direction`.
    pub fn next_point_after(&self, cursor: i64, direction: Direction) -> Option<&AutoPoint> {
        match direction {
            Direction::Forward => {
                let index = self.points.partition_point(|p| p.position <= cursor);
                self.points.get(index)
            }
            Direction::Reverse => {
                let index = self.points.partition_point(|p| p.position < cursor);
                index.checked_sub(1).map(|i| &self.points[i])
            }
        }
    }

    /// Narrow `length` to the distance until the next point inside the
    /// fragment starting at `cursor`.
    pub fn change_duration(&self, cursor: i64, length: i64, direction: Direction) -> i64 {
        match self.next_point_after(cursor, direction) {
            Some(point) => length.min((point.position - cursor).abs()),
            None => length,
        }
    }
}

/// Curves every track carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    /// Linear gain for audio, opacity in `[0, 1]` for video.
    #[serde(default = "Automation::unity")]
    pub fade: Autos,

    /// Muted where the value is at least 0.5.
    #[serde(default = "Automation::zero")]
    pub mute: Autos,

    /// Blend mode index, see `BlendMode::from_index`.
    #[serde(default = "Automation::zero")]
    pub mode: Autos,

    /// Alpha limit in `[0, 1]` applied before compositing.
    #[serde(default = "Automation::unity")]
    pub mask: Autos,
}

impl Default for Automation {
    fn default() -> Self {
        Self {
            fade: Self::unity(),
            mute: Self::zero(),
            mode: Self::zero(),
            mask: Self::unity(),
        }
    }
}

impl Automation {
    fn unity() -> Autos {
        Autos::constant(1.0)
    }

    fn zero() -> Autos {
        Autos::constant(0.0)
    }

    /// Mute is a switch: linear points hold their value like step points.
    pub fn is_muted(&self, cursor: i64, direction: Direction) -> bool {
        self.mute.step_at(cursor, direction) >= 0.5
    }

    pub(crate) fn normalize(&mut self) {
        self.fade.normalize();
        self.mute.normalize();
        self.mode.normalize();
        self.mask.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_curve() {
        let autos = Autos::constant(0.7);
        assert_eq!(autos.value_at(123, Direction::Forward), 0.7);
        assert_eq!(autos.change_duration(0, 50, Direction::Forward), 50);
    }

    #[test]
    fn test_linear_interpolation() {
        let autos = Autos::constant(1.0)
            .with_point(0, 0.0, Interpolation::Linear)
            .with_point(100, 1.0, Interpolation::Linear);
        assert!((autos.value_at(50, Direction::Forward) - 0.5).abs() < 1e-12);
        assert!((autos.value_at(51, Direction::Reverse) - 0.5).abs() < 1e-12);
        assert_eq!(autos.value_at(500, Direction::Forward), 1.0);
    }

    #[test]
    fn test_step_interpolation() {
        let autos = Autos::constant(0.0)
            .with_point(10, 1.0, Interpolation::Step)
            .with_point(20, 0.0, Interpolation::Step);
        assert_eq!(autos.value_at(15, Direction::Forward), 1.0);
        assert_eq!(autos.value_at(20, Direction::Forward), 0.0);
        assert_eq!(autos.value_at(20, Direction::Reverse), 1.0);
        assert_eq!(autos.value_at(5, Direction::Forward), 1.0);
    }

    #[test]
    fn test_change_duration_by_direction() {
        let autos = Autos::constant(0.0).with_point(40, 1.0, Interpolation::Step);
        assert_eq!(autos.change_duration(10, 100, Direction::Forward), 30);
        assert_eq!(autos.change_duration(40, 100, Direction::Forward), 100);
        assert_eq!(autos.change_duration(60, 100, Direction::Reverse), 20);
        assert_eq!(autos.change_duration(40, 100, Direction::Reverse), 100);
    }

    #[test]
    fn test_step_at_ignores_interpolation() {
        let autos = Autos::constant(0.0)
            .with_point(0, 0.0, Interpolation::Linear)
            .with_point(100, 1.0, Interpolation::Linear);
        assert_eq!(autos.step_at(60, Direction::Forward), 0.0);
        assert_eq!(autos.step_at(99, Direction::Forward), 0.0);
        assert_eq!(autos.step_at(100, Direction::Forward), 1.0);
        assert_eq!(autos.step_at(100, Direction::Reverse), 0.0);
        assert_eq!(autos.step_at(101, Direction::Reverse), 1.0);
        assert_eq!(Autos::constant(0.3).step_at(7, Direction::Forward), 0.3);
    }

    #[test]
    fn test_linear_mute_holds_between_points() {
        let mut automation = Automation::default();
        automation.mute = Autos::constant(0.0)
            .with_point(0, 0.0, Interpolation::Linear)
            .with_point(100, 1.0, Interpolation::Linear);
        for cursor in 0..100 {
            assert!(!automation.is_muted(cursor, Direction::Forward), "muted at {cursor}");
        }
        assert!(automation.is_muted(100, Direction::Forward));
    }

    #[test]
    fn test_next_point_after() {
        let autos = Autos::constant(0.0)
            .with_point(10, 1.0, Interpolation::Step)
            .with_point(20, 0.0, Interpolation::Step);
        assert_eq!(autos.next_point_after(10, Direction::Forward).map(|p| p.position), Some(20));
        assert_eq!(autos.next_point_after(20, Direction::Forward), None);
        assert_eq!(autos.next_point_after(20, Direction::Reverse).map(|p| p.position), Some(10));
        assert_eq!(autos.next_point_after(10, Direction::Reverse), None);
    }
}
