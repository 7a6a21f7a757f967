//! Planar geometry and node kinematics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in the simulation plane, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`, in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Kinematic state of a node: where it is, how fast it moves and in which
/// direction (radians, 0 pointing along +x).
///
/// `last_update` only ever moves forward; integration covers exactly the
/// interval since the previous update, so repeated calls never double-count
/// motion and never rewind it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub position: Position,
    pub velocity: f64,
    pub direction: f64,
    pub last_update: DateTime<Utc>,
}

impl NodeState {
    pub fn new(position: Position, velocity: f64, direction: f64, now: DateTime<Utc>) -> Self {
        Self {
            position,
            velocity,
            direction,
            last_update: now,
        }
    }

    /// Integrates motion up to `now`. Returns `true` when time actually
    /// advanced (and therefore the state was refreshed).
    pub fn advance_to(&mut self, now: DateTime<Utc>) -> bool {
        let delta_ms = (now - self.last_update).num_milliseconds();
        if delta_ms <= 0 {
            return false;
        }
        let delta_t = delta_ms as f64 / 1_000.0;
        self.position.x += self.velocity * self.direction.cos() * delta_t;
        self.position.y += self.velocity * self.direction.sin() * delta_t;
        self.last_update = now;
        true
    }

    /// Jumps to `position`, re-anchoring the integrator at `now` so the
    /// displaced interval is not integrated on top of the jump.
    pub fn teleport(&mut self, position: Position, now: DateTime<Utc>) {
        self.position = position;
        self.last_update = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3_000.0, 4_000.0);
        assert!((a.distance_to(&b) - 5_000.0).abs() < 1e-9);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn motion_integrates_along_the_heading() {
        // Heading 90 degrees: all displacement lands on the y axis.
        let mut state = NodeState::new(
            Position::new(100.0, 0.0),
            10.0,
            std::f64::consts::FRAC_PI_2,
            t0(),
        );
        assert!(state.advance_to(t0() + Duration::seconds(4)));
        assert!((state.position.x - 100.0).abs() < 1e-6);
        assert!((state.position.y - 40.0).abs() < 1e-6);
        assert_eq!(state.last_update, t0() + Duration::seconds(4));
    }

    #[test]
    fn motion_never_runs_backwards() {
        let mut state = NodeState::new(Position::new(0.0, 0.0), 10.0, 0.0, t0());
        assert!(!state.advance_to(t0() - Duration::seconds(5)));
        assert_eq!(state.position, Position::new(0.0, 0.0));
        assert_eq!(state.last_update, t0());
    }

    #[test]
    fn teleport_reanchors_the_integrator() {
        let mut state = NodeState::new(Position::new(0.0, 0.0), 10.0, 0.0, t0());
        state.teleport(Position::new(500.0, 500.0), t0() + Duration::seconds(30));
        // The 30 seconds spent "elsewhere" must not be integrated.
        assert!(!state.advance_to(t0() + Duration::seconds(30)));
        assert_eq!(state.position, Position::new(500.0, 500.0));
    }
}
