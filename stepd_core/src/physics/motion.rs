// src/physics/motion.rs - straight-line displacement at a target feed rate

use crate::vec4::Vec4;

/// One straight-line displacement. Derived quantities are computed once at
/// construction; the record is immutable after that.
///
/// The all-zero move is the group separator: it carries no displacement and
/// zeroes the junction feedrates on both sides of it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Move {
    from: Vec4,
    to: Vec4,
    delta: Vec4,
    vel: Vec4,
    fr: f64,
    time: f64,
}

impl Move {
    pub const EMPTY: Move = Move {
        from: Vec4::ZERO,
        to: Vec4::ZERO,
        delta: Vec4::ZERO,
        vel: Vec4::ZERO,
        fr: 0.0,
        time: 0.0,
    };

    pub fn new(from: Vec4, to: Vec4, fr: f64) -> Move {
        let delta = to - from;
        let time = delta.dist() / fr;
        let vel = if time > 0.0 { delta.div(time) } else { Vec4::ZERO };
        Move { from, to, delta, vel, fr, time }
    }

    pub fn from(&self) -> Vec4 {
        self.from
    }

    pub fn to(&self) -> Vec4 {
        self.to
    }

    pub fn fr(&self) -> f64 {
        self.fr
    }

    pub fn delta(&self) -> Vec4 {
        self.delta
    }

    pub fn vel(&self) -> Vec4 {
        self.vel
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn is_empty(&self) -> bool {
        self.delta.dist() == 0.0
    }

    /// Slow the move down: the geometry is unchanged, the feed rate and the
    /// derived velocity scale by `s`.
    pub fn scale(&self, s: f64) -> Move {
        Move::new(self.from, self.to, self.fr * s)
    }

    pub fn is_e_or_z_only(&self) -> bool {
        if self.delta.x != 0.0 || self.delta.y != 0.0 {
            return false;
        }
        self.delta.z == 0.0 || self.delta.e == 0.0
    }

    /// A print move extrudes forward while travelling in the XY plane.
    pub fn is_print(&self) -> bool {
        self.delta.e > 0.0 && !self.is_e_or_z_only()
    }
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Move({} -> {} @{})", self.from, self.to, self.fr)
    }
}
