// src/physics/block.rs - a move paired with its velocity shape

use thiserror::Error;

use crate::physics::motion::Move;
use crate::physics::shape::{pulse, Shape, Trapezoid};
use crate::vec4::Vec4;

/// The block could not fit its easing ramps inside the move.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EaseLimit {
    /// The entry-side constraint is the offender; slow the current move.
    #[error("ease limit on block entry")]
    Pre,
    /// The exit-side constraint is the offender; slow the following move.
    #[error("ease limit on block exit")]
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Constant-acceleration ramps.
    Trap,
    /// Jerk-limited (S-curve) ramps.
    STrap,
}

/// A move with a velocity shape whose area equals the move's distance.
#[derive(Debug, Clone)]
pub struct MotionBlock {
    kind: BlockKind,
    shape: Shape,
    mv: Move,
}

impl MotionBlock {
    /// S-curve block: the accel and decel ramps are themselves trapezoids
    /// of jerk pulses, so acceleration is continuous.
    pub fn s_trap(
        fr_jerk: f64,
        fr_accel: f64,
        fr_start: f64,
        mv: Move,
        fr_end: f64,
    ) -> Result<MotionBlock, EaseLimit> {
        let pre = Trapezoid::new(
            pulse(fr_jerk, fr_accel),
            pulse(-fr_jerk, -fr_accel),
            mv.fr() - fr_start,
            0.0,
        );
        let post = Trapezoid::new(
            pulse(-fr_jerk, -fr_accel),
            pulse(fr_jerk, fr_accel),
            fr_end - mv.fr(),
            0.0,
        );
        let shape = Trapezoid::new(pre, post, mv.delta().dist(), fr_start);
        Self::checked(BlockKind::STrap, shape, mv, fr_end)
    }

    /// Plain trapezoid block with constant-acceleration ramps.
    pub fn trap(
        fr_accel: f64,
        fr_start: f64,
        mv: Move,
        fr_end: f64,
    ) -> Result<MotionBlock, EaseLimit> {
        let pre = pulse(fr_accel, mv.fr() - fr_start);
        let post = pulse(-fr_accel, fr_end - mv.fr());
        let shape = Trapezoid::new(pre, post, mv.delta().dist(), fr_start);
        Self::checked(BlockKind::Trap, shape, mv, fr_end)
    }

    fn checked(
        kind: BlockKind,
        shape: Shape,
        mv: Move,
        fr_end: f64,
    ) -> Result<MotionBlock, EaseLimit> {
        if !shape.is_valid() {
            if mv.fr() > fr_end {
                return Err(EaseLimit::Pre);
            }
            return Err(EaseLimit::Post);
        }
        Ok(MotionBlock { kind, shape, mv })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn mv(&self) -> &Move {
        &self.mv
    }

    /// Positions along the move at the given sample rate. Print moves get
    /// the linear-advance extruder offset, proportional to the current
    /// velocity.
    pub fn samples(
        &self,
        samples_per_second: f64,
        e_advance_k: f64,
    ) -> impl Iterator<Item = Vec4> + '_ {
        let shape = &self.shape;
        let mv = &self.mv;
        let is_print = mv.is_print();
        let dist = mv.delta().dist();
        let dir = mv.delta().norm();

        let count = (shape.dt() * samples_per_second) as usize;
        let div = if count > 0 { shape.dt() / count as f64 } else { 0.0 };

        (0..count).map(move |i| {
            let t = i as f64 * div;
            let d = shape.int1_at(t, 0.0).clamp(0.0, dist);
            let mut pos = mv.from() + dir * d;
            if is_print {
                let e_fac = shape.apply(t) * dir.e * e_advance_k;
                pos = pos + Vec4::new(0.0, 0.0, 0.0, e_fac);
            }
            pos
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x_move(mm: f64, fr: f64) -> Move {
        Move::new(Vec4::ZERO, Vec4::new(mm, 0.0, 0.0, 0.0), fr)
    }

    #[test]
    fn trap_block_area_matches_distance() {
        let mv = x_move(10.0, 10.0);
        let block = MotionBlock::trap(1000.0, 0.0, mv, 0.0).unwrap();
        let shape = block.shape();
        assert!((shape.int1_at(shape.dt(), 0.0) - mv.delta().dist()).abs() < 1e-9);
        assert_eq!(shape.apply(0.0), 0.0);
        assert!((shape.apply(shape.dt())).abs() < 1e-9);
    }

    #[test]
    fn s_trap_block_area_matches_distance() {
        let mv = x_move(10.0, 10.0);
        let block = MotionBlock::s_trap(200000.0, 1000.0, 0.0, mv, 0.0).unwrap();
        let shape = block.shape();
        assert_eq!(block.kind(), BlockKind::STrap);
        assert!((shape.int1_at(shape.dt(), 0.0) - mv.delta().dist()).abs() < 1e-6);
    }

    #[test]
    fn junction_feedrates_at_boundaries() {
        let mv = x_move(10.0, 10.0);
        let block = MotionBlock::trap(1000.0, 4.0, mv, 6.0).unwrap();
        let shape = block.shape();
        assert_eq!(shape.apply(0.0), 4.0);
        assert!((shape.apply(shape.dt()) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn ease_limit_side_selection() {
        // no room to decelerate 10 -> 0 in 0.01 mm
        let err = MotionBlock::trap(1000.0, 0.0, x_move(0.01, 10.0), 0.0).unwrap_err();
        assert_eq!(err, EaseLimit::Pre);

        // exit faster than the move's own feedrate: the exit ramp is at fault
        let err = MotionBlock::trap(1000.0, 0.0, x_move(0.01, 1.0), 5.0).unwrap_err();
        assert_eq!(err, EaseLimit::Post);
    }

    #[test]
    fn sample_positions_cover_the_move() {
        let mv = x_move(10.0, 10.0);
        let block = MotionBlock::trap(1000.0, 0.0, mv, 0.0).unwrap();
        let samples: Vec<_> = block.samples(1000.0, 0.0).collect();
        assert!(!samples.is_empty());
        assert_eq!(samples[0], Vec4::ZERO);
        for w in samples.windows(2) {
            assert!(w[1].x >= w[0].x, "positions must be monotonic");
        }
        assert!(samples.last().unwrap().x <= 10.0);
    }

    #[test]
    fn print_move_gets_linear_advance() {
        let mv = Move::new(Vec4::ZERO, Vec4::new(10.0, 0.0, 0.0, 1.0), 10.0);
        let block = MotionBlock::trap(1000.0, 0.0, mv, 0.0).unwrap();
        let k = 0.1;
        let with: Vec<_> = block.samples(1000.0, k).collect();
        let without: Vec<_> = block.samples(1000.0, 0.0).collect();
        // mid-move the velocity is positive, so e leads ahead
        let mid = with.len() / 2;
        assert!(with[mid].e > without[mid].e);
        assert_eq!(with[mid].x, without[mid].x);
    }

    #[test]
    fn zero_length_sampling_is_empty() {
        let mv = x_move(10.0, 10.0);
        let block = MotionBlock::trap(1000.0, 0.0, mv, 0.0).unwrap();
        assert_eq!(block.samples(0.5, 0.0).count(), 0);
    }
}
