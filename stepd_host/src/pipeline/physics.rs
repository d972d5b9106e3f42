// src/pipeline/physics.rs - motion blocks from a sliding three-move window

use stepd_core::config::Config;
use stepd_core::gcode::Gcode;
use stepd_core::physics::{EaseLimit, MotionBlock, Move};
use stepd_core::vec4::Vec4;

use crate::pipeline::{clamp01, Message, Port, StageError, Tx};

const MAX_LIMIT_RESIZE: usize = 30;
const MAX_SCURVE_RESIZE: usize = 15;
const MAX_NORM_RESIZE: usize = 100;
const RESIZE_SCALE: f64 = 0.8;

const FAILED_SCURVE: &str = "warn:failed to apply s-curve easing";

/// Fits kinematic constraints across `(last, cur, next)`: the junction
/// feedrates come from the dot product of the unit direction vectors, so a
/// corner of 90° or more junctions at zero and collinear moves keep their
/// full shared feedrate. Acceleration and jerk along the move are the dot
/// of its absolute unit direction with the per-axis limits; both are
/// strictly positive for any real move.
///
/// When the easing ramps do not fit, the offending move is shrunk by 0.8
/// and the fit retried; S-curve easing falls back to a plain trapezoid
/// before giving up entirely.
pub struct PhysicsStage {
    s_jerk: Vec4,
    acc: Vec4,
    spmm: Vec4,
    max_v: Vec4,

    /// Samples per second the step stage will take from our blocks; caps
    /// velocity so one sample never exceeds a segment's step capacity.
    sps: f64,
    max_sv: Vec4,

    last_move: Move,
    cur_move: Move,
}

impl PhysicsStage {
    pub fn new() -> Self {
        Self {
            s_jerk: Vec4::ZERO,
            acc: Vec4::ZERO,
            spmm: Vec4::ZERO,
            max_v: Vec4::ZERO,
            sps: 0.0,
            max_sv: Vec4::ZERO,
            last_move: Move::EMPTY,
            cur_move: Move::EMPTY,
        }
    }

    pub async fn run(mut self, head: Port, tail: Port) -> Result<(), StageError> {
        let (mut head_rx, head_tx) = head.split();
        let (mut tail_rx, tail_tx) = tail.split();

        loop {
            tokio::select! {
                msg = head_rx.recv() => match msg {
                    Some(msg) => self.head_read(msg, &head_tx, &tail_tx).await?,
                    None => return Ok(()),
                },
                msg = tail_rx.recv() => match msg {
                    Some(msg) => head_tx.send(msg).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn head_read(&mut self, msg: Message, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        match msg {
            Message::Move(m) => {
                if !m.is_print() {
                    // isolate non-print motion in its own group
                    self.end_block(head, tail).await?;
                    self.proc_move(m, head, tail).await?;
                    self.end_block(head, tail).await?;
                } else {
                    self.proc_move(m, head, tail).await?;
                }
                return Ok(());
            }
            Message::Gcode(ref g) => {
                self.end_block(head, tail).await?;
                self.proc_gcode(g, head).await?;
            }
            Message::Config(ref conf) => self.proc_config(conf)?,
            _ => {}
        }
        tail.send(msg).await
    }

    async fn proc_gcode(&mut self, g: &Gcode, head: &Tx) -> Result<(), StageError> {
        if g.is_m(201) {
            // set max accel
            self.acc = g.args.get_vec4(self.acc);
        } else if g.is_m(203) {
            // set max vel
            self.max_v = g.args.get_vec4(self.max_v);
        } else if g.is_m(92) {
            // set steps/mm; derives the step-rate velocity cap
            self.spmm = g.args.get_vec4(self.spmm);
            self.max_sv = self.spmm.inv() * self.sps;
            head.line(format!("info:max vel (step limit) is {}", self.max_sv))
                .await?;
        }
        Ok(())
    }

    fn proc_config(&mut self, conf: &Config) -> Result<(), StageError> {
        let format = conf.page_format()?;
        self.sps = (conf.ticks_per_second * format.segment_steps) as f64;
        self.s_jerk = conf.s_jerk;
        Ok(())
    }

    async fn proc_move(&mut self, next: Move, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        let next = self.limit_resize(next)?;

        if self.proc_move_safe(next, MAX_SCURVE_RESIZE, true, head, tail).await? {
            return Ok(());
        }
        head.line(FAILED_SCURVE).await?;
        if self.proc_move_safe(next, MAX_NORM_RESIZE, false, head, tail).await? {
            return Ok(());
        }
        Err(StageError::Fatal(format!(
            "failed to ease feed rate for block. pre: {}, move: {}, post: {}",
            self.last_move, self.cur_move, next,
        )))
    }

    /// Try to emit a block for the staged move against the window
    /// `(last, cur, next)`. The already-sent `last` is immutable; an entry
    /// fault slows `cur`, an exit fault slows `next`. Slowing a move's
    /// target feedrate does not change either junction feedrate.
    async fn proc_move_safe(
        &mut self,
        next: Move,
        max_resizes: usize,
        s_trap: bool,
        head: &Tx,
        tail: &Tx,
    ) -> Result<bool, StageError> {
        if self.cur_move.is_empty() {
            self.push_move(next);
            return Ok(true); // no motion staged, nothing to fit
        }

        let mut cur = self.cur_move;
        let mut next = next;
        for _ in 0..max_resizes {
            match self.create_block(&self.last_move, &cur, &next, s_trap) {
                Ok(block) => {
                    tail.send(Message::Block(block)).await?;
                    self.cur_move = cur;
                    self.push_move(next);
                    return Ok(true);
                }
                Err(EaseLimit::Pre) => cur = cur.scale(RESIZE_SCALE),
                Err(EaseLimit::Post) => next = next.scale(RESIZE_SCALE),
            }
        }
        head.line(format!("debug:failed block for {cur}")).await?;
        Ok(false)
    }

    fn push_move(&mut self, next: Move) {
        self.last_move = self.cur_move;
        self.cur_move = next;
    }

    fn create_block(
        &self,
        pre: &Move,
        mv: &Move,
        post: &Move,
        s_trap: bool,
    ) -> Result<MotionBlock, EaseLimit> {
        let fr_start = if pre.is_empty() {
            0.0
        } else {
            let f = pre.delta().norm().dot(mv.delta().norm());
            pre.fr().min(mv.fr()) * clamp01(f)
        };

        let fr_accel = mv.delta().abs().norm().dot(self.acc);
        let fr_jerk = mv.delta().abs().norm().dot(self.s_jerk);

        let fr_end = if post.is_empty() {
            0.0
        } else {
            let f = mv.delta().norm().dot(post.delta().norm());
            mv.fr().min(post.fr()) * clamp01(f)
        };

        if s_trap {
            MotionBlock::s_trap(fr_jerk, fr_accel, fr_start, *mv, fr_end)
        } else {
            MotionBlock::trap(fr_accel, fr_start, *mv, fr_end)
        }
    }

    /// Flush the window with empty moves, zeroing both junction feedrates
    /// and completing any staged block.
    async fn end_block(&mut self, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        for _ in 0..3 {
            self.proc_move(Move::EMPTY, head, tail).await?;
        }
        Ok(())
    }

    /// Shrink a move until its velocity fits both the mechanical limit and
    /// the step-rate limit.
    fn limit_resize(&self, m: Move) -> Result<Move, StageError> {
        if m.is_empty() {
            return Ok(m);
        }
        let mut m = m;
        for _ in 0..MAX_LIMIT_RESIZE {
            if m.vel().within(self.max_sv) && m.vel().within(self.max_v) {
                return Ok(m);
            }
            m = m.scale(RESIZE_SCALE);
        }
        Err(StageError::Fatal(format!(
            "move ({m}) cannot fit within max velocity ({}, {})",
            self.max_sv, self.max_v,
        )))
    }
}

impl Default for PhysicsStage {
    fn default() -> Self {
        Self::new()
    }
}
