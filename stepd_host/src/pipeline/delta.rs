// src/pipeline/delta.rs - gcode position commands to absolute moves

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use stepd_core::gcode::{vec4_args, Gcode};
use stepd_core::physics::Move;
use stepd_core::vec4::Vec4;

use crate::pipeline::{Message, Port, Rx, StageError, Tx};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Tracks the logical position and rewrites `G0`/`G1` into absolute
/// `Move` records. Homing and probing are followed by a position query so
/// the logical position re-syncs with wherever the device actually ended
/// up; the response is applied by posting a `G92` back to ourselves.
pub struct DeltaStage {
    pos: Vec4,
    fr: f64,
    fr_scale: f64,
    abs: bool,
    syncing: bool,
    pending: VecDeque<Gcode>,
}

impl DeltaStage {
    pub fn new() -> Self {
        Self {
            pos: Vec4::ZERO,
            fr: 0.0,
            fr_scale: 1.0,
            abs: true,
            syncing: false,
            pending: VecDeque::new(),
        }
    }

    pub async fn run(mut self, head: Port, tail: Port) -> Result<(), StageError> {
        let (mut head_rx, head_tx) = head.split();
        let (mut tail_rx, tail_tx) = tail.split();

        loop {
            // self-enqueued gcodes run before any new upstream traffic
            if let Some(g) = self.pending.pop_front() {
                self.head_gcode(g, &head_tx, &tail_tx, &mut tail_rx).await?;
                continue;
            }
            tokio::select! {
                msg = head_rx.recv() => match msg {
                    Some(Message::Gcode(g)) => {
                        self.head_gcode(g, &head_tx, &tail_tx, &mut tail_rx).await?
                    }
                    Some(msg) => tail_tx.send(msg).await?,
                    None => return Ok(()),
                },
                msg = tail_rx.recv() => match msg {
                    Some(msg) => self.tail_read(msg, &head_tx).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn head_gcode(
        &mut self,
        g: Gcode,
        head: &Tx,
        tail: &Tx,
        tail_rx: &mut Rx,
    ) -> Result<(), StageError> {
        if g.is_g(0) || g.is_g(1) {
            return self.proc_move(g, head, tail).await;
        }

        if g.is_g(28) {
            // re-sync the logical position once homing completes
            self.pending.push_back(Gcode::new('M', 114, ()));
        } else if g.is_g(29) {
            // probing moves the carriage; home afterwards
            self.pending.push_back(Gcode::new('G', 28, ()));
        } else if g.is_g(90) {
            head.line("info:setting to absolute coords").await?;
            self.abs = true;
        } else if g.is_g(91) {
            head.line("info:setting to relative coords").await?;
            self.abs = false;
        } else if g.is_g(92) {
            self.pos = g.args.get_vec4(self.pos);
        } else if g.is_m(220) {
            if let Some(s) = g.args.get_float('S') {
                self.fr_scale = s / 100.0;
                head.line(format!("info:setting feedrate scale to {}", self.fr_scale))
                    .await?;
            }
        } else if g.is_m(114) {
            tail.gcode(g).await?;
            return self.sync_position(head, tail_rx).await;
        }

        tail.gcode(g).await
    }

    async fn tail_read(&mut self, msg: Message, head: &Tx) -> Result<(), StageError> {
        if let Message::Line(line) = &msg {
            // X:0.00 Y:0.00 Z:10.00 E:0.00 Count X:0 Y:0 Z:16000
            if line.starts_with("X:") && line.contains(" Count ") {
                if self.syncing {
                    let pos = parse_position(line).ok_or_else(|| {
                        StageError::Fatal(format!("bad position report: {line}"))
                    })?;
                    self.pending.push_back(Gcode::new('G', 92, vec4_args(pos)));
                    self.syncing = false;
                    head.line("info:syncd with device position").await?;
                }
                return Ok(());
            }
        }
        head.send(msg).await
    }

    /// Block on the `M114` response, servicing only device traffic until
    /// the position report arrives.
    async fn sync_position(&mut self, head: &Tx, tail_rx: &mut Rx) -> Result<(), StageError> {
        head.line("info:syncing with device position").await?;
        self.syncing = true;
        let deadline = Instant::now() + SYNC_TIMEOUT;
        while self.syncing {
            let wait = deadline.saturating_duration_since(Instant::now());
            let msg = timeout(wait, tail_rx.recv())
                .await
                .map_err(|_| StageError::SyncTimeout)?;
            match msg {
                Some(msg) => self.tail_read(msg, head).await?,
                None => return Err(StageError::Closed),
            }
        }
        Ok(())
    }

    async fn proc_move(&mut self, g: Gcode, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        let new_pos = if self.abs {
            g.args.get_vec4(self.pos)
        } else {
            g.args.get_vec4(Vec4::ZERO) + self.pos
        };
        if let Some(f) = g.args.get_float('F') {
            self.fr = f * self.fr_scale / 60.0;
        }
        if new_pos == self.pos {
            return Ok(());
        }

        if self.fr == 0.0 {
            self.pos = new_pos;
            return head.line("warn:skipped move with 0 feedrate").await;
        }

        let m = Move::new(self.pos, new_pos, self.fr);
        self.pos = new_pos;
        tail.send(Message::Move(m)).await
    }
}

impl Default for DeltaStage {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_position(line: &str) -> Option<Vec4> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() < 4 {
        return None;
    }
    let mut vs = [0.0; 4];
    for (i, v) in vs.iter_mut().enumerate() {
        *v = words[i].get(2..)?.parse().ok()?;
    }
    Some(Vec4::new(vs[0], vs[1], vs[2], vs[3]))
}
