// src/pipeline/source.rs - text lines in, parsed gcode out

use stepd_core::gcode::Gcode;

use crate::pipeline::{Message, Port, StageError, Tx};

/// Parses producer lines into gcode and acknowledges each one. The stage
/// holds upstream traffic until the device reports `pages_ready`; a second
/// start banner afterwards means the device rebooted under us.
pub struct SourceStage {
    started: bool,
}

impl SourceStage {
    pub fn new() -> Self {
        Self { started: false }
    }

    pub async fn run(mut self, head: Port, tail: Port) -> Result<(), StageError> {
        let (mut head_rx, head_tx) = head.split();
        let (mut tail_rx, tail_tx) = tail.split();

        loop {
            tokio::select! {
                msg = head_rx.recv(), if self.started => match msg {
                    Some(msg) => self.head_read(msg, &head_tx, &tail_tx).await?,
                    None => return Ok(()),
                },
                msg = tail_rx.recv() => match msg {
                    Some(msg) => self.tail_read(msg, &head_tx).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn head_read(&mut self, msg: Message, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        let line = match msg {
            Message::Line(line) => line,
            other => return tail.send(other).await,
        };

        if line.is_empty() || line.starts_with(';') {
            return Ok(()); // comment-only or blank line
        }

        let g = match Gcode::parse(&line) {
            Ok(g) => g,
            Err(e) => {
                return head.line(format!("error: failed parsing gcode ({e})")).await;
            }
        };

        let num = g.num;
        if !g.is_m(110) {
            // send to tail before responding ok, in case tail blocks
            tail.gcode(g).await?;
        }

        match num {
            None => head.line("ok").await,
            Some(n) => head.line(format!("ok N{n}")).await,
        }
    }

    async fn tail_read(&mut self, msg: Message, head: &Tx) -> Result<(), StageError> {
        if let Message::Line(line) = &msg {
            if line == "pages_ready" && !self.started {
                head.line("info:device ready for paged data, starting...").await?;
                self.started = true;
            } else if self.started && (line == "echo:start" || line == "pages_ready") {
                return Err(StageError::DeviceRestart);
            }
        }
        head.send(msg).await
    }
}

impl Default for SourceStage {
    fn default() -> Self {
        Self::new()
    }
}
