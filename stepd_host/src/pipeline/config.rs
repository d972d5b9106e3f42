// src/pipeline/config.rs - configuration fan-out and bed-level collection

use std::time::Duration;

use tokio::time::{timeout, Instant};

use stepd_core::bed;
use stepd_core::config::Config;
use stepd_core::gcode::{arg, Gcode};

use crate::pipeline::{Message, Port, Rx, StageError, Tx};

const BL_END: &str = "Bilinear Leveling Grid:";
const BL_START: &str = "G29 Auto Bed Leveling";
const CONF_END: &str = "echo:; PID settings:";

const DEV_SETTINGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Seeds the pipeline with the loaded configuration and the persisted
/// bed-level function, then keeps both current: probe points streaming back
/// from a `G29` become a fresh ZFunc, and the device's `M503` settings
/// report re-parameterises the motion stages.
pub struct ConfigStage {
    conf: Config,
    samples: Vec<bed::Sample>,
    is_ready: bool,
}

impl ConfigStage {
    pub fn new(conf: Config) -> Self {
        Self { conf, samples: Vec::new(), is_ready: false }
    }

    pub async fn run(mut self, head: Port, tail: Port) -> Result<(), StageError> {
        let (mut head_rx, head_tx) = head.split();
        let (mut tail_rx, tail_tx) = tail.split();

        tail_tx.send(Message::Config(self.conf.clone())).await?;
        self.load_samples(&head_tx, &tail_tx).await?;

        // startup barrier: only service the device until it has reported
        // its settings
        let deadline = Instant::now() + DEV_SETTINGS_TIMEOUT;
        while !self.is_ready {
            match self.recv_by(&mut tail_rx, deadline).await? {
                Some(msg) => self.tail_read(msg, &head_tx, &tail_tx).await?,
                None => return Ok(()),
            }
        }

        loop {
            tokio::select! {
                msg = head_rx.recv() => match msg {
                    Some(msg) => self.head_read(msg, &tail_tx).await?,
                    None => return Ok(()),
                },
                msg = tail_rx.recv() => match msg {
                    Some(msg) => self.tail_read(msg, &head_tx, &tail_tx).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn recv_by(
        &self,
        tail_rx: &mut Rx,
        deadline: Instant,
    ) -> Result<Option<Message>, StageError> {
        let wait = deadline.saturating_duration_since(Instant::now());
        timeout(wait, tail_rx.recv())
            .await
            .map_err(|_| StageError::SettingsTimeout)
    }

    async fn head_read(&mut self, msg: Message, tail: &Tx) -> Result<(), StageError> {
        if let Message::Gcode(g) = &msg {
            if g.is_g(29) {
                // probe verbosely so the point reports come back to us
                let verbose = Gcode::new('G', 29, vec![arg('V', 3), "T".to_string()]);
                return tail.gcode(verbose).await;
            }
            if g.is_m(501) {
                tail.send(msg).await?;
                return self.gather_settings(tail).await;
            }
        }
        tail.send(msg).await
    }

    async fn tail_read(&mut self, msg: Message, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        if let Message::Line(line) = &msg {
            if let Some(p) = bed::parse_point(line) {
                self.samples.push(p);
            } else if line.starts_with(BL_END) && !self.samples.is_empty() {
                self.save_samples(head).await?;
                self.proc_samples(head, tail).await?;
            } else if line.starts_with(BL_START) {
                head.line("info:collecting bed-level samples").await?;
                self.samples.clear();
            } else if line.starts_with(CONF_END) {
                self.is_ready = true;
            } else if line == "pages_ready" {
                self.gather_settings(tail).await?;
            } else {
                self.check_settings_report(line, tail).await?;
            }
        }
        head.send(msg).await
    }

    /// Ask the device to report its live settings.
    async fn gather_settings(&self, tail: &Tx) -> Result<(), StageError> {
        tail.gcode(Gcode::new('M', 503, ())).await
    }

    /// `M503` report lines come back as `echo: M92 X80.0 …`; the motion
    /// settings among them re-parameterise the physics and step stages.
    async fn check_settings_report(&self, line: &str, tail: &Tx) -> Result<(), StageError> {
        let Some(rest) = line.strip_prefix("echo:") else {
            return Ok(());
        };
        let rest = rest.trim_start();
        if !rest.starts_with('M') {
            return Ok(());
        }
        let Ok(g) = Gcode::parse(rest) else {
            return Ok(());
        };
        match g.code {
            92 | 201 | 203 | 204 if g.command == 'M' => tail.gcode(g).await,
            _ => Ok(()),
        }
    }

    async fn proc_samples(&mut self, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        head.line("info:generating bed level function...").await?;
        let z_func = bed::generate(&self.samples, self.conf.bed_max)
            .map_err(|e| StageError::Fatal(format!("bad bed-level data: {e}")))?;
        tail.send(Message::ZFunc(z_func)).await
    }

    async fn load_samples(&mut self, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        match bed::load_samples(&self.conf.bed_samples_path) {
            Ok(samples) => {
                self.samples = samples;
                self.proc_samples(head, tail).await
            }
            Err(e) => {
                head.line(format!(
                    "warn:failed to load {}: {e}",
                    self.conf.bed_samples_path.display()
                ))
                .await
            }
        }
    }

    async fn save_samples(&self, head: &Tx) -> Result<(), StageError> {
        if let Err(e) = bed::save_samples(&self.conf.bed_samples_path, &self.samples) {
            head.line(format!(
                "warn:failed to save {}: {e}",
                self.conf.bed_samples_path.display()
            ))
            .await?;
        }
        Ok(())
    }
}
