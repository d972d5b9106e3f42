//! Pipeline fabric: the message sum type, bidirectional ports, and the
//! stage chain.
//!
//! A stage owns two ports: `head` faces upstream (the gcode producer),
//! `tail` faces downstream (the device). Stages are chained by handing one
//! endpoint of a fresh port pair to the new stage and keeping the other as
//! the next attachment point, so the downstream stage's head read queue is
//! the upstream stage's tail write queue.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use stepd_core::bed::ZFunc;
use stepd_core::config::{Config, ConfigError};
use stepd_core::gcode::Gcode;
use stepd_core::physics::{MotionBlock, Move};

pub mod config;
pub mod delta;
pub mod device;
pub mod physics;
pub mod source;
pub mod step;

pub use config::ConfigStage;
pub use delta::DeltaStage;
pub use device::DeviceStage;
pub use physics::PhysicsStage;
pub use source::SourceStage;
pub use step::StepStage;

/// Device-side page slot count; also the step stage's tail buffer size.
pub const NUM_PAGES: usize = 16;

/// Commands allowed in flight before an `ok` must drain; also the device
/// stage's tail buffer size.
pub const MAX_PENDING_COMMANDS: usize = 4;

/// One bit-packed page of step segments, ready for a device slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageData {
    /// Steps this page represents in device ticks.
    pub steps: u32,
    /// Tick rate the page should be clocked out at.
    pub speed: u32,
    pub has_dirs: bool,
    pub dirs: [bool; 4],
    pub data: Vec<u8>,
}

/// Everything that can travel through a pipeline queue. Stages transform
/// the kinds they understand and forward the rest unchanged.
#[derive(Debug, Clone)]
pub enum Message {
    /// A text line of the framed wire protocol.
    Line(String),
    /// A binary control frame (device status, page writes, unlocks).
    Frame(Vec<u8>),
    Gcode(Gcode),
    Move(Move),
    Block(MotionBlock),
    Page(PageData),
    Config(Config),
    ZFunc(ZFunc),
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Line(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Line(s)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("pipeline channel closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("device restart detected")]
    DeviceRestart,
    #[error("timed out waiting for device settings")]
    SettingsTimeout,
    #[error("timed out while syncing position")]
    SyncTimeout,
    #[error("{0}")]
    Fatal(String),
}

/// Receive half of a port.
pub type Rx = mpsc::Receiver<Message>;

/// Send half of a port.
#[derive(Clone)]
pub struct Tx(mpsc::Sender<Message>);

impl Tx {
    pub async fn send(&self, msg: Message) -> Result<(), StageError> {
        self.0.send(msg).await.map_err(|_| StageError::Closed)
    }

    /// Send a text line, e.g. a severity-prefixed status reply.
    pub async fn line(&self, s: impl Into<String>) -> Result<(), StageError> {
        self.send(Message::Line(s.into())).await
    }

    pub async fn gcode(&self, g: Gcode) -> Result<(), StageError> {
        self.send(Message::Gcode(g)).await
    }
}

/// One endpoint of a bidirectional link: a bounded read queue and a bounded
/// write queue.
pub struct Port {
    rx: Rx,
    tx: Tx,
}

impl Port {
    /// Create both endpoints of a link. Writing into one endpoint is read
    /// from the other; handing the peer endpoint to the next stage is the
    /// composition "flip".
    pub fn pair(buffer: usize) -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            Port { rx: a_rx, tx: Tx(a_tx) },
            Port { rx: b_rx, tx: Tx(b_tx) },
        )
    }

    pub fn split(self) -> (Rx, Tx) {
        (self.rx, self.tx)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub async fn send(&self, msg: Message) -> Result<(), StageError> {
        self.tx.send(msg).await
    }

    pub fn sender(&self) -> Tx {
        self.tx.clone()
    }
}

/// Spawn a stage on the current chain tail and return the new tail
/// endpoint. A clean close (either neighbour going away) ends the stage
/// quietly; anything else is fatal for the whole daemon.
pub fn attach<F, Fut>(head: Port, buffer: usize, name: &'static str, stage: F) -> Port
where
    F: FnOnce(Port, Port) -> Fut,
    Fut: Future<Output = Result<(), StageError>> + Send + 'static,
{
    let (tail, next) = Port::pair(buffer);
    let fut = stage(head, tail);
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => tracing::debug!("{name} stage drained"),
            Err(StageError::Closed) => tracing::debug!("{name} stage: pipeline closed"),
            Err(e) => {
                tracing::error!("fatal: {name} stage: {e}");
                std::process::exit(1);
            }
        }
    });
    next
}

pub(crate) fn clamp01(f: f64) -> f64 {
    f.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_pair_is_crossed() {
        let (a, mut b) = Port::pair(4);
        a.send(Message::from("hello")).await.unwrap();
        match b.recv().await.unwrap() {
            Message::Line(s) => assert_eq!(s, "hello"),
            other => panic!("unexpected {other:?}"),
        }

        b.send(Message::from("back")).await.unwrap();
        let (mut a_rx, _a_tx) = a.split();
        assert!(matches!(a_rx.recv().await, Some(Message::Line(s)) if s == "back"));
    }

    #[tokio::test]
    async fn attach_forwards_through_a_stage() {
        let (ours, head) = Port::pair(4);
        // a stage that echoes head traffic back upstream and downstream
        let tail = attach(head, 4, "echo", |head, tail| async move {
            let (mut head_rx, head_tx) = head.split();
            let (_tail_rx, tail_tx) = tail.split();
            while let Some(msg) = head_rx.recv().await {
                head_tx.send(msg.clone()).await?;
                tail_tx.send(msg).await?;
            }
            Ok(())
        });

        ours.send(Message::from("ping")).await.unwrap();
        let (mut ours_rx, _) = ours.split();
        let (mut tail_rx, _tail_tx) = tail.split();
        assert!(matches!(ours_rx.recv().await, Some(Message::Line(s)) if s == "ping"));
        assert!(matches!(tail_rx.recv().await, Some(Message::Line(s)) if s == "ping"));
    }
}
