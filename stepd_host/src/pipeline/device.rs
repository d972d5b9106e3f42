// src/pipeline/device.rs - page-slot ring, ack window, and gcode numbering

use std::collections::VecDeque;

use stepd_core::gcode::{arg, Gcode};

use crate::pipeline::{
    Message, PageData, Port, StageError, Tx, MAX_PENDING_COMMANDS, NUM_PAGES,
};

const MAX_N: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Free,
    Writing,
    Ok,
    Fail,
}

impl PageState {
    fn from_bits(bits: u8) -> PageState {
        match bits & 3 {
            0 => PageState::Free,
            1 => PageState::Writing,
            2 => PageState::Ok,
            _ => PageState::Fail,
        }
    }
}

#[derive(Debug)]
enum Work {
    Gcode(Gcode),
    /// A page waiting in slot `idx`; holds the queue until the device
    /// acknowledges the slot as Ok.
    Page(usize),
}

/// Owns the device-side page ring and the outgoing command window. Head
/// reads are gated on both: a full ack window or an exhausted ring only
/// leaves the device side to service, which is what couples upstream
/// back-pressure to the device.
pub struct DeviceStage {
    q: VecDeque<Work>,
    states: [PageState; NUM_PAGES],
    pages: Vec<PageData>,

    pending_commands: usize,
    n: u32,

    has_sent: bool,
    last_dirs: [bool; 4],
    last_speed: u32,
}

impl DeviceStage {
    pub fn new() -> Self {
        Self {
            q: VecDeque::new(),
            states: [PageState::Free; NUM_PAGES],
            pages: vec![PageData::default(); NUM_PAGES],
            pending_commands: 0,
            // start saturated so the first send resets device numbering
            n: MAX_N,
            has_sent: false,
            last_dirs: [false; 4],
            last_speed: 0,
        }
    }

    pub async fn run(mut self, head: Port, tail: Port) -> Result<(), StageError> {
        let (mut head_rx, head_tx) = head.split();
        let (mut tail_rx, tail_tx) = tail.split();

        loop {
            let may_read_head =
                self.pending_commands < MAX_PENDING_COMMANDS && self.free_page().is_some();
            tokio::select! {
                msg = head_rx.recv(), if may_read_head => match msg {
                    Some(msg) => self.head_read(msg, &head_tx, &tail_tx).await?,
                    None => return Ok(()),
                },
                msg = tail_rx.recv() => match msg {
                    Some(msg) => self.tail_read(msg, &head_tx, &tail_tx).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn head_read(&mut self, msg: Message, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        match msg {
            Message::Page(page) => self.push_page(page, tail).await?,
            Message::Config(_) => head.line("info:config processed").await?,
            Message::Gcode(g) => self.q.push_back(Work::Gcode(g)),
            other => tracing::debug!("device stage dropping {other:?}"),
        }
        self.drain(tail).await
    }

    async fn tail_read(&mut self, msg: Message, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        match msg {
            Message::Frame(bytes) => self.update_page_states(&bytes, head, tail).await?,
            Message::Line(line) if line.starts_with("ok") => {
                if self.pending_commands == 0 {
                    head.line("warn:pending OK count dropped below 0").await?;
                } else {
                    self.pending_commands -= 1;
                }
            }
            Message::Line(_) => head.send(msg).await?,
            other => {
                return Err(StageError::Fatal(format!(
                    "unexpected message from transport: {other:?}"
                )));
            }
        }
        self.drain(tail).await
    }

    /// Pop work while the ack window is open. A page placeholder at the
    /// front blocks the queue until its slot reports Ok.
    async fn drain(&mut self, tail: &Tx) -> Result<(), StageError> {
        while self.pending_commands < MAX_PENDING_COMMANDS {
            match self.q.front() {
                None => break,
                Some(Work::Page(idx)) => {
                    let idx = *idx;
                    if self.states[idx] != PageState::Ok {
                        break; // hold until the page is confirmed
                    }
                    self.send_g6(idx, tail).await?;
                    self.q.pop_front();
                }
                Some(Work::Gcode(_)) => {
                    let Some(Work::Gcode(g)) = self.q.pop_front() else {
                        unreachable!()
                    };
                    self.send_gcode(g, tail).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_gcode(&mut self, g: Gcode, tail: &Tx) -> Result<(), StageError> {
        if self.n >= MAX_N {
            self.n = 0;
            let reset = Gcode::new('M', 110, ());
            self.emit(reset, tail).await?;
        }
        self.emit(g, tail).await
    }

    async fn emit(&mut self, mut g: Gcode, tail: &Tx) -> Result<(), StageError> {
        g.num = Some(self.n);
        self.n += 1;
        self.pending_commands += 1;
        tail.line(g.to_string()).await
    }

    /// Apply a device status frame: two bits per slot, slot `i` at bit
    /// `(i*2) % 8` of byte `i/4`. Only the valid lifecycle transitions are
    /// applied; everything else in the frame is noise to us.
    async fn update_page_states(
        &mut self,
        bytes: &[u8],
        head: &Tx,
        tail: &Tx,
    ) -> Result<(), StageError> {
        for i in 0..NUM_PAGES {
            let Some(b) = bytes.get(i / 4) else { break };
            let s1 = PageState::from_bits(b >> ((i * 2) % 8));
            match (self.states[i], s1) {
                (PageState::Writing, PageState::Ok) => self.states[i] = PageState::Ok,
                (PageState::Writing, PageState::Fail) => {
                    head.line("warn:unlocking failed page").await?;
                    self.send_unlock(i, tail).await?;
                    self.states[i] = PageState::Fail;
                }
                (PageState::Ok, PageState::Free) => {
                    self.pages[i] = PageData::default();
                    self.states[i] = PageState::Free;
                }
                (PageState::Fail, PageState::Free) => {
                    // the slot drained a corrupt write; retry the payload
                    // and keep holding the Fail state
                    self.send_page(i, tail).await?;
                }
                _ => {} // not a valid transition, ignore
            }
        }
        Ok(())
    }

    fn free_page(&self) -> Option<usize> {
        (0..NUM_PAGES).find(|&i| self.states[i] == PageState::Free)
    }

    async fn push_page(&mut self, page: PageData, tail: &Tx) -> Result<(), StageError> {
        let idx = self.free_page().ok_or_else(|| {
            StageError::Fatal("page management failed to find a free page".into())
        })?;
        self.pages[idx] = page;
        self.send_page(idx, tail).await?;
        self.q.push_back(Work::Page(idx));
        Ok(())
    }

    async fn send_page(&mut self, idx: usize, tail: &Tx) -> Result<(), StageError> {
        let data = &self.pages[idx].data;
        let chs = data.iter().fold(0u8, |acc, b| acc ^ b);

        let mut msg = Vec::with_capacity(data.len() + 3);
        msg.push(idx as u8);
        msg.push(data.len() as u8);
        msg.extend_from_slice(data);
        msg.push(chs);

        self.states[idx] = PageState::Writing;
        tail.send(Message::Frame(msg)).await
    }

    async fn send_unlock(&self, idx: usize, tail: &Tx) -> Result<(), StageError> {
        tail.send(Message::Frame(vec![idx as u8, 0])).await
    }

    /// `G6` consumes the prepared page in slot `idx`. Speed and direction
    /// args are deltas against the previous send.
    async fn send_g6(&mut self, idx: usize, tail: &Tx) -> Result<(), StageError> {
        let page = self.pages[idx].clone();
        let mut args = Vec::with_capacity(7);

        args.push(arg('I', idx));
        if page.steps != 0 {
            args.push(arg('S', page.steps));
        }
        if self.last_speed != page.speed || !self.has_sent {
            args.push(arg('R', page.speed));
        }
        if page.has_dirs {
            for (i, a) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                if self.last_dirs[i] != page.dirs[i] || !self.has_sent {
                    args.push(arg(a, page.dirs[i] as u8));
                }
            }
        }

        self.last_speed = page.speed;
        self.last_dirs = page.dirs;
        self.has_sent = true;
        self.send_gcode(Gcode::new('G', 6, args), tail).await
    }
}

impl Default for DeviceStage {
    fn default() -> Self {
        Self::new()
    }
}
