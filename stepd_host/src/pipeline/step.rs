// src/pipeline/step.rs - block sampling and page packing

use stepd_core::bed::ZFunc;
use stepd_core::config::{Config, PageFormat};
use stepd_core::gcode::Gcode;
use stepd_core::physics::MotionBlock;
use stepd_core::vec4::Vec4;

use crate::pipeline::{Message, PageData, Port, StageError, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackKind {
    Sp4x4d128,
    Sp4x2256,
    Sp4x1512,
}

/// Everything a packing pass wants to emit: pages flow downstream in
/// order, status lines go back upstream.
#[derive(Debug, Default)]
struct StepOut {
    pages: Vec<PageData>,
    lines: Vec<String>,
}

/// Samples motion blocks at the device tick rate and packs the per-tick
/// integer step deltas into page frames. The logical (mm) position is
/// mapped to step space with the Z bed-level offset and the E flow scale
/// applied, and the integer step counters make rounding loss impossible:
/// whatever a segment drops, the next one picks up.
pub struct StepStage {
    spmm: Vec4,
    ticks_per_second: u32,
    e_advance_k: f64,
    flow_rate: f64,
    z_func: Option<ZFunc>,

    s_pos: [i64; 4],
    dir: [bool; 4],
    v_pos: Vec4,

    format: Option<PageFormat>,
    pack: PackKind,

    chunk: Vec<u8>,
    segment_idx: usize,
}

impl StepStage {
    pub fn new() -> Self {
        Self {
            spmm: Vec4::ZERO,
            ticks_per_second: 0,
            e_advance_k: 0.0,
            flow_rate: 1.0,
            z_func: None,
            s_pos: [0; 4],
            dir: [false; 4],
            v_pos: Vec4::ZERO,
            format: None,
            pack: PackKind::Sp4x4d128,
            chunk: Vec::new(),
            segment_idx: 0,
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
        let mut out = StepOut::default();
        match &msg {
            Message::Gcode(g) => {
                if g.is_g(92) {
                    // re-anchor the integer step counters
                    self.update_s_pos(g.args.get_vec4(self.v_pos));
                } else if g.is_m(92) {
                    self.spmm = g.args.get_vec4(self.spmm);
                } else if g.is_m(221) {
                    if let Some(s) = g.args.get_float('S') {
                        self.flow_rate = s / 100.0;
                        out.lines.push(format!("info:setting flow rate to {}", self.flow_rate));
                    }
                } else if g.is_m(900) {
                    if let Some(k) = g.args.get_float('K') {
                        self.e_advance_k = k;
                        out.lines
                            .push(format!("info:setting lin advance k to {}", self.e_advance_k));
                    }
                    return self.emit(out, head, tail).await; // not a device gcode
                }
            }
            Message::Block(block) => self.proc_block(block, &mut out)?,
            Message::Config(conf) => self.config_update(conf)?,
            Message::ZFunc(z) => {
                out.lines.push("info:bed level z-func loaded".to_string());
                self.z_func = Some(z.clone());
            }
            _ => {}
        }
        self.emit(out, head, tail).await?;
        tail.send(msg).await
    }

    async fn emit(&self, out: StepOut, head: &Tx, tail: &Tx) -> Result<(), StageError> {
        for line in out.lines {
            head.line(line).await?;
        }
        for page in out.pages {
            tail.send(Message::Page(page)).await?;
        }
        Ok(())
    }

    fn format(&self) -> Result<PageFormat, StageError> {
        self.format
            .ok_or_else(|| StageError::Fatal("step stage used before configuration".into()))
    }

    fn proc_block(&mut self, block: &MotionBlock, out: &mut StepOut) -> Result<(), StageError> {
        let format = self.format()?;
        let samples_per_second = self.ticks_per_second as f64 / format.segment_steps as f64;

        let mut failed = false;
        for pos in block.samples(samples_per_second, self.e_advance_k) {
            let ds = self.update_s_pos(pos);
            failed |= !self.proc_segment(ds, format, out);
        }
        if failed {
            out.lines.push(format!("warn:segment split with block {}", block.mv()));
        }
        Ok(())
    }

    /// Map a logical position into integer step space and return the delta
    /// against the running counters.
    fn update_s_pos(&mut self, pos: Vec4) -> [i64; 4] {
        let mut ds = [0i64; 4];
        for (i, d) in ds.iter_mut().enumerate() {
            let mut offs = 0.0;
            let mut scale = 1.0;
            match i {
                2 => offs = self.z_offs_at(pos.xy()),
                3 => scale = self.flow_rate,
                _ => {}
            }
            let df = (pos[i] + offs) * self.spmm[i] * scale;
            let di = df.round() as i64;
            *d = di - self.s_pos[i];
            self.s_pos[i] = di;
        }
        self.v_pos = pos;
        ds
    }

    fn z_offs_at(&self, (x, y): (f64, f64)) -> f64 {
        match &self.z_func {
            Some(z) => z.at(x, y),
            None => 0.0,
        }
    }

    /// Pack one segment; splits it in half (recursively) when any axis
    /// overflows the format's step capacity. Returns false when a split
    /// happened.
    fn proc_segment(&mut self, ds: [i64; 4], format: PageFormat, out: &mut StepOut) -> bool {
        if !format.directional {
            self.check_direction(ds, format, out);
        }
        for (axis, d) in ds.iter().enumerate() {
            if d.unsigned_abs() > format.segment_steps as u64 {
                // splits should be very rare, but still may happen
                out.lines.push(format!(
                    "warn:step segment split for axis {axis} ({} v {})",
                    d.abs(),
                    format.segment_steps
                ));
                let mut ds0 = [0i64; 4];
                let mut ds1 = ds;
                for i in 0..4 {
                    ds0[i] = ds[i] / 2;
                    ds1[i] -= ds0[i];
                }
                self.proc_segment(ds0, format, out);
                self.proc_segment(ds1, format, out);
                return false;
            }
        }
        self.pack_segment(ds);
        if self.segment_idx == format.segments {
            self.flush_chunk(format, out);
        }
        true
    }

    /// Non-directional formats carry sign out of band: any sign change
    /// flushes the partial page and latches the new direction vector.
    fn check_direction(&mut self, ds: [i64; 4], format: PageFormat, out: &mut StepOut) {
        let mut changed = false;
        let mut new_dir = self.dir;
        for (i, d) in ds.iter().enumerate() {
            let dir = *d > 0;
            if *d != 0 && dir != self.dir[i] {
                new_dir[i] = dir;
                changed = true;
            }
        }
        if changed {
            self.flush_chunk(format, out);
            self.dir = new_dir;
        }
    }

    fn flush_chunk(&mut self, format: PageFormat, out: &mut StepOut) {
        if self.segment_idx == 0 {
            return;
        }
        out.pages.push(self.page_data(format));
        self.chunk = Vec::with_capacity(format.bytes);
        self.segment_idx = 0;
    }

    fn page_data(&self, format: PageFormat) -> PageData {
        PageData {
            steps: format.segment_steps * (self.segment_idx % format.segments) as u32,
            speed: self.ticks_per_second,
            has_dirs: !format.directional,
            dirs: self.dir,
            data: self.chunk.clone(),
        }
    }

    fn pack_segment(&mut self, ds: [i64; 4]) {
        match self.pack {
            PackKind::Sp4x4d128 => {
                // two bytes per segment: two signed 4-bit offsets each
                let a = (((ds[0] + 7) as u8 & 0xF) << 4) | ((ds[1] + 7) as u8 & 0xF);
                let b = (((ds[2] + 7) as u8 & 0xF) << 4) | ((ds[3] + 7) as u8 & 0xF);
                self.chunk.push(a);
                self.chunk.push(b);
            }
            PackKind::Sp4x2256 => {
                let mut a = 0u8;
                for (i, d) in ds.iter().enumerate() {
                    a |= (d.unsigned_abs() as u8 & 0x3) << ((3 - i) * 2);
                }
                self.chunk.push(a);
            }
            PackKind::Sp4x1512 => {
                let mut a = 0u8;
                for (i, d) in ds.iter().enumerate() {
                    if *d != 0 {
                        a |= 1 << (3 - i);
                    }
                }
                if self.segment_idx & 1 == 1 {
                    self.chunk[self.segment_idx / 2] |= a << 4;
                } else {
                    self.chunk.push(a);
                }
            }
        }
        self.segment_idx += 1;
    }

    fn config_update(&mut self, conf: &Config) -> Result<(), StageError> {
        self.ticks_per_second = conf.ticks_per_second;
        let format = conf.page_format()?;
        self.format = Some(format);
        self.pack = match conf.format.as_str() {
            "SP_4x4D_128" => PackKind::Sp4x4d128,
            "SP_4x2_256" => PackKind::Sp4x2256,
            "SP_4x1_512" => PackKind::Sp4x1512,
            other => {
                return Err(StageError::Fatal(format!("unknown page format {other}")));
            }
        };
        Ok(())
    }
}

impl Default for StepStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(name: &str) -> (StepStage, PageFormat) {
        let mut s = StepStage::new();
        s.ticks_per_second = 30000;
        let format = PageFormat::get(name).unwrap();
        s.format = Some(format);
        s.pack = match name {
            "SP_4x4D_128" => PackKind::Sp4x4d128,
            "SP_4x2_256" => PackKind::Sp4x2256,
            _ => PackKind::Sp4x1512,
        };
        (s, format)
    }

    #[test]
    fn directional_page_roundtrip() {
        let (mut s, format) = configured("SP_4x4D_128");
        let mut out = StepOut::default();
        for _ in 0..format.segments {
            assert!(s.proc_segment([1, -1, 2, -2], format, &mut out));
        }
        assert_eq!(out.pages.len(), 1);
        let page = &out.pages[0];
        assert_eq!(page.data.len(), 256);
        assert_eq!(page.steps, 0); // 128 % 128 segments
        assert_eq!(page.speed, 30000);
        assert!(!page.has_dirs);
        assert_eq!(page.data[0], 0x86); // (1+7)<<4 | (-1+7)
        assert_eq!(page.data[1], 0x95); // (2+7)<<4 | (-2+7)

        // every byte pair decodes back to the source deltas
        for pair in page.data.chunks(2) {
            let decode = |b: u8| ((b >> 4) as i64 - 7, (b & 0xF) as i64 - 7);
            assert_eq!(decode(pair[0]), (1, -1));
            assert_eq!(decode(pair[1]), (2, -2));
        }
    }

    #[test]
    fn two_bit_format_packs_magnitudes() {
        let (mut s, format) = configured("SP_4x2_256");
        let mut out = StepOut::default();
        // establish the direction vector first so no flush interferes
        assert!(s.proc_segment([1, 1, 1, 1], format, &mut out));
        assert!(s.proc_segment([3, 2, 1, 0], format, &mut out));
        assert_eq!(s.chunk[1], 0b11_10_01_00);
    }

    #[test]
    fn one_bit_format_packs_nibbles() {
        let (mut s, format) = configured("SP_4x1_512");
        s.dir = [true; 4]; // all axes already latched forward
        let mut out = StepOut::default();
        assert!(s.proc_segment([1, 0, 0, 1], format, &mut out));
        assert!(s.proc_segment([0, 1, 1, 0], format, &mut out));
        // even segment in the low nibble, odd or-ed into the high one
        assert_eq!(s.chunk.len(), 1);
        assert_eq!(s.chunk[0], 0b0110_1001);
    }

    #[test]
    fn direction_change_flushes_partial_page() {
        let (mut s, format) = configured("SP_4x2_256");
        let mut out = StepOut::default();
        assert!(s.proc_segment([1, 0, 0, 0], format, &mut out));
        assert!(s.proc_segment([2, 0, 0, 0], format, &mut out));
        assert!(out.pages.len() <= 1); // first segment may latch x positive
        let before = out.pages.len();

        // x reverses: the partial page must flush before the new sign packs
        assert!(s.proc_segment([-1, 0, 0, 0], format, &mut out));
        assert_eq!(out.pages.len(), before + 1);
        let page = out.pages.last().unwrap();
        assert!(page.has_dirs);
        assert!(page.dirs[0]); // the flushed page still carries x forward
        assert!(!s.dir[0]); // and the latched direction is now reverse
        assert_eq!(page.steps, format.segment_steps * 2);
    }

    #[test]
    fn oversized_segment_splits_in_half() {
        let (mut s, format) = configured("SP_4x4D_128");
        let mut out = StepOut::default();
        assert!(!s.proc_segment([10, 0, 0, 0], format, &mut out));
        assert_eq!(s.segment_idx, 2);
        assert_eq!(s.chunk[0], (5 + 7) << 4 | 7);
        assert_eq!(s.chunk[2], (5 + 7) << 4 | 7);
        assert!(out.lines.iter().any(|l| l.starts_with("warn:step segment split")));
    }

    #[test]
    fn step_position_tracks_cumulative_deltas() {
        let (mut s, _) = configured("SP_4x4D_128");
        s.spmm = Vec4::new(80.0, 80.0, 1600.0, 95.2);
        let mut sum = [0i64; 4];
        for k in 1..=10 {
            let pos = Vec4::new(k as f64 * 0.013, 0.0, 0.0, k as f64 * 0.001);
            let ds = s.update_s_pos(pos);
            for i in 0..4 {
                sum[i] += ds[i];
            }
        }
        assert_eq!(sum, s.s_pos);
        assert_eq!(s.s_pos[0], (10.0 * 0.013 * 80.0_f64).round() as i64);
    }

    #[test]
    fn z_offset_and_flow_scale_apply() {
        let (mut s, _) = configured("SP_4x4D_128");
        s.spmm = Vec4::new(80.0, 80.0, 1600.0, 100.0);
        s.flow_rate = 0.5;
        s.z_func = Some(ZFunc::new(|_, _| 0.1));
        let ds = s.update_s_pos(Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(ds[2], ((1.0 + 0.1) * 1600.0_f64).round() as i64);
        assert_eq!(ds[3], (1.0 * 100.0 * 0.5_f64).round() as i64);
    }
}
