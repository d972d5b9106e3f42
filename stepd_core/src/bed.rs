// src/bed.rs - bed-level probe samples and the Z-offset function

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no bed samples")]
    Empty,
}

/// One probed point of the build surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub offs: f64,
}

/* Bed X: 179.000 Y: 20.000 Z: 0.135 */

/// Parse a probe-point report line from the device.
pub fn parse_point(line: &str) -> Option<Sample> {
    if !line.starts_with("Bed X:") {
        return None;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() < 7 {
        return None;
    }
    let mut vs = [0.0; 3];
    for (slot, idx) in [2usize, 4, 6].iter().enumerate() {
        vs[slot] = words[*idx].parse().ok()?;
    }
    Some(Sample { x: vs[0], y: vs[1], offs: vs[2] })
}

pub fn load_samples(path: &Path) -> Result<Vec<Sample>, BedError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn save_samples(path: &Path, samples: &[Sample]) -> Result<(), BedError> {
    let bytes = serde_json::to_vec(samples)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Opaque Z-offset function over the bed plane.
#[derive(Clone)]
pub struct ZFunc {
    inner: Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>,
}

impl ZFunc {
    pub fn new<F: Fn(f64, f64) -> f64 + Send + Sync + 'static>(f: F) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn at(&self, x: f64, y: f64) -> f64 {
        (self.inner)(x, y)
    }
}

impl std::fmt::Debug for ZFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZFunc")
    }
}

/// Build a `ZFunc` from probe samples. Auto-level reports arrive as a
/// regular grid, which interpolates bilinearly; scattered sample sets fall
/// back to inverse-distance weighting. Queries are clamped to the bed
/// extent and then to the sampled area.
pub fn generate(samples: &[Sample], bed_max: [f64; 2]) -> Result<ZFunc, BedError> {
    if samples.is_empty() {
        return Err(BedError::Empty);
    }

    if let Some(grid) = Grid::build(samples) {
        return Ok(ZFunc::new(move |x, y| {
            grid.at(x.clamp(0.0, bed_max[0]), y.clamp(0.0, bed_max[1]))
        }));
    }

    let samples = samples.to_vec();
    Ok(ZFunc::new(move |x, y| {
        idw(&samples, x.clamp(0.0, bed_max[0]), y.clamp(0.0, bed_max[1]))
    }))
}

fn idw(samples: &[Sample], x: f64, y: f64) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for s in samples {
        let d2 = (s.x - x) * (s.x - x) + (s.y - y) * (s.y - y);
        if d2 < 1e-12 {
            return s.offs;
        }
        num += s.offs / d2;
        den += 1.0 / d2;
    }
    num / den
}

struct Grid {
    xs: Vec<f64>,
    ys: Vec<f64>,
    // zs[iy * xs.len() + ix]
    zs: Vec<f64>,
}

impl Grid {
    fn build(samples: &[Sample]) -> Option<Grid> {
        let mut xs: Vec<f64> = samples.iter().map(|s| s.x).collect();
        let mut ys: Vec<f64> = samples.iter().map(|s| s.y).collect();
        xs.sort_by(f64::total_cmp);
        xs.dedup();
        ys.sort_by(f64::total_cmp);
        ys.dedup();

        if xs.len() < 2 || ys.len() < 2 || xs.len() * ys.len() != samples.len() {
            return None;
        }

        let mut zs = vec![f64::NAN; xs.len() * ys.len()];
        for s in samples {
            let ix = xs.iter().position(|&x| x == s.x)?;
            let iy = ys.iter().position(|&y| y == s.y)?;
            zs[iy * xs.len() + ix] = s.offs;
        }
        if zs.iter().any(|z| z.is_nan()) {
            return None; // not actually a full grid
        }
        Some(Grid { xs, ys, zs })
    }

    fn at(&self, x: f64, y: f64) -> f64 {
        let (ix, fx) = Self::locate(&self.xs, x);
        let (iy, fy) = Self::locate(&self.ys, y);
        let w = self.xs.len();
        let z00 = self.zs[iy * w + ix];
        let z10 = self.zs[iy * w + ix + 1];
        let z01 = self.zs[(iy + 1) * w + ix];
        let z11 = self.zs[(iy + 1) * w + ix + 1];
        let z0 = z00 + (z10 - z00) * fx;
        let z1 = z01 + (z11 - z01) * fx;
        z0 + (z1 - z0) * fy
    }

    /// Bracketing cell index and fraction along it, clamped to the extent.
    fn locate(axis: &[f64], v: f64) -> (usize, f64) {
        let v = v.clamp(axis[0], axis[axis.len() - 1]);
        let hi = axis.partition_point(|&a| a < v).clamp(1, axis.len() - 1);
        let lo = hi - 1;
        (lo, (v - axis[lo]) / (axis[hi] - axis[lo]))
    }
}
