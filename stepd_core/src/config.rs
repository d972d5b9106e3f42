// src/config.rs - daemon configuration (HJSON on disk) and page formats

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vec4::Vec4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HJSON parse error: {0}")]
    Hjson(#[from] deser_hjson::Error),
    #[error("unknown page format {0:?}")]
    UnknownFormat(String),
}

/// Daemon configuration. Axis tuples are `[x, y, z, e]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub acceleration: Vec4,
    pub jerk: Vec4,
    #[serde(rename = "s-jerk")]
    pub s_jerk: Vec4,
    #[serde(rename = "steps-per-mm")]
    pub steps_per_mm: Vec4,
    #[serde(rename = "ticks-per-second")]
    pub ticks_per_second: u32,
    pub format: String,
    #[serde(rename = "bed-max")]
    pub bed_max: [f64; 2],
    #[serde(rename = "bed-samples-path")]
    pub bed_samples_path: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let conf: Config = deser_hjson::from_str(&text)?;
        conf.page_format()?; // reject unknown formats at load time
        Ok(conf)
    }

    pub fn page_format(&self) -> Result<PageFormat, ConfigError> {
        PageFormat::get(&self.format)
            .ok_or_else(|| ConfigError::UnknownFormat(self.format.clone()))
    }
}

/// One supported page encoding. `segment_steps` is the per-axis step
/// magnitude one segment can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFormat {
    pub directional: bool,
    pub bytes: usize,
    pub segments: usize,
    pub segment_steps: u32,
}

impl PageFormat {
    pub fn get(name: &str) -> Option<PageFormat> {
        let format = match name {
            "SP_4x4D_128" => PageFormat {
                directional: true,
                bytes: 256,
                segments: 128,
                segment_steps: 7,
            },
            "SP_4x2_256" => PageFormat {
                directional: false,
                bytes: 256,
                segments: 256,
                segment_steps: 3,
            },
            "SP_4x1_512" => PageFormat {
                directional: false,
                bytes: 256,
                segments: 512,
                segment_steps: 1,
            },
            _ => return None,
        };
        Some(format)
    }
}
