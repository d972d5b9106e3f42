// src/gcode.rs - gcode parsing and rendering with line numbers and XOR checksums

use thiserror::Error;

use crate::vec4::Vec4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcodeError {
    #[error("bad checksum")]
    BadChecksum,
    #[error("empty command")]
    Empty,
    #[error("malformed line number in {0:?}")]
    BadLineNumber(String),
    #[error("malformed command {0:?}")]
    BadCommand(String),
}

/// XOR checksum over the raw line bytes, as used by the `*<n>` suffix.
pub fn checksum(line: &str) -> u8 {
    line.bytes().fold(0, |acc, b| acc ^ b)
}

/// A parsed gcode command and its raw tagged args.
#[derive(Debug, Clone, PartialEq)]
pub struct Gcode {
    pub command: char,
    pub code: u32,
    pub num: Option<u32>,
    pub args: Args,
}

impl Gcode {
    pub fn new<A: Into<Args>>(command: char, code: u32, args: A) -> Self {
        Self { command, code, num: None, args: args.into() }
    }

    pub fn is_g(&self, code: u32) -> bool {
        self.command == 'G' && self.code == code
    }

    pub fn is_m(&self, code: u32) -> bool {
        self.command == 'M' && self.code == code
    }

    /// Parse a raw line: comments stripped, optional `*` checksum verified,
    /// optional `N` line number, then `<letter><code>` and tagged args.
    pub fn parse(line: &str) -> Result<Gcode, GcodeError> {
        let line = line.to_uppercase();

        // strip comment
        let mut line = line.split(';').next().unwrap_or("").trim();

        // checksum verification if provided
        if let Some((body, chs)) = line.split_once('*') {
            let expect: u8 = chs
                .trim()
                .parse()
                .map_err(|_| GcodeError::BadChecksum)?;
            if checksum(body) != expect {
                return Err(GcodeError::BadChecksum);
            }
            line = body;
        }

        let mut num = None;
        if line.starts_with('N') {
            let (head, rest) = line
                .split_once(' ')
                .ok_or_else(|| GcodeError::BadLineNumber(line.to_string()))?;
            num = Some(
                head[1..]
                    .parse()
                    .map_err(|_| GcodeError::BadLineNumber(head.to_string()))?,
            );
            line = rest;
        }

        let mut words = line.split_whitespace();
        let cmd = words.next().ok_or(GcodeError::Empty)?;
        let command = cmd.chars().next().ok_or(GcodeError::Empty)?;
        let code = cmd[command.len_utf8()..]
            .parse()
            .map_err(|_| GcodeError::BadCommand(cmd.to_string()))?;

        let args = Args(words.map(str::to_string).collect());
        Ok(Gcode { command, code, num, args })
    }
}

impl std::fmt::Display for Gcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut body = format!("{}{} {}", self.command, self.code, self.args);
        body.truncate(body.trim_end().len());
        match self.num {
            None => write!(f, "{body}"),
            Some(n) => {
                let numbered = format!("N{n} {body}");
                write!(f, "{numbered}*{}", checksum(&numbered))
            }
        }
    }
}

/// Tagged gcode args, kept as the raw `<letter><value>` words.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args(pub Vec<String>);

impl Args {
    pub fn get_str(&self, tag: char) -> Option<&str> {
        self.0
            .iter()
            .filter_map(|a| a.strip_prefix(tag))
            .find(|rest| !rest.is_empty())
    }

    pub fn get_float(&self, tag: char) -> Option<f64> {
        self.get_str(tag)?.parse().ok()
    }

    pub fn get_int(&self, tag: char) -> Option<i64> {
        self.get_str(tag)?.parse().ok()
    }

    pub fn get_bool(&self, tag: char) -> Option<bool> {
        match self.get_str(tag)? {
            "1" | "T" | "TRUE" | "True" | "true" => Some(true),
            "0" | "F" | "FALSE" | "False" | "false" => Some(false),
            _ => None,
        }
    }

    /// X/Y/Z/E as a Vec4, falling back to `def` per missing dimension.
    pub fn get_vec4(&self, def: Vec4) -> Vec4 {
        Vec4::new(
            self.get_float('X').unwrap_or(def.x),
            self.get_float('Y').unwrap_or(def.y),
            self.get_float('Z').unwrap_or(def.z),
            self.get_float('E').unwrap_or(def.e),
        )
    }
}

impl std::fmt::Display for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

impl From<Vec<String>> for Args {
    fn from(v: Vec<String>) -> Self {
        Args(v)
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Args::default()
    }
}

impl From<&[&str]> for Args {
    fn from(v: &[&str]) -> Self {
        Args(v.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Args {
    fn from(v: [&str; N]) -> Self {
        Args(v.iter().map(|s| s.to_string()).collect())
    }
}

/// One tagged arg from a value, e.g. `arg('V', 3)` -> `"V3"`.
pub fn arg<T: std::fmt::Display>(tag: char, value: T) -> String {
    format!("{tag}{value}")
}

/// X/Y/Z/E args from a Vec4, e.g. for a synthesized `G92`.
pub fn vec4_args(v: Vec4) -> Vec<String> {
    vec![arg('X', v.x), arg('Y', v.y), arg('Z', v.z), arg('E', v.e)]
}
