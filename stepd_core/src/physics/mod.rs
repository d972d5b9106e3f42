//! Motion math: moves, velocity shapes, and motion blocks.

pub mod block;
pub mod motion;
pub mod shape;

pub use block::{BlockKind, EaseLimit, MotionBlock};
pub use motion::Move;
pub use shape::{pulse, Shape, Trapezoid};
