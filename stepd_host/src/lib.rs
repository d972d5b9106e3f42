// stepd_host: the pipeline stages and transport of the stepd daemon.

pub mod pipeline;
pub mod transport;

pub use pipeline::{Message, PageData, Port, StageError, Tx};
