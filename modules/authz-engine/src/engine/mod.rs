//! The single-writer engine: command channel and processor.

pub mod channel;
pub mod processor;

pub use channel::{CommandSender, Envelope, SubmitMeta, command_channel};
pub use processor::{CommandProcessor, EngineHandle, EngineMetrics, spawn};
