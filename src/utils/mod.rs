//! 通用工具

pub mod event_stream;

pub use event_stream::{EventStream, EventStreamData};
