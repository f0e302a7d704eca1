//! Test doubles for dealflow pipelines.

pub mod fixtures;
pub mod sink;
pub mod transport;

pub use sink::RecordingSink;
pub use transport::{CallRecord, Reply, ScriptedTransport};
