//! Log streaming for kubepulse
//!
//! This crate keeps exactly one upstream log follow per target that viewers
//! are watching, batches the lines it receives and pushes them to the
//! target's `logs:<target>` topic at a bounded rate.

mod lines;
mod multiplexer;
mod reconciler;
mod source;
mod throttle;

pub use lines::split_lines;
pub use multiplexer::{LogMultiplexer, MultiplexerConfig, MultiplexerHandle, ReconcileReport};
pub use reconciler::Reconciler;
pub use source::{ChunkSink, KubeLogSource, LogRequest, LogSource};
pub use throttle::ThrottleGate;

// Re-export types used in our public API
pub use kubepulse_types::LogBatch;
