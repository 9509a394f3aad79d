//! Concurrent replay engine for captured pipeline-creation state.
//!
//! Replays an archive against a driver to pre-warm pipeline caches, surface
//! driver bugs, and measure compile throughput: a worker pool drains typed
//! work items, a two-phase resolver orders derivative pipelines after their
//! bases, and an optional supervision protocol isolates driver crashes in
//! single-threaded slave processes that report progress through a shared
//! memory control block.

pub mod cache;
pub mod control;
pub mod engine;
pub mod error;
pub mod queue;
pub mod replay;
pub mod stats;
#[cfg(unix)]
pub mod supervisor;
pub mod tables;

pub use engine::{IndexRange, PipelineKind, ReplayEngine, ReplayOptions};
pub use error::{ReplayError, Result};
pub use replay::{run_replay, ArchiveSource, PLAYBACK_ORDER};
pub use stats::{KindSnapshot, ReplaySummary, StatsSnapshot};
