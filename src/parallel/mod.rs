//! Dependency-ordered parallel execution of stories.
//!
//! - [`dependency`]: story graph, wave layering, cycle detection
//! - [`conflict`]: file-overlap detection within a wave
//! - [`wave`]: bounded-concurrency execution of one wave
//! - [`scheduler`]: the run loop tying the pieces together

pub mod conflict;
pub mod dependency;
pub mod scheduler;
pub mod wave;

pub use conflict::{Conflict, ConflictDetector, FileLockTable};
pub use dependency::DependencyGraph;
pub use scheduler::{CancelHandle, EpicReport, EpicRunner};
pub use wave::{WaveExecutor, WaveHalt, WaveReport};
