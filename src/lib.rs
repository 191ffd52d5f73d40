pub mod boundary;
pub mod config;
pub mod engines;
pub mod error;
pub mod events;
pub mod executor;
pub mod merger;
pub mod scheduler;
pub mod segment;
pub mod task;

pub use config::Config;
pub use error::{DubError, Result};
pub use events::{Event, EventBus, EventPayload};
pub use executor::{Executor, ExecutorDeps};
pub use scheduler::Scheduler;
pub use segment::{Segment, SegmentPatch, SegmentTable, WordTimestamp};
pub use task::{ArtifactNames, PauseAfter, StartRequest, Status, TaskStatus, TaskStore};
