//! The release orchestration engine: the `check → build → sign → release`
//! pipeline and the watch-mode state machine.

mod backoff;
mod pipeline;
mod triggered;
mod watch;

pub use backoff::Backoff;
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutcome, PipelinePlan};
pub use triggered::TriggeredSet;
pub use watch::{IterationOutcome, PipelineDriver, WatchConfig, WatchLoop, jittered_sleep};
