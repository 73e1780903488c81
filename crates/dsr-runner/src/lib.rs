//! Process execution and host executors.
//!
//! All process execution goes through [`CommandSpec`] to ensure argv-style
//! invocation: arguments cross trust boundaries as discrete elements, never
//! as shell strings. The [`ProcessRunner`] trait is the seam tests mock.

mod command_spec;
mod executor;
mod process;
mod reachability;

pub use command_spec::CommandSpec;
pub use executor::{ExecutionContext, ExecutionOutcome, HostExecutor, invoking_user};
pub use process::{ProcessOutput, ProcessRunner, RunnerError, TokioRunner};
pub use reachability::check_reachable;
