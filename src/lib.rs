//! dsr, a fallback release pipeline.
//!
//! When a project's hosted CI is queued past a threshold, dsr reproduces
//! the release locally: it dispatches the project's own CI workflow to a
//! pool of heterogeneous build hosts, collects and signs the resulting
//! artifacts, and publishes them to the project's upstream release page
//! with the same naming and integrity metadata the hosted CI would have
//! produced.
//!
//! This crate is the command-line surface; the engine lives in the
//! workspace crates (`dsr-engine`, `dsr-dispatch`, `dsr-runner`, …).

pub mod cli;

mod doctor;
mod maintenance;
mod status;

pub use dsr_utils::ExitCode;
