//! Shared infrastructure for dsr: the error taxonomy, the stable exit-code
//! table, state/cache directory resolution, and the tracing bootstrap.

pub mod error;
pub mod exit_codes;
pub mod logging;
pub mod paths;

pub use error::{
    AuthError, BuildError, ConfigError, DsrError, NetworkError, ReleaseError, SystemError,
};
pub use exit_codes::ExitCode;
