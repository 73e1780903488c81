//! Exit code constants and error-to-exit-code mapping.
//!
//! The numeric values are a stable public contract and will not change in
//! 0.x releases:
//!
//! | Code | Constant | Class |
//! |------|----------|-------|
//! | 0 | `SUCCESS` | success |
//! | 1 | `PARTIAL` | partial failure |
//! | 2 | `CONFLICT` | lock held / run in progress |
//! | 3 | `DEPENDENCY` | dependency missing (auth, tool, daemon) |
//! | 4 | `INVALID_CONFIG` | invalid arguments / config |
//! | 5 | `INTERRUPTED` | interrupted / timeout |
//! | 6 | `BUILD_FAILED` | build failed |
//! | 7 | `RELEASE_FAILED` | release / upload failed |
//! | 8 | `NETWORK` | network error |

use crate::error::DsrError;

/// Type-safe process exit code.
///
/// Use the named constants rather than raw integers; `main` converts via
/// [`as_i32()`](Self::as_i32) for `std::process::exit()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Operation completed successfully.
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// At least one target succeeded and at least one failed.
    pub const PARTIAL: ExitCode = ExitCode(1);

    /// Another run holds the lock for the same scope.
    pub const CONFLICT: ExitCode = ExitCode(2);

    /// A dependency is missing: hosted-CI auth, a required tool, or the
    /// container daemon.
    pub const DEPENDENCY: ExitCode = ExitCode(3);

    /// Invalid arguments or configuration.
    pub const INVALID_CONFIG: ExitCode = ExitCode(4);

    /// Interrupted by the user, or a target exceeded its execution ceiling.
    pub const INTERRUPTED: ExitCode = ExitCode(5);

    /// Every build target failed.
    pub const BUILD_FAILED: ExitCode = ExitCode(6);

    /// The release or an upload failed permanently.
    pub const RELEASE_FAILED: ExitCode = ExitCode(7);

    /// A network operation failed (after any configured retries).
    pub const NETWORK: ExitCode = ExitCode(8);

    /// Numeric value for `std::process::exit()`.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Construct from a raw value. Prefer the named constants.
    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

impl DsrError {
    /// Map an error to its exit code per the stable table.
    ///
    /// `partial` is not an error and never reaches this function; the
    /// dispatcher's aggregate status decides between 0, 1 and the dominant
    /// failure class.
    #[must_use]
    pub fn to_exit_code(&self) -> ExitCode {
        match self {
            DsrError::Auth(_) | DsrError::System(_) => ExitCode::DEPENDENCY,
            DsrError::Network(_) => ExitCode::NETWORK,
            DsrError::Build(_) => ExitCode::BUILD_FAILED,
            DsrError::Release(_) => ExitCode::RELEASE_FAILED,
            DsrError::Config(_) => ExitCode::INVALID_CONFIG,
            DsrError::LockHeld { .. } => ExitCode::CONFLICT,
            DsrError::Cancelled | DsrError::TargetTimeout { .. } => ExitCode::INTERRUPTED,
            DsrError::Io(_) => ExitCode::PARTIAL,
        }
    }
}
