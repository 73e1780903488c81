//! dsr CLI binary.
//!
//! All logic lives in the library; main only maps the result to a process
//! exit code. cli::run() handles every byte of output, including errors.

fn main() {
    if let Err(code) = dsr::cli::run() {
        std::process::exit(code.as_i32());
    }
}
