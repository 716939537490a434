//! Records the files a command and all its child processes touch, through the native tracer
//! of the platform: strace on Linux, dtrace on macOS and the NT Kernel Logger on Windows.

mod local_logger;
mod prelude;

pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod parser;
pub mod path;
pub mod tracer;

pub use error::{FailureKind, TraceResult, TracingFailure};
pub use local_logger::clean_logger;

/// Exit code of the CLI when tracing or parsing failed, as opposed to the traced command
/// failing.
pub const TRACING_FAILURE_EXIT_CODE: i32 = 125;
