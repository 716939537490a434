//! Immutable process/file model produced by one trace run.
//!
//! The tracer builds a [`Results`] tree once the whole log has been replayed. Downstream tools
//! consume it either directly or through its [`FlatProcess`] serialization.

pub mod artifact;
mod directories;
mod file;
mod flatten;
mod process;

pub use artifact::ArtifactExt;
pub use directories::{default_blacklist, extract_directories};
pub use file::{Directory, Entry, FileAccess};
pub use flatten::{FlatEntry, FlatProcess};
pub use process::{Pid, Process, Results};
