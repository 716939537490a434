use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trace_results::{ArtifactExt, Pid};

use super::TracerName;
use crate::error::{TraceResult, TracingFailure};
use crate::path::DriveMap;

/// Written at the log path by every trace, it describes how the raw logs beside it were
/// produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceManifest {
    pub tracer: TracerName,
    pub command: Vec<String>,
    pub cwd: String,
    /// The root process when it is known up front (the trampoline for dtrace).
    pub pid: Option<Pid>,
    /// The tracing tool itself, when it runs as a process of its own.
    pub tracer_pid: Option<Pid>,
    pub exit_code: i32,
    pub output: String,
    #[serde(default, skip_serializing_if = "DriveMap::is_empty")]
    pub drives: DriveMap,
}

impl ArtifactExt for TraceManifest {}

impl TraceManifest {
    pub fn save(&self, log_path: &Path) -> TraceResult<()> {
        self.save_to(log_path).map_err(|e| {
            TracingFailure::instrumentation(format!(
                "Failed to write the trace manifest {}: {e:#}",
                log_path.display()
            ))
        })
    }

    /// Loads the manifest and checks it was produced by `expected`.
    pub fn load(log_path: &Path, expected: TracerName) -> TraceResult<Self> {
        if !log_path.exists() {
            return Err(TracingFailure::instrumentation(format!(
                "No trace manifest at {}, was the command traced?",
                log_path.display()
            )));
        }
        let manifest = Self::load_from(log_path).map_err(|e| {
            TracingFailure::instrumentation(format!(
                "Invalid trace manifest {}: {e:#}",
                log_path.display()
            ))
        })?;
        if manifest.tracer != expected {
            return Err(TracingFailure::instrumentation(format!(
                "{} was produced by {}, not {expected}",
                log_path.display(),
                manifest.tracer
            )));
        }
        Ok(manifest)
    }
}

/// `<log_path><suffix>`, the naming of every raw artifact.
pub fn artifact_path(log_path: &Path, suffix: &str) -> PathBuf {
    let mut path = log_path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}
