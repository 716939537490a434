//! macOS backend: a D script follows the descendants of a trampoline whose pid is known
//! before the traced command starts.

mod parser;
mod script;
#[cfg(unix)]
mod session;

pub use parser::{decode_log, replay};
pub use script::script;

use std::path::{Path, PathBuf};

use super::{TraceManifest, TraceOutput, Tracer, TracerName, artifact_path};
use crate::config::TracerConfig;
use crate::error::{TraceResult, TracingFailure};
use crate::path::PathResolver;
use crate::prelude::*;
use async_trait::async_trait;
use trace_results::Results;

pub(crate) const LOG_SUFFIX: &str = ".dtrace";

pub struct DtraceTracer {
    config: TracerConfig,
}

impl DtraceTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self { config }
    }
}

#[async_trait(?Send)]
impl Tracer for DtraceTracer {
    fn name(&self) -> TracerName {
        TracerName::Dtrace
    }

    #[cfg(unix)]
    async fn trace(
        &self,
        command: &[String],
        cwd: &Path,
        log_path: &Path,
    ) -> TraceResult<TraceOutput> {
        self.clean_old_log(log_path)?;
        session::trace(&self.config, command, cwd, log_path).await
    }

    #[cfg(not(unix))]
    async fn trace(
        &self,
        _command: &[String],
        _cwd: &Path,
        _log_path: &Path,
    ) -> TraceResult<TraceOutput> {
        Err(TracingFailure::instrumentation(
            "dtrace is not available on this platform",
        ))
    }

    fn artifacts(&self, log_path: &Path) -> TraceResult<Vec<PathBuf>> {
        Ok(vec![artifact_path(log_path, LOG_SUFFIX)])
    }

    fn parse_log(&self, log_path: &Path) -> TraceResult<Results> {
        let manifest = TraceManifest::load(log_path, self.name())?;
        let dtrace_log = artifact_path(log_path, LOG_SUFFIX);
        let content = std::fs::read(&dtrace_log).map_err(|e| {
            TracingFailure::instrumentation(format!("Failed to read {}", dtrace_log.display()))
                .with_source(e)
        })?;

        let events = decode_log(&String::from_utf8_lossy(&content))?;
        debug!("Replaying {} dtrace events", events.len());
        let mut resolver = PathResolver::new(manifest.drives);
        let results = replay(&events, &manifest.cwd, &mut resolver)?;

        if let Some(pid) = manifest.pid {
            if results.root().pid() != pid {
                return Err(TracingFailure::inconsistency(format!(
                    "The log is rooted at pid {}, the traced process was {pid}",
                    results.root().pid()
                )));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DriveMap;

    fn write_manifest(log: &Path, pid: u32) {
        TraceManifest {
            tracer: TracerName::Dtrace,
            command: vec!["true".into()],
            cwd: "/tmp".into(),
            pid: Some(pid),
            tracer_pid: Some(1),
            exit_code: 0,
            output: String::new(),
            drives: DriveMap::default(),
        }
        .save(log)
        .unwrap();
    }

    #[test]
    fn test_parse_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        write_manifest(&log, 20);
        std::fs::write(
            artifact_path(&log, LOG_SUFFIX),
            "1 20 proc_exec_success(\"/usr/bin/true\", \"true\")\n0 20 dtrace_BEGIN(\"trace-inputs\")\n",
        )
        .unwrap();

        let results = DtraceTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap();
        assert_eq!(results.root().executable(), "/usr/bin/true");
        assert_eq!(results.root().initial_cwd(), "/tmp");
    }

    #[test]
    fn test_root_must_match_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        write_manifest(&log, 21);
        std::fs::write(
            artifact_path(&log, LOG_SUFFIX),
            "0 20 dtrace_BEGIN(\"trace-inputs\")\n",
        )
        .unwrap();

        let failure = DtraceTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap_err();
        assert!(failure.to_string().contains("traced process was 21"));
    }

    #[test]
    fn test_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        write_manifest(&log, 20);
        let failure = DtraceTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap_err();
        assert!(failure.is_instrumentation());
    }
}
