use std::fmt::Display;
use std::path::{Path, PathBuf};

pub mod dtrace;
pub mod helpers;
pub mod logman;
mod manifest;
pub mod strace;

use crate::config::TracerConfig;
use crate::error::{TraceResult, TracingFailure};
use crate::prelude::*;
use async_trait::async_trait;
use clap::ValueEnum;
use dtrace::DtraceTracer;
use logman::LogmanTracer;
pub use manifest::{TraceManifest, artifact_path};
use serde::{Deserialize, Serialize};
use strace::StraceTracer;
use trace_results::Results;

/// Log target of the traced command's output.
pub const TRACED_OUTPUT_TARGET: &str = "tracer";

#[derive(ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TracerName {
    Strace,
    Dtrace,
    Logman,
}

impl Display for TracerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracerName::Strace => write!(f, "strace"),
            TracerName::Dtrace => write!(f, "dtrace"),
            TracerName::Logman => write!(f, "logman"),
        }
    }
}

impl TracerName {
    /// The native tracing mechanism of the host.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            TracerName::Logman
        } else if cfg!(any(target_os = "macos", target_os = "freebsd")) {
            TracerName::Dtrace
        } else {
            TracerName::Strace
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOutput {
    /// Exit code of the traced command, `128 + signal` when it was killed. A non-zero value is
    /// still a successful trace.
    pub exit_code: i32,
    pub output: String,
}

pub fn get_tracer(name: Option<TracerName>, config: &TracerConfig) -> Box<dyn Tracer> {
    match name.unwrap_or_else(TracerName::platform_default) {
        TracerName::Strace => Box::new(StraceTracer::new(config.clone())),
        TracerName::Dtrace => Box::new(DtraceTracer::new(config.clone())),
        TracerName::Logman => Box::new(LogmanTracer::new(config.clone())),
    }
}

#[async_trait(?Send)]
pub trait Tracer {
    fn name(&self) -> TracerName;

    /// Runs `command` from `cwd` under the tracer and writes the manifest at `log_path`, the
    /// raw logs beside it. Returns once the command and the tracer are both done.
    async fn trace(&self, command: &[String], cwd: &Path, log_path: &Path)
    -> TraceResult<TraceOutput>;

    /// Every file this tracer may write for `log_path`.
    fn artifacts(&self, log_path: &Path) -> TraceResult<Vec<PathBuf>>;

    /// Removes the artifacts of a previous run. Missing files are fine.
    fn clean_old_log(&self, log_path: &Path) -> TraceResult<()> {
        for path in std::iter::once(log_path.to_path_buf()).chain(self.artifacts(log_path)?) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TracingFailure::instrumentation(format!(
                        "Failed to remove {}",
                        path.display()
                    ))
                    .with_source(e));
                }
            }
        }
        Ok(())
    }

    /// Replays the raw logs written for `log_path` into the process tree.
    fn parse_log(&self, log_path: &Path) -> TraceResult<Results>;
}

/// Prepends the interpreter when the command starts with a python script.
pub fn fix_python_path(command: &[String], python: &str) -> Vec<String> {
    match command.first() {
        Some(first) if first.ends_with(".py") => std::iter::once(python.to_owned())
            .chain(command.iter().cloned())
            .collect(),
        _ => command.to_vec(),
    }
}

/// Checks the request shared by every backend and returns the command to run.
pub(crate) fn prepare_command(
    command: &[String],
    cwd: &Path,
    config: &TracerConfig,
) -> TraceResult<Vec<String>> {
    if command.is_empty() {
        return Err(TracingFailure::instrumentation("No command to trace"));
    }
    if !cwd.is_dir() {
        return Err(TracingFailure::instrumentation(format!(
            "The working directory {} is not a directory",
            cwd.display()
        )));
    }
    Ok(fix_python_path(command, &config.python_path))
}

/// Keeps a `TracingFailure` raised through an `anyhow` helper, wraps anything else.
pub(crate) fn into_failure(error: anyhow::Error, what: &str) -> TracingFailure {
    match error.downcast::<TracingFailure>() {
        Ok(failure) => failure,
        Err(error) => TracingFailure::instrumentation(format!("{what}: {error:#}")),
    }
}

/// The working directory as recorded in the manifest: absolute, without `.` or `..`.
pub(crate) fn absolute_cwd(cwd: &Path) -> TraceResult<String> {
    // Tracers report resolved symlinks (`/tmp` is `/private/tmp` on macOS)
    #[cfg(unix)]
    let cwd = cwd.canonicalize()?;
    #[cfg(not(unix))]
    let cwd = std::path::absolute(cwd)?;
    Ok(crate::path::normalize(&cwd.to_string_lossy(), &[]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case(&["run_test.py", "--verbose"], &["python3", "run_test.py", "--verbose"])]
    #[case(&["./build.sh"], &["./build.sh"])]
    #[case(&["python3", "x.py"], &["python3", "x.py"])]
    fn test_fix_python_path(#[case] command: &[&str], #[case] expected: &[&str]) {
        assert_eq!(fix_python_path(&argv(command), "python3"), argv(expected));
    }

    #[test]
    fn test_prepare_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let failure = prepare_command(&[], dir.path(), &TracerConfig::default()).unwrap_err();
        assert!(failure.is_instrumentation());
    }

    #[test]
    fn test_prepare_rejects_missing_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let failure = prepare_command(
            &argv(&["true"]),
            &dir.path().join("missing"),
            &TracerConfig::default(),
        )
        .unwrap_err();
        assert!(failure.to_string().contains("is not a directory"));
    }

    #[test]
    fn test_get_tracer() {
        let config = TracerConfig::default();
        assert_eq!(
            get_tracer(Some(TracerName::Logman), &config).name(),
            TracerName::Logman
        );
        assert_eq!(
            get_tracer(None, &config).name(),
            TracerName::platform_default()
        );
    }

    #[test]
    fn test_clean_old_log_removes_family() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(&log, "{}").unwrap();
        std::fs::write(artifact_path(&log, ".strace.10"), "").unwrap();
        std::fs::write(artifact_path(&log, ".strace.11"), "").unwrap();
        std::fs::write(dir.path().join("other.log"), "").unwrap();

        let tracer = get_tracer(Some(TracerName::Strace), &TracerConfig::default());
        tracer.clean_old_log(&log).unwrap();
        // Cleaning twice is fine.
        tracer.clean_old_log(&log).unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec!["other.log"]);
    }
}
