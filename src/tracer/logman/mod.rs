//! Windows backend: the NT Kernel Logger records every process, thread and file event of the
//! machine, tracerpt converts the binary log to CSV.

mod parser;

pub use parser::{HEADER, check_summary, decode_csv, replay, split_command_line};

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use super::helpers::command::CommandBuilder;
use super::helpers::run_command_with_log_pipe::{
    exit_code, run_command_with_log_pipe_and_callback,
};
use super::{
    TraceManifest, TraceOutput, Tracer, TracerName, absolute_cwd, artifact_path, into_failure,
    prepare_command,
};
use crate::config::TracerConfig;
use crate::error::{TraceResult, TracingFailure};
use crate::path::{DriveMap, PathResolver};
use crate::prelude::*;
use async_trait::async_trait;
use trace_results::Results;

const SESSION_NAME: &str = "NT Kernel Logger";
const PROVIDER: &str = "Windows Kernel Trace";
const FLAGS: &str = "(process,thread,file,fileio)";

const ETL_SUFFIX: &str = ".etl";
const CSV_SUFFIX: &str = ".csv";
const SUMMARY_SUFFIX: &str = ".summary.txt";

/// The kernel logger is a machine wide singleton, a process runs one session at most.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held while this process owns the kernel logger.
struct SessionSlot;

impl SessionSlot {
    fn acquire() -> TraceResult<Self> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SessionSlot)
            .map_err(|_| TracingFailure::busy("A kernel logger session is already running"))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Runs a short lived tool to completion and returns its combined output.
fn run_tool(program: &str, args: &[&str]) -> TraceResult<(bool, String)> {
    debug!("Running: {program} {}", shell_words::join(args));
    let output = Command::new(program).args(args).output().map_err(|e| {
        TracingFailure::instrumentation(format!("Failed to run {program}")).with_source(e)
    })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    trace!("{program} output:\n{text}");
    Ok((output.status.success(), text))
}

/// A started kernel logger. Stopped on drop when [`KernelLogger::stop`] was not reached.
struct KernelLogger<'a> {
    config: &'a TracerConfig,
    running: bool,
    _slot: SessionSlot,
}

impl<'a> KernelLogger<'a> {
    fn start(config: &'a TracerConfig, etl: &Path) -> TraceResult<Self> {
        let slot = SessionSlot::acquire()?;
        let etl = etl.to_string_lossy().into_owned();
        let (success, output) = run_tool(
            &config.logman_path,
            &["start", SESSION_NAME, "-p", PROVIDER, FLAGS, "-o", etl.as_str(), "-ets"],
        )?;
        if !success {
            if output.to_lowercase().contains("already exists") {
                return Err(TracingFailure::busy(format!(
                    "The {SESSION_NAME} is used by another program"
                )));
            }
            return Err(TracingFailure::instrumentation(format!(
                "Failed to start the {SESSION_NAME}:\n{output}"
            )));
        }
        Ok(Self {
            config,
            running: true,
            _slot: slot,
        })
    }

    fn stop_session(&mut self) -> TraceResult<()> {
        self.running = false;
        let (success, output) =
            run_tool(&self.config.logman_path, &["stop", SESSION_NAME, "-ets"])?;
        if !success {
            return Err(TracingFailure::instrumentation(format!(
                "Failed to stop the {SESSION_NAME}:\n{output}"
            )));
        }
        Ok(())
    }

    /// Stops the session and converts the binary log.
    fn stop(mut self, etl: &Path, csv: &Path, summary: &Path) -> TraceResult<()> {
        self.stop_session()?;
        let (etl_arg, csv, summary) = (
            etl.to_string_lossy().into_owned(),
            csv.to_string_lossy().into_owned(),
            summary.to_string_lossy().into_owned(),
        );
        let (success, output) = run_tool(
            &self.config.tracerpt_path,
            &[
                etl_arg.as_str(),
                "-o",
                csv.as_str(),
                "-of",
                "CSV",
                "-summary",
                summary.as_str(),
                "-y",
            ],
        )?;
        if !success {
            return Err(TracingFailure::instrumentation(format!(
                "tracerpt failed to convert {}:\n{output}",
                etl.display()
            )));
        }
        Ok(())
    }
}

impl Drop for KernelLogger<'_> {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.stop_session() {
                warn!("{e}");
            }
        }
    }
}

pub struct LogmanTracer {
    config: TracerConfig,
}

impl LogmanTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self { config }
    }
}

#[async_trait(?Send)]
impl Tracer for LogmanTracer {
    fn name(&self) -> TracerName {
        TracerName::Logman
    }

    async fn trace(
        &self,
        command: &[String],
        cwd: &Path,
        log_path: &Path,
    ) -> TraceResult<TraceOutput> {
        let command = prepare_command(command, cwd, &self.config)?;
        let cwd_string = absolute_cwd(cwd)?;
        self.clean_old_log(log_path)?;

        let drives = DriveMap::capture();
        let etl = artifact_path(log_path, ETL_SUFFIX);
        let logger = KernelLogger::start(&self.config, &etl)?;

        let mut builder = CommandBuilder::from_argv(&command)
            .ok_or_else(|| TracingFailure::instrumentation("No command to trace"))?;
        builder.current_dir(cwd);
        debug!("Running: {}", builder.as_command_line());
        let (run, pid) =
            run_command_with_log_pipe_and_callback(builder.build(), async |pid, _| Ok(pid))
                .await
                .map_err(|e| into_failure(e, "Failed to run the command"))?;

        logger.stop(
            &etl,
            &artifact_path(log_path, CSV_SUFFIX),
            &artifact_path(log_path, SUMMARY_SUFFIX),
        )?;

        let output = TraceOutput {
            exit_code: exit_code(&run.status),
            output: run.output,
        };
        TraceManifest {
            tracer: self.name(),
            command,
            cwd: cwd_string,
            pid: Some(pid),
            tracer_pid: None,
            exit_code: output.exit_code,
            output: output.output.clone(),
            drives,
        }
        .save(log_path)?;
        Ok(output)
    }

    fn artifacts(&self, log_path: &Path) -> TraceResult<Vec<PathBuf>> {
        Ok([ETL_SUFFIX, CSV_SUFFIX, SUMMARY_SUFFIX]
            .iter()
            .map(|suffix| artifact_path(log_path, suffix))
            .collect())
    }

    fn parse_log(&self, log_path: &Path) -> TraceResult<Results> {
        let manifest = TraceManifest::load(log_path, self.name())?;
        let root_pid = manifest.pid.ok_or_else(|| {
            TracingFailure::instrumentation("The trace manifest has no root pid")
        })?;
        let read = |suffix: &str| {
            let path = artifact_path(log_path, suffix);
            std::fs::read(&path)
                .map(|content| String::from_utf8_lossy(&content).into_owned())
                .map_err(|e| {
                    TracingFailure::instrumentation(format!("Failed to read {}", path.display()))
                        .with_source(e)
                })
        };

        check_summary(&read(SUMMARY_SUFFIX)?)?;
        let events = decode_csv(&read(CSV_SUFFIX)?)?;
        debug!("Replaying {} kernel events", events.len());
        let mut resolver = PathResolver::new(manifest.drives);
        replay(&events, root_pid, &manifest.cwd, &mut resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_second_session_is_busy() {
        let slot = SessionSlot::acquire().unwrap();
        let failure = SessionSlot::acquire().err().unwrap();
        assert_eq!(failure.kind, crate::error::FailureKind::TracerBusy);
        drop(slot);
        assert!(SessionSlot::acquire().is_ok());
    }

    #[test]
    fn test_artifacts() {
        let tracer = LogmanTracer::new(TracerConfig::default());
        let artifacts = tracer.artifacts(Path::new("out/run.log")).unwrap();
        assert_eq!(
            artifacts,
            vec![
                PathBuf::from("out/run.log.etl"),
                PathBuf::from("out/run.log.csv"),
                PathBuf::from("out/run.log.summary.txt"),
            ]
        );
    }

    fn write_trace(dir: &Path, summary: &str) -> PathBuf {
        let log = dir.join("run.log");
        let mut volumes = BTreeMap::new();
        volumes.insert("\\Device\\HarddiskVolume2".to_owned(), "C:".to_owned());
        TraceManifest {
            tracer: TracerName::Logman,
            command: vec!["cmd.exe".into()],
            cwd: "C:\\src".into(),
            pid: Some(0x100),
            tracer_pid: None,
            exit_code: 0,
            output: String::new(),
            drives: DriveMap::new(volumes),
        }
        .save(&log)
        .unwrap();
        let user_data = |values: &[&str]| values.join(",");
        let prefix = |name: &str, kind: &str| {
            format!("{name},{kind},0,2,0,0,1,0,0x0,0x100,0x10,0,0,0,{{0}},{{0}},1,0,0")
        };
        let csv = [
            HEADER.join(", "),
            format!(
                "{},{}",
                prefix("Process", "Start"),
                user_data(&["0x1", "0x100", "0x50", "1", "0", "0x0", "S-1", "cmd.exe", "cmd.exe"])
            ),
            format!("{},{}", prefix("Thread", "Start"), user_data(&["0x100", "0x10"])),
            format!(
                "{},{}",
                prefix("FileIo", "Create"),
                user_data(&["0x1", "0x10", "0xA", "0x0", "0x80", "0x7", "\\Device\\HarddiskVolume2\\src\\a.txt"])
            ),
            format!("{},{}", prefix("FileIo", "Cleanup"), user_data(&["0x1", "0x10", "0xA", "0x0"])),
        ]
        .join("\n");
        std::fs::write(artifact_path(&log, CSV_SUFFIX), csv).unwrap();
        std::fs::write(artifact_path(&log, SUMMARY_SUFFIX), summary).unwrap();
        log
    }

    #[test]
    fn test_parse_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_trace(dir.path(), "Total Events Processed: 5\nEvents Lost: 0\n");
        let results = LogmanTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap();
        let files: Vec<_> = results.root().files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["C:\\src\\a.txt"]);
    }

    #[test]
    fn test_lost_events_fail() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_trace(dir.path(), "Events Lost: 12\n");
        let failure = LogmanTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap_err();
        assert!(failure.is_instrumentation());
        assert!(failure.to_string().contains("lost 12 events"));
    }
}
