//! Linux backend: `strace -ff` writes one log per traced process.

mod parser;

pub use parser::{Stream, TRACED_CALLS, decode_stream, replay};

use std::path::{Path, PathBuf};

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
use trace_results::{Pid, Results};

const STREAM_SUFFIX: &str = ".strace";

pub struct StraceTracer {
    config: TracerConfig,
}

impl StraceTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self { config }
    }

    /// The per process logs of `log_path`, sorted by pid.
    fn stream_paths(&self, log_path: &Path) -> TraceResult<Vec<(Pid, PathBuf)>> {
        let Some(file_name) = log_path.file_name() else {
            return Err(TracingFailure::instrumentation(format!(
                "Invalid log path {}",
                log_path.display()
            )));
        };
        let prefix = format!("{}{STREAM_SUFFIX}.", file_name.to_string_lossy());
        let directory = match log_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut streams: Vec<(Pid, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let pid = name.strip_prefix(&prefix)?.parse().ok()?;
                Some((pid, entry.path()))
            })
            .collect();
        streams.sort();
        Ok(streams)
    }

    fn build_command(&self, command: &[String], cwd: &Path, log_path: &Path) -> CommandBuilder {
        let mut builder = CommandBuilder::new(&command[0]);
        builder.args(&command[1..]).current_dir(cwd).wrap(
            &self.config.strace_path,
            [
                "-q".to_owned(),
                "-ff".to_owned(),
                "-s".to_owned(),
                "4096".to_owned(),
                "-e".to_owned(),
                format!("trace={}", TRACED_CALLS.join(",")),
                "-o".to_owned(),
                artifact_path(log_path, STREAM_SUFFIX)
                    .to_string_lossy()
                    .into_owned(),
                "--".to_owned(),
            ],
        );
        builder
    }
}

#[async_trait(?Send)]
impl Tracer for StraceTracer {
    fn name(&self) -> TracerName {
        TracerName::Strace
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

        let builder = self.build_command(&command, cwd, log_path);
        debug!("Running: {}", builder.as_command_line());
        let (run, tracer_pid) =
            run_command_with_log_pipe_and_callback(builder.build(), async |pid, _| Ok(pid))
                .await
                .map_err(|e| into_failure(e, "Failed to run strace"))?;

        if self.stream_paths(log_path)?.is_empty() {
            return Err(TracingFailure::instrumentation(format!(
                "strace did not write any log, is ptrace allowed?\n{}",
                run.output
            )));
        }

        let output = TraceOutput {
            exit_code: exit_code(&run.status),
            output: run.output,
        };
        TraceManifest {
            tracer: self.name(),
            command,
            cwd: cwd_string,
            pid: None,
            tracer_pid: Some(tracer_pid),
            exit_code: output.exit_code,
            output: output.output.clone(),
            drives: DriveMap::default(),
        }
        .save(log_path)?;
        Ok(output)
    }

    fn artifacts(&self, log_path: &Path) -> TraceResult<Vec<PathBuf>> {
        Ok(self
            .stream_paths(log_path)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn parse_log(&self, log_path: &Path) -> TraceResult<Results> {
        let manifest = TraceManifest::load(log_path, self.name())?;
        let paths = self.stream_paths(log_path)?;
        if paths.is_empty() {
            return Err(TracingFailure::instrumentation(format!(
                "No strace log found beside {}",
                log_path.display()
            )));
        }

        let mut streams = Vec::with_capacity(paths.len());
        for (pid, path) in paths {
            let content = std::fs::read(&path).map_err(|e| {
                TracingFailure::instrumentation(format!("Failed to read {}", path.display()))
                    .with_source(e)
            })?;
            let stream = decode_stream(pid, &String::from_utf8_lossy(&content))?;
            trace!("Decoded {} events for pid {pid}", stream.events.len());
            streams.push(stream);
        }

        let mut resolver = PathResolver::new(manifest.drives);
        replay(&streams, &manifest.cwd, &mut resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_trace(dir: &Path) -> PathBuf {
        let log = dir.join("run.log");
        TraceManifest {
            tracer: TracerName::Strace,
            command: vec!["sh".into(), "parent.sh".into()],
            cwd: "/src".into(),
            pid: None,
            tracer_pid: Some(99),
            exit_code: 0,
            output: String::new(),
            drives: DriveMap::default(),
        }
        .save(&log)
        .unwrap();
        std::fs::write(
            artifact_path(&log, ".strace.100"),
            "execve(\"/bin/sh\", [\"sh\", \"parent.sh\"], 0x1 /* 3 vars */) = 0\n\
             open(\"parent.sh\", O_RDONLY) = 3\n\
             vfork() = 101\n\
             +++ exited with 0 +++\n",
        )
        .unwrap();
        std::fs::write(
            artifact_path(&log, ".strace.101"),
            "execve(\"/bin/true\", [\"true\"], 0x1 /* 3 vars */) = 0\n+++ exited with 0 +++\n",
        )
        .unwrap();
        log
    }

    #[test]
    fn test_build_command() {
        let tracer = StraceTracer::new(TracerConfig::default());
        let builder = tracer.build_command(
            &["make".to_owned(), "all".to_owned()],
            Path::new("/src"),
            Path::new("/tmp/run.log"),
        );
        insta::assert_snapshot!(builder.as_command_line(), @"strace -q -ff -s 4096 -e 'trace=access,chdir,clone,clone3,creat,execve,exit_group,fork,lstat,open,openat,readlink,rename,stat,vfork' -o /tmp/run.log.strace -- make all");
    }

    #[test]
    fn test_parse_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_trace(dir.path());
        let tracer = StraceTracer::new(TracerConfig::default());

        let results = tracer.parse_log(&log).unwrap();
        let root = results.root();
        assert_eq!(root.pid(), 100);
        assert_eq!(root.children()[0].executable(), "/bin/true");
        assert_eq!(
            tracer.artifacts(&log).unwrap(),
            vec![
                artifact_path(&log, ".strace.100"),
                artifact_path(&log, ".strace.101")
            ]
        );
    }

    #[test]
    fn test_parse_log_without_streams() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_trace(dir.path());
        std::fs::remove_file(artifact_path(&log, ".strace.100")).unwrap();
        std::fs::remove_file(artifact_path(&log, ".strace.101")).unwrap();

        let failure = StraceTracer::new(TracerConfig::default())
            .parse_log(&log)
            .unwrap_err();
        assert!(failure.is_instrumentation());
    }
}
