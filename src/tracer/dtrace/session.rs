use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use super::LOG_SUFFIX;
use super::script::{BEGIN_MARKER, script};
use crate::config::TracerConfig;
use crate::error::{TraceResult, TracingFailure};
use crate::prelude::*;
use crate::tracer::helpers::command::CommandBuilder;
use crate::tracer::helpers::run_command_with_log_pipe::{
    exit_code, run_command_with_log_pipe_and_callback,
};
use crate::tracer::helpers::run_with_sudo::wrap_with_sudo;
use crate::tracer::{
    TraceManifest, TraceOutput, TracerName, absolute_cwd, artifact_path, into_failure,
    prepare_command,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid as UnixPid;
use trace_results::Pid;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Blocks until a line is read on stdin, then becomes the traced command.
const TRAMPOLINE: &str = r#"read _ && exec "$@""#;

/// A running dtrace process. Interrupted on drop, so every exit path flushes and stops it.
struct DtraceSession {
    child: Option<Child>,
}

impl DtraceSession {
    async fn start(config: &TracerConfig, traced_pid: Pid, log: &Path) -> TraceResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(log)?;

        let script = script(traced_pid);
        let mut builder = CommandBuilder::new(&config.dtrace_path);
        builder.args([
            "-q",
            "-x",
            "dynvarsize=4m",
            "-x",
            "bufsize=16m",
            "-x",
            "switchrate=10hz",
            "-n",
            script.as_str(),
        ]);
        let mut cmd = wrap_with_sudo(builder)?.build();
        cmd.stdin(Stdio::null())
            .stdout(file.try_clone()?)
            .stderr(file);
        let child = cmd.spawn().map_err(|e| {
            TracingFailure::instrumentation(format!("Failed to start {}", config.dtrace_path))
                .with_source(e)
        })?;
        debug!("dtrace started with pid {}", child.id());

        let mut session = Self { child: Some(child) };
        session.wait_for_begin(log).await?;
        Ok(session)
    }

    fn pid(&self) -> Option<Pid> {
        self.child.as_ref().map(Child::id)
    }

    /// Early events are lost until the probes are enabled, which the BEGIN line tells.
    async fn wait_for_begin(&mut self, log: &Path) -> TraceResult<()> {
        let begin = format!("dtrace_BEGIN(\"{BEGIN_MARKER}\")");
        loop {
            let content = std::fs::read_to_string(log).unwrap_or_default();
            if content.lines().any(|line| line.ends_with(&begin)) {
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Err(TracingFailure::instrumentation(format!(
                        "dtrace exited with {status} before starting:\n{content}"
                    )));
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn interrupt(child: &mut Child) -> TraceResult<()> {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = child.id();
        match kill(UnixPid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) => {}
            // dtrace runs through sudo, which may not accept our signals
            Err(Errno::EPERM) => {
                let pid = pid.to_string();
                let status = Command::new("sudo")
                    .args(["--non-interactive", "kill", "-INT", pid.as_str()])
                    .status()?;
                if !status.success() {
                    warn!("Failed to interrupt dtrace through sudo: {status}");
                }
            }
            Err(e) => warn!("Failed to interrupt dtrace: {e}"),
        }
        let status = child.wait()?;
        debug!("dtrace stopped with {status}");
        Ok(())
    }

    /// Interrupts dtrace and waits for it to flush the log.
    fn stop(mut self) -> TraceResult<()> {
        match self.child.take() {
            Some(mut child) => Self::interrupt(&mut child),
            None => Ok(()),
        }
    }
}

impl Drop for DtraceSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = Self::interrupt(&mut child) {
                warn!("Failed to stop dtrace: {e}");
            }
        }
    }
}

pub(super) async fn trace(
    config: &TracerConfig,
    command: &[String],
    cwd: &Path,
    log_path: &Path,
) -> TraceResult<TraceOutput> {
    let command = prepare_command(command, cwd, config)?;
    let cwd_string = absolute_cwd(cwd)?;
    let dtrace_log = artifact_path(log_path, LOG_SUFFIX);

    let mut trampoline = CommandBuilder::new("sh");
    trampoline
        .args(["-c", TRAMPOLINE, "trace-inputs"])
        .args(&command)
        .current_dir(cwd);
    debug!("Running: {}", trampoline.as_command_line());
    let mut cmd = trampoline.build();
    cmd.stdin(Stdio::piped());

    let (run, (pid, session)) =
        run_command_with_log_pipe_and_callback(cmd, async |pid, stdin| {
            // On error `stdin` is dropped and the trampoline exits without running anything
            let session = DtraceSession::start(config, pid, &dtrace_log).await?;
            let mut stdin = stdin.ok_or_else(|| anyhow!("The trampoline has no stdin"))?;
            stdin.write_all(b"\n")?;
            Ok((pid, session))
        })
        .await
        .map_err(|e| into_failure(e, "Failed to trace with dtrace"))?;

    let tracer_pid = session.pid();
    session.stop()?;

    let output = TraceOutput {
        exit_code: exit_code(&run.status),
        output: run.output,
    };
    TraceManifest {
        tracer: TracerName::Dtrace,
        command,
        cwd: cwd_string,
        pid: Some(pid),
        tracer_pid,
        exit_code: output.exit_code,
        output: output.output.clone(),
        drives: Default::default(),
    }
    .save(log_path)?;
    Ok(output)
}
