use crate::local_logger::suspend_progress_bar;
use crate::prelude::*;
use crate::tracer::TRACED_OUTPUT_TARGET;
use std::future::Future;
use std::io::{Read, Write};
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

/// Exit status and interleaved stdout/stderr of a traced run.
#[derive(Debug)]
pub struct CapturedRun {
    pub status: ExitStatus,
    pub output: String,
}

/// The exit code of the command, `128 + signal` when it was killed.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn log_tee(
    mut reader: impl Read,
    mut writer: impl Write,
    captured: &Mutex<Vec<u8>>,
    log_prefix: Option<&str>,
) -> std::io::Result<()> {
    let prefix = log_prefix.unwrap_or("");
    let mut buffer = [0; 1024];
    let mut line_buffer = Vec::new();

    let mut flush = |bytes: &[u8]| -> std::io::Result<()> {
        if let Ok(mut captured) = captured.lock() {
            captured.extend_from_slice(bytes);
        }
        suspend_progress_bar(|| {
            trace!(
                target: TRACED_OUTPUT_TARGET,
                "{}{}",
                prefix,
                String::from_utf8_lossy(bytes)
            );
            writer.write_all(bytes)
        })
    };

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            if !line_buffer.is_empty() {
                flush(&line_buffer)?;
            }
            break;
        }

        line_buffer.extend_from_slice(&buffer[..bytes_read]);

        // Only complete lines are flushed, so both streams interleave line by line
        if let Some(last_newline_pos) =
            line_buffer.iter().rposition(|&b| b == b'\n' || b == b'\r')
        {
            flush(&line_buffer[..=last_newline_pos])?;
            line_buffer.drain(..=last_newline_pos);
        }
    }
    Ok(())
}

/// Run a command, tee its output to the terminal and capture it.
///
/// `cb` is called once the process is spawned, with its pid and its stdin when the command
/// was configured with a piped stdin. The process is waited for once `cb` resolves, even when
/// it fails.
pub async fn run_command_with_log_pipe_and_callback<F, Fut, T>(
    mut cmd: Command,
    cb: F,
) -> Result<(CapturedRun, T)>
where
    F: FnOnce(u32, Option<ChildStdin>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut process = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn the process")?;
    let stdout = process
        .stdout
        .take()
        .ok_or_else(|| anyhow!("unable to get stdout"))?;
    let stderr = process
        .stderr
        .take()
        .ok_or_else(|| anyhow!("unable to get stderr"))?;
    let captured = Arc::new(Mutex::new(Vec::new()));

    let stdout_captured = captured.clone();
    let stdout_thread = thread::spawn(move || {
        if let Err(e) = log_tee(stdout, std::io::stdout(), &stdout_captured, None) {
            warn!("Failed to forward stdout: {e}");
        }
    });
    let stderr_captured = captured.clone();
    let stderr_thread = thread::spawn(move || {
        if let Err(e) = log_tee(stderr, std::io::stderr(), &stderr_captured, Some("[stderr]")) {
            warn!("Failed to forward stderr: {e}");
        }
    });

    let cb_result = cb(process.id(), process.stdin.take()).await;
    let status = process.wait().context("failed to wait for the process")?;
    let value = cb_result?;

    // The pipes close once the process and its children are gone
    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let output = captured
        .lock()
        .map(|captured| String::from_utf8_lossy(&captured).into_owned())
        .unwrap_or_default();
    Ok((CapturedRun { status, output }, value))
}
