use super::command::CommandBuilder;
use crate::error::{TraceResult, TracingFailure};
use crate::{local_logger::suspend_progress_bar, prelude::*};
use std::{
    io::IsTerminal,
    process::{Command, Stdio},
};

fn is_root_user() -> bool {
    #[cfg(unix)]
    return nix::unistd::Uid::effective().is_root();
    #[cfg(not(unix))]
    return false;
}

fn is_sudo_available() -> bool {
    Command::new("sudo")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Validate sudo access, prompting the user for their password if necessary
fn validate_sudo_access() -> TraceResult<()> {
    let needs_password = std::io::stdin().is_terminal()
        && Command::new("sudo")
            .arg("--non-interactive") // Fail if password is required
            .arg("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| !status.success())
            .unwrap_or(true);

    if needs_password {
        suspend_progress_bar(|| {
            info!("Tracing requires sudo privileges. Please enter your password.");

            let auth_status = Command::new("sudo")
                .arg("--validate")
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()?;

            if !auth_status.success() {
                return Err(TracingFailure::instrumentation(
                    "Failed to authenticate with sudo",
                ));
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Wrap with sudo if not running as root
pub fn wrap_with_sudo(mut cmd_builder: CommandBuilder) -> TraceResult<CommandBuilder> {
    if is_root_user() {
        Ok(cmd_builder)
    } else if is_sudo_available() {
        debug!("Wrapping with sudo: {}", cmd_builder.as_command_line());
        validate_sudo_access()?;
        // The credentials are cached, no prompt can show up past this point
        cmd_builder.wrap("sudo", ["--non-interactive"]);
        Ok(cmd_builder)
    } else {
        Err(TracingFailure::instrumentation(format!(
            "Tracing requires root privileges and sudo is not available to run: {}",
            cmd_builder.as_command_line()
        )))
    }
}
