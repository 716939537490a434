use super::expand_path;
use crate::prelude::*;
use crate::tracer::Tracer;
use clap::Args;

#[derive(Args, Debug)]
pub struct TraceArgs {
    /// Where to write the trace log, the raw tracer output is written beside it
    #[arg(long)]
    pub log: String,

    /// The working directory of the command, defaults to the current one
    #[arg(long)]
    pub cwd: Option<String>,

    /// The command to trace
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Traces the command and returns its exit code.
pub async fn run(args: TraceArgs, tracer: &dyn Tracer) -> Result<i32> {
    let log = expand_path(&args.log);
    let cwd = match &args.cwd {
        Some(cwd) => expand_path(cwd),
        None => std::env::current_dir()?,
    };

    start_group!(format!("Tracing with {}", tracer.name()));
    let output = tracer.trace(&args.command, &cwd, &log).await;
    end_group!();
    let output = output?;

    if output.exit_code != 0 {
        warn!(
            "The command exited with code {}, the trace is probably incomplete",
            output.exit_code
        );
    }
    info!("Trace log written to {}", log.display());
    Ok(output.exit_code)
}

#[cfg(test)]
mod tests {
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_command_is_required() {
        let error = Cli::try_parse_from(["trace-inputs", "trace", "--log", "run.log"]).unwrap_err();
        assert_eq!(
            error.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }
}
