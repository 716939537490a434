mod clean;
mod read;
mod trace;

use std::path::PathBuf;

use crate::{
    config::TraceInputsConfig,
    local_logger::{ACCENT_U8_COLOR_CODE, init_local_logger},
    prelude::*,
    tracer::{TracerName, get_tracer},
};
use clap::{
    Parser, Subcommand,
    builder::{Styles, styling},
};

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::Ansi256Color(ACCENT_U8_COLOR_CODE).on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Record the files a command and all its child processes touch",
    styles = create_styles()
)]
pub struct Cli {
    /// The tracer to use, defaults to the native one of the platform
    #[arg(long, env = "TRACE_INPUTS_TRACER", global = true, value_enum)]
    pub tracer: Option<TracerName>,

    /// The configuration name to use
    /// If provided, the configuration will be loaded from ~/.config/trace-inputs/{config-name}.yaml
    /// Otherwise, loads from ~/.config/trace-inputs/config.yaml
    #[arg(long, env = "TRACE_INPUTS_CONFIG_NAME", global = true)]
    pub config_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command under the tracer and record its log
    #[command(alias = "t")]
    Trace(trace::TraceArgs),
    /// Read a recorded log and print the files touched by each process
    #[command(alias = "r")]
    Read(read::ReadArgs),
    /// Remove a recorded log and the raw tracer output beside it
    Clean(clean::CleanArgs),
}

/// A path given on the command line. A `~` may have made its way here without being expanded by
/// the shell.
pub(crate) fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Runs the CLI and returns the process exit code.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_local_logger()?;

    let config = TraceInputsConfig::load(cli.config_name.as_deref())?;
    let tracer = get_tracer(cli.tracer, &config.tracer);
    debug!("Using the {} tracer", tracer.name());

    match cli.command {
        Commands::Trace(args) => trace::run(args, tracer.as_ref()).await,
        Commands::Read(args) => read::run(args, tracer.as_ref()).map(|()| 0),
        Commands::Clean(args) => clean::run(args, tracer.as_ref()).map(|()| 0),
    }
}
