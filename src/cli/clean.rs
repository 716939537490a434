use super::expand_path;
use crate::prelude::*;
use crate::tracer::Tracer;
use clap::Args;

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// The trace log to remove, with the raw tracer output beside it
    #[arg(long)]
    pub log: String,
}

pub fn run(args: CleanArgs, tracer: &dyn Tracer) -> Result<()> {
    let log = expand_path(&args.log);
    tracer.clean_old_log(&log)?;
    info!("Removed the {} log at {}", tracer.name(), log.display());
    Ok(())
}
