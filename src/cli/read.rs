use super::expand_path;
use crate::prelude::*;
use crate::tracer::Tracer;
use clap::Args;
use trace_results::{
    ArtifactExt, Entry, FlatEntry, FlatProcess, Process, default_blacklist, extract_directories,
};

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// The trace log written by `trace`
    #[arg(long)]
    pub log: String,

    /// Only keep the files under this directory, their paths become relative to it
    #[arg(long)]
    pub root_dir: Option<String>,

    /// Replace a directory with `<(NAME)` in the output, as NAME=PATH. PATH is matched against
    /// the printed paths, so it is relative when --root-dir is used
    #[arg(short = 'V', long = "variable", value_parser = parse_variable)]
    pub variables: Vec<(String, String)>,

    /// Print the process tree as JSON
    #[arg(long)]
    pub json: bool,

    /// Replace the files of a fully read directory by the directory itself
    #[arg(long)]
    pub collapse_directories: bool,

    /// Also save the process tree as JSON to this file
    #[arg(long)]
    pub output: Option<String>,
}

fn parse_variable(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_owned(), path.to_owned()))
        }
        _ => Err(format!("expected NAME=PATH, got {value:?}")),
    }
}

/// Converts a process, collapsing its directories under `collapse_root` when given.
fn flatten_process(process: &Process, collapse_root: Option<&str>) -> Result<FlatProcess> {
    let mut entries: Vec<Entry> = process.files().iter().cloned().map(Entry::File).collect();
    if let Some(root) = collapse_root {
        entries = extract_directories(root, entries, default_blacklist)
            .with_context(|| format!("Failed to collapse the directories of pid {}", process.pid()))?;
    }
    Ok(FlatProcess {
        children: process
            .children()
            .iter()
            .map(|child| flatten_process(child, collapse_root))
            .collect::<Result<_>>()?,
        command: process.command().to_vec(),
        executable: process.executable().to_owned(),
        files: entries.iter().map(FlatEntry::from).collect(),
        initial_cwd: process.initial_cwd().to_owned(),
        pid: process.pid(),
    })
}

fn substitute_path(path: &str, variables: &[(String, String)]) -> Option<String> {
    variables.iter().find_map(|(name, directory)| {
        let directory = directory.trim_end_matches(['/', '\\']);
        let rest = path.strip_prefix(directory)?;
        if rest.is_empty() || rest.starts_with(['/', '\\']) {
            Some(format!("<({name}){rest}"))
        } else {
            None
        }
    })
}

/// Replaces the variable directories in every path of the tree. The longest directory wins.
fn substitute_variables(process: &mut FlatProcess, variables: &[(String, String)]) {
    if variables.is_empty() {
        return;
    }
    let mut variables = variables.to_vec();
    variables.sort_by_key(|(_, directory)| std::cmp::Reverse(directory.len()));
    substitute_sorted(process, &variables);
}

fn substitute_sorted(process: &mut FlatProcess, variables: &[(String, String)]) {
    if let Some(cwd) = substitute_path(&process.initial_cwd, variables) {
        process.initial_cwd = cwd;
    }
    for file in &mut process.files {
        if let Some(path) = substitute_path(&file.path, variables) {
            file.path = path;
        }
    }
    for child in &mut process.children {
        substitute_sorted(child, variables);
    }
}

fn render_process(process: &FlatProcess, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    lines.push(format!(
        "{indent}{} {}",
        process.pid,
        shell_words::join(&process.command)
    ));
    lines.push(format!("{indent}  cwd: {}", process.initial_cwd));
    for file in &process.files {
        let detail = match (file.size, file.file_count) {
            (Some(size), Some(count)) => format!("{count} files, {size} bytes"),
            (Some(size), None) => format!("{size} bytes"),
            (None, _) => "missing".to_owned(),
        };
        lines.push(format!("{indent}  {} ({detail})", file.path));
    }
    for child in &process.children {
        render_process(child, depth + 1, lines);
    }
}

/// Human readable rendering of the process tree, children indented under their parent.
fn render_tree(process: &FlatProcess) -> String {
    let mut lines = Vec::new();
    render_process(process, 0, &mut lines);
    lines.join("\n")
}

pub fn run(args: ReadArgs, tracer: &dyn Tracer) -> Result<()> {
    let log = expand_path(&args.log);

    start_group!("Parsing the trace log");
    let results = tracer.parse_log(&log);
    end_group!();
    let mut results = results?;
    debug!(
        "{} processes touched {} files",
        results.processes().len(),
        results.files().len()
    );
    let missing = results.non_existent();
    if !missing.is_empty() {
        debug!(
            "{} of them no longer exist, {} do",
            missing.len(),
            results.existent().len()
        );
    }

    if let Some(root_dir) = &args.root_dir {
        results = results.strip_root(root_dir);
    }
    let collapse_root = args.collapse_directories.then(|| {
        args.root_dir
            .clone()
            .unwrap_or_else(|| results.root().initial_cwd().to_owned())
    });
    let mut flat = flatten_process(results.root(), collapse_root.as_deref())?;
    substitute_variables(&mut flat, &args.variables);

    if let Some(output) = &args.output {
        let output = expand_path(output);
        flat.save_to(&output)?;
        info!("Process tree saved to {}", output.display());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&flat)?);
    } else {
        println!("{}", render_tree(&flat));
    }
    Ok(())
}
