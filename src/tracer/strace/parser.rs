use std::collections::{BTreeSet, HashMap};

use crate::error::{TraceResult, TracingFailure};
use crate::parser::{EventKind, ProcessTable, TraceEvent, at_event};
use crate::path::{LateBoundPath, PathResolver};
use crate::prelude::*;
use lazy_static::lazy_static;
use regex::Regex;
use trace_results::{Pid, Results};

/// Calls passed to `strace -e trace=`.
pub const TRACED_CALLS: &[&str] = &[
    "access",
    "chdir",
    "clone",
    "clone3",
    "creat",
    "execve",
    "exit_group",
    "fork",
    "lstat",
    "open",
    "openat",
    "readlink",
    "rename",
    "stat",
    "vfork",
];

lazy_static! {
    static ref CALL_REGEX: Regex = Regex::new(r"^([a-z0-9_]+)\((.*)\)\s+=\s+(.+)$").unwrap();
    static ref UNFINISHED_REGEX: Regex =
        Regex::new(r"^([a-z0-9_]+)\((.*?)\s*<unfinished \.\.\.>$").unwrap();
    static ref RESUMED_REGEX: Regex =
        Regex::new(r"^<\.\.\. ([a-z0-9_]+) resumed>\s?(.*)$").unwrap();
    static ref EXITED_REGEX: Regex =
        Regex::new(r"^\+\+\+ (?:exited with -?\d+|killed by SIG[A-Z0-9]+.*|superseded by execve in pid \d+) \+\+\+$").unwrap();
    static ref SIGNAL_REGEX: Regex = Regex::new(r"^--- .* ---$").unwrap();
}

/// The decoded events of one `<log>.strace.<pid>` file.
#[derive(Debug)]
pub struct Stream {
    pub pid: Pid,
    pub events: Vec<TraceEvent>,
}

/// Splits a call's arguments on the top level commas.
fn split_args(args: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in args.chars() {
        if in_string {
            current.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '[' | '{' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' | ')' => {
                depth = depth.checked_sub(1)?;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_owned());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if in_string || depth != 0 {
        return None;
    }
    let last = current.trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last.to_owned());
    }
    Some(out)
}

/// Decodes a C string literal as printed by strace. A trailing `...` marks a truncated string
/// and is dropped.
fn unquote(value: &str) -> Option<String> {
    let value = value.strip_suffix("...").unwrap_or(value);
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buffer = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
            continue;
        }
        match chars.next()? {
            'n' => bytes.push(b'\n'),
            't' => bytes.push(b'\t'),
            'r' => bytes.push(b'\r'),
            'v' => bytes.push(0x0b),
            'f' => bytes.push(0x0c),
            'x' => {
                let high = chars.next()?.to_digit(16)?;
                let low = chars.next()?.to_digit(16)?;
                bytes.push((high * 16 + low) as u8);
            }
            digit @ '0'..='7' => {
                let mut value = digit.to_digit(8)?;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(next) => {
                            value = value * 8 + next;
                            chars.next();
                        }
                        None => break,
                    }
                }
                bytes.push(value as u8);
            }
            other => {
                let mut buffer = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buffer).as_bytes());
            }
        }
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decodes `["a", "b", ...]`.
fn unquote_array(value: &str) -> Option<Vec<String>> {
    let inner = value.trim().strip_prefix('[')?.strip_suffix(']')?;
    split_args(inner)?
        .iter()
        .filter(|item| item.as_str() != "...")
        .map(|item| unquote(item))
        .collect()
}

fn has_flag(flags: &str, flag: &str) -> bool {
    flags.split('|').any(|f| f.trim() == flag)
}

fn is_failure(result: &str) -> bool {
    result.starts_with('-') || result.starts_with('?')
}

/// Per stream state: calls interrupted by a signal, keyed by function name.
#[derive(Debug, Default)]
struct Decoder {
    pid: Pid,
    pending: HashMap<String, String>,
}

impl Decoder {
    fn event(&self, name: &str, kind: EventKind, args: Vec<String>, line: (usize, &str)) -> TraceEvent {
        TraceEvent {
            name: name.to_owned(),
            kind,
            pid: self.pid,
            tid: self.pid,
            index: line.0 as u64,
            args,
            result: None,
            line_number: line.0,
            raw: line.1.to_owned(),
        }
    }

    /// Turns one line into at most one event. Interrupted calls are buffered until resumed.
    fn decode(&mut self, line_number: usize, raw: &str) -> TraceResult<Option<TraceEvent>> {
        let line = raw.trim_end();
        let pid = self.pid;
        let context = |failure: TracingFailure| failure.at_line(Some(pid), line_number, raw);

        if line.is_empty() || SIGNAL_REGEX.is_match(line) {
            return Ok(None);
        }
        if EXITED_REGEX.is_match(line) {
            return Ok(Some(self.event("exit", EventKind::Exit, vec![], (line_number, raw))));
        }
        if let Some(captures) = UNFINISHED_REGEX.captures(line) {
            let name = captures[1].to_owned();
            let start = format!("{}({}", name, &captures[2]);
            if self.pending.insert(name.clone(), start).is_some() {
                return Err(context(TracingFailure::inconsistency(format!(
                    "Call {name} interrupted twice"
                ))));
            }
            return Ok(None);
        }

        let stitched;
        let line = match RESUMED_REGEX.captures(line) {
            Some(captures) => {
                let name = &captures[1];
                let rest = &captures[2];
                let start = self.pending.remove(name).ok_or_else(|| {
                    context(TracingFailure::inconsistency(format!(
                        "Resumed call {name} was never started"
                    )))
                })?;
                let separator = if rest.starts_with(')') || start.ends_with('(') {
                    ""
                } else {
                    " "
                };
                stitched = format!("{start}{separator}{rest}");
                stitched.as_str()
            }
            None => line,
        };

        let captures = CALL_REGEX.captures(line).ok_or_else(|| {
            context(TracingFailure::instrumentation("Unexpected strace line"))
        })?;
        let name = &captures[1];
        if !TRACED_CALLS.contains(&name) {
            return Ok(None);
        }
        let result = captures[3].trim();
        let args = split_args(&captures[2])
            .ok_or_else(|| context(TracingFailure::instrumentation("Unbalanced arguments")))?;
        self.decode_call(name, &args, result, (line_number, raw))
            .map_err(context)
    }

    fn decode_call(
        &self,
        name: &str,
        args: &[String],
        result: &str,
        line: (usize, &str),
    ) -> TraceResult<Option<TraceEvent>> {
        if name == "exit_group" {
            return Ok(Some(self.event("exit", EventKind::Exit, vec![], line)));
        }
        if is_failure(result) {
            return Ok(None);
        }
        let invalid = || TracingFailure::instrumentation(format!("Invalid {name} call"));
        let path_arg = |index: usize| -> TraceResult<String> {
            args.get(index).and_then(|arg| unquote(arg)).ok_or_else(invalid)
        };

        let (name, args) = match name {
            "clone" | "clone3" | "fork" | "vfork" => {
                let child: Pid = result.parse().map_err(|_| invalid())?;
                ("fork", vec![child.to_string()])
            }
            "chdir" => ("chdir", vec![path_arg(0)?]),
            "execve" => {
                let executable = path_arg(0)?;
                let argv = args
                    .get(1)
                    .and_then(|arg| unquote_array(arg))
                    .ok_or_else(invalid)?;
                (
                    "exec",
                    std::iter::once(executable).chain(argv).collect::<Vec<_>>(),
                )
            }
            "open" | "creat" => {
                let flags = args.get(1).map(String::as_str).unwrap_or("");
                if name == "open" && has_flag(flags, "O_DIRECTORY") {
                    return Ok(None);
                }
                ("touch", vec![path_arg(0)?])
            }
            "openat" => {
                let dirfd = args.first().ok_or_else(invalid)?;
                let path = path_arg(1)?;
                let flags = args.get(2).map(String::as_str).unwrap_or("");
                if has_flag(flags, "O_DIRECTORY") {
                    return Ok(None);
                }
                if dirfd != "AT_FDCWD" && !crate::path::is_absolute(&path) {
                    warn!(
                        "Skipping {path:?} opened relative to descriptor {dirfd} by pid {}",
                        self.pid
                    );
                    return Ok(None);
                }
                ("touch", vec![path])
            }
            "access" | "stat" | "lstat" | "readlink" => ("touch", vec![path_arg(0)?]),
            "rename" => ("touch", vec![path_arg(0)?, path_arg(1)?]),
            _ => return Ok(None),
        };
        let mut event = self.event(name, EventKind::Return, args, line);
        event.result = Some(result.to_owned());
        Ok(Some(event))
    }
}

/// Decodes a whole per process log.
pub fn decode_stream(pid: Pid, content: &str) -> TraceResult<Stream> {
    let mut decoder = Decoder {
        pid,
        ..Default::default()
    };
    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(event) = decoder.decode(index + 1, line)? {
            events.push(event);
        }
    }
    for name in decoder.pending.keys() {
        debug!("Process {pid} was interrupted during {name}");
    }
    Ok(Stream { pid, events })
}

/// Replays the streams, in any order, into the process tree rooted at the only process that
/// no other process created.
pub fn replay(streams: &[Stream], cwd: &str, resolver: &mut PathResolver) -> TraceResult<Results> {
    let children: BTreeSet<Pid> = streams
        .iter()
        .flat_map(|stream| &stream.events)
        .filter(|event| event.name == "fork")
        .filter_map(|event| event.arg(0)?.parse().ok())
        .collect();
    let roots: Vec<Pid> = streams
        .iter()
        .map(|stream| stream.pid)
        .filter(|pid| !children.contains(pid))
        .collect();
    let [root] = roots.as_slice() else {
        return Err(TracingFailure::inconsistency(format!(
            "Expected exactly one root process, found {}: {roots:?}",
            roots.len()
        )));
    };

    let mut table = ProcessTable::new();
    for stream in streams {
        table.ensure_process(stream.pid);
    }
    table.bind_initial_cwd(*root, LateBoundPath::absolute(cwd))?;

    for stream in streams {
        for event in &stream.events {
            handle_event(&mut table, event).map_err(at_event(event))?;
        }
    }
    table.into_results(resolver)
}

fn handle_event(table: &mut ProcessTable, event: &TraceEvent) -> TraceResult<()> {
    let pid = event.pid;
    match (event.name.as_str(), event.kind) {
        ("exit", EventKind::Exit) => table.exit(pid),
        ("fork", _) => {
            let child = event
                .arg(0)
                .and_then(|child| child.parse().ok())
                .ok_or_else(|| TracingFailure::instrumentation("Invalid child pid"))?;
            table.fork(pid, child)
        }
        ("chdir", _) => table.chdir(pid, event.arg(0).unwrap_or_default()),
        ("exec", _) => {
            let (executable, argv) = event
                .args
                .split_first()
                .ok_or_else(|| TracingFailure::instrumentation("Invalid execve call"))?;
            table.exec(pid, executable, argv.to_vec())
        }
        ("touch", _) => event.args.iter().try_for_each(|path| table.touch(pid, path)),
        _ => Ok(()),
    }
}
