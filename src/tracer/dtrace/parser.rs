use super::script::O_DIRECTORY;
use crate::error::{TraceResult, TracingFailure};
use crate::parser::{EventKind, ProcessTable, TraceEvent, at_event};
use crate::path::{LateBoundPath, PathResolver};
use crate::prelude::*;
use lazy_static::lazy_static;
use regex::Regex;
use trace_results::Results;

/// dtrace reports its own errors with this prefix, in the middle of the probe output.
const ERROR_PREFIX: &str = "dtrace:";

lazy_static! {
    static ref LINE_REGEX: Regex =
        Regex::new(r"^(\d+) (\d+) ([a-z]+_[A-Za-z_]+)\((.*)\)$").unwrap();
}

/// Splits `"a, b", 12, "c"` on the commas outside of quotes. D does not escape quotes.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in args.chars() {
        match c {
            '"' => in_string = !in_string,
            ',' if !in_string => {
                out.push(current.trim().to_owned());
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() || !out.is_empty() {
        out.push(current.trim().to_owned());
    }
    out
}

fn kind_of(name: &str) -> EventKind {
    if name.ends_with("_return") {
        EventKind::Return
    } else if name == "proc_exit" {
        EventKind::Exit
    } else {
        EventKind::Info
    }
}

/// Decodes every line and sorts them by their global index.
pub fn decode_log(content: &str) -> TraceResult<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if line.starts_with(ERROR_PREFIX) {
            return Err(TracingFailure::instrumentation("dtrace reported an error")
                .at_line(None, line_number, raw));
        }
        let captures = LINE_REGEX.captures(line).ok_or_else(|| {
            TracingFailure::instrumentation("Unexpected dtrace line").at_line(None, line_number, raw)
        })?;
        let invalid = || {
            TracingFailure::instrumentation("Invalid dtrace line").at_line(None, line_number, raw)
        };
        let name = captures[3].to_owned();
        let pid = captures[2].parse().map_err(|_| invalid())?;
        events.push(TraceEvent {
            kind: kind_of(&name),
            name,
            pid,
            tid: pid,
            index: captures[1].parse().map_err(|_| invalid())?,
            args: split_args(&captures[4]),
            result: None,
            line_number,
            raw: raw.to_owned(),
        });
    }
    // Per-CPU buffers interleave, the replay needs the emission order.
    events.sort_by_key(|event| event.index);
    Ok(events)
}

fn int_arg(event: &TraceEvent, index: usize) -> TraceResult<i64> {
    event
        .arg(index)
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| TracingFailure::instrumentation(format!("Invalid {} event", event.name)))
}

fn str_arg(event: &TraceEvent, index: usize) -> TraceResult<&str> {
    event
        .arg(index)
        .ok_or_else(|| TracingFailure::instrumentation(format!("Invalid {} event", event.name)))
}

fn handle_event(table: &mut ProcessTable, event: &TraceEvent) -> TraceResult<()> {
    let pid = event.pid;
    match event.name.as_str() {
        "proc_start" => {
            let ppid = int_arg(event, 0)?;
            let ppid = u32::try_from(ppid).map_err(|_| {
                TracingFailure::instrumentation(format!("Invalid parent pid {ppid}"))
            })?;
            table.fork(ppid, pid)
        }
        "proc_exit" => table.exit(pid),
        "proc_exec_success" => {
            let executable = str_arg(event, 0)?;
            let argv = event
                .arg(1)
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_owned)
                .collect();
            table.exec(pid, executable, argv)
        }
        "syscall_open_return" => {
            let result = int_arg(event, 0)?;
            let flags = int_arg(event, 1)? as u64;
            let path = str_arg(event, 2)?;
            if result < 0 || flags & O_DIRECTORY != 0 {
                return Ok(());
            }
            table.touch(pid, path)
        }
        "syscall_chdir_return" => {
            if int_arg(event, 0)? != 0 {
                return Ok(());
            }
            table.chdir(pid, str_arg(event, 1)?)
        }
        name => {
            trace!("Ignoring {name}");
            Ok(())
        }
    }
}

/// Replays sorted events, the BEGIN line names the root process.
pub fn replay(events: &[TraceEvent], cwd: &str, resolver: &mut PathResolver) -> TraceResult<Results> {
    let Some((begin, events)) = events.split_first() else {
        return Err(TracingFailure::instrumentation("The dtrace log is empty"));
    };
    if begin.name != "dtrace_BEGIN" {
        return Err(
            TracingFailure::instrumentation("The dtrace log does not start with BEGIN")
                .at_line(Some(begin.pid), begin.line_number, &begin.raw),
        );
    }

    let mut table = ProcessTable::new();
    table
        .add_process(begin.pid, None, LateBoundPath::absolute(cwd))
        .map_err(at_event(begin))?;
    for event in events {
        if event.name == "dtrace_BEGIN" {
            return Err(TracingFailure::inconsistency("Found a second BEGIN line")
                .at_line(Some(event.pid), event.line_number, &event.raw));
        }
        handle_event(&mut table, event).map_err(at_event(event))?;
    }
    table.into_results(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::path::DriveMap;

    fn resolver() -> PathResolver {
        PathResolver::new(DriveMap::default()).with_case_folding(false)
    }

    // Lines as emitted by two CPUs, out of order.
    const LOG: &str = r#"0 500 dtrace_BEGIN("trace-inputs")
3 500 syscall_open_return(3, 0, "parent.sh")
1 500 proc_exec_success("/bin/sh", "sh parent.sh")
2 500 syscall_open_return(3, 0, "/bin/sh")
7 501 proc_exec_success("/bin/sh", "sh child.sh")
6 501 proc_start(500)
4 500 syscall_chdir_return(0, "sub")
5 500 syscall_open_return(4, 1048576, "/usr/lib")
8 501 syscall_open_return(-1, 0, "missing.txt")
9 501 syscall_open_return(3, 0, "child.sh")
10 501 proc_exit(0)
11 500 proc_exit(0)
"#;

    #[test]
    fn test_events_are_sorted() {
        let events = decode_log(LOG).unwrap();
        let indexes: Vec<_> = events.iter().map(|e| e.index).collect();
        assert_eq!(indexes, (0..=11).collect::<Vec<_>>());
        assert_eq!(events[1].args, ["/bin/sh", "sh parent.sh"]);
        assert_eq!(events[1].line_number, 3);
        assert_eq!(events[11].kind, EventKind::Exit);
    }

    #[test]
    fn test_two_level_tree() {
        let events = decode_log(LOG).unwrap();
        let results = replay(&events, "/src", &mut resolver()).unwrap();
        let root = results.root();
        assert_eq!(root.pid(), 500);
        assert_eq!(root.command(), ["sh", "parent.sh"]);
        let files: Vec<_> = root.files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["/bin/sh", "/src/parent.sh"]);

        let child = &root.children()[0];
        assert_eq!(child.initial_cwd(), "/src/sub");
        let files: Vec<_> = child.files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["/bin/sh", "/src/sub/child.sh"]);
    }

    #[test]
    fn test_unsorted_replay_breaks_parentage() {
        // In file order the child execs before it is started.
        let mut events = decode_log(LOG).unwrap();
        events.sort_by_key(|event| event.line_number);
        let failure = replay(&events, "/src", &mut resolver()).unwrap_err();
        assert_eq!(failure.pid(), Some(501));
        assert_eq!(failure.line_number(), Some(5));
    }

    #[test]
    fn test_error_prefix_aborts() {
        let log = "0 1 dtrace_BEGIN(\"trace-inputs\")\ndtrace: 12 dynamic variable drops\n";
        let failure = decode_log(log).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Instrumentation);
        assert_eq!(failure.line_number(), Some(2));
        assert_eq!(failure.line(), Some("dtrace: 12 dynamic variable drops"));
    }

    #[test]
    fn test_unknown_parent_fails() {
        let log = "0 1 dtrace_BEGIN(\"trace-inputs\")\n1 7 proc_start(3)\n";
        let events = decode_log(log).unwrap();
        let failure = replay(&events, "/", &mut resolver()).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Inconsistency);
        assert_eq!(failure.pid(), Some(7));
        assert_eq!(failure.line_number(), Some(2));
    }

    #[test]
    fn test_missing_begin_fails() {
        let failure = replay(&[], "/", &mut resolver()).unwrap_err();
        assert!(failure.is_instrumentation());

        let events = decode_log("0 1 proc_exit(0)\n").unwrap();
        let failure = replay(&events, "/", &mut resolver()).unwrap_err();
        assert!(failure.to_string().contains("does not start with BEGIN"));
    }

    #[test]
    fn test_path_with_comma() {
        assert_eq!(
            split_args(r#"3, 0, "/src/a, b.txt""#),
            ["3", "0", "/src/a, b.txt"]
        );
    }
}
