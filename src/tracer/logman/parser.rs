use std::collections::HashMap;
use std::path::Path;

use crate::error::{TraceResult, TracingFailure};
use crate::parser::{EventKind, ProcessTable, TraceEvent, at_event};
use crate::path::{LateBoundPath, PathResolver, is_absolute, normalize};
use crate::prelude::*;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use trace_results::{Pid, Results};

/// The columns tracerpt writes before the event specific user data.
pub const HEADER: [&str; 19] = [
    "Event Name",
    "Type",
    "Event ID",
    "Version",
    "Channel",
    "Level",
    "Opcode",
    "Task",
    "Keyword",
    "PID",
    "TID",
    "Processor Number",
    "Instance ID",
    "Parent Instance ID",
    "Activity ID",
    "Related Activity ID",
    "Clock-Time",
    "Kernel(ms)",
    "User(ms)",
];

const EVENT_NAME: usize = 0;
const TYPE: usize = 1;
const PID: usize = 9;
const TID: usize = 10;
const USER_DATA: usize = HEADER.len();

/// `FILE_DIRECTORY_FILE` in `CreateOptions`.
const FILE_DIRECTORY_FILE: u64 = 0x1;

/// (Event Name, Type) pairs kept from the kernel log, everything else is noise.
const WHITELIST: &[(&str, &str)] = &[
    ("Process", "Start"),
    ("Process", "DCStart"),
    ("Process", "End"),
    ("Thread", "Start"),
    ("Thread", "DCStart"),
    ("FileIo", "Create"),
    ("FileIo", "Cleanup"),
];

// Offsets in the user data of each event.
mod process {
    pub const PROCESS_ID: usize = 1;
    pub const PARENT_ID: usize = 2;
    pub const IMAGE_FILE_NAME: usize = 7;
    pub const COMMAND_LINE: usize = 8;
}

mod thread {
    pub const PROCESS_ID: usize = 0;
    pub const THREAD_ID: usize = 1;
}

mod file_io {
    pub const TTID: usize = 1;
    pub const FILE_OBJECT: usize = 2;
    pub const CREATE_OPTIONS: usize = 3;
    pub const OPEN_PATH: usize = 6;
}

lazy_static! {
    static ref EVENTS_LOST_REGEX: Regex = Regex::new(r"Events\s+Lost\s*:?\s*(\d+)").unwrap();
}

/// Checks the tracerpt summary, a log missing events cannot be trusted.
pub fn check_summary(summary: &str) -> TraceResult<()> {
    let captures = EVENTS_LOST_REGEX.captures(summary).ok_or_else(|| {
        TracingFailure::instrumentation("The tracerpt summary has no Events Lost counter")
    })?;
    let lost: u64 = captures[1]
        .parse()
        .map_err(|_| TracingFailure::instrumentation("Invalid Events Lost counter"))?;
    if lost != 0 {
        return Err(TracingFailure::instrumentation(format!(
            "The kernel logger lost {lost} events, the trace is incomplete"
        )));
    }
    Ok(())
}

/// tracerpt pads its separators, which leaves the quotes of a padded field in place.
fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'))
        .unwrap_or(value)
}

/// Integers are written in hex (`0x0000022C`) or decimal depending on the field.
fn parse_int(value: &str) -> Option<u64> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_pid(value: &str) -> Option<Pid> {
    parse_int(value).and_then(|value| Pid::try_from(value).ok())
}

/// Splits a Windows command line the way `CommandLineToArgvW` does.
pub fn split_command_line(command_line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut in_quotes = false;
    let mut backslashes = 0usize;

    for c in command_line.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                in_arg = true;
            }
            '"' => {
                current.extend(std::iter::repeat_n('\\', backslashes / 2));
                if backslashes % 2 == 1 {
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
                backslashes = 0;
                in_arg = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                current.extend(std::iter::repeat_n('\\', backslashes));
                backslashes = 0;
                if in_arg {
                    argv.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                current.extend(std::iter::repeat_n('\\', backslashes));
                backslashes = 0;
                current.push(c);
                in_arg = true;
            }
        }
    }
    current.extend(std::iter::repeat_n('\\', backslashes));
    if in_arg {
        argv.push(current);
    }
    argv
}

/// Decodes the whitelisted rows of a tracerpt CSV export.
pub fn decode_csv(content: &str) -> TraceResult<Vec<TraceEvent>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let mut records = reader.records();

    let header = match records.next() {
        Some(header) => header.map_err(|e| {
            TracingFailure::instrumentation("Invalid tracerpt CSV header").with_source(e)
        })?,
        None => return Err(TracingFailure::instrumentation("The tracerpt CSV is empty")),
    };
    let columns: Vec<&str> = header
        .iter()
        .map(|column| column.trim_start_matches('\u{feff}'))
        .take(HEADER.len())
        .collect();
    if columns != HEADER {
        return Err(TracingFailure::instrumentation(format!(
            "Unexpected tracerpt CSV header: {}",
            columns.join(", ")
        )));
    }

    let mut events = Vec::new();
    for record in records {
        let record = record.map_err(|e| {
            TracingFailure::instrumentation("Invalid tracerpt CSV row").with_source(e)
        })?;
        let line_number = record
            .position()
            .map(|position| position.line() as usize)
            .unwrap_or_default();
        let fields: Vec<&str> = record.iter().map(unquote).collect();
        let raw = fields.iter().join(", ");
        let (Some(&event_name), Some(&event_type)) = (fields.get(EVENT_NAME), fields.get(TYPE))
        else {
            continue;
        };
        if !WHITELIST.contains(&(event_name, event_type)) {
            continue;
        }

        let invalid = || {
            TracingFailure::instrumentation("Invalid kernel event").at_line(None, line_number, &raw)
        };
        let pid = fields.get(PID).and_then(|v| parse_pid(v)).ok_or_else(invalid)?;
        let tid = fields.get(TID).and_then(|v| parse_pid(v)).ok_or_else(invalid)?;
        let name = format!("{event_name}_{event_type}");
        events.push(TraceEvent {
            kind: if event_type == "End" {
                EventKind::Exit
            } else {
                EventKind::Info
            },
            name,
            pid,
            tid,
            index: line_number as u64,
            args: fields.iter().skip(USER_DATA).map(|v| v.to_string()).collect(),
            result: None,
            line_number,
            raw,
        });
    }
    Ok(events)
}

struct Replay<'a> {
    table: ProcessTable,
    /// Thread id to owning pid, for the tracked processes only.
    threads: HashMap<Pid, Pid>,
    root_pid: Pid,
    cwd: &'a str,
    resolver: &'a PathResolver,
}

impl Replay<'_> {
    fn user_data<'e>(&self, event: &'e TraceEvent, offset: usize) -> TraceResult<&'e str> {
        event.arg(offset).ok_or_else(|| {
            TracingFailure::instrumentation(format!("{} has no user data {offset}", event.name))
        })
    }

    fn pid_at(&self, event: &TraceEvent, offset: usize) -> TraceResult<Pid> {
        let value = self.user_data(event, offset)?;
        parse_pid(value).ok_or_else(|| {
            TracingFailure::instrumentation(format!("Invalid id {value} in {}", event.name))
        })
    }

    fn handle_event(&mut self, event: &TraceEvent) -> TraceResult<()> {
        match event.name.as_str() {
            "Process_Start" | "Process_DCStart" => self.process_start(event),
            "Process_End" => {
                let pid = self.pid_at(event, process::PROCESS_ID)?;
                if self.table.contains(pid) {
                    self.table.exit(pid)?;
                }
                Ok(())
            }
            "Thread_Start" | "Thread_DCStart" => {
                let pid = self.pid_at(event, thread::PROCESS_ID)?;
                if self.table.contains(pid) {
                    let tid = self.pid_at(event, thread::THREAD_ID)?;
                    self.threads.insert(tid, pid);
                }
                Ok(())
            }
            "FileIo_Create" => {
                let Some(pid) = self.thread_owner(event)? else {
                    return Ok(());
                };
                let options = self.user_data(event, file_io::CREATE_OPTIONS)?;
                let options = parse_int(options).ok_or_else(|| {
                    TracingFailure::instrumentation(format!("Invalid CreateOptions {options}"))
                })?;
                if options & FILE_DIRECTORY_FILE != 0 {
                    return Ok(());
                }
                let open_path = self.user_data(event, file_io::OPEN_PATH)?;
                let Some(path) = self.resolver.to_dos_path(open_path) else {
                    debug!("Skipping {open_path}, its volume has no drive letter");
                    return Ok(());
                };
                let handle = self.user_data(event, file_io::FILE_OBJECT)?;
                self.table.open_handle(pid, handle, &path)
            }
            "FileIo_Cleanup" => {
                let Some(pid) = self.thread_owner(event)? else {
                    return Ok(());
                };
                let handle = self.user_data(event, file_io::FILE_OBJECT)?;
                self.table.close_handle(pid, handle)?;
                Ok(())
            }
            name => {
                trace!("Ignoring {name}");
                Ok(())
            }
        }
    }

    fn thread_owner(&self, event: &TraceEvent) -> TraceResult<Option<Pid>> {
        let tid = self.pid_at(event, file_io::TTID)?;
        Ok(self.threads.get(&tid).copied())
    }

    fn process_start(&mut self, event: &TraceEvent) -> TraceResult<()> {
        let pid = self.pid_at(event, process::PROCESS_ID)?;
        let parent = self.pid_at(event, process::PARENT_ID)?;
        if pid == self.root_pid && self.table.is_empty() {
            self.table
                .add_process(pid, None, LateBoundPath::absolute(self.cwd))?;
        } else if self.table.contains(parent) {
            self.table.fork(parent, pid)?;
        } else {
            return Ok(());
        }

        let command = split_command_line(event.arg(process::COMMAND_LINE).unwrap_or_default());
        let image = self.user_data(event, process::IMAGE_FILE_NAME)?;
        match self.locate_executable(command.first(), image) {
            Some(executable) => self.table.set_command(pid, &executable, command),
            None => self.table.set_image(pid, image, command),
        }
    }

    /// The full path of the executable, when the first argument names an existing file that
    /// matches the image name.
    fn locate_executable(&self, first: Option<&String>, image: &str) -> Option<String> {
        let mut candidate = first?.clone();
        if !candidate.to_ascii_lowercase().ends_with(".exe") {
            candidate.push_str(".exe");
        }
        let candidate = if is_absolute(&candidate) {
            normalize(&candidate, &[])
        } else {
            normalize(self.cwd, &[candidate.as_str()])
        };
        let matches_image = candidate
            .to_ascii_lowercase()
            .strip_suffix(&image.to_ascii_lowercase())
            .is_some_and(|rest| rest.is_empty() || rest.ends_with(['/', '\\']));
        (matches_image && Path::new(&candidate).is_file()).then_some(candidate)
    }
}

/// Replays the kernel events of the processes descending from `root_pid`.
pub fn replay(
    events: &[TraceEvent],
    root_pid: Pid,
    cwd: &str,
    resolver: &mut PathResolver,
) -> TraceResult<Results> {
    let mut replay = Replay {
        table: ProcessTable::new(),
        threads: HashMap::new(),
        root_pid,
        cwd,
        resolver,
    };
    for event in events {
        replay.handle_event(event).map_err(at_event(event))?;
    }
    if replay.table.is_empty() {
        return Err(TracingFailure::instrumentation(format!(
            "The traced process {root_pid} does not appear in the kernel log"
        )));
    }
    let table = replay.table;
    table.into_results(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::path::DriveMap;
    use rstest::rstest;
    use std::collections::BTreeMap;

    const HEADER_LINE: &str = "Event Name, Type, Event ID, Version, Channel, Level, Opcode, Task, Keyword, PID, TID, Processor Number, Instance ID, Parent Instance ID, Activity ID, Related Activity ID, Clock-Time, Kernel(ms), User(ms), User Data";

    fn row(name: &str, kind: &str, pid: &str, user_data: &[&str]) -> String {
        let mut fields = vec![
            name, kind, "0", "2", "0", "0", "1", "0", "0x0", pid, "0x0010", "0", "0", "0",
            "{00000000-0000-0000-0000-000000000000}",
            "{00000000-0000-0000-0000-000000000000}",
            "131000000000000000", "0", "0",
        ];
        fields.extend_from_slice(user_data);
        fields
            .iter()
            .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn process_start(pid: &str, parent: &str, command_line: &str) -> String {
        image_start(pid, parent, "cmd.exe", command_line)
    }

    fn image_start(pid: &str, parent: &str, image: &str, command_line: &str) -> String {
        row(
            "Process",
            "Start",
            parent,
            &["0xFFFF0001", pid, parent, "1", "0", "0x1AA", "S-1-5", image, command_line],
        )
    }

    fn thread_start(pid: &str, tid: &str) -> String {
        row("Thread", "Start", pid, &[pid, tid, "0x0", "0x0"])
    }

    fn create(pid: &str, tid: &str, file_object: &str, options: &str, path: &str) -> String {
        row(
            "FileIo",
            "Create",
            pid,
            &["0xFFFF0002", tid, file_object, options, "0x80", "0x7", path],
        )
    }

    fn cleanup(pid: &str, tid: &str, file_object: &str) -> String {
        row("FileIo", "Cleanup", pid, &["0xFFFF0003", tid, file_object, "0x0"])
    }

    fn resolver() -> PathResolver {
        let mut volumes = BTreeMap::new();
        volumes.insert("\\Device\\HarddiskVolume2".to_owned(), "C:".to_owned());
        PathResolver::new(DriveMap::new(volumes)).with_case_folding(false)
    }

    fn log(rows: &[String]) -> String {
        std::iter::once(HEADER_LINE.to_owned())
            .chain(rows.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parse(rows: &[String]) -> TraceResult<Results> {
        let events = decode_csv(&log(rows))?;
        replay(&events, 0x100, "C:\\src", &mut resolver())
    }

    #[rstest]
    #[case("Total Events Processed: 10\nEvents Lost : 0\n", true)]
    #[case("Events Lost: 3\n", false)]
    #[case("Total Events Processed: 10\n", false)]
    fn test_check_summary(#[case] summary: &str, #[case] ok: bool) {
        assert_eq!(check_summary(summary).is_ok(), ok);
    }

    #[rstest]
    #[case(r#"a b  c"#, &["a", "b", "c"])]
    #[case(r#""C:\Program Files\x.exe" /c"#, &["C:\\Program Files\\x.exe", "/c"])]
    #[case(r#"a\\\"b c"#, &["a\\\"b", "c"])]
    #[case(r#"a\\\\"b c" d"#, &["a\\\\b c", "d"])]
    #[case(r#"C:\dir\ "" x"#, &["C:\\dir\\", "", "x"])]
    fn test_split_command_line(#[case] command_line: &str, #[case] expected: &[&str]) {
        assert_eq!(split_command_line(command_line), expected);
    }

    #[test]
    fn test_header_mismatch() {
        let failure = decode_csv("Event Name, Type, PID\n").unwrap_err();
        assert!(failure.is_instrumentation());
        assert!(failure.to_string().contains("Unexpected tracerpt CSV header"));
    }

    #[test]
    fn test_noise_is_ignored() {
        let events = decode_csv(&log(&[
            row("DiskIo", "Read", "0x4", &["0x0"]),
            thread_start("0x100", "0x10"),
        ]))
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Thread_Start");
        assert_eq!(events[0].pid, 0x100);
        assert_eq!(events[0].line_number, 3);
    }

    #[test]
    fn test_create_cleanup_join() {
        let results = parse(&[
            process_start("0x100", "0x50", "cmd.exe /c build.bat"),
            thread_start("0x100", "0x10"),
            // Unrelated process, same file object
            process_start("0x200", "0x50", "svchost.exe"),
            thread_start("0x200", "0x20"),
            create("0x200", "0x20", "0xA", "0x0", "\\Device\\HarddiskVolume2\\noise.txt"),
            cleanup("0x200", "0x20", "0xA"),
            create("0x100", "0x10", "0xA", "0x0", "\\Device\\HarddiskVolume2\\src\\build.bat"),
            create("0x100", "0x10", "0xB", "0x1", "\\Device\\HarddiskVolume2\\src"),
            create("0x100", "0x10", "0xC", "0x0", "\\Device\\HarddiskVolume2\\never.txt"),
            cleanup("0x100", "0x10", "0xA"),
            cleanup("0x100", "0x10", "0xB"),
        ])
        .unwrap();

        let root = results.root();
        assert_eq!(root.pid(), 0x100);
        assert_eq!(root.executable(), "cmd.exe");
        assert_eq!(root.command(), ["cmd.exe", "/c", "build.bat"]);
        let files: Vec<_> = root.files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["C:\\src\\build.bat"]);
    }

    #[test]
    fn test_child_process_and_duplicates() {
        let results = parse(&[
            process_start("0x100", "0x50", "cmd.exe"),
            thread_start("0x100", "0x10"),
            image_start("0x101", "0x100", "cl.exe", "\"C:\\Tools\\cl.exe\" a.c"),
            thread_start("0x101", "0x11"),
            create("0x101", "0x11", "0x1", "0x0", "\\Device\\HarddiskVolume2\\src\\a.c"),
            cleanup("0x101", "0x11", "0x1"),
            create("0x101", "0x11", "0x2", "0x0", "\\??\\C:\\src\\a.c"),
            cleanup("0x101", "0x11", "0x2"),
            row("Process", "End", "0x101", &["0xFFFF0001", "0x101", "0x100"]),
        ])
        .unwrap();

        let child = &results.root().children()[0];
        assert_eq!(child.pid(), 0x101);
        // Not on this disk, the image name is kept
        assert_eq!(child.executable(), "cl.exe");
        assert_eq!(child.initial_cwd(), "C:\\src");
        let files: Vec<_> = child.files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["C:\\src\\a.c"]);
    }

    #[test]
    fn test_unmapped_volume_is_skipped() {
        let results = parse(&[
            process_start("0x100", "0x50", "cmd.exe"),
            thread_start("0x100", "0x10"),
            create("0x100", "0x10", "0x1", "0x0", "\\Device\\HarddiskVolume9\\x.txt"),
            cleanup("0x100", "0x10", "0x1"),
        ])
        .unwrap();
        assert!(results.root().files().is_empty());
    }

    #[test]
    fn test_missing_root() {
        let failure = parse(&[process_start("0x300", "0x50", "cmd.exe")]).unwrap_err();
        assert!(failure.to_string().contains("does not appear"));
    }

    #[test]
    fn test_child_started_twice() {
        let failure = parse(&[
            process_start("0x100", "0x50", "cmd.exe"),
            process_start("0x101", "0x100", "cl.exe"),
            process_start("0x101", "0x100", "cl.exe"),
        ])
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Inconsistency);
        assert_eq!(failure.pid(), Some(0x100));
        assert_eq!(failure.line_number(), Some(4));
    }

    #[test]
    fn test_padded_fields() {
        let events = decode_csv(&format!(
            "{HEADER_LINE}\nThread,  Start, 0, 2, 0, 0, 1, 0, 0x0, 0x100, 0x10, 0, 0, 0, {{0}}, {{0}}, 1, 0, 0, 0x100, 0x10, \"x\"\n"
        ))
        .unwrap();
        assert_eq!(events[0].name, "Thread_Start");
        assert_eq!(events[0].args, ["0x100", "0x10", "x"]);
    }

    #[test]
    fn test_executable_found_from_first_argument() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        std::fs::create_dir(&tools).unwrap();
        std::fs::write(tools.join("cl.exe"), "").unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();
        let expected = tools.join("cl.exe").to_string_lossy().into_owned();

        let events = decode_csv(&log(&[
            image_start("0x100", "0x50", "cl.exe", "tools/cl a.c"),
            image_start("0x101", "0x100", "link.exe", "tools/cl.exe a.obj"),
        ]))
        .unwrap();
        let results = replay(&events, 0x100, &cwd, &mut resolver()).unwrap();

        let root = results.root();
        assert_eq!(root.executable(), expected);
        // The first argument is not the image
        assert_eq!(root.children()[0].executable(), "link.exe");
    }
}
