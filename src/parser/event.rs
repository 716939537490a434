use std::fmt;

use trace_results::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A call or probe reported once it completed.
    Return,
    /// A probe fired without a return value.
    Info,
    /// The process is gone.
    Exit,
}

/// One normalized tracing record, as decoded from a raw log line or row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub name: String,
    pub kind: EventKind,
    pub pid: Pid,
    pub tid: Pid,
    /// Ordering key: the global log index for dtrace, the line number elsewhere.
    pub index: u64,
    pub args: Vec<String>,
    /// Raw return value, for `Return` events.
    pub result: Option<String>,
    /// 1-based position of the record in its log stream.
    pub line_number: usize,
    pub raw: String,
}

impl TraceEvent {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}({})", self.pid, self.name, self.args.join(", "))?;
        if let Some(result) = &self.result {
            write!(f, " = {result}")?;
        }
        Ok(())
    }
}
