use std::fmt;
use trace_results::Pid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The tracing mechanism itself failed: it could not start, was denied privilege, lost
    /// events or produced a structurally invalid log.
    Instrumentation,
    /// A system-wide tracing session is already running.
    TracerBusy,
    /// The log looks valid but replaying it violated an invariant of the process model.
    Inconsistency,
}

/// Location of the offending log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineContext {
    pub pid: Option<Pid>,
    /// 1-based.
    pub line_number: usize,
    pub line: String,
}

impl fmt::Display for LineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "\npid {pid}, line {}: {}", self.line_number, self.line),
            None => write!(f, "\nline {}: {}", self.line_number, self.line),
        }
    }
}

fn format_context(context: &Option<LineContext>) -> String {
    context.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// The failure raised by every tracer backend and log parser.
///
/// A traced command exiting with a non-zero code is *not* a `TracingFailure`.
#[derive(Debug, thiserror::Error)]
#[error("{description}{}", format_context(.context))]
pub struct TracingFailure {
    pub kind: FailureKind,
    pub description: String,
    pub context: Option<LineContext>,
    #[source]
    pub source: Option<BoxError>,
}

impl TracingFailure {
    pub fn instrumentation<S: Into<String>>(description: S) -> Self {
        Self {
            kind: FailureKind::Instrumentation,
            description: description.into(),
            context: None,
            source: None,
        }
    }

    pub fn busy<S: Into<String>>(description: S) -> Self {
        Self {
            kind: FailureKind::TracerBusy,
            description: description.into(),
            context: None,
            source: None,
        }
    }

    pub fn inconsistency<S: Into<String>>(description: S) -> Self {
        Self {
            kind: FailureKind::Inconsistency,
            description: description.into(),
            context: None,
            source: None,
        }
    }

    pub fn with_source<E: Into<BoxError>>(mut self, source: E) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches the offending line, unless a more precise location is already known.
    pub fn at_line(mut self, pid: Option<Pid>, line_number: usize, line: &str) -> Self {
        if self.context.is_none() {
            self.context = Some(LineContext {
                pid,
                line_number,
                line: line.trim_end().to_owned(),
            });
        }
        self
    }

    pub fn pid(&self) -> Option<Pid> {
        self.context.as_ref().and_then(|c| c.pid)
    }

    pub fn line_number(&self) -> Option<usize> {
        self.context.as_ref().map(|c| c.line_number)
    }

    pub fn line(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.line.as_str())
    }

    /// Both the generic instrumentation failures and the busy tracer.
    pub fn is_instrumentation(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Instrumentation | FailureKind::TracerBusy
        )
    }
}

impl From<std::io::Error> for TracingFailure {
    fn from(error: std::io::Error) -> Self {
        TracingFailure::instrumentation(error.to_string()).with_source(error)
    }
}

pub type TraceResult<T> = std::result::Result<T, TracingFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_context() {
        let failure =
            TracingFailure::inconsistency("Unknown pid").at_line(Some(42), 3, "clone() = 43\n");
        assert_eq!(failure.to_string(), "Unknown pid\npid 42, line 3: clone() = 43");
        assert_eq!(failure.pid(), Some(42));
        assert_eq!(failure.line_number(), Some(3));
        assert_eq!(failure.line(), Some("clone() = 43"));
    }

    #[test]
    fn test_first_context_wins() {
        let failure = TracingFailure::inconsistency("x")
            .at_line(None, 1, "first")
            .at_line(Some(2), 9, "second");
        assert_eq!(failure.line(), Some("first"));
        assert_eq!(failure.pid(), None);
    }

    #[test]
    fn test_kinds() {
        assert!(TracingFailure::busy("x").is_instrumentation());
        assert!(TracingFailure::instrumentation("x").is_instrumentation());
        assert!(!TracingFailure::inconsistency("x").is_instrumentation());
    }
}
