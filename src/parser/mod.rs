//! Replay state shared by the log parsers of every tracer.
//!
//! Each backend decodes its raw log into [`TraceEvent`]s and dispatches them to the
//! [`ProcessTable`], which is converted once into the immutable [`trace_results::Results`].

mod event;
mod process_table;

pub use event::{EventKind, TraceEvent};
pub use process_table::ProcessTable;

use crate::error::TracingFailure;

/// Attaches the event's location to a failure raised while handling it.
pub fn at_event(event: &TraceEvent) -> impl FnOnce(TracingFailure) -> TracingFailure + '_ {
    move |failure| failure.at_line(Some(event.pid), event.line_number, &event.raw)
}
