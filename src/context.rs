//! Shared state for one weaving run: options, the log channel and step timing.
//!
//! The host build tool owns the real diagnostics channel, so logging goes through the
//! [`LogSink`] trait; [`StdLog`] adapts it to the `log` facade for standalone use and
//! tests. Errors are latched on the context: the pipeline keeps running to report as
//! many problems as it can, and the driver checks [`WeaveContext::has_errors`] before
//! committing anything.

use std::cell::Cell;
use std::time::Instant;

use crate::options::Options;

/// A source location attached to a diagnostic, when debug info makes one available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source document path
    pub document: String,
    /// 1-based line
    pub line: u32,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.document, self.line)
    }
}

/// Receiver for weaving diagnostics.
pub trait LogSink {
    /// Report an error; the run will not commit.
    fn error(&self, message: &str, location: Option<&SourceLocation>);
    /// Report a build warning.
    fn warning(&self, message: &str, location: Option<&SourceLocation>);
    /// Report progress information.
    fn info(&self, message: &str);
    /// Report diagnostic detail.
    fn debug(&self, message: &str);
}

/// [`LogSink`] adapter over the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdLog;

impl LogSink for StdLog {
    fn error(&self, message: &str, location: Option<&SourceLocation>) {
        match location {
            Some(location) => log::error!("{location}: {message}"),
            None => log::error!("{message}"),
        }
    }

    fn warning(&self, message: &str, location: Option<&SourceLocation>) {
        match location {
            Some(location) => log::warn!("{location}: {message}"),
            None => log::warn!("{message}"),
        }
    }

    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn debug(&self, message: &str) {
        log::debug!("{message}");
    }
}

/// Per-run state shared across all pipeline stages.
pub struct WeaveContext<'a> {
    /// Parsed weaver options
    pub options: Options,
    sink: &'a dyn LogSink,
    started: Instant,
    errored: Cell<bool>,
}

impl<'a> WeaveContext<'a> {
    /// Create a context for one run.
    #[must_use]
    pub fn new(options: Options, sink: &'a dyn LogSink) -> Self {
        WeaveContext {
            options,
            sink,
            started: Instant::now(),
            errored: Cell::new(false),
        }
    }

    /// Report an error and latch the failure flag.
    pub fn log_error(&self, message: &str, location: Option<&SourceLocation>) {
        self.errored.set(true);
        self.sink.error(message, location);
    }

    /// Report a build warning.
    pub fn log_warning(&self, message: &str, location: Option<&SourceLocation>) {
        self.sink.warning(message, location);
    }

    /// Report progress information.
    pub fn log_info(&self, message: &str) {
        self.sink.info(message);
    }

    /// Report diagnostic detail.
    pub fn log_debug(&self, message: &str) {
        self.sink.debug(message);
    }

    /// Whether any error has been reported this run.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errored.get()
    }

    /// Open a timed pipeline step; start and finish are logged at debug level.
    #[must_use]
    pub fn step(&self, message: &str) -> Step<'_, 'a> {
        self.log_debug(&format!("STARTING {message}"));
        Step {
            context: self,
            message: message.to_string(),
            start: self.started.elapsed(),
        }
    }
}

/// RAII guard logging a step's duration on drop.
pub struct Step<'s, 'a> {
    context: &'s WeaveContext<'a>,
    message: String,
    start: std::time::Duration,
}

impl Drop for Step<'_, '_> {
    fn drop(&mut self) {
        let duration = self.context.started.elapsed() - self.start;
        self.context.log_debug(&format!(
            "FINISHED {} ({}ms)",
            self.message,
            duration.as_millis()
        ));
    }
}

/// In-memory sink capturing every diagnostic, for assertions in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySink {
    pub(crate) errors: std::cell::RefCell<Vec<String>>,
    pub(crate) warnings: std::cell::RefCell<Vec<String>>,
    pub(crate) infos: std::cell::RefCell<Vec<String>>,
    pub(crate) debugs: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn error(&self, message: &str, _location: Option<&SourceLocation>) {
        self.errors.borrow_mut().push(message.to_string());
    }

    fn warning(&self, message: &str, _location: Option<&SourceLocation>) {
        self.warnings.borrow_mut().push(message.to_string());
    }

    fn info(&self, message: &str) {
        self.infos.borrow_mut().push(message.to_string());
    }

    fn debug(&self, message: &str) {
        self.debugs.borrow_mut().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_latch_the_context() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        assert!(!context.has_errors());

        context.log_warning("just a warning", None);
        assert!(!context.has_errors());

        context.log_error("broken", None);
        assert!(context.has_errors());
        assert_eq!(sink.errors.borrow().as_slice(), ["broken"]);
    }

    #[test]
    fn steps_log_start_and_finish() {
        let sink = MemorySink::default();
        let context = WeaveContext::new(Options::default(), &sink);
        {
            let _step = context.step("finding references");
        }
        let debugs = sink.debugs.borrow();
        assert_eq!(debugs[0], "STARTING finding references");
        assert!(debugs[1].starts_with("FINISHED finding references ("));
    }
}
