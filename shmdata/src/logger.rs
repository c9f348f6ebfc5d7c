//! Injectable logger used by every transport component
//!
//! Components never print directly: they report through a [`Logger`] so that a
//! host application can route transport diagnostics wherever it wants. The
//! default [`TracingLogger`] forwards to `tracing` events.

use std::fmt;
use std::sync::Arc;

/// Sink for transport diagnostics
pub trait Logger: Send + Sync {
    /// Unexpected failure; the transport recovered or gave up
    fn error(&self, args: fmt::Arguments<'_>);

    /// Caller misuse or degraded operation
    fn warning(&self, args: fmt::Arguments<'_>);

    /// Expected transient conditions and lifecycle chatter
    fn debug(&self, args: fmt::Arguments<'_>);
}

/// Logger forwarding to the `tracing` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!("{}", args);
    }

    fn warning(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!("{}", args);
    }
}

/// Shared handle to the default logger
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Severity recorded by [`RecordingLogger`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Level {
        Error,
        Warning,
        Debug,
    }

    /// Logger keeping every line in memory
    #[derive(Default)]
    pub struct RecordingLogger {
        pub lines: Mutex<Vec<(Level, String)>>,
    }

    impl RecordingLogger {
        pub fn count(&self, level: Level) -> usize {
            self.lines.lock().iter().filter(|(l, _)| *l == level).count()
        }
    }

    impl Logger for RecordingLogger {
        fn error(&self, args: fmt::Arguments<'_>) {
            self.lines.lock().push((Level::Error, args.to_string()));
        }

        fn warning(&self, args: fmt::Arguments<'_>) {
            self.lines.lock().push((Level::Warning, args.to_string()));
        }

        fn debug(&self, args: fmt::Arguments<'_>) {
            self.lines.lock().push((Level::Debug, args.to_string()));
        }
    }
}
