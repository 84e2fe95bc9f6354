pub mod event;
pub mod parse;
pub mod pipe;
pub mod stats;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use self::event::TraceEvent;
use self::parse::ParseError;

/// Errors reported to tracer error handlers.
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("reading trace stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing trace line: {0}")]
    Parse(#[from] ParseError),
}

/// Why a tracer's background reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The cancellation token fired.
    Cancelled,
    /// The kernel closed the stream.
    EndOfStream,
    /// A read error or a panic in a handler ended the reader.
    Failed,
}

impl ReaderExit {
    pub const fn is_failure(self) -> bool {
        matches!(self, ReaderExit::Failed)
    }
}

/// Callback for parsed events.
pub type EventHandler = Box<dyn Fn(TraceEvent<'_>) + Send + Sync>;

/// Callback for tracer errors.
pub type ErrorHandler = Box<dyn Fn(&TracerError) + Send + Sync>;

/// Tracer owns the kernel event stream and feeds parsed events to handlers.
pub trait Tracer: Send {
    /// Open the event stream and start the background reader.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for the reader to exit and release the event stream.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// True once the background reader has exited.
    fn is_finished(&self) -> bool {
        self.exit().is_some()
    }

    /// Why the background reader exited, or `None` while it is running.
    fn exit(&self) -> Option<ReaderExit>;

    /// Register a handler for parsed events.
    fn on_event(&mut self, handler: EventHandler);

    /// Register a handler for tracer errors.
    fn on_error(&mut self, handler: ErrorHandler);
}
