//! ftrace `trace_pipe` reader.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::parse::parse_line;
use super::{ErrorHandler, EventHandler, ReaderExit, Tracer, TracerError};

/// Bytes requested per read from the pipe.
const READ_CHUNK: usize = 64 * 1024;

/// Longest line kept; the rest of an overlong line is discarded.
const MAX_LINE: usize = 4096;

/// Tracer reading block events from a `trace_pipe` file.
pub struct TracePipeTracer {
    path: PathBuf,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<tokio::task::JoinHandle<()>>,
    exit: Arc<Mutex<Option<ReaderExit>>>,
}

impl TracePipeTracer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            event_handlers: Vec::with_capacity(2),
            error_handlers: Vec::with_capacity(2),
            read_task: None,
            exit: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tracer for TracePipeTracer {
    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let file = open_nonblocking(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let async_fd = AsyncFd::new(file).context("registering trace pipe with the reactor")?;

        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));

        *self.exit.lock() = None;
        let mut recorder = ExitRecorder::new(Arc::clone(&self.exit));
        let handle = tokio::spawn(async move {
            recorder.exit = read_loop(async_fd, event_handlers, error_handlers, ctx).await;
        });
        self.read_task = Some(handle);

        tracing::info!(path = %self.path.display(), "trace pipe tracer started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits when the CancellationToken is cancelled or the
        // stream ends.
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }

        tracing::info!("trace pipe tracer stopped");
        Ok(())
    }

    fn exit(&self) -> Option<ReaderExit> {
        *self.exit.lock()
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

fn open_nonblocking(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

async fn read_loop(
    mut async_fd: AsyncFd<File>,
    event_handlers: Arc<Vec<EventHandler>>,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: CancellationToken,
) -> ReaderExit {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut framer = LineFramer::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ReaderExit::Cancelled,
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "trace pipe poll error");
                        report_error(&error_handlers, TracerError::Io(e));
                        return ReaderExit::Failed;
                    }
                };

                match guard.try_io(|inner| inner.get_mut().read(&mut chunk)) {
                    Ok(Ok(0)) => {
                        framer.finish(|line| dispatch_line(line, &event_handlers, &error_handlers));
                        tracing::info!("trace stream ended");
                        return ReaderExit::EndOfStream;
                    }
                    Ok(Ok(n)) => {
                        framer.push(&chunk[..n], |line| {
                            dispatch_line(line, &event_handlers, &error_handlers)
                        });
                    }
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "trace pipe read error");
                        report_error(&error_handlers, TracerError::Io(e));
                        return ReaderExit::Failed;
                    }
                    // Spurious wakeup; readiness was cleared by try_io.
                    Err(_would_block) => {}
                }
            }
        }
    }
}

/// Publishes the reader's exit reason when the read task ends, including by
/// unwinding out of a handler.
struct ExitRecorder {
    slot: Arc<Mutex<Option<ReaderExit>>>,
    exit: ReaderExit,
}

impl ExitRecorder {
    fn new(slot: Arc<Mutex<Option<ReaderExit>>>) -> Self {
        // Stays `Failed` unless the read loop returns normally.
        Self {
            slot,
            exit: ReaderExit::Failed,
        }
    }
}

impl Drop for ExitRecorder {
    fn drop(&mut self) {
        if self.exit.is_failure() && std::thread::panicking() {
            tracing::error!("trace pipe reader panicked");
        }
        *self.slot.lock() = Some(self.exit);
    }
}

fn dispatch_line(line: &[u8], event_handlers: &[EventHandler], error_handlers: &[ErrorHandler]) {
    if line.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(line);

    match parse_line(&text) {
        Ok(event) => {
            for handler in event_handlers {
                handler(event);
            }
        }
        Err(e) => {
            tracing::trace!(error = %e, line = %text, "skipping trace line");
            report_error(error_handlers, TracerError::Parse(e));
        }
    }
}

fn report_error(handlers: &[ErrorHandler], err: TracerError) {
    for handler in handlers {
        handler(&err);
    }
}

/// Splits a byte stream into newline-terminated lines, carrying partial
/// lines across reads.
#[derive(Debug, Default)]
struct LineFramer {
    partial: Vec<u8>,
    overflow: bool,
}

impl LineFramer {
    fn new() -> Self {
        Self {
            partial: Vec::with_capacity(MAX_LINE),
            overflow: false,
        }
    }

    fn push(&mut self, mut data: &[u8], mut on_line: impl FnMut(&[u8])) {
        while let Some(pos) = data.iter().position(|&b| b == b'\n') {
            let (head, tail) = data.split_at(pos);
            if self.partial.is_empty() && !self.overflow {
                on_line(truncate(head));
            } else {
                self.append(head);
                on_line(&self.partial);
                self.partial.clear();
                self.overflow = false;
            }
            data = &tail[1..];
        }
        self.append(data);
    }

    /// Flush a trailing unterminated line.
    fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if !self.partial.is_empty() {
            on_line(&self.partial);
        }
        self.partial.clear();
        self.overflow = false;
    }

    fn append(&mut self, data: &[u8]) {
        let room = MAX_LINE.saturating_sub(self.partial.len());
        if data.len() > room {
            self.overflow = true;
        }
        self.partial.extend_from_slice(&data[..data.len().min(room)]);
    }
}

fn truncate(line: &[u8]) -> &[u8] {
    &line[..line.len().min(MAX_LINE)]
}

/// Best-effort toggle of the kernel's block tracepoints.
#[derive(Debug, Clone)]
pub struct TracingSwitch {
    path: PathBuf,
}

impl TracingSwitch {
    /// `path` is the `events/block/enable` file under the tracefs root.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Turn block tracing on. Returns whether the write succeeded.
    pub fn enable(&self) -> bool {
        self.write("1")
    }

    /// Turn block tracing off. Returns whether the write succeeded.
    pub fn disable(&self) -> bool {
        self.write("0")
    }

    fn write(&self, value: &str) -> bool {
        match std::fs::write(&self.path, value) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), value, "updated block tracing");
                true
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    value,
                    error = %e,
                    "failed to toggle block tracing",
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::DeviceId;
    use crate::tracer::event::TraceEvent;

    fn frames(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push(chunk, |line| out.push(String::from_utf8_lossy(line).into_owned()));
        }
        framer.finish(|line| out.push(String::from_utf8_lossy(line).into_owned()));
        out
    }

    #[test]
    fn test_framer_whole_lines() {
        assert_eq!(frames(&[b"a\nb\n"]), vec!["a", "b"]);
    }

    #[test]
    fn test_framer_split_across_reads() {
        assert_eq!(frames(&[b"ab", b"c\nd", b"e\n"]), vec!["abc", "de"]);
    }

    #[test]
    fn test_framer_trailing_partial_flushed() {
        assert_eq!(frames(&[b"a\nbc"]), vec!["a", "bc"]);
    }

    #[test]
    fn test_framer_empty_lines_kept() {
        assert_eq!(frames(&[b"\n\nx\n"]), vec!["", "", "x"]);
    }

    #[test]
    fn test_framer_truncates_overlong_line() {
        let long = vec![b'x'; MAX_LINE + 100];
        let mut input = long.clone();
        input.extend_from_slice(b"\nnext\n");

        let out = frames(&[&input[..10], &input[10..]]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), MAX_LINE);
        assert_eq!(out[1], "next");
    }

    #[test]
    fn test_tracing_switch_writes_values() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let switch = TracingSwitch::new(file.path());

        assert!(switch.enable());
        assert_eq!(std::fs::read_to_string(file.path()).expect("read"), "1");
        assert!(switch.disable());
        assert_eq!(std::fs::read_to_string(file.path()).expect("read"), "0");
    }

    #[test]
    fn test_tracing_switch_failure_is_not_fatal() {
        let switch = TracingSwitch::new("/nonexistent/events/block/enable");
        assert!(!switch.enable());
        assert!(!switch.disable());
    }

    fn make_fifo(dir: &Path) -> PathBuf {
        use std::os::unix::ffi::OsStrExt;

        let path = dir.join("trace_pipe");
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).expect("c path");
        // Safety: valid NUL-terminated path.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(rc, 0, "mkfifo: {}", io::Error::last_os_error());
        path
    }

    async fn wait_finished(tracer: &TracePipeTracer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !tracer.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reader should finish");
    }

    #[tokio::test]
    async fn test_reads_events_until_end_of_stream() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fifo = make_fifo(dir.path());

        // O_RDWR on a FIFO never blocks, unlike a write-only open.
        let mut writer = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&fifo)
            .expect("open writer");

        let events = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0usize));

        let mut tracer = TracePipeTracer::new(&fifo);
        let sink = Arc::clone(&events);
        tracer.on_event(Box::new(move |ev: TraceEvent<'_>| {
            sink.lock().push((ev.name.to_string(), ev.device, ev.address));
        }));
        let err_sink = Arc::clone(&errors);
        tracer.on_error(Box::new(move |_: &TracerError| *err_sink.lock() += 1));

        tracer.start(CancellationToken::new()).await.expect("start");

        writer
            .write_all(
                b"  task-1 [000] .... 1.0: block_dirty_buffer: 8,3 sector=42 size=4096\n\
                  # garbage line\n\
                  task-2 [001] .... 2.0: block_rq_issue: 8,0 R () 800 + 8 [task]\n",
            )
            .expect("write");
        drop(writer);

        wait_finished(&tracer).await;
        assert_eq!(tracer.exit(), Some(ReaderExit::EndOfStream));
        tracer.stop().await.expect("stop");

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                ("block_dirty_buffer".to_string(), DeviceId::new(8, 3), 42),
                ("block_rq_issue".to_string(), DeviceId::new(8, 0), 800),
            ]
        );
        assert_eq!(*errors.lock(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_idle_reader() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fifo = make_fifo(dir.path());
        let _writer = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&fifo)
            .expect("open writer");

        let cancel = CancellationToken::new();
        let mut tracer = TracePipeTracer::new(&fifo);
        tracer.start(cancel.clone()).await.expect("start");
        assert!(!tracer.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), tracer.stop())
            .await
            .expect("stop should not hang")
            .expect("stop");
        assert_eq!(tracer.exit(), Some(ReaderExit::Cancelled));
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported_as_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fifo = make_fifo(dir.path());
        let mut writer = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&fifo)
            .expect("open writer");

        let mut tracer = TracePipeTracer::new(&fifo);
        tracer.on_event(Box::new(|_: TraceEvent<'_>| panic!("handler failure")));
        tracer.start(CancellationToken::new()).await.expect("start");
        assert_eq!(tracer.exit(), None);

        writer
            .write_all(b"  task-1 [000] .... 1.0: block_dirty_buffer: 8,3 sector=42 size=4096\n")
            .expect("write");

        wait_finished(&tracer).await;
        let exit = tracer.exit().expect("exit recorded");
        assert_eq!(exit, ReaderExit::Failed);
        assert!(exit.is_failure());

        let err = tracer.stop().await.expect_err("join error surfaces");
        assert!(format!("{err:#}").contains("waiting for read task"));
    }

    #[tokio::test]
    async fn test_start_missing_pipe_is_error() {
        let mut tracer = TracePipeTracer::new("/nonexistent/trace_pipe");
        let err = tracer
            .start(CancellationToken::new())
            .await
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("/nonexistent/trace_pipe"));
    }
}
