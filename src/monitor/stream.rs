use crate::local_logger::suspend_progress_bar;
use crate::logger::WORKLOAD_TARGET;
use crate::prelude::*;
use crate::tracer::{ExecutionTracer, SpanId, ThreadState};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Counters of one output stream, written by its reader thread only.
#[derive(Debug, Default)]
pub struct StreamStats {
    bytes: AtomicU64,
    lines: AtomicU64,
    reader_alive: AtomicBool,
    /// Milliseconds since the process start at which the reader stopped, 0 while it runs.
    reader_finished_ms: AtomicU64,
    buffer: Mutex<Vec<u8>>,
}

impl StreamStats {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn reader_alive(&self) -> bool {
        self.reader_alive.load(Ordering::Acquire)
    }

    pub fn captured(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Liveness data of a monitored process, shared between its readers, the deadlock watch and
/// the monitor loop.
#[derive(Debug)]
pub struct ProcessActivity {
    started: Instant,
    last_output_ms: AtomicU64,
    pub stdout: StreamStats,
    pub stderr: StreamStats,
}

impl ProcessActivity {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            last_output_ms: AtomicU64::new(0),
            stdout: StreamStats::default(),
            stderr: StreamStats::default(),
        }
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamStats {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn record_output(&self) {
        self.last_output_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Time since the last chunk of output on either stream, or since the start without output.
    pub fn silence(&self) -> Duration {
        let last = self.last_output_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// How long the reader of `kind` has been stopped, `None` while it runs.
    pub fn reader_stopped_for(&self, kind: StreamKind) -> Option<Duration> {
        let stats = self.stream(kind);
        if stats.reader_alive() {
            return None;
        }
        let finished = stats.reader_finished_ms.load(Ordering::Acquire);
        Some(Duration::from_millis(self.now_ms().saturating_sub(finished)))
    }

    pub fn total_bytes(&self) -> u64 {
        self.stdout.bytes() + self.stderr.bytes()
    }
}

/// A reader thread draining one output stream of the workload.
pub struct StreamReader {
    pub kind: StreamKind,
    handle: JoinHandle<()>,
}

impl StreamReader {
    /// Spawn the reader. `echo` copies the output to our own matching stream.
    pub fn spawn(
        kind: StreamKind,
        reader: impl Read + Send + 'static,
        activity: Arc<ProcessActivity>,
        echo: bool,
        tracer: Option<Arc<ExecutionTracer>>,
    ) -> Result<Self> {
        let span = tracer
            .as_ref()
            .and_then(|tracer| tracer.track_thread(&format!("{kind}-reader"), &kind.to_string()));
        activity.stream(kind).reader_alive.store(true, Ordering::Release);

        let thread_activity = Arc::clone(&activity);
        let handle = thread::Builder::new()
            .name(format!("{kind}-reader"))
            .spawn(move || {
                if let (Some(tracer), Some(span)) = (&tracer, span) {
                    tracer.update_thread_state(span, ThreadState::Running, None);
                }
                let result = match kind {
                    StreamKind::Stdout => {
                        drain(reader, std::io::stdout(), kind, &thread_activity, echo)
                    }
                    StreamKind::Stderr => {
                        drain(reader, std::io::stderr(), kind, &thread_activity, echo)
                    }
                };
                let stats = thread_activity.stream(kind);
                stats
                    .reader_finished_ms
                    .store(thread_activity.now_ms(), Ordering::Release);
                stats.reader_alive.store(false, Ordering::Release);
                finish_span(tracer.as_deref(), span, result);
            });

        match handle {
            Ok(handle) => Ok(Self { kind, handle }),
            Err(e) => {
                activity.stream(kind).reader_alive.store(false, Ordering::Release);
                Err(e).with_context(|| format!("Failed to spawn the {kind} reader"))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Bounded join, the thread is detached when it does not stop in time.
    pub fn join(self, timeout: Duration) -> bool {
        crate::process::join_bounded(self.handle, timeout).is_some()
    }
}

fn finish_span(tracer: Option<&ExecutionTracer>, span: Option<SpanId>, result: Result<()>) {
    let (Some(tracer), Some(span)) = (tracer, span) else {
        return;
    };
    match result {
        Ok(()) => tracer.update_thread_state(span, ThreadState::Terminated, None),
        Err(e) => tracer.update_thread_state(span, ThreadState::Error, Some(format!("{e:#}"))),
    }
}

fn drain(
    mut reader: impl Read,
    mut writer: impl Write,
    kind: StreamKind,
    activity: &ProcessActivity,
    echo: bool,
) -> Result<()> {
    let stats = activity.stream(kind);
    let prefix = match kind {
        StreamKind::Stdout => "",
        StreamKind::Stderr => "[stderr] ",
    };
    let mut flush = |chunk: &[u8]| {
        suspend_progress_bar(|| {
            if echo {
                // Our own terminal going away must not stop the draining
                let _ = writer.write_all(chunk);
            }
            trace!(
                target: WORKLOAD_TARGET,
                "{prefix}{}",
                String::from_utf8_lossy(chunk).trim_end()
            );
        });
    };

    let mut buffer = [0; 1024];
    let mut line_buffer = Vec::new();
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !line_buffer.is_empty() {
                    flush(&line_buffer);
                }
                return Err(e).with_context(|| format!("Failed to read {kind}"));
            }
        };
        let chunk = &buffer[..bytes_read];
        activity.record_output();
        stats.bytes.fetch_add(bytes_read as u64, Ordering::Relaxed);
        stats.lines.fetch_add(
            chunk.iter().filter(|&&b| b == b'\n').count() as u64,
            Ordering::Relaxed,
        );
        stats
            .buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(chunk);

        line_buffer.extend_from_slice(chunk);
        // Flush up to and including the last complete line
        if let Some(last_newline_pos) = line_buffer.iter().rposition(|&b| b == b'\n' || b == b'\r')
        {
            flush(&line_buffer[..=last_newline_pos]);
            line_buffer.drain(..=last_newline_pos);
        }
    }

    if !line_buffer.is_empty() {
        flush(&line_buffer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_counts_and_captures() {
        let activity = Arc::new(ProcessActivity::new(Instant::now()));
        let reader = StreamReader::spawn(
            StreamKind::Stdout,
            Cursor::new(b"one\ntwo\nthree".to_vec()),
            Arc::clone(&activity),
            false,
            None,
        )
        .unwrap();
        assert!(reader.join(Duration::from_secs(2)));

        assert_eq!(activity.stdout.bytes(), 13);
        assert_eq!(activity.stdout.lines(), 2);
        assert_eq!(activity.stdout.captured(), "one\ntwo\nthree");
        assert!(!activity.stdout.reader_alive());
        assert!(activity.reader_stopped_for(StreamKind::Stdout).is_some());
        assert!(activity.reader_stopped_for(StreamKind::Stderr).is_some());
    }

    #[test]
    fn test_silence_grows_without_output() {
        let activity = ProcessActivity::new(Instant::now());
        thread::sleep(Duration::from_millis(50));
        assert!(activity.silence() >= Duration::from_millis(50));
        activity.record_output();
        assert!(activity.silence() < Duration::from_millis(50));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("pipe broke"))
        }
    }

    #[test]
    fn test_reader_error_is_traced() {
        let tracer = Arc::new(
            ExecutionTracer::new(
                crate::config::TracerConfig::default(),
                Arc::new(crate::resources::UnavailableSampler),
            )
            .unwrap(),
        );
        tracer.start_trace(None).unwrap();
        let activity = Arc::new(ProcessActivity::new(Instant::now()));
        let reader = StreamReader::spawn(
            StreamKind::Stderr,
            FailingReader,
            Arc::clone(&activity),
            false,
            Some(Arc::clone(&tracer)),
        )
        .unwrap();
        assert!(reader.join(Duration::from_secs(2)));

        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.threads.len(), 1);
        assert_eq!(trace.threads[0].state, ThreadState::Error);
        assert!(trace.threads[0].error.as_deref().unwrap().contains("pipe broke"));
    }
}
