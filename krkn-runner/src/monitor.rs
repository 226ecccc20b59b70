//! Line-oriented monitoring of a running Kraken process.
//!
//! One reader thread per stream forwards complete lines over a channel. The
//! monitor loop checks liveness, takes lines off the channel and scans them
//! for completion phrases. Reader threads keep pulling from the pipes until
//! EOF, so the child never blocks on a full pipe even after the monitor has
//! stopped looking.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::markers::{CompletionMarkers, CompletionSignal};

/// Consecutive read errors after which a stream is treated as closed.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// How the monitor waits for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Block on the line channel for at most one poll slice.
    #[default]
    EventDriven,
    /// Sleep one poll slice, then take whatever is buffered.
    FixedInterval,
}

#[derive(Debug)]
enum StreamEvent {
    Line(Stream, String),
    ReadError(Stream, String),
    Closed(Stream),
}

/// Timing knobs for one monitored attempt.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub ceiling: Duration,
    pub poll_slice: Duration,
    pub read_mode: ReadMode,
    pub drain_timeout: Duration,
}

/// How monitoring ended.
#[derive(Debug, Clone)]
pub struct Completion {
    /// `None` when a marker was seen and the process has not exited yet.
    pub status: Option<ExitStatus>,
    pub signal: Option<CompletionSignal>,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("process still running after {0:?}")]
    Timeout(Duration),

    #[error("lost track of process: {0}")]
    Lost(String),
}

pub struct OutputMonitor {
    rx: Receiver<StreamEvent>,
    open_streams: u8,
    stdout: String,
    stderr: String,
    /// Strongest signal scanned so far, whichever path read the line.
    seen: Option<CompletionSignal>,
    settings: MonitorSettings,
    markers: CompletionMarkers,
}

impl OutputMonitor {
    /// Take ownership of the child's piped stdout and stderr.
    pub fn start(child: &mut Child, settings: MonitorSettings, markers: CompletionMarkers) -> Self {
        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(Stream::Stdout, stdout, tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(Stream::Stderr, stderr, tx.clone());
            open_streams += 1;
        }
        Self {
            rx,
            open_streams,
            stdout: String::new(),
            stderr: String::new(),
            seen: None,
            settings,
            markers,
        }
    }

    /// Watch `child` until it exits, a completion phrase appears, or the
    /// ceiling passes.
    pub fn run(&mut self, child: &mut Child) -> Result<Completion, MonitorError> {
        let start = Instant::now();
        let ceiling = self.settings.ceiling;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "Process exited, draining remaining output");
                    self.drain(self.settings.drain_timeout);
                    if let Some(signal) = &self.seen {
                        debug!(?signal, "Completion phrase was still queued at exit");
                    }
                    return Ok(Completion {
                        status: Some(status),
                        signal: self.seen.clone(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Liveness check failed, falling back to blocking drain");
                    let remaining = ceiling.saturating_sub(start.elapsed());
                    return self.blocking_fallback(child, remaining, e.to_string());
                }
            }

            if start.elapsed() >= ceiling {
                warn!(ceiling = ?ceiling, "Monitor ceiling reached with process still alive");
                return Err(MonitorError::Timeout(ceiling));
            }

            let signal = match self.settings.read_mode {
                ReadMode::EventDriven => self.next_line(self.settings.poll_slice),
                ReadMode::FixedInterval => {
                    thread::sleep(self.settings.poll_slice);
                    self.take_buffered()
                }
            };

            match signal {
                Some(CompletionSignal::Primary) => {
                    info!("Primary completion marker observed");
                    self.take_buffered();
                    let status = child.try_wait().ok().flatten();
                    return Ok(Completion {
                        status,
                        signal: Some(CompletionSignal::Primary),
                    });
                }
                Some(CompletionSignal::Secondary(phrase)) => {
                    info!(phrase = %phrase, "Secondary completion phrase observed, waiting for exit");
                    let status = self.wait_for_exit(child, self.settings.drain_timeout);
                    // The primary marker may have arrived while waiting.
                    return Ok(Completion {
                        status,
                        signal: self.seen.clone(),
                    });
                }
                None => {}
            }
        }
    }

    /// Collect output until both streams close or `timeout` passes.
    pub fn drain(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(open_streams = self.open_streams, "Drain deadline reached");
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(event) => {
                    self.handle(event);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    self.open_streams = 0;
                }
            }
        }
    }

    /// Poll `child` for exit while collecting output, for up to `timeout`.
    pub fn wait_for_exit(&mut self, child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            self.take_buffered();
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.drain(deadline.saturating_duration_since(Instant::now()));
                    return Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Liveness check failed while waiting for exit");
                    return None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.settings.poll_slice);
        }
    }

    /// Strongest completion signal scanned so far.
    pub fn signal(&self) -> Option<&CompletionSignal> {
        self.seen.as_ref()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn into_output(self) -> (String, String) {
        (self.stdout, self.stderr)
    }

    fn blocking_fallback(
        &mut self,
        child: &mut Child,
        remaining: Duration,
        reason: String,
    ) -> Result<Completion, MonitorError> {
        self.drain(remaining);
        match child.try_wait() {
            Ok(Some(status)) => Ok(Completion {
                status: Some(status),
                signal: self.seen.clone(),
            }),
            _ => Err(MonitorError::Lost(reason)),
        }
    }

    /// Wait up to `slice` for one event and scan it.
    fn next_line(&mut self, slice: Duration) -> Option<CompletionSignal> {
        if self.open_streams == 0 {
            thread::sleep(slice);
            return None;
        }
        match self.rx.recv_timeout(slice) {
            Ok(event) => self.handle(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.open_streams = 0;
                None
            }
        }
    }

    /// Scan everything already queued; the first signal wins.
    fn take_buffered(&mut self) -> Option<CompletionSignal> {
        let mut found = None;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    let signal = self.handle(event);
                    if found.is_none() {
                        found = signal;
                    }
                }
                Err(TryRecvError::Empty) => return found,
                Err(TryRecvError::Disconnected) => {
                    self.open_streams = 0;
                    return found;
                }
            }
        }
    }

    fn record(&mut self, signal: &CompletionSignal) {
        let stronger = match (&self.seen, signal) {
            (None, _) => true,
            (Some(CompletionSignal::Secondary(_)), CompletionSignal::Primary) => true,
            _ => false,
        };
        if stronger {
            self.seen = Some(signal.clone());
        }
    }

    fn handle(&mut self, event: StreamEvent) -> Option<CompletionSignal> {
        match event {
            StreamEvent::Line(stream, line) => {
                trace!(stream = stream.as_str(), line = %line.trim_end(), "kraken");
                let signal = self.markers.scan(&line);
                if let Some(found) = &signal {
                    self.record(found);
                }
                let buffer = match stream {
                    Stream::Stdout => &mut self.stdout,
                    Stream::Stderr => &mut self.stderr,
                };
                buffer.push_str(&line);
                if !line.ends_with('\n') {
                    buffer.push('\n');
                }
                signal
            }
            StreamEvent::ReadError(stream, error) => {
                warn!(stream = stream.as_str(), error = %error, "Error reading Kraken output");
                None
            }
            StreamEvent::Closed(stream) => {
                debug!(stream = stream.as_str(), "Output stream closed");
                self.open_streams = self.open_streams.saturating_sub(1);
                None
            }
        }
    }
}

fn spawn_reader<R>(stream: Stream, source: R, tx: Sender<StreamEvent>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        let mut consecutive_errors = 0;
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    consecutive_errors = 0;
                    // Keep emptying the pipe after the monitor goes away.
                    if forwarding {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        forwarding = tx.send(StreamEvent::Line(stream, line)).is_ok();
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if forwarding {
                        forwarding = tx.send(StreamEvent::ReadError(stream, e.to_string())).is_ok();
                    }
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        break;
                    }
                }
            }
        }
        let _ = tx.send(StreamEvent::Closed(stream));
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn settings(ceiling: Duration) -> MonitorSettings {
        MonitorSettings {
            ceiling,
            poll_slice: Duration::from_millis(20),
            read_mode: ReadMode::EventDriven,
            drain_timeout: Duration::from_secs(2),
        }
    }

    fn spawn_sh(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_captures_both_streams_on_exit() {
        let mut child = spawn_sh("echo out1; echo err1 >&2; echo out2; exit 3");
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_secs(10)),
            CompletionMarkers::default(),
        );
        let completion = monitor.run(&mut child).unwrap();
        assert_eq!(completion.status.and_then(|s| s.code()), Some(3));
        assert!(completion.signal.is_none());
        let (stdout, stderr) = monitor.into_output();
        assert_eq!(stdout, "out1\nout2\n");
        assert_eq!(stderr, "err1\n");
    }

    #[test]
    fn test_primary_marker_returns_before_exit() {
        let mut child = spawn_sh("echo 'Successfully finished running Kraken'; sleep 5");
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_secs(30)),
            CompletionMarkers::default(),
        );
        let start = Instant::now();
        let completion = monitor.run(&mut child).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(completion.signal, Some(CompletionSignal::Primary));
        assert!(completion.status.is_none());
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn test_secondary_marker_waits_for_exit() {
        let mut child = spawn_sh("echo 'Kraken run completed' >&2; sleep 0.2; echo tail; exit 0");
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_secs(30)),
            CompletionMarkers::default(),
        );
        let completion = monitor.run(&mut child).unwrap();
        assert!(matches!(completion.signal, Some(CompletionSignal::Secondary(_))));
        assert_eq!(completion.status.and_then(|s| s.code()), Some(0));
        assert!(monitor.stdout().contains("tail"));
    }

    #[test]
    fn test_ceiling_reports_timeout_with_partial_output() {
        let mut child = spawn_sh("echo started; sleep 10");
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_millis(300)),
            CompletionMarkers::default(),
        );
        let err = monitor.run(&mut child).unwrap_err();
        assert!(matches!(err, MonitorError::Timeout(_)));
        assert!(monitor.stdout().contains("started"));
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn test_marker_queued_behind_exit_is_reported() {
        let mut child = spawn_sh("echo 'Successfully finished running Kraken'; exit 1");
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_secs(10)),
            CompletionMarkers::default(),
        );
        // Let the process exit before the monitor reads the line.
        thread::sleep(Duration::from_millis(300));
        let completion = monitor.run(&mut child).unwrap();
        assert_eq!(completion.status.and_then(|s| s.code()), Some(1));
        assert_eq!(completion.signal, Some(CompletionSignal::Primary));
        assert_eq!(monitor.signal(), Some(&CompletionSignal::Primary));
        assert!(monitor.stdout().contains("Successfully finished running Kraken"));
    }

    #[test]
    fn test_primary_outranks_earlier_secondary() {
        let mut child = spawn_sh(
            "echo 'Kraken run completed'; echo 'Successfully finished running Kraken'; exit 0",
        );
        let mut monitor = OutputMonitor::start(
            &mut child,
            settings(Duration::from_secs(10)),
            CompletionMarkers::default(),
        );
        thread::sleep(Duration::from_millis(300));
        let completion = monitor.run(&mut child).unwrap();
        assert_eq!(completion.signal, Some(CompletionSignal::Primary));
    }

    #[test]
    fn test_fixed_interval_mode_sees_marker() {
        let mut child = spawn_sh("sleep 0.1; echo 'Successfully finished running Kraken'; sleep 5");
        let mut monitor = OutputMonitor::start(
            &mut child,
            MonitorSettings {
                read_mode: ReadMode::FixedInterval,
                ..settings(Duration::from_secs(30))
            },
            CompletionMarkers::default(),
        );
        let completion = monitor.run(&mut child).unwrap();
        assert_eq!(completion.signal, Some(CompletionSignal::Primary));
        let _ = child.kill();
        let _ = child.wait();
    }
}
