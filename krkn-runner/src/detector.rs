//! Completion checks against Kraken's persisted log file.
//!
//! Every check re-reads the file from disk. Kraken may still be appending, so
//! results are only as fresh as the last flush. Kraken appends to an existing
//! log, so checks start at the offset recorded when the current run launched.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::ChaosError;
use crate::markers::{CompletionMarkers, CompletionSignal};

/// Lines inspected by the quick tail check.
pub const TAIL_CHECK_LINES: usize = 50;
/// Lines dumped when validation fails.
pub const FAILURE_DUMP_LINES: usize = 20;

const TAIL_BLOCK_SIZE: u64 = 8 * 1024;

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    log_path: PathBuf,
    markers: CompletionMarkers,
    start_offset: u64,
}

impl CompletionDetector {
    pub fn new(log_path: impl Into<PathBuf>, markers: CompletionMarkers) -> Self {
        Self {
            log_path: log_path.into(),
            markers,
            start_offset: 0,
        }
    }

    /// Ignore everything before byte `offset` of the log.
    pub fn set_start_offset(&mut self, offset: u64) {
        self.start_offset = offset;
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Log content written since the start offset.
    ///
    /// A log shorter than the offset was replaced or truncated and is read
    /// from the beginning.
    pub fn read_log(&self) -> io::Result<String> {
        let mut file = File::open(&self.log_path)?;
        let from = effective_floor(self.start_offset, file.metadata()?.len());
        file.seek(SeekFrom::Start(from))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether any success phrase appears in the last lines of the log.
    pub fn check_output_log_for_completion(&self) -> bool {
        let tail = match read_tail_lines_after(&self.log_path, TAIL_CHECK_LINES, self.start_offset) {
            Ok(lines) => lines,
            Err(e) => {
                debug!(log = %self.log_path.display(), error = %e, "Log tail not readable");
                return false;
            }
        };
        let found = tail.iter().any(|line| self.markers.scan(line).is_some());
        if found {
            debug!(log = %self.log_path.display(), "Completion phrase found in log tail");
        }
        found
    }

    /// Classify the whole log. Returns `(succeeded, explanation)`.
    pub fn check_success_completion(&self) -> (bool, String) {
        let content = match self.read_log() {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return (
                    false,
                    format!("log file {} does not exist", self.log_path.display()),
                );
            }
            Err(e) => {
                return (
                    false,
                    format!("log file {} unreadable: {e}", self.log_path.display()),
                );
            }
        };

        match self.markers.scan(&content) {
            Some(CompletionSignal::Primary) => {
                return (true, format!("found '{}'", self.markers.primary));
            }
            Some(CompletionSignal::Secondary(phrase)) => {
                return (true, format!("found completion phrase '{phrase}'"));
            }
            None => {}
        }

        let failures = self.markers.failure_matches(&content);
        if !failures.is_empty() {
            return (
                false,
                format!("failure indicators present: {}", failures.join(", ")),
            );
        }

        (
            false,
            "completion status unclear: no success or failure markers".to_string(),
        )
    }

    /// Confirm the log shows success, dumping its tail on failure.
    pub fn validate_execution_success(&self) -> Result<bool, ChaosError> {
        let (succeeded, message) = self.check_success_completion();
        if succeeded {
            info!(log = %self.log_path.display(), detail = %message, "Kraken execution validated");
            return Ok(true);
        }

        error!(log = %self.log_path.display(), detail = %message, "Kraken execution validation failed");
        match read_tail_lines_after(&self.log_path, FAILURE_DUMP_LINES, self.start_offset) {
            Ok(lines) => {
                for line in lines {
                    error!(line = %line, "log tail");
                }
            }
            Err(e) => warn!(error = %e, "Could not read log tail"),
        }
        Err(ChaosError::ValidationFailed {
            message,
            log_path: self.log_path.clone(),
        })
    }
}

/// Last `n` lines of a file, reading backwards in blocks.
pub fn read_tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    read_tail_lines_after(path, n, 0)
}

/// Last `n` lines of a file that start at or after byte `floor`.
pub fn read_tail_lines_after(path: &Path, n: usize, floor: u64) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let floor = effective_floor(floor, len);

    let mut start = len;
    let mut chunk: Vec<u8> = Vec::new();
    while start > floor {
        let block = TAIL_BLOCK_SIZE.min(start - floor);
        start -= block;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; block as usize];
        file.read_exact(&mut buf)?;
        buf.extend_from_slice(&chunk);
        chunk = buf;
        // One extra newline guarantees the first kept line is complete.
        if chunk.iter().filter(|&&b| b == b'\n').count() > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&chunk);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

fn effective_floor(offset: u64, len: u64) -> u64 {
    if offset > len {
        debug!(offset, len, "Log shorter than start offset, reading from the beginning");
        0
    } else {
        offset
    }
}
