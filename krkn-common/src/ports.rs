//! Signal-server port allocation for Kraken runs.
//!
//! Kraken starts a small HTTP status server on `kraken.port`. Concurrent chaos
//! runs on the same host collide on that port, so the supervisor asks this
//! module for a port that is bindable right now.
//!
//! Every probe is a real bind-and-release. Nothing is reserved: two callers can
//! both be told the same port is free. The supervisor's port-conflict retry is
//! what makes the overall run correct, not this module.

use std::io::ErrorKind;
use std::net::TcpListener;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Port Kraken listens on when nothing else is configured.
pub const DEFAULT_SIGNAL_PORT: u16 = 8081;
/// First port of the sequential search range.
pub const PORT_RANGE_START: u16 = 8081;
/// Last port (inclusive) of the sequential search range.
pub const PORT_RANGE_END: u16 = 8181;
/// Random probes attempted after the sequential scan.
pub const DEFAULT_RANDOM_PROBES: u32 = 10;

const MIN_UNPRIVILEGED_PORT: u32 = 1024;
const MIN_RANGE_SPAN: u32 = 10;

/// Raised only when even the OS-assigned fallback could not bind.
#[derive(Debug, Error)]
#[error("no bindable port on {host} (range {start}..={end}, OS fallback failed: {source})")]
pub struct PortExhaustionError {
    pub host: String,
    pub start: u16,
    pub end: u16,
    #[source]
    pub source: std::io::Error,
}

/// Static search configuration for the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    pub default_port: u16,
    pub random_probes: u32,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: PORT_RANGE_START,
            end: PORT_RANGE_END,
            default_port: DEFAULT_SIGNAL_PORT,
            random_probes: DEFAULT_RANDOM_PROBES,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Sanity check for operator-supplied port ranges.
///
/// Not used on the allocation path; configuration validation calls it.
pub fn validate_port_range(start: u32, end: u32) -> bool {
    start >= MIN_UNPRIVILEGED_PORT
        && end <= u16::MAX as u32
        && start < end
        && end - start >= MIN_RANGE_SPAN
}

/// Stateless port finder. Every call re-probes the OS.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    /// Point-in-time bind check with address reuse enabled.
    ///
    /// `TcpListener::bind` sets `SO_REUSEADDR` on Unix, so sockets lingering in
    /// TIME_WAIT do not count as taken.
    pub fn is_port_available(&self, port: u16, host: &str) -> bool {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, host, "Port already in use");
                false
            }
            Err(e) => {
                debug!(port, host, error = %e, "Port bind failed");
                false
            }
        }
    }

    /// Find a bindable port.
    ///
    /// Order: `preferred`, the default port, the sequential range, random
    /// probes in the range, then an OS-assigned ephemeral port.
    pub fn find_available_port(
        &self,
        preferred: Option<u16>,
        host: &str,
    ) -> Result<u16, PortExhaustionError> {
        self.search(preferred, host, &[])
    }

    /// Like [`find_available_port`](Self::find_available_port) but never
    /// returns `current`.
    ///
    /// Used after Kraken reported a bind failure on `current`: the port may
    /// look free by the time we probe it, yet it is the one that just failed.
    pub fn find_alternate_port(&self, current: u16, host: &str) -> Result<u16, PortExhaustionError> {
        let port = self.search(None, host, &[current])?;
        debug!(old_port = current, new_port = port, "Selected alternate signal port");
        Ok(port)
    }

    fn search(
        &self,
        preferred: Option<u16>,
        host: &str,
        exclude: &[u16],
    ) -> Result<u16, PortExhaustionError> {
        let mut tried = exclude.to_vec();

        if let Some(port) = preferred.filter(|p| !tried.contains(p)) {
            if self.is_port_available(port, host) {
                debug!(port, "Preferred port is available");
                return Ok(port);
            }
            tried.push(port);
        }

        if !tried.contains(&self.range.default_port) {
            if self.is_port_available(self.range.default_port, host) {
                return Ok(self.range.default_port);
            }
            tried.push(self.range.default_port);
        }

        for port in self.range.start..=self.range.end {
            if tried.contains(&port) {
                continue;
            }
            if self.is_port_available(port, host) {
                debug!(port, "Found available port in sequential range");
                return Ok(port);
            }
        }

        let probes = if self.range.start <= self.range.end {
            self.range.random_probes
        } else {
            warn!(start = self.range.start, end = self.range.end, "Empty port range, skipping random probes");
            0
        };
        for _ in 0..probes {
            let port = fastrand::u16(self.range.start..=self.range.end);
            if exclude.contains(&port) {
                continue;
            }
            if self.is_port_available(port, host) {
                debug!(port, "Found available port by random probe");
                return Ok(port);
            }
        }

        warn!(
            host,
            start = self.range.start,
            end = self.range.end,
            "Port range exhausted, asking the OS for an ephemeral port"
        );
        let port = TcpListener::bind((host, 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .map_err(|source| PortExhaustionError {
                host: host.to_string(),
                start: self.range.start,
                end: self.range.end,
                source,
            })?;
        info!(port, "Using OS-assigned port");
        Ok(port)
    }

    /// Port for a Kraken signal server, preferring the default.
    pub fn get_port_for_krkn(&self, host: &str) -> Result<u16, PortExhaustionError> {
        let port = self.find_available_port(Some(self.range.default_port), host)?;
        if port != self.range.default_port {
            warn!(
                port,
                default_port = self.range.default_port,
                "Default Kraken port unavailable, using alternate port"
            );
        }
        Ok(port)
    }
}
