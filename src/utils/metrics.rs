//! Observability and Metrics
//!
//! Counters for connection lifecycle, traffic and dispatch outcomes.
//! A single [`Metrics`] is shared (via `Arc`) between the connection manager and
//! the packet router of one network manager.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one client network stack
#[derive(Debug)]
pub struct Metrics {
    /// Connections successfully opened
    pub connections_opened: AtomicU64,
    /// Connections torn down
    pub connections_closed: AtomicU64,
    /// Connect attempts that failed
    pub connections_failed: AtomicU64,
    /// Frames received
    pub packets_received: AtomicU64,
    /// Frames sent
    pub packets_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Frames dropped because the header could not be parsed
    pub unparsable_headers: AtomicU64,
    /// Frames with no registered handler
    pub unhandled_packets: AtomicU64,
    /// Frames dropped by the suppression list
    pub suppressed_packets: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            unparsable_headers: AtomicU64::new(0),
            unhandled_packets: AtomicU64::new(0),
            suppressed_packets: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn unparsable_header(&self) {
        self.unparsable_headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_packet(&self) {
        self.unhandled_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn suppressed_packet(&self) {
        self.suppressed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections currently open according to the counters
    pub fn connections_active(&self) -> u64 {
        self.connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            unparsable_headers: self.unparsable_headers.load(Ordering::Relaxed),
            unhandled_packets: self.unhandled_packets.load(Ordering::Relaxed),
            suppressed_packets: self.suppressed_packets.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_opened = snapshot.connections_opened,
            connections_closed = snapshot.connections_closed,
            connections_failed = snapshot.connections_failed,
            packets_received = snapshot.packets_received,
            packets_sent = snapshot.packets_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            unparsable_headers = snapshot.unparsable_headers,
            unhandled_packets = snapshot.unhandled_packets,
            suppressed_packets = snapshot.suppressed_packets,
            handler_failures = snapshot.handler_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Client network metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_failed: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub unparsable_headers: u64,
    pub unhandled_packets: u64,
    pub suppressed_packets: u64,
    pub handler_failures: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
