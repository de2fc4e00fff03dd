//! Process-wide counters shared by the server, its sessions and the policy checkers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    rejected_spf: AtomicU64,
    rejected_dkim: AtomicU64,
    rejected_dmarc: AtomicU64,
    auth_success: AtomicU64,
    auth_failed: AtomicU64,
    running: AtomicBool,
    started: Instant,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_sessions: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub rejected_spf: u64,
    pub rejected_dkim: u64,
    pub rejected_dmarc: u64,
    pub auth_success: u64,
    pub auth_failed: u64,
    pub uptime_seconds: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            rejected_spf: AtomicU64::new(0),
            rejected_dkim: AtomicU64::new(0),
            rejected_dmarc: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a session active until the returned guard is dropped.
    pub fn track_session(&self) -> ActiveSession<'_> {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        ActiveSession { metrics: self }
    }

    pub fn increment_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_spf(&self) {
        self.rejected_spf.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_dkim(&self) {
        self.rejected_dkim.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_dmarc(&self) {
        self.rejected_dmarc.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_success(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_failed(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            rejected_spf: self.rejected_spf.load(Ordering::Relaxed),
            rejected_dkim: self.rejected_dkim.load(Ordering::Relaxed),
            rejected_dmarc: self.rejected_dmarc.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

pub struct ActiveSession<'a> {
    metrics: &'a Metrics,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections={} active={} received={} relayed={} rejected_spf={} \
             rejected_dkim={} rejected_dmarc={} auth_ok={} auth_failed={} uptime={}s",
            self.total_connections,
            self.active_sessions,
            self.messages_received,
            self.messages_relayed,
            self.rejected_spf,
            self.rejected_dkim,
            self.rejected_dmarc,
            self.auth_success,
            self.auth_failed,
            self.uptime_seconds
        )
    }
}
