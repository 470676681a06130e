//! Counters and gauges read by health/metrics consumers

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    agents_connected: AtomicU64,
    active_sessions: AtomicU64,
    sessions_opened: AtomicU64,
    dial_failures: AtomicU64,
    sessions_lost: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_to_agents: AtomicU64,
    bytes_from_agents: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub agents_connected: u64,
    pub active_sessions: u64,
    pub sessions_opened: u64,
    pub dial_failures: u64,
    pub sessions_lost: u64,
    pub frames_dropped: u64,
    pub bytes_to_agents: u64,
    pub bytes_from_agents: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            agents_connected: self.agents_connected.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_to_agents: self.bytes_to_agents.load(Ordering::Relaxed),
            bytes_from_agents: self.bytes_from_agents.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_agents_connected(&self, count: usize) {
        self.agents_connected.store(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sessions_released(&self, count: usize) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(count as u64))
            });
    }

    pub(crate) fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sessions_lost(&self, count: usize) {
        self.sessions_lost.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_to_agent(&self, n: usize) {
        self.bytes_to_agents.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_from_agent(&self, n: usize) {
        self.bytes_from_agents.fetch_add(n as u64, Ordering::Relaxed);
    }
}
