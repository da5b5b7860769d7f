use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-wide counters. Handlers only ever add to them.
#[derive(Debug, Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub fragmented: AtomicU64,
    pub passthrough: AtomicU64,
    pub plain_http: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_relay(&self, sent: u64, received: u64) {
        self.bytes_out.fetch_add(sent, Ordering::Relaxed);
        self.bytes_in.fetch_add(received, Ordering::Relaxed);
    }

    pub fn print(&self) {
        info!(
            "📊 total={} active={} fragmented={} passthrough={} http={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.fragmented.load(Ordering::Relaxed),
            self.passthrough.load(Ordering::Relaxed),
            self.plain_http.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

/// Decrements `active` when a connection task ends, however it ends.
pub struct ActiveGuard<'a>(&'a Stats);

impl<'a> ActiveGuard<'a> {
    pub fn enter(stats: &'a Stats) -> Self {
        stats.total.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}
