// Per-session flow timestamps: cache verification, connection phases, result modes.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};

use serde::Serialize;

use crate::cache::now_millis;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub url: String,
    pub start_time: i64,
    pub flow_start_time: i64,
    pub cache_verify_time: i64,
    pub connection_flow_start_time: i64,
    pub connection_connect_time: i64,
    pub connection_respond_time: i64,
    pub connection_flow_finish_time: i64,
    pub last_diff_callback_time: i64,
    pub is_direct_address: bool,
    pub original_mode: i32,
    pub final_mode: i32,
}

impl StatsSnapshot {
    /// Millis from flow start to the end of the connection step, when both happened.
    pub fn flow_cost(&self) -> Option<i64> {
        (self.flow_start_time > 0 && self.connection_flow_finish_time >= self.flow_start_time)
            .then(|| self.connection_flow_finish_time - self.flow_start_time)
    }
}

/// Read-only telemetry; nothing here gates control flow.
pub struct SessionStatistics {
    url: String,
    start_time: AtomicI64,
    flow_start_time: AtomicI64,
    cache_verify_time: AtomicI64,
    connection_flow_start_time: AtomicI64,
    connection_connect_time: AtomicI64,
    connection_respond_time: AtomicI64,
    connection_flow_finish_time: AtomicI64,
    last_diff_callback_time: AtomicI64,
    is_direct_address: AtomicBool,
    original_mode: AtomicI32,
    final_mode: AtomicI32,
}

impl SessionStatistics {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            start_time: AtomicI64::new(0),
            flow_start_time: AtomicI64::new(0),
            cache_verify_time: AtomicI64::new(0),
            connection_flow_start_time: AtomicI64::new(0),
            connection_connect_time: AtomicI64::new(0),
            connection_respond_time: AtomicI64::new(0),
            connection_flow_finish_time: AtomicI64::new(0),
            last_diff_callback_time: AtomicI64::new(0),
            is_direct_address: AtomicBool::new(false),
            original_mode: AtomicI32::new(-1),
            final_mode: AtomicI32::new(-1),
        }
    }

    pub fn record_start(&self) {
        self.start_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_flow_start(&self) {
        self.flow_start_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_cache_verify(&self) {
        self.cache_verify_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_connection_flow_start(&self) {
        self.connection_flow_start_time
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_connection_connect(&self) {
        self.connection_connect_time
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_connection_respond(&self) {
        self.connection_respond_time
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_connection_flow_finish(&self) {
        self.connection_flow_finish_time
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn set_direct_address(&self, direct: bool) {
        self.is_direct_address.store(direct, Ordering::Relaxed);
    }

    pub fn record_modes(&self, original: i32, final_mode: i32) {
        self.original_mode.store(original, Ordering::Relaxed);
        self.final_mode.store(final_mode, Ordering::Relaxed);
    }

    pub fn last_diff_callback_time(&self) -> i64 {
        self.last_diff_callback_time.load(Ordering::Relaxed)
    }

    pub fn set_last_diff_callback_time(&self, at: i64) {
        self.last_diff_callback_time.store(at, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            url: self.url.clone(),
            start_time: self.start_time.load(Ordering::Relaxed),
            flow_start_time: self.flow_start_time.load(Ordering::Relaxed),
            cache_verify_time: self.cache_verify_time.load(Ordering::Relaxed),
            connection_flow_start_time: self.connection_flow_start_time.load(Ordering::Relaxed),
            connection_connect_time: self.connection_connect_time.load(Ordering::Relaxed),
            connection_respond_time: self.connection_respond_time.load(Ordering::Relaxed),
            connection_flow_finish_time: self.connection_flow_finish_time.load(Ordering::Relaxed),
            last_diff_callback_time: self.last_diff_callback_time.load(Ordering::Relaxed),
            is_direct_address: self.is_direct_address.load(Ordering::Relaxed),
            original_mode: self.original_mode.load(Ordering::Relaxed),
            final_mode: self.final_mode.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = SessionStatistics::new("https://a.com/");
        let empty = stats.snapshot();
        assert_eq!(empty.original_mode, -1);
        assert!(empty.flow_cost().is_none());

        stats.record_flow_start();
        stats.record_connection_flow_finish();
        stats.set_direct_address(true);
        stats.record_modes(1000, 304);

        let snap = stats.snapshot();
        assert_eq!(snap.url, "https://a.com/");
        assert!(snap.is_direct_address);
        assert_eq!((snap.original_mode, snap.final_mode), (1000, 304));
        assert!(snap.flow_cost().unwrap() >= 0);
    }
}
