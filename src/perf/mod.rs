//! Performance Counters
//!
//! Frame accounting per component (dispatcher, grabber pool), published
//! as one log line per component per report interval.

use std::collections::HashMap;

use log::info;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

const DEFAULT_REPORT_INTERVAL_MS: i64 = 60_000;

#[derive(Default, Clone)]
struct Counter {
    written: u64,
    incoming: u64,
    dropped: u64,
    begin_ms: i64,
}

pub struct PerformanceCounters {
    interval_ms: i64,
    counters: Mutex<HashMap<String, Counter>>,
}

impl PerformanceCounters {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_incoming(&self, component: &str) {
        self.counters
            .lock()
            .entry(component.to_string())
            .or_default()
            .incoming += 1;
    }

    pub fn record_written(&self, component: &str) {
        self.counters
            .lock()
            .entry(component.to_string())
            .or_default()
            .written += 1;
    }

    pub fn record_dropped(&self, component: &str, count: u64) {
        self.counters
            .lock()
            .entry(component.to_string())
            .or_default()
            .dropped += count;
    }

    /// Publish and reset any counter whose window elapsed. Returns the
    /// components reported (test hook).
    pub fn maybe_report(&self, now_ms: i64) -> Vec<String> {
        let mut reported = Vec::new();
        let mut counters = self.counters.lock();
        for (name, counter) in counters.iter_mut() {
            if counter.begin_ms == 0 {
                counter.begin_ms = now_ms;
                continue;
            }
            let window = now_ms - counter.begin_ms;
            if window >= self.interval_ms {
                let seconds = (window as f64 / 1000.0).max(1e-3);
                info!(
                    "{}: {:.2} Hz over {:.1}s (written: {}, incoming: {}, dropped: {})",
                    name,
                    counter.written as f64 / seconds,
                    seconds,
                    counter.written,
                    counter.incoming,
                    counter.dropped
                );
                reported.push(name.clone());
                *counter = Counter {
                    begin_ms: now_ms,
                    ..Counter::default()
                };
            }
        }
        reported
    }
}

static GLOBAL: OnceCell<PerformanceCounters> = OnceCell::new();

/// Install the process-wide counters. Later calls win nothing: the
/// first initialization sticks.
pub fn init(interval_ms: i64) {
    let _ = GLOBAL.set(PerformanceCounters::new(interval_ms));
}

/// Process-wide counters, created with the default window when `init`
/// was never called (tests, tools).
pub fn global() -> &'static PerformanceCounters {
    GLOBAL.get_or_init(|| PerformanceCounters::new(DEFAULT_REPORT_INTERVAL_MS))
}
