//! Thread-safe metrics collection system
//!
//! Atomic counters for sessions, routing and the directory, plus
//! mutex-protected dispatch timings and per-operation statistics. Readers see
//! eventually consistent values; only the scheduler worker mutates broker state.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Session metrics
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    handshake_failures: AtomicU64,
    active_sessions: AtomicU64,
    max_active_sessions: AtomicU64,
    disconnects: AtomicU64,

    // Envelope and routing metrics
    envelopes_processed: AtomicU64,
    decode_errors: AtomicU64,
    messages_routed: AtomicU64,
    routing_failures: AtomicU64,
    protocol_errors: AtomicU64,

    // Directory metrics
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    registration_errors: AtomicU64,
    searches: AtomicU64,
    conversations_expired: AtomicU64,

    // Dispatch latency (microseconds)
    dispatch_times: Mutex<Vec<u64>>,

    // Per operation counts
    operation_stats: Mutex<HashMap<String, OperationStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            max_active_sessions: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            envelopes_processed: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            routing_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            unregistrations: AtomicU64::new(0),
            registration_errors: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            conversations_expired: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            operation_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Session metrics
    pub fn session_admitted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let active = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_active_sessions.fetch_max(active, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        // Saturating: a reset between admit and close must not wrap
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    // Envelope and routing metrics
    pub fn envelope_processed(&self, operation: &str, duration: Duration, success: bool) {
        self.envelopes_processed.fetch_add(1, Ordering::Relaxed);
        self.record_dispatch_time(duration);

        if let Ok(mut stats) = self.operation_stats.lock() {
            let entry = stats
                .entry(operation.to_string())
                .or_insert_with(|| OperationStats {
                    name: operation.to_string(),
                    count: 0,
                    failures: 0,
                });
            entry.count += 1;
            if !success {
                entry.failures += 1;
            }
        }
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routing_failed(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Directory metrics
    pub fn registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregistration(&self) {
        self.unregistrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration_failed(&self) {
        self.registration_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversations_expired(&self, count: usize) {
        self.conversations_expired
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_dispatch_time(&self, duration: Duration) {
        if let Ok(mut times) = self.dispatch_times.lock() {
            times.push(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));

            // Keep the last 1000 measurements
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connections_accepted,
            &self.connections_rejected,
            &self.handshake_failures,
            &self.active_sessions,
            &self.max_active_sessions,
            &self.disconnects,
            &self.envelopes_processed,
            &self.decode_errors,
            &self.messages_routed,
            &self.routing_failures,
            &self.protocol_errors,
            &self.registrations,
            &self.unregistrations,
            &self.registration_errors,
            &self.searches,
            &self.conversations_expired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.dispatch_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.operation_stats.lock() {
            stats.clear();
        }
    }

    /// Calculate dispatch time statistics (avg, p50, p95, p99)
    fn dispatch_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.dispatch_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn operation_snapshot(&self) -> HashMap<String, OperationStats> {
        self.operation_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_dispatch_time_us, p50, p95, p99) = self.dispatch_time_statistics();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            sessions: SessionMetrics {
                connections_accepted: load(&self.connections_accepted),
                connections_rejected: load(&self.connections_rejected),
                handshake_failures: load(&self.handshake_failures),
                active_sessions: load(&self.active_sessions),
                max_active_sessions: load(&self.max_active_sessions),
                disconnects: load(&self.disconnects),
            },
            routing: RoutingMetrics {
                envelopes_processed: load(&self.envelopes_processed),
                decode_errors: load(&self.decode_errors),
                messages_routed: load(&self.messages_routed),
                routing_failures: load(&self.routing_failures),
                protocol_errors: load(&self.protocol_errors),
                avg_dispatch_time_us,
                dispatch_time_p50_us: p50,
                dispatch_time_p95_us: p95,
                dispatch_time_p99_us: p99,
                operations: self.operation_snapshot(),
            },
            directory: DirectoryMetrics {
                registrations: load(&self.registrations),
                unregistrations: load(&self.unregistrations),
                registration_errors: load(&self.registration_errors),
                searches: load(&self.searches),
                conversations_expired: load(&self.conversations_expired),
            },
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub name: String,
    pub count: u64,
    pub failures: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub sessions: SessionMetrics,
    pub routing: RoutingMetrics,
    pub directory: DirectoryMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub handshake_failures: u64,
    pub active_sessions: u64,
    pub max_active_sessions: u64,
    pub disconnects: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub envelopes_processed: u64,
    pub decode_errors: u64,
    pub messages_routed: u64,
    pub routing_failures: u64,
    pub protocol_errors: u64,
    pub avg_dispatch_time_us: f64,
    pub dispatch_time_p50_us: f64,
    pub dispatch_time_p95_us: f64,
    pub dispatch_time_p99_us: f64,
    pub operations: HashMap<String, OperationStats>,
}

#[derive(Debug, Serialize)]
pub struct DirectoryMetrics {
    pub registrations: u64,
    pub unregistrations: u64,
    pub registration_errors: u64,
    pub searches: u64,
    pub conversations_expired: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
