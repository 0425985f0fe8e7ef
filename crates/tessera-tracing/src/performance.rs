//! Timing helpers for build and execute stages.
//!
//! ```rust
//! use tessera_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! {
//!     let _span = PerformanceSpan::new("partition", Some(100));
//!     // ... work ...
//! } // reported only if it took at least 100us
//!
//! record_transfer(4096, "H2D", 25);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Apply process-wide performance settings. Called by
/// [`crate::init_global_tracing`].
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(0), Ordering::Relaxed);
}

/// Whether performance spans currently report anything.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// RAII guard that reports its own duration when dropped.
///
/// A span is silent when performance tracing is disabled or when it
/// finishes faster than both its own threshold and the global one.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing `name`. `threshold_us = None` reports every duration.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start timing `name` inside a span at `level`.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span started.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying tracing span.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    fn should_report(&self, elapsed_us: u64) -> bool {
        if !is_enabled() {
            return false;
        }
        let threshold = self
            .threshold_us
            .unwrap_or(0)
            .max(GLOBAL_THRESHOLD_US.load(Ordering::Relaxed));
        elapsed_us >= threshold
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.should_report(elapsed_us) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a host/device copy with its bandwidth.
///
/// `direction` is `"H2D"` or `"D2H"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record one kernel launch with its element throughput.
pub fn record_kernel(operation: &str, elements: usize, duration_us: u64) {
    let elements_per_sec = if duration_us > 0 {
        (elements as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "kernel",
        operation = operation,
        elements = elements,
        duration_us = duration_us,
        elements_per_sec = elements_per_sec,
        "kernel_complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("partition", Some(1000));
        assert_eq!(span.name(), "partition");
        assert_eq!(span.threshold_us, Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_transfer(4096, "H2D", 0);
        record_transfer(4096, "D2H", 10);
        record_kernel("relu", 1024, 0);
        record_kernel("relu", 1024, 3);
    }
}
