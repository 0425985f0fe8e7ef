//! Macros over [`crate::performance`].
//!
//! They expand to `tracing::` paths, so calling crates depend on `tracing`.

/// Start a [`crate::performance::PerformanceSpan`], optionally inside a span
/// carrying extra fields.
///
/// ```rust
/// use tessera_tracing::perf_span;
///
/// let _span = perf_span!("sub_program_build", index = 2, backend = "host");
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Run a block and return `(result, duration_us)`, logging the duration.
///
/// ```rust
/// use tessera_tracing::timed_block;
///
/// let (sum, duration_us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// # let _ = duration_us;
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(
            operation = $name,
            duration_us = duration_us,
            "timed_block_complete"
        );
        (result, duration_us)
    }};
}
