//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds, so release builds pay nothing for them.

// =============================================================================
// Span timing
// =============================================================================

/// Assert that a span's end timestamp does not precede its start.
///
/// Used in: `Span::finish()`
macro_rules! debug_assert_span_ordered {
    ($start:expr, $end:expr) => {
        debug_assert!(
            $end >= $start,
            "span end {} precedes start {}",
            $end,
            $start
        )
    };
}

// =============================================================================
// Buffer capacity
// =============================================================================

/// Assert that a processor buffer never grows past its capacity.
///
/// Used in: `BatchExportProcessor::enqueue()`
macro_rules! debug_assert_within_capacity {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "buffer length {} exceeds capacity {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// Batch sizing
// =============================================================================

/// Assert that a scheduled (non-final) export respects the batch size limit.
///
/// Used in: the processor worker's size and timer flushes
macro_rules! debug_assert_batch_bounded {
    ($batch_len:expr, $limit:expr) => {
        debug_assert!(
            $batch_len <= $limit,
            "scheduled batch of {} exceeds max_export_batch_size {}",
            $batch_len,
            $limit
        )
    };
}

// =============================================================================
// Counter monotonicity
// =============================================================================

/// Assert that a cumulative counter value never decreases.
///
/// Used in: `Counter::add()`
macro_rules! debug_assert_monotonic {
    ($before:expr, $after:expr) => {
        debug_assert!(
            $after >= $before,
            "counter decreased from {} to {}",
            $before,
            $after
        )
    };
}
