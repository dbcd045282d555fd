//! Metric names shared across crates.
//!
//! Recorded through the `metrics` facade; a binary that wants them exported
//! installs its own recorder.

/// Frames read from the socket (counter).
pub const FRAMES_RECEIVED_TOTAL: &str = "cable_frames_received_total";
/// Data frames dropped by the classifier (counter, labels: reason).
pub const FRAMES_DROPPED_TOTAL: &str = "cable_frames_dropped_total";
/// Frames that failed to decode (counter).
pub const DECODE_ERRORS_TOTAL: &str = "cable_decode_errors_total";
/// Records written to the sink (counter, labels: kind).
pub const RECORDS_EMITTED_TOTAL: &str = "cable_records_emitted_total";
/// Queued records discarded while draining (counter).
pub const RECORDS_DISCARDED_TOTAL: &str = "cable_records_discarded_total";
/// Debounce buckets flushed (counter).
pub const BATCHES_FLUSHED_TOTAL: &str = "cable_batches_flushed_total";
