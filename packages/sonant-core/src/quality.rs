//! Quality and observability sink abstraction.
//!
//! Pipeline components report buffer health and delivery accounting
//! through the [`QualitySink`] trait rather than concrete metrics
//! backends, enabling testing and alternative telemetry transports.

/// Trait for reporting per-session audio pipeline observations.
///
/// Implementations must be non-blocking: sinks are called from timer
/// callbacks and the send pump. Cross-session aggregation happens behind
/// the sink, never inside pipeline code.
pub trait QualitySink: Send + Sync {
    /// The jitter buffer discarded its oldest bytes.
    /// `level` is `data_len / max_buffer_bytes` at the time of overflow.
    fn buffer_overrun(&self, session_id: &str, level: f64);

    /// The jitter buffer ran below 10% fill while audio was expected.
    fn buffer_underrun(&self, session_id: &str, level: f64);

    /// A framer tick fired later than the nominal interval allows.
    fn delayed_tick(&self, session_id: &str, skew_ms: u64);

    /// The send queue overflowed and dropped its oldest record.
    fn queue_overrun(&self, session_id: &str);

    /// A media frame was handed to the carrier socket.
    fn frame_sent(&self, session_id: &str, seq: u64);

    /// A carrier send failed.
    fn send_error(&self, session_id: &str);
}

/// No-op sink for tests and minimal deployments.
pub struct NoopQualitySink;

impl QualitySink for NoopQualitySink {
    fn buffer_overrun(&self, _session_id: &str, _level: f64) {}
    fn buffer_underrun(&self, _session_id: &str, _level: f64) {}
    fn delayed_tick(&self, _session_id: &str, _skew_ms: u64) {}
    fn queue_overrun(&self, _session_id: &str) {}
    fn frame_sent(&self, _session_id: &str, _seq: u64) {}
    fn send_error(&self, _session_id: &str) {}
}

/// Logging sink for debugging and development.
///
/// Frame sends log at trace to avoid 50 lines/second per call; health
/// observations log at debug/warn.
pub struct LoggingQualitySink;

impl QualitySink for LoggingQualitySink {
    fn buffer_overrun(&self, session_id: &str, level: f64) {
        log::warn!(
            "[Quality] Buffer overrun: session={}, level={:.2}",
            session_id,
            level
        );
    }

    fn buffer_underrun(&self, session_id: &str, level: f64) {
        log::debug!(
            "[Quality] Buffer underrun: session={}, level={:.2}",
            session_id,
            level
        );
    }

    fn delayed_tick(&self, session_id: &str, skew_ms: u64) {
        log::debug!(
            "[Quality] Delayed tick: session={}, skew={}ms",
            session_id,
            skew_ms
        );
    }

    fn queue_overrun(&self, session_id: &str) {
        log::warn!("[Quality] Send queue overrun: session={}", session_id);
    }

    fn frame_sent(&self, session_id: &str, seq: u64) {
        log::trace!("[Quality] Frame sent: session={}, seq={}", session_id, seq);
    }

    fn send_error(&self, session_id: &str) {
        log::warn!("[Quality] Send error: session={}", session_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Test sink that counts observations.
    #[derive(Default)]
    pub struct CountingQualitySink {
        pub overruns: AtomicU64,
        pub underruns: AtomicU64,
        pub delayed_ticks: AtomicU64,
        pub queue_overruns: AtomicU64,
        pub frames_sent: AtomicU64,
        pub send_errors: AtomicU64,
    }

    impl QualitySink for CountingQualitySink {
        fn buffer_overrun(&self, _session_id: &str, _level: f64) {
            self.overruns.fetch_add(1, Ordering::SeqCst);
        }

        fn buffer_underrun(&self, _session_id: &str, _level: f64) {
            self.underruns.fetch_add(1, Ordering::SeqCst);
        }

        fn delayed_tick(&self, _session_id: &str, _skew_ms: u64) {
            self.delayed_ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn queue_overrun(&self, _session_id: &str) {
            self.queue_overruns.fetch_add(1, Ordering::SeqCst);
        }

        fn frame_sent(&self, _session_id: &str, _seq: u64) {
            self.frames_sent.fetch_add(1, Ordering::SeqCst);
        }

        fn send_error(&self, _session_id: &str) {
            self.send_errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}
