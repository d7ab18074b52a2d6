//! Timer-driven outbound transmitter.
//!
//! The framer owns the jitter buffer and two cooperative tasks: a
//! metronome that lifts one frame per tick out of the ring into the send
//! queue, and a pump that drains the queue toward the carrier socket in
//! small batches, honoring socket backpressure. Both tasks die with the
//! session's cancellation token and never outlive teardown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{interval, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::AudioConfig;
use crate::pool::BufferPool;
use crate::protocol_constants::{
    MULAW_SILENCE, SEND_LATENCY_LOG_THRESHOLD_MS, SEND_PUMP_BATCH, SEND_QUEUE_DEPTH,
    TICK_DELAY_LOG_THRESHOLD_MS, UNDERRUN_LEVEL,
};
use crate::quality::QualitySink;
use crate::stream::jitter::JitterBuffer;
use crate::stream::{completion_mark_name, CarrierOutgoing, CarrierSink, MarkPayload, MediaPayload, SocketState};

/// A framed message waiting on the send queue.
struct QueuedFrame {
    message: CarrierOutgoing,
    seq: u64,
    enqueued_at: TokioInstant,
}

/// Delivery counters, exposed through the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FramerStats {
    pub frames_sent: u64,
    pub send_errors: u64,
    pub queue_overruns: u64,
}

/// Timer-driven transmitter pairing a [`JitterBuffer`] with a carrier
/// socket.
pub struct OutboundFramer {
    session_id: String,
    sink: Arc<dyn CarrierSink>,
    jitter: Mutex<JitterBuffer>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    pump_wakeup: Notify,
    active: AtomicBool,
    /// Set by the complete-buffer entry point: once the ring drains,
    /// flush and send the completion mark.
    drain_then_complete: AtomicBool,
    mark_sent: AtomicBool,
    timer_token: Mutex<Option<CancellationToken>>,
    frame_size: usize,
    interval_ms: u64,
    buffered_amount_threshold: usize,
    pool: Arc<BufferPool>,
    quality: Arc<dyn QualitySink>,
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    queue_overruns: AtomicU64,
}

impl OutboundFramer {
    pub fn new(
        session_id: String,
        sink: Arc<dyn CarrierSink>,
        audio: &AudioConfig,
        pool: Arc<BufferPool>,
        quality: Arc<dyn QualitySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            sink,
            jitter: Mutex::new(JitterBuffer::new(audio.frame_size, audio.max_buffer_bytes())),
            queue: Mutex::new(VecDeque::with_capacity(SEND_QUEUE_DEPTH)),
            pump_wakeup: Notify::new(),
            active: AtomicBool::new(false),
            drain_then_complete: AtomicBool::new(false),
            mark_sent: AtomicBool::new(false),
            timer_token: Mutex::new(None),
            frame_size: audio.frame_size,
            interval_ms: audio.interval_ms,
            buffered_amount_threshold: audio.buffered_amount_threshold,
            pool,
            quality,
            frames_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            queue_overruns: AtomicU64::new(0),
        })
    }

    /// Queues model audio for paced delivery, starting the timer on the
    /// first chunk.
    pub fn add_audio(self: &Arc<Self>, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(level) = self.jitter.lock().push(bytes) {
            self.quality.buffer_overrun(&self.session_id, level);
        }
        self.ensure_started();
    }

    /// Streams a complete buffer: paces it out frame by frame, then sends
    /// the completion mark once the source is exhausted.
    pub fn stream_buffer(self: &Arc<Self>, bytes: &[u8]) {
        self.drain_then_complete.store(true, Ordering::SeqCst);
        self.add_audio(bytes);
    }

    /// Whether the timer is currently running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> FramerStats {
        FramerStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            queue_overruns: self.queue_overruns.load(Ordering::Relaxed),
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.timer_token.lock() = Some(token.clone());

        let timer = Arc::clone(self);
        let timer_cancel = token.clone();
        tokio::spawn(async move { timer.timer_loop(timer_cancel).await });

        let pump = Arc::clone(self);
        tokio::spawn(async move { pump.pump_loop(token).await });
    }

    async fn timer_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(self.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        // interval's first tick completes immediately; the first frame
        // belongs one full interval after start.
        ticker.tick().await;

        let mut last_tick: Option<TokioInstant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = TokioInstant::now();
                    if let Some(prev) = last_tick {
                        let gap_ms = now.duration_since(prev).as_millis() as u64;
                        if gap_ms > self.interval_ms + TICK_DELAY_LOG_THRESHOLD_MS {
                            log::debug!(
                                "[Framer] Tick delayed: session={}, gap={}ms, nominal={}ms",
                                self.session_id,
                                gap_ms,
                                self.interval_ms
                            );
                            self.quality.delayed_tick(&self.session_id, gap_ms - self.interval_ms);
                        }
                    }
                    last_tick = Some(now);

                    if !self.on_tick() {
                        break;
                    }
                }
            }
        }
    }

    /// One metronome tick. Returns false when the timer should stop.
    fn on_tick(&self) -> bool {
        if self.sink.state() != SocketState::Open {
            log::debug!(
                "[Framer] Socket no longer open, stopping: session={}",
                self.session_id
            );
            self.stop("socket not open");
            return false;
        }

        let mut jitter = self.jitter.lock();
        if !jitter.has_frame() {
            if self.drain_then_complete.load(Ordering::SeqCst) {
                drop(jitter);
                self.flush();
                return false;
            }
            if !jitter.is_empty() && jitter.level() < UNDERRUN_LEVEL {
                self.quality.buffer_underrun(&self.session_id, jitter.level());
            }
            drop(jitter);
            // Keep the pump moving on anything still queued.
            if !self.queue.lock().is_empty() {
                self.pump_wakeup.notify_one();
            }
            return true;
        }

        let mut frame = self.pool.acquire(self.frame_size);
        let popped = jitter.pop_frame(&mut frame);
        drop(jitter);
        debug_assert!(popped);

        self.enqueue_frame(&frame);
        self.pool.release(frame);
        self.pump_wakeup.notify_one();
        true
    }

    /// Frames μ-law bytes into a `media` message on the send queue.
    fn enqueue_frame(&self, frame: &[u8]) {
        let Some(stream_sid) = self.sink.stream_sid() else {
            log::warn!(
                "[Framer] No stream id on socket, dropping frame: session={}",
                self.session_id
            );
            return;
        };

        let seq = self.sink.next_sequence();
        let message = CarrierOutgoing::Media {
            stream_sid,
            sequence_number: seq.to_string(),
            media: MediaPayload {
                payload: BASE64.encode(frame),
            },
        };

        let mut queue = self.queue.lock();
        if queue.len() >= SEND_QUEUE_DEPTH {
            queue.pop_front();
            self.queue_overruns.fetch_add(1, Ordering::Relaxed);
            self.quality.queue_overrun(&self.session_id);
        }
        queue.push_back(QueuedFrame {
            message,
            seq,
            enqueued_at: TokioInstant::now(),
        });
    }

    async fn pump_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.pump_wakeup.notified() => {}
            }

            'drain: loop {
                let mut skipped = false;
                let mut processed = 0;
                while processed < SEND_PUMP_BATCH {
                    if self.sink.state() != SocketState::Open
                        || self.sink.buffered_amount() > self.buffered_amount_threshold
                    {
                        // Transient: leave the records queued for a later turn.
                        skipped = true;
                        break;
                    }
                    let Some(record) = self.queue.lock().pop_front() else {
                        break;
                    };
                    self.deliver(record);
                    processed += 1;
                }

                tokio::task::yield_now().await;
                if skipped || self.queue.lock().is_empty() {
                    break 'drain;
                }
            }
        }
    }

    fn deliver(&self, record: QueuedFrame) {
        let latency_ms = record.enqueued_at.elapsed().as_millis() as u64;
        if latency_ms > SEND_LATENCY_LOG_THRESHOLD_MS {
            log::debug!(
                "[Framer] Queue latency {}ms: session={}, seq={}",
                latency_ms,
                self.session_id,
                record.seq
            );
        }

        match self.sink.send(record.message) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.quality.frame_sent(&self.session_id, record.seq);
            }
            Err(err) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                self.quality.send_error(&self.session_id);
                log::warn!(
                    "[Framer] Send failed: session={}, seq={}, error={}",
                    self.session_id,
                    record.seq,
                    err
                );
            }
        }
    }

    /// Synchronously emits everything buffered: queued records first,
    /// then remaining complete frames, then a final frame padded with
    /// μ-law silence, then the completion mark. Zeroes the ring and
    /// stops the timer.
    pub fn flush(&self) {
        let queued: Vec<QueuedFrame> = self.queue.lock().drain(..).collect();
        for record in queued {
            self.deliver(record);
        }

        let mut jitter = self.jitter.lock();
        let mut frame = self.pool.acquire(self.frame_size);
        while jitter.pop_frame(&mut frame) {
            self.enqueue_direct(&frame);
        }
        let partial = jitter.drain_partial(&mut frame);
        if partial > 0 {
            frame[partial..].fill(MULAW_SILENCE);
            self.enqueue_direct(&frame);
        }
        jitter.clear();
        drop(jitter);
        self.pool.release(frame);

        self.send_completion_mark();
        self.stop_timer();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Builds and delivers a frame immediately, bypassing the queue.
    fn enqueue_direct(&self, frame: &[u8]) {
        let Some(stream_sid) = self.sink.stream_sid() else {
            return;
        };
        let seq = self.sink.next_sequence();
        let message = CarrierOutgoing::Media {
            stream_sid,
            sequence_number: seq.to_string(),
            media: MediaPayload {
                payload: BASE64.encode(frame),
            },
        };
        self.deliver(QueuedFrame {
            message,
            seq,
            enqueued_at: TokioInstant::now(),
        });
    }

    /// Stops the framer: clears the timer, empties the send queue, sends
    /// the completion mark when the socket still allows it, and marks the
    /// framer inactive.
    pub fn stop(&self, reason: &str) {
        log::debug!(
            "[Framer] Stopping: session={}, reason={}",
            self.session_id,
            reason
        );
        self.stop_timer();
        self.queue.lock().clear();
        self.send_completion_mark();
        self.jitter.lock().clear();
        self.active.store(false, Ordering::SeqCst);
    }

    fn stop_timer(&self) {
        if let Some(token) = self.timer_token.lock().take() {
            token.cancel();
        }
    }

    /// Sends the completion mark at most once per lifecycle, and only
    /// while the socket is open with a known stream identifier.
    fn send_completion_mark(&self) {
        if self.sink.state() != SocketState::Open {
            return;
        }
        let Some(stream_sid) = self.sink.stream_sid() else {
            return;
        };
        if self.mark_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = CarrierOutgoing::Mark {
            stream_sid,
            mark: MarkPayload {
                name: completion_mark_name(),
            },
        };
        if let Err(err) = self.sink.send(message) {
            log::debug!(
                "[Framer] Completion mark not delivered: session={}, error={}",
                self.session_id,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPoolConfig;
    use crate::pool::NoPressure;
    use crate::protocol_constants::COMPLETION_MARK_PREFIX;
    use crate::quality::testing::CountingQualitySink;
    use crate::stream::testing::MockCarrierSink;
    use tokio::time::{self, Duration};

    fn test_framer(
        sink: Arc<MockCarrierSink>,
        quality: Arc<CountingQualitySink>,
    ) -> Arc<OutboundFramer> {
        OutboundFramer::new(
            "CAtest".to_string(),
            sink,
            &AudioConfig::default(),
            Arc::new(BufferPool::new(BufferPoolConfig::default(), Arc::new(NoPressure))),
            quality,
        )
    }

    /// Advances the paused clock one tick at a time so interval timers
    /// and the pump get scheduled between steps.
    async fn advance_ms(ms: u64) {
        let step = Duration::from_millis(1);
        for _ in 0..ms {
            time::advance(step).await;
            tokio::task::yield_now().await;
        }
        // Let the pump's post-batch yield run.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_emit_at_cadence_with_monotonic_sequences() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), quality);

        framer.stream_buffer(&[0x55u8; 320]);

        advance_ms(20).await;
        assert_eq!(sink.media_count(), 1, "one frame at t=20ms");
        assert_eq!(sink.media_sequences(), vec![1]);

        advance_ms(20).await;
        assert_eq!(sink.media_count(), 2, "second frame at t=40ms");
        assert_eq!(sink.media_sequences(), vec![1, 2]);
        assert!(sink.mark_names().is_empty(), "no mark while audio remains");

        advance_ms(20).await;
        assert_eq!(sink.media_count(), 2, "no media at t=60ms");
        let marks = sink.mark_names();
        assert_eq!(marks.len(), 1, "completion mark after source exhausted");
        assert!(marks[0].starts_with(COMPLETION_MARK_PREFIX));
        assert!(!framer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_defers_send_until_buffer_drains() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), quality);

        sink.set_buffered_amount(100_000);
        framer.add_audio(&[0x11u8; 160]);

        advance_ms(20).await;
        assert_eq!(sink.media_count(), 0, "backpressure blocks the send");

        sink.set_buffered_amount(1_000);
        advance_ms(20).await;
        assert_eq!(sink.media_count(), 1, "queued frame goes out next tick");
    }

    #[tokio::test(start_paused = true)]
    async fn socket_close_stops_timer_without_mark() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), quality);

        framer.add_audio(&[0x22u8; 480]);

        advance_ms(20).await;
        assert_eq!(sink.media_count(), 1);

        sink.set_state(SocketState::Closed);
        advance_ms(40).await;
        assert_eq!(sink.media_count(), 1, "no frames after close");
        assert!(sink.mark_names().is_empty(), "no mark on closed socket");
        assert!(!framer.is_active(), "timer released");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_pads_partial_frame_with_mulaw_silence() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), quality);

        // 400 bytes: 2 complete frames + 80-byte remainder.
        framer.add_audio(&[0x33u8; 400]);
        advance_ms(40).await;
        assert_eq!(sink.media_count(), 2);

        framer.flush();
        assert_eq!(sink.media_count(), 3, "flush emits the padded remainder");

        let bytes = sink.media_bytes();
        assert_eq!(bytes.len(), 480);
        assert!(bytes[..400].iter().all(|&b| b == 0x33));
        assert!(bytes[400..].iter().all(|&b| b == 0xFF), "0xFF padding");

        assert_eq!(sink.mark_names().len(), 1);
        assert_eq!(sink.media_sequences(), vec![1, 2, 3], "gap-free sequences");
    }

    #[tokio::test(start_paused = true)]
    async fn mark_is_sent_at_most_once() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), quality);

        framer.add_audio(&[0x44u8; 160]);
        advance_ms(20).await;

        framer.flush();
        framer.stop("test");
        framer.flush();
        assert_eq!(sink.mark_names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_reports_overrun_and_keeps_newest() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), Arc::clone(&quality));

        // Default window is 1600 bytes; 2000 bytes overflows by 400.
        framer.add_audio(&[0x01u8; 1600]);
        framer.add_audio(&[0x02u8; 400]);
        assert_eq!(
            quality.overruns.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // Drain fully: 10 frames, ending in the newest bytes.
        advance_ms(220).await;
        let bytes = sink.media_bytes();
        assert_eq!(bytes.len(), 1600);
        assert!(bytes[1200..].iter().all(|&b| b == 0x02));
    }

    #[tokio::test(start_paused = true)]
    async fn underrun_observation_below_ten_percent() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), Arc::clone(&quality));

        // 100 bytes: below one frame and below 10% of 1600.
        framer.add_audio(&[0x09u8; 100]);
        advance_ms(20).await;
        assert!(quality.underruns.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert_eq!(sink.media_count(), 0, "no short frame is ever sent");
    }

    #[tokio::test(start_paused = true)]
    async fn send_queue_drops_oldest_past_depth() {
        let sink = Arc::new(MockCarrierSink::new());
        let quality = Arc::new(CountingQualitySink::default());
        let framer = test_framer(Arc::clone(&sink), Arc::clone(&quality));

        // Stall the pump so the queue can only fill.
        sink.set_buffered_amount(100_000);
        // 15 frames framed at 20ms cadence against depth 10.
        for _ in 0..15 {
            framer.add_audio(&[0x0Au8; 160]);
            advance_ms(20).await;
        }

        assert_eq!(
            framer.stats().queue_overruns, 5,
            "queue depth 10 drops 5 oldest of 15"
        );

        sink.set_buffered_amount(0);
        advance_ms(100).await;
        let seqs = sink.media_sequences();
        assert_eq!(seqs.len(), 10);
        assert_eq!(seqs, (6..=15).collect::<Vec<u64>>(), "oldest dropped");
    }
}
