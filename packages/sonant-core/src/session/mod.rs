//! Per-call session state.
//!
//! A [`Session`] bridges one carrier call to one model RPC stream. All
//! of its mutable state (queue, flags, handler map) is guarded by short
//! critical sections so the carrier reader, the RPC writer, the RPC
//! reader and the framer timer can touch it without ordering surprises;
//! across sessions everything is independent.

pub mod dispatcher;
pub mod events;
pub mod registry;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::InferenceConfig;
use crate::protocol_constants::SUBJECT_CHANNEL_CAPACITY;
use events::{EventType, SessionEvent};

/// Handler invoked for a dispatched event. Panics are caught by the
/// dispatcher, logged, and swallowed.
pub type EventHandler = Box<dyn Fn(&Value) + Send + Sync>;

/// Phase of an active session's conversation with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePhase {
    /// Start events are being emitted; audio must wait.
    SendingPromptStart,
    /// Carrier audio is flowing into the RPC.
    StreamingAudio,
    /// Carrier said stop; waiting for the model to finish responding.
    AwaitingCompletion,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active(ActivePhase),
    Closing,
    Closed,
}

/// Per-call bridge context.
pub struct Session {
    id: String,
    prompt_name: String,
    audio_content_name: String,
    inference: InferenceConfig,
    state: Mutex<SessionState>,
    active: AtomicBool,
    prompt_start_sent: AtomicBool,
    audio_content_start_sent: AtomicBool,
    waiting_for_response: AtomicBool,
    queue: Mutex<VecDeque<Vec<u8>>>,
    max_queue: usize,
    dropped_events: AtomicU64,
    queue_signal: Notify,
    close_signal: CancellationToken,
    subject: broadcast::Sender<SessionEvent>,
    handlers: Mutex<HashMap<EventType, EventHandler>>,
    any_handler: Mutex<Option<EventHandler>>,
    last_activity: Mutex<Instant>,
    stream_taken: AtomicBool,
    marked_for_cleanup: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session for a carrier call. Prompt and audio-content
    /// identifiers are freshly generated.
    pub fn new(id: impl Into<String>, inference: InferenceConfig, max_queue: usize) -> Arc<Self> {
        let (subject, _) = broadcast::channel(SUBJECT_CHANNEL_CAPACITY);
        Arc::new(Self {
            id: id.into(),
            prompt_name: Uuid::new_v4().to_string(),
            audio_content_name: Uuid::new_v4().to_string(),
            inference,
            state: Mutex::new(SessionState::Created),
            active: AtomicBool::new(false),
            prompt_start_sent: AtomicBool::new(false),
            audio_content_start_sent: AtomicBool::new(false),
            waiting_for_response: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            max_queue,
            dropped_events: AtomicU64::new(0),
            queue_signal: Notify::new(),
            close_signal: CancellationToken::new(),
            subject,
            handlers: Mutex::new(HashMap::new()),
            any_handler: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            stream_taken: AtomicBool::new(false),
            marked_for_cleanup: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt_name(&self) -> &str {
        &self.prompt_name
    }

    pub fn audio_content_name(&self) -> &str {
        &self.audio_content_name
    }

    pub fn inference(&self) -> &InferenceConfig {
        &self.inference
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_waiting_for_response(&self) -> bool {
        self.waiting_for_response.load(Ordering::SeqCst)
    }

    pub fn set_waiting_for_response(&self, waiting: bool) {
        self.waiting_for_response.store(waiting, Ordering::SeqCst);
    }

    /// Events dropped from the inbound queue due to the bound.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Carrier `start` arrived: enters Active and queues the model start
    /// sequence (`sessionStart` → `promptStart` → `contentStart`).
    ///
    /// The guard flags are set before any audio can be enqueued; calling
    /// this twice is a no-op.
    pub fn activate(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SessionState::Active(ActivePhase::SendingPromptStart);

        self.enqueue_event(events::session_start(&self.inference));
        self.enqueue_event(events::prompt_start(&self.prompt_name, &self.inference));
        self.prompt_start_sent.store(true, Ordering::SeqCst);
        self.enqueue_event(events::content_start(
            &self.prompt_name,
            &self.audio_content_name,
        ));
        self.audio_content_start_sent.store(true, Ordering::SeqCst);

        *self.state.lock() = SessionState::Active(ActivePhase::StreamingAudio);
        log::info!("[Session] Activated: id={}", self.id);
    }

    /// Carrier `stop` arrived: streaming is done but the model may still
    /// be responding.
    pub fn await_completion(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Active(_)) {
            *state = SessionState::Active(ActivePhase::AwaitingCompletion);
        }
    }

    /// Begins teardown: queues the terminal event sequence best-effort,
    /// then fires the close signal exactly once. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.active.store(false, Ordering::SeqCst);

        // Terminal events go out before the signal so a live reader can
        // still drain them.
        if self.audio_content_start_sent.load(Ordering::SeqCst) {
            self.push_raw(events::content_end(
                &self.prompt_name,
                &self.audio_content_name,
            ));
        }
        if self.prompt_start_sent.load(Ordering::SeqCst) {
            self.push_raw(events::prompt_end(&self.prompt_name));
        }
        self.push_raw(events::session_end());

        self.close_signal.cancel();
        log::info!("[Session] Closing: id={}", self.id);
    }

    /// Marks teardown complete.
    pub fn finish_closed(&self) {
        *self.state.lock() = SessionState::Closed;
    }

    /// Token observed by every cooperative reader tied to this session.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.close_signal.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_signal.is_cancelled()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound Event Queue
    // ─────────────────────────────────────────────────────────────────────

    /// Queues an event for the model while the session accepts input.
    pub fn enqueue_event(&self, event: Value) {
        if self.close_signal.is_cancelled() {
            log::debug!("[Session] Dropping event after close: id={}", self.id);
            return;
        }
        self.push_raw(event);
    }

    /// Queues base64 PCM as an `audioInput` event.
    ///
    /// Requires the start-event guards; audio arriving before `start`
    /// processing completes is dropped rather than reordered.
    pub fn enqueue_audio(&self, base64_pcm: &str) {
        if !self.prompt_start_sent.load(Ordering::SeqCst)
            || !self.audio_content_start_sent.load(Ordering::SeqCst)
        {
            log::warn!(
                "[Session] Audio before start events, dropping: id={}",
                self.id
            );
            return;
        }
        self.enqueue_event(events::audio_input(
            &self.prompt_name,
            &self.audio_content_name,
            base64_pcm,
        ));
        self.set_waiting_for_response(true);
    }

    fn push_raw(&self, event: Value) {
        let bytes = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!(
                    "[Session] Event serialization failed: id={}, error={}",
                    self.id,
                    err
                );
                serde_json::to_vec(&events::synthetic_error(&err.to_string()))
                    .unwrap_or_else(|_| br#"{"event":{"error":{"reason":"serialization"}}}"#.to_vec())
            }
        };

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_queue {
                queue.pop_front();
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[Session] Inbound queue full, dropped oldest: id={}",
                    self.id
                );
            }
            queue.push_back(bytes);
        }
        self.queue_signal.notify_one();
        self.touch();
    }

    /// Current inbound queue depth.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Takes the lazy inbound event sequence.
    ///
    /// Each item is the UTF-8 JSON of the next queued event. The
    /// sequence drains the queue, waits on the queue signal, and
    /// terminates once the close signal has fired and the queue is
    /// empty. It can be taken exactly once; later calls return `None`.
    pub fn take_event_stream(self: &Arc<Self>) -> Option<impl Stream<Item = Vec<u8>>> {
        if self.stream_taken.swap(true, Ordering::SeqCst) {
            log::warn!(
                "[Session] Event stream already taken: id={}",
                self.id
            );
            return None;
        }

        let session = Arc::clone(self);
        Some(async_stream::stream! {
            loop {
                let next = session.queue.lock().pop_front();
                if let Some(bytes) = next {
                    yield bytes;
                    continue;
                }
                if session.close_signal.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = session.queue_signal.notified() => {}
                    _ = session.close_signal.cancelled() => {}
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subject & Handlers
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribes to the session's broadcast subject.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.subject.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // After close the subject emits nothing further.
        if self.close_signal.is_cancelled() {
            return;
        }
        let _ = self.subject.send(event);
    }

    /// Registers the at-most-one handler for an event type, replacing
    /// any previous one.
    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(event_type, Box::new(handler));
    }

    /// Registers the catch-all handler invoked after the typed handler.
    pub fn register_any_handler(&self, handler: impl Fn(&Value) + Send + Sync + 'static) {
        *self.any_handler.lock() = Some(Box::new(handler));
    }

    pub(crate) fn with_handler<R>(
        &self,
        event_type: &EventType,
        f: impl FnOnce(Option<&EventHandler>) -> R,
    ) -> R {
        let handlers = self.handlers.lock();
        f(handlers.get(event_type))
    }

    pub(crate) fn with_any_handler<R>(&self, f: impl FnOnce(Option<&EventHandler>) -> R) -> R {
        let any = self.any_handler.lock();
        f(any.as_ref())
    }

    /// Drops every registered handler. Called by the registry on remove.
    pub fn clear_handlers(&self) {
        self.handlers.lock().clear();
        *self.any_handler.lock() = None;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activity Tracking
    // ─────────────────────────────────────────────────────────────────────

    /// Records activity for the idle sweeps.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the session last saw activity.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn mark_for_cleanup(&self) {
        self.marked_for_cleanup.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_marked_for_cleanup(&self) -> bool {
        self.marked_for_cleanup.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_session() -> Arc<Session> {
        Session::new("CAtest", InferenceConfig::default(), 200)
    }

    fn queued_event_names(session: &Arc<Session>) -> Vec<String> {
        session
            .queue
            .lock()
            .iter()
            .map(|bytes| {
                let value: Value = serde_json::from_slice(bytes).expect("queued event is JSON");
                value["event"]
                    .as_object()
                    .expect("envelope")
                    .keys()
                    .next()
                    .expect("single key")
                    .clone()
            })
            .collect()
    }

    #[test]
    fn identifiers_are_generated_and_distinct() {
        let a = test_session();
        let b = test_session();
        assert_ne!(a.prompt_name(), b.prompt_name());
        assert_ne!(a.audio_content_name(), b.audio_content_name());
    }

    #[test]
    fn activate_queues_start_sequence_in_order() {
        let session = test_session();
        session.activate();
        assert_eq!(
            queued_event_names(&session),
            vec!["sessionStart", "promptStart", "contentStart"]
        );
        assert_eq!(
            session.state(),
            SessionState::Active(ActivePhase::StreamingAudio)
        );
    }

    #[test]
    fn activate_is_idempotent() {
        let session = test_session();
        session.activate();
        session.activate();
        assert_eq!(session.queue_len(), 3);
    }

    #[test]
    fn audio_before_activation_is_dropped() {
        let session = test_session();
        session.enqueue_audio("QUJD");
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn audio_after_activation_is_queued_fifo() {
        let session = test_session();
        session.activate();
        session.enqueue_audio("AAAA");
        session.enqueue_audio("BBBB");
        let names = queued_event_names(&session);
        assert_eq!(names[3], "audioInput");
        assert_eq!(names[4], "audioInput");
        assert!(session.is_waiting_for_response());
    }

    #[test]
    fn queue_bound_drops_oldest() {
        let session = Session::new("CAtest", InferenceConfig::default(), 5);
        session.activate(); // 3 events
        for i in 0..5 {
            session.enqueue_event(serde_json::json!({ "event": { "n": i } }));
        }
        assert_eq!(session.queue_len(), 5);
        assert_eq!(session.dropped_events(), 3);
        // The start events were the oldest and got displaced.
        assert_eq!(queued_event_names(&session)[0], "n");
    }

    #[test]
    fn close_queues_terminal_events_and_fires_signal_once() {
        let session = test_session();
        session.activate();
        session.close();
        session.close();

        let names = queued_event_names(&session);
        assert_eq!(
            &names[names.len() - 3..],
            &["contentEnd", "promptEnd", "sessionEnd"]
        );
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn events_after_close_are_dropped() {
        let session = test_session();
        session.activate();
        session.close();
        let depth = session.queue_len();
        session.enqueue_event(serde_json::json!({ "event": { "late": {} } }));
        assert_eq!(session.queue_len(), depth);
    }

    #[test]
    fn close_without_activation_skips_content_events() {
        let session = test_session();
        session.close();
        assert_eq!(queued_event_names(&session), vec!["sessionEnd"]);
    }

    #[tokio::test]
    async fn event_stream_yields_fifo_then_terminates_on_close() {
        let session = test_session();
        session.activate();
        session.enqueue_audio("QUJD");

        let stream = session.take_event_stream().expect("first take succeeds");
        tokio::pin!(stream);

        let mut names = Vec::new();
        for _ in 0..4 {
            let bytes = stream.next().await.expect("queued item");
            let value: Value = serde_json::from_slice(&bytes).expect("json");
            names.push(
                value["event"]
                    .as_object()
                    .expect("envelope")
                    .keys()
                    .next()
                    .expect("single key")
                    .clone(),
            );
        }
        assert_eq!(
            names,
            vec!["sessionStart", "promptStart", "contentStart", "audioInput"]
        );

        session.close();
        // Terminal events drain, then the sequence ends.
        let mut terminal = Vec::new();
        while let Some(bytes) = stream.next().await {
            let value: Value = serde_json::from_slice(&bytes).expect("json");
            terminal.push(
                value["event"]
                    .as_object()
                    .expect("envelope")
                    .keys()
                    .next()
                    .expect("single key")
                    .clone(),
            );
        }
        assert_eq!(terminal, vec!["contentEnd", "promptEnd", "sessionEnd"]);
    }

    #[test]
    fn event_stream_can_only_be_taken_once() {
        let session = test_session();
        assert!(session.take_event_stream().is_some());
        assert!(session.take_event_stream().is_none());
    }

    #[test]
    fn subject_emits_nothing_after_close() {
        let session = test_session();
        let mut rx = session.subscribe();
        session.close();
        session.publish(SessionEvent {
            event_type: EventType::TextOutput,
            data: serde_json::json!({}),
        });
        assert!(rx.try_recv().is_err());
    }
}
