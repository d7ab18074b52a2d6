//! Carrier WebSocket handler.
//!
//! Terminates the carrier's media stream socket: validates the upgrade
//! (rate limit, User-Agent), parses carrier control and media frames,
//! creates the per-call session on `start`, feeds `media` frames through
//! the input pipeline, and drives graceful teardown on `stop` or socket
//! close. The registry entry itself is retired by the cleanup sweep, not
//! synchronously.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::AppState;
use crate::audio::input::forward_to_session;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol_constants::{
    ACCEPTED_USER_AGENT_PREFIXES, CALL_SID_LEN, CALL_SID_PREFIX, UPGRADE_RATE_LIMIT_MAX,
    UPGRADE_RATE_LIMIT_WINDOW_SECS, WS_IDLE_CHECK_INTERVAL_SECS,
};
use crate::session::registry::CallRegistry;
use crate::session::Session;
use crate::stream::{CarrierOutgoing, CarrierSink, OutboundFramer, SocketState};

// ─────────────────────────────────────────────────────────────────────────────
// Upgrade Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Rolling-window connection rate limiter keyed by remote address.
pub struct UpgradeRateLimiter {
    attempts: DashMap<IpAddr, Mutex<Vec<Instant>>>,
}

impl UpgradeRateLimiter {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
        }
    }

    /// Records an attempt and enforces the window.
    pub fn check(&self, remote: IpAddr) -> BridgeResult<()> {
        let window = Duration::from_secs(UPGRADE_RATE_LIMIT_WINDOW_SECS);
        let entry = self.attempts.entry(remote).or_insert_with(|| Mutex::new(Vec::new()));
        let mut attempts = entry.lock();
        attempts.retain(|at| at.elapsed() < window);
        if attempts.len() >= UPGRADE_RATE_LIMIT_MAX {
            return Err(BridgeError::RateLimited);
        }
        attempts.push(Instant::now());
        Ok(())
    }
}

impl Default for UpgradeRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-upgrade validation: rate limit, then User-Agent.
///
/// Call identifiers are not required at upgrade time; they arrive in the
/// `start` frame.
pub fn validate_upgrade(
    headers: &HeaderMap,
    remote: IpAddr,
    limiter: &UpgradeRateLimiter,
) -> BridgeResult<()> {
    limiter.check(remote)?;

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let accepted = ACCEPTED_USER_AGENT_PREFIXES
        .iter()
        .any(|prefix| user_agent.starts_with(prefix));
    if !accepted {
        return Err(BridgeError::AuthRejected(format!(
            "User-Agent not recognized: {user_agent:?}"
        )));
    }
    Ok(())
}

/// Post-upgrade validation of the `start` frame's call identifier.
pub fn validate_start(call_sid: &str, calls: &CallRegistry) -> BridgeResult<()> {
    if call_sid.is_empty() {
        return Err(BridgeError::BadStartMessage("missing callSid".into()));
    }
    if call_sid.len() != CALL_SID_LEN || !call_sid.starts_with(CALL_SID_PREFIX) {
        return Err(BridgeError::BadStartMessage(format!(
            "malformed callSid {call_sid:?}"
        )));
    }
    if !calls.is_active(call_sid) {
        return Err(BridgeError::BadStartMessage(format!(
            "callSid {call_sid} is not an active call"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Carrier Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming carrier messages. Unknown event types fail to parse and are
/// ignored by the loop.
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum CarrierIncoming {
    Start { start: StartFrame },
    Media { media: MediaFrame },
    Stop,
    Mark,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartFrame {
    call_sid: String,
    stream_sid: String,
}

#[derive(Deserialize)]
struct MediaFrame {
    payload: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Carrier Sink over the WebSocket Writer
// ─────────────────────────────────────────────────────────────────────────────

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// [`CarrierSink`] implementation backed by the socket writer channel.
///
/// `buffered_amount` counts bytes accepted by `send` but not yet written
/// by the socket task; the framer's pump uses it as its backpressure
/// signal.
pub struct WsCarrierSink {
    tx: mpsc::UnboundedSender<(Message, usize)>,
    buffered: Arc<AtomicUsize>,
    seq: AtomicU64,
    stream_sid: RwLock<Option<String>>,
    state: AtomicU8,
}

impl WsCarrierSink {
    fn new(tx: mpsc::UnboundedSender<(Message, usize)>, buffered: Arc<AtomicUsize>) -> Self {
        Self {
            tx,
            buffered,
            seq: AtomicU64::new(0),
            stream_sid: RwLock::new(None),
            state: AtomicU8::new(STATE_OPEN),
        }
    }

    fn set_stream_sid(&self, stream_sid: String) {
        *self.stream_sid.write() = Some(stream_sid);
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }
}

impl CarrierSink for WsCarrierSink {
    fn state(&self) -> SocketState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => SocketState::Open,
            STATE_CLOSING => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn stream_sid(&self) -> Option<String> {
        self.stream_sid.read().clone()
    }

    fn next_sequence(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn send(&self, message: CarrierOutgoing) -> BridgeResult<()> {
        if self.state() != SocketState::Open {
            return Err(BridgeError::SocketClosed);
        }
        let text = serde_json::to_string(&message)
            .map_err(|err| BridgeError::InternalPanic(format!("serialize outgoing: {err}")))?;
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.tx
            .send((Message::Text(text.into()), len))
            .map_err(|_| {
                self.buffered.fetch_sub(len, Ordering::SeqCst);
                BridgeError::SocketClosed
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket upgrade handler with pre-upgrade validation.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = validate_upgrade(&headers, addr.ip(), &state.limiter) {
        log::warn!("[WS] Upgrade rejected: remote={}, reason={}", addr, err);
        return err.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Per-call context established by the `start` frame.
struct CallContext {
    session: Arc<Session>,
    framer: Arc<OutboundFramer>,
}

/// Main connection loop.
async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_guard = state.ws_manager.register();
    let cancel_token = conn_guard.cancel_token().clone();
    log::info!(
        "[WS] Connection established: id={}, remote={}",
        conn_guard.id(),
        addr
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Message, usize)>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(WsCarrierSink::new(out_tx, Arc::clone(&buffered)));

    let config = state.config.snapshot();
    let idle_timeout = Duration::from_millis(config.bedrock.session_timeout_ms);
    let mut idle_check =
        tokio::time::interval(Duration::from_secs(WS_IDLE_CHECK_INTERVAL_SECS));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut call: Option<CallContext> = None;
    let mut last_activity = Instant::now();
    // Set when the peer is already gone, suppressing the final mark.
    let mut peer_gone = false;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: id={}", conn_guard.id());
                break;
            }
            outbound = out_rx.recv() => {
                let Some((message, len)) = outbound else { break };
                let result = ws_sender.send(message).await;
                buffered.fetch_sub(len, Ordering::SeqCst);
                if result.is_err() {
                    log::warn!("[WS] Socket write failed: id={}", conn_guard.id());
                    peer_gone = true;
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                last_activity = Instant::now();
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<CarrierIncoming>(&text) {
                            Ok(CarrierIncoming::Start { start }) => {
                                match handle_start(&state, &sink, start) {
                                    Ok(context) => call = Some(context),
                                    Err(err) => {
                                        log::warn!(
                                            "[WS] Start rejected: id={}, reason={}",
                                            conn_guard.id(),
                                            err
                                        );
                                        break;
                                    }
                                }
                            }
                            Ok(CarrierIncoming::Media { media }) => {
                                if let Some(ref context) = call {
                                    handle_media(&state, context, &media.payload);
                                }
                            }
                            Ok(CarrierIncoming::Stop) => {
                                log::info!("[WS] Carrier stop: id={}", conn_guard.id());
                                if let Some(ref context) = call {
                                    context.session.await_completion();
                                }
                                break;
                            }
                            Ok(CarrierIncoming::Mark) => {
                                // Mark echoes need no action.
                            }
                            Err(_) => {
                                // Unknown message types pass.
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        peer_gone = true;
                        break;
                    }
                    _ => {}
                }
            }
            _ = idle_check.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    log::warn!(
                        "[WS] Idle timeout after {:?}: id={}",
                        idle_timeout,
                        conn_guard.id()
                    );
                    break;
                }
            }
        }
    }

    // Graceful teardown. A peer that already closed gets no final mark;
    // on a carrier `stop` the socket is still writable, so the framer's
    // stop path may emit it. The registry entry stays for the cleanup
    // sweep rather than being torn down synchronously.
    if peer_gone {
        sink.set_state(STATE_CLOSED);
    }
    if let Some(context) = call {
        context.framer.stop("carrier socket closed");
        context.session.close();
        state.registry.mark_for_cleanup(context.session.id());
    }
    sink.set_state(STATE_CLOSED);
    // Drain anything the framer handed over after the loop exited.
    while let Ok((message, len)) = out_rx.try_recv() {
        if !peer_gone && ws_sender.send(message).await.is_ok() {
            buffered.fetch_sub(len, Ordering::SeqCst);
        }
    }
    log::info!("[WS] Connection finished: id={}", conn_guard.id());
}

/// Processes a `start` frame: validates the call, applies the admission
/// cap, creates the session, wires the framer, launches the RPC driver.
fn handle_start(
    state: &AppState,
    sink: &Arc<WsCarrierSink>,
    start: StartFrame,
) -> BridgeResult<CallContext> {
    validate_start(&start.call_sid, &state.calls)?;

    let config = state.config.snapshot();
    if state.registry.len() >= config.server.max_concurrent_streams {
        return Err(BridgeError::QueueFull(
            "maximum concurrent media streams reached".into(),
        ));
    }

    sink.set_stream_sid(start.stream_sid);
    let session = state.registry.create(&start.call_sid, config.inference)?;
    session.activate();

    let framer = OutboundFramer::new(
        start.call_sid.clone(),
        Arc::clone(sink) as Arc<dyn CarrierSink>,
        &config.audio,
        Arc::clone(&state.pool),
        Arc::clone(&state.quality),
    );

    let driver = Arc::clone(&state.driver);
    let rpc_session = Arc::clone(&session);
    let rpc_framer = Arc::clone(&framer);
    tokio::spawn(async move {
        driver.run_session(rpc_session, rpc_framer).await;
    });

    log::info!("[WS] Call started: callSid={}", session.id());
    Ok(CallContext { session, framer })
}

/// Forwards one carrier media payload through the input pipeline.
fn handle_media(state: &AppState, context: &CallContext, payload: &str) {
    match BASE64.decode(payload) {
        Ok(mulaw) => {
            forward_to_session(&context.session, &mulaw);
            state.registry.touch(context.session.id());
        }
        Err(err) => {
            // Noise-grade input is tolerated, undecodable input is dropped.
            log::warn!(
                "[WS] Undecodable media payload: session={}, error={}",
                context.session.id(),
                err
            );
        }
    }
}
