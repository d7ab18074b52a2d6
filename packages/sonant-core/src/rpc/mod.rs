//! Model RPC client seam and the per-session stream driver.
//!
//! [`ModelConnector`] abstracts the provider transport: one call yields
//! a duplex of an event sender (bridge → model) and a response byte
//! stream (model → bridge). The driver owns a session's whole RPC
//! lifecycle: initiation with retry and breaker gating, pumping the
//! session event queue into the sender, and translating response chunks
//! into dispatcher events.

pub mod breaker;
pub mod http;
pub mod retry;

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{BridgeError, BridgeResult};
use crate::session::dispatcher;
use crate::session::events::{EventType, ParsedResponse};
use crate::session::Session;
use crate::stream::OutboundFramer;
use breaker::CircuitBreaker;
use retry::{with_backoff, BackoffPolicy};

/// Response byte stream from the model.
pub type ResponseStream = Pin<Box<dyn Stream<Item = BridgeResult<Bytes>> + Send>>;

/// An established bidirectional model stream.
pub struct ModelDuplex {
    /// Serialized inbound events, one JSON document per send.
    pub events: mpsc::Sender<Vec<u8>>,
    /// Response chunks, one JSON document per item.
    pub responses: ResponseStream,
}

/// Provider transport seam.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    /// Opens one bidirectional stream against the model.
    async fn connect(&self) -> BridgeResult<ModelDuplex>;
}

/// Everything the driver needs besides the session itself.
pub struct RpcDriver {
    pub connector: Arc<dyn ModelConnector>,
    pub breaker: Arc<CircuitBreaker>,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
}

impl RpcDriver {
    /// Drives one session against the model until the response stream
    /// ends, the session closes, or the RPC fails terminally.
    ///
    /// Model `audioOutput` events are converted through the reverse
    /// pipeline into the framer; everything else reaches observers via
    /// the dispatcher. The natural end of the response iterator is
    /// surfaced as a `streamComplete` event.
    pub async fn run_session(&self, session: Arc<Session>, framer: Arc<OutboundFramer>) {
        let duplex = match self.initiate(&session).await {
            Ok(duplex) => duplex,
            Err(err) => {
                log::error!(
                    "[Rpc] Initiation failed terminally: session={}, error={}",
                    session.id(),
                    err
                );
                dispatcher::dispatch(
                    &session,
                    &EventType::Error,
                    &json!({ "type": err.code(), "details": { "message": err.to_string() } }),
                );
                session.close();
                return;
            }
        };

        let Some(event_stream) = session.take_event_stream() else {
            log::error!(
                "[Rpc] Session event stream unavailable: session={}",
                session.id()
            );
            session.close();
            return;
        };

        // Writer: session queue → model. Ends when the session sequence
        // terminates (close drained) or the transport drops the receiver.
        let events_tx = duplex.events;
        let writer_session = Arc::clone(&session);
        let writer = tokio::spawn(async move {
            tokio::pin!(event_stream);
            while let Some(event_bytes) = event_stream.next().await {
                if events_tx.send(event_bytes).await.is_err() {
                    log::debug!(
                        "[Rpc] Transport closed while writing: session={}",
                        writer_session.id()
                    );
                    break;
                }
            }
        });

        self.read_responses(&session, &framer, duplex.responses)
            .await;

        // The response side is done; release the writer by closing the
        // session (idempotent) so its sequence terminates.
        session.close();
        let _ = writer.await;
    }

    /// Opens the stream with retry, backoff and breaker gating.
    async fn initiate(&self, session: &Session) -> BridgeResult<ModelDuplex> {
        let connector = Arc::clone(&self.connector);
        let timeout = self.request_timeout;
        with_backoff(&self.backoff, &self.breaker, "model stream", move || {
            let connector = Arc::clone(&connector);
            async move {
                match tokio::time::timeout(timeout, connector.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::RpcTimeout(timeout.as_millis() as u64)),
                }
            }
        })
        .await
        .inspect(|_| log::info!("[Rpc] Stream established: session={}", session.id()))
    }

    async fn read_responses(
        &self,
        session: &Arc<Session>,
        framer: &Arc<OutboundFramer>,
        mut responses: ResponseStream,
    ) {
        let close_signal = session.close_signal();
        loop {
            let chunk = tokio::select! {
                _ = close_signal.cancelled() => break,
                chunk = tokio::time::timeout(self.request_timeout, responses.next()) => chunk,
            };

            let chunk = match chunk {
                Err(_) => {
                    log::warn!(
                        "[Rpc] Response timeout after {:?}: session={}",
                        self.request_timeout,
                        session.id()
                    );
                    dispatcher::dispatch(
                        session,
                        &EventType::Error,
                        &json!({
                            "type": "rpc_timeout",
                            "details": { "timeoutMs": self.request_timeout.as_millis() as u64 },
                        }),
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    dispatcher::dispatch(
                        session,
                        &EventType::Error,
                        &json!({ "type": err.code(), "details": { "message": err.to_string() } }),
                    );
                    break;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            self.handle_chunk(session, framer, &chunk);
        }

        dispatcher::dispatch(
            session,
            &EventType::StreamComplete,
            &json!({ "timestamp": unix_millis() }),
        );
    }

    fn handle_chunk(&self, session: &Arc<Session>, framer: &Arc<OutboundFramer>, chunk: &[u8]) {
        let parsed = match crate::session::events::parse_response_chunk(chunk) {
            Ok(parsed) => parsed,
            Err(err) => {
                // A malformed chunk is skipped; the stream carries on.
                log::warn!(
                    "[Rpc] Unparseable response chunk ({} bytes): session={}, error={}",
                    chunk.len(),
                    session.id(),
                    err
                );
                return;
            }
        };

        session.touch();
        session.set_waiting_for_response(false);

        match parsed {
            ParsedResponse::Error {
                error_type,
                details,
            } => {
                dispatcher::dispatch(
                    session,
                    &EventType::Error,
                    &json!({ "type": error_type, "details": details }),
                );
            }
            ParsedResponse::Event {
                event_type,
                mut data,
            } => {
                dispatcher::normalize(&mut data);
                if event_type == EventType::AudioOutput {
                    match crate::audio::output::process_model_audio(&data) {
                        Ok(mulaw) => framer.add_audio(&mulaw),
                        Err(err) => {
                            // Pipeline errors never propagate; the chunk is
                            // dropped.
                            log::warn!(
                                "[Rpc] Audio chunk dropped: session={}, error={}",
                                session.id(),
                                err
                            );
                        }
                    }
                }
                dispatcher::dispatch(session, &event_type, &data);
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
