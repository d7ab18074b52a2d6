//! Sonant Core - shared library for Sonant Bridge.
//!
//! This crate bridges carrier telephony audio (Twilio Media Streams,
//! G.711 μ-law at 8 kHz over WebSocket) to a cloud model provider's
//! bidirectional streaming RPC (PCM16 at 16 kHz in, synthesized audio
//! and structured events out).
//!
//! # Architecture
//!
//! - [`codec`]: μ-law companding and sample-rate conversion
//! - [`audio`]: the forward and reverse pipelines built on the codec
//! - [`stream`]: jitter buffer and timer-driven outbound framer
//! - [`session`]: per-call state machine, event dispatch, registries
//! - [`rpc`]: model connector seam, retry/breaker policy, stream driver
//! - [`pool`]: size-classed buffer pool shared by the pipelines
//! - [`api`]: WebSocket carrier link plus health/stats routes
//! - [`config`]: validated configuration with a safe-reload subset
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! Process-wide collaborators are injected rather than reached for
//! globally, so tests construct isolated instances:
//!
//! - [`ModelConnector`](rpc::ModelConnector): provider transport
//! - [`CarrierSink`](stream::CarrierSink): socket write side
//! - [`QualitySink`](quality::QualitySink): pipeline observations
//! - [`MemoryPressure`](pool::MemoryPressure): pool shedding signal

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol_constants;
pub mod quality;
pub mod rpc;
pub mod session;
pub mod stream;

// Re-export commonly used types at the crate root
pub use api::{build_router, start_server, AppState, ServerError, WsConnectionManager};
pub use config::{Config, ConfigChanged, SafeSubset, SharedConfig};
pub use error::{BridgeError, BridgeResult};
pub use pool::{BufferPool, MemoryPressure, NoPressure, PoolStats, ProcMeminfoPressure};
pub use quality::{LoggingQualitySink, NoopQualitySink, QualitySink};
pub use rpc::breaker::CircuitBreaker;
pub use rpc::http::HttpModelConnector;
pub use rpc::retry::BackoffPolicy;
pub use rpc::{ModelConnector, ModelDuplex, RpcDriver};
pub use session::events::{EventType, SessionEvent};
pub use session::registry::{CallRegistry, SessionRegistry};
pub use session::{Session, SessionState};
pub use stream::{CarrierSink, JitterBuffer, OutboundFramer, SocketState};
