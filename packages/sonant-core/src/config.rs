//! Core configuration types.
//!
//! The configuration is a tree of small sections matching the recognized
//! environment keys. It is loaded once at startup and validated before
//! any service is constructed. A designated safe subset (logging level,
//! health thresholds) may be changed at runtime through [`SharedConfig`];
//! the critical subset (ports, region, model id, auth token) is read-only
//! after startup.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{BridgeError, BridgeResult};

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Request timeout (ms).
    pub timeout_ms: u64,
    /// Admission cap on concurrent media streams.
    pub max_concurrent_streams: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            timeout_ms: 300_000,
            max_concurrent_streams: 20,
        }
    }
}

/// Carrier (Twilio) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TwilioConfig {
    /// Webhook auth token. Required, minimum 32 characters.
    pub auth_token: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
        }
    }
}

/// Model provider (Bedrock) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BedrockConfig {
    /// Model RPC region.
    pub region: String,
    /// Model identifier.
    pub model_id: String,
    /// Per-RPC request timeout (ms).
    pub request_timeout_ms: u64,
    /// Per-session idle timeout (ms).
    pub session_timeout_ms: u64,
    /// Bound on the inbound per-session event queue.
    pub max_audio_queue_size: usize,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            model_id: "amazon.nova-sonic-v1:0".to_string(),
            request_timeout_ms: 300_000,
            session_timeout_ms: 300_000,
            max_audio_queue_size: 200,
        }
    }
}

/// Inference parameters sent with `sessionStart` and `promptStart`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// Jitter buffer and outbound framer settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    /// Outbound frame size (bytes of μ-law).
    pub frame_size: usize,
    /// Outbound frame interval (ms).
    pub interval_ms: u64,
    /// Maximum audio buffered ahead of the carrier (ms).
    pub max_buffer_ms: u64,
    /// Socket buffered-bytes threshold above which sends are skipped.
    pub buffered_amount_threshold: usize,
}

impl AudioConfig {
    /// Maximum buffered bytes implied by `max_buffer_ms` at 8 kHz μ-law.
    ///
    /// One byte per sample at 8 kHz, so 1 ms = 8 bytes.
    #[must_use]
    pub const fn max_buffer_bytes(&self) -> usize {
        (self.max_buffer_ms * 8) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_size: 160,
            interval_ms: 20,
            max_buffer_ms: 200,
            buffered_amount_threshold: 32_768,
        }
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferPoolConfig {
    /// Per-size available count a maintenance pass trims down to.
    pub initial_size: usize,
    /// Per-size available count above which releases are discarded.
    pub max_size: usize,
    /// Memory pressure (0.0-1.0) at or above which releases are discarded.
    pub memory_pressure_threshold: f64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 10,
            max_size: 50,
            memory_pressure_threshold: 0.8,
        }
    }
}

/// Logging settings (safe to reload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Level name: ERROR, WARN, INFO, DEBUG or TRACE.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
        }
    }
}

/// Health check / registry sweep settings (safe to reload).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Idle age after which the registry sweep retires a session (ms).
    pub stale_session_timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            stale_session_timeout_ms: 1_800_000,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub bedrock: BedrockConfig,
    pub inference: InferenceConfig,
    pub audio: AudioConfig,
    pub buffer_pool: BufferPoolConfig,
    pub logging: LoggingConfig,
    pub health_check: HealthCheckConfig,
}

impl Config {
    /// Validates the configuration. Failures here are startup failures
    /// (process exit code 1), never runtime surprises.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.twilio.auth_token.len() < 32 {
            return Err(BridgeError::ConfigInvalid(
                "twilio.authToken is required and must be at least 32 characters".into(),
            ));
        }
        if self.server.max_concurrent_streams == 0 {
            return Err(BridgeError::ConfigInvalid(
                "server.maxConcurrentStreams must be >= 1".into(),
            ));
        }
        if self.audio.frame_size == 0 {
            return Err(BridgeError::ConfigInvalid(
                "audio.frameSize must be >= 1".into(),
            ));
        }
        if self.audio.interval_ms == 0 {
            return Err(BridgeError::ConfigInvalid(
                "audio.intervalMs must be >= 1".into(),
            ));
        }
        if self.audio.max_buffer_bytes() < self.audio.frame_size {
            return Err(BridgeError::ConfigInvalid(
                "audio.maxBufferMs must cover at least one frame".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.buffer_pool.memory_pressure_threshold) {
            return Err(BridgeError::ConfigInvalid(
                "bufferPool.memoryPressureThreshold must be within 0.0-1.0".into(),
            ));
        }
        if self.buffer_pool.max_size < self.buffer_pool.initial_size {
            return Err(BridgeError::ConfigInvalid(
                "bufferPool.maxSize must be >= bufferPool.initialSize".into(),
            ));
        }
        if self.bedrock.max_audio_queue_size == 0 {
            return Err(BridgeError::ConfigInvalid(
                "bedrock.maxAudioQueueSize must be >= 1".into(),
            ));
        }
        if log_level_filter(&self.logging.level).is_none() {
            return Err(BridgeError::ConfigInvalid(format!(
                "logging.level {:?} is not one of ERROR, WARN, INFO, DEBUG, TRACE",
                self.logging.level
            )));
        }
        Ok(())
    }
}

/// Parses a configured level name into a `log::LevelFilter`.
#[must_use]
pub fn log_level_filter(level: &str) -> Option<log::LevelFilter> {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => Some(log::LevelFilter::Error),
        "WARN" => Some(log::LevelFilter::Warn),
        "INFO" => Some(log::LevelFilter::Info),
        "DEBUG" => Some(log::LevelFilter::Debug),
        "TRACE" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

/// The runtime-mutable subset of [`Config`].
///
/// Everything else requires a restart.
#[derive(Debug, Clone)]
pub struct SafeSubset {
    pub logging: LoggingConfig,
    pub health_check: HealthCheckConfig,
}

/// Notification published when the safe subset changes.
#[derive(Debug, Clone)]
pub struct ConfigChanged {
    pub logging_level: String,
    pub stale_session_timeout_ms: u64,
}

/// Shared, reload-aware configuration handle.
///
/// The full config is readable from anywhere; writes are restricted to
/// the safe subset and publish a [`ConfigChanged`] notification.
pub struct SharedConfig {
    inner: RwLock<Config>,
    changes: broadcast::Sender<ConfigChanged>,
}

impl SharedConfig {
    /// Wraps a validated configuration.
    pub fn new(config: Config) -> Arc<Self> {
        let (changes, _) = broadcast::channel(8);
        Arc::new(Self {
            inner: RwLock::new(config),
            changes,
        })
    }

    /// Returns a snapshot of the full configuration.
    #[must_use]
    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Applies the safe-to-reload subset and notifies subscribers.
    ///
    /// Critical keys are untouched by design: callers cannot pass them.
    pub fn apply_safe(&self, subset: SafeSubset) -> BridgeResult<()> {
        if log_level_filter(&subset.logging.level).is_none() {
            return Err(BridgeError::ConfigInvalid(format!(
                "logging.level {:?} is not a recognized level",
                subset.logging.level
            )));
        }
        let notification = {
            let mut config = self.inner.write();
            config.logging = subset.logging;
            config.health_check = subset.health_check;
            ConfigChanged {
                logging_level: config.logging.level.clone(),
                stale_session_timeout_ms: config.health_check.stale_session_timeout_ms,
            }
        };
        // Receivers may not exist yet; that's fine.
        let _ = self.changes.send(notification);
        Ok(())
    }

    /// Subscribes to safe-subset change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChanged> {
        self.changes.subscribe()
    }
}
