//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (Twilio Media
//! Streams, ITU-T G.711, the model provider's event wire) and changing
//! them would break protocol compliance.

// ─────────────────────────────────────────────────────────────────────────────
// Carrier Audio (Twilio Media Streams)
// ─────────────────────────────────────────────────────────────────────────────

/// Carrier sample rate (Hz). Twilio Media Streams is always 8 kHz G.711.
pub const CARRIER_SAMPLE_RATE: u32 = 8000;

/// Bytes per carrier media frame: 160 bytes of μ-law = 20 ms at 8 kHz.
pub const CARRIER_FRAME_BYTES: usize = 160;

/// Carrier frame interval in milliseconds.
pub const CARRIER_FRAME_INTERVAL_MS: u64 = 20;

/// μ-law silence byte. 0xFF decodes to linear 0.
pub const MULAW_SILENCE: u8 = 0xFF;

/// Carrier call SID length (e.g. `CA` + 32 hex chars).
pub const CALL_SID_LEN: usize = 34;

/// Required call SID prefix.
pub const CALL_SID_PREFIX: &str = "CA";

/// User-Agent prefixes accepted at WebSocket upgrade.
///
/// Twilio's media stream client identifies itself with a `Twilio.*`
/// product token; anything else is rejected before the upgrade.
pub const ACCEPTED_USER_AGENT_PREFIXES: &[&str] = &["Twilio"];

/// Connection attempts allowed per remote address per rolling window.
pub const UPGRADE_RATE_LIMIT_MAX: usize = 10;

/// Rolling window for the upgrade rate limit (seconds).
pub const UPGRADE_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Model Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of PCM sent to the model (Hz).
pub const MODEL_INPUT_SAMPLE_RATE: u32 = 16000;

/// Default sample rate assumed for model output when unstated or invalid (Hz).
pub const MODEL_OUTPUT_DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Maximum sample rate accepted from model output metadata (Hz).
pub const MAX_SAMPLE_RATE: u32 = 48000;

/// Minimum audio chunk sent to the model: 10 ms at 16 kHz mono PCM16.
///
/// Shorter carrier payloads are zero-padded up to this length so the model
/// never receives sub-10ms fragments.
pub const MODEL_INPUT_MIN_BYTES: usize = 320;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum records in the per-socket send queue. Overflow drops the oldest.
pub const SEND_QUEUE_DEPTH: usize = 10;

/// Records the send pump processes per cooperative turn.
pub const SEND_PUMP_BATCH: usize = 3;

/// Queue latency above which a send is logged as delayed (ms).
pub const SEND_LATENCY_LOG_THRESHOLD_MS: u64 = 10;

/// Tick skew beyond the nominal interval that is logged as a delay (ms).
pub const TICK_DELAY_LOG_THRESHOLD_MS: u64 = 5;

/// Buffer fill ratio below which a non-empty buffer counts as an underrun.
pub const UNDERRUN_LEVEL: f64 = 0.10;

/// Name prefix of the completion mark sent after a generated utterance.
pub const COMPLETION_MARK_PREFIX: &str = "bedrock_out_";

// ─────────────────────────────────────────────────────────────────────────────
// Jitter Buffer Sizing
// ─────────────────────────────────────────────────────────────────────────────

/// Ring capacity multiplier over the configured max-buffer bytes.
pub const RING_CAPACITY_FACTOR: usize = 4;

/// Minimum ring capacity (bytes) regardless of configuration.
pub const RING_CAPACITY_MIN: usize = 32 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Buffer Pool Maintenance
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between pool maintenance passes (seconds).
pub const POOL_MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Idle age after which an uncommon size class is dropped (seconds).
pub const POOL_IDLE_CLASS_SECS: u64 = 300;

/// Buffer sizes that are never garbage-collected: the carrier frame, the
/// decoded 8 kHz PCM frame, and the upsampled 16 kHz PCM chunk.
pub const POOL_COMMON_SIZES: &[usize] = &[160, 320, 640, 1280];

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in logs and the health endpoint.
pub const APP_NAME: &str = "Sonant Bridge";

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "sonant-bridge";

/// Capacity of the per-session broadcast subject.
pub const SUBJECT_CHANNEL_CAPACITY: usize = 100;

/// Interval between carrier socket idle checks (seconds).
pub const WS_IDLE_CHECK_INTERVAL_SECS: u64 = 1;
