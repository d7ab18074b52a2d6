//! Reverse pipeline: model audio → carrier μ-law.
//!
//! Model `audioOutput` payloads are loosely shaped: the base64 audio may
//! sit under any of several aliases, with optional media-type and
//! sample-rate hints. The normalizer resolves that into a tagged
//! encoding + rate before the numeric path runs. Everything lands as
//! μ-law at 8 kHz for the jitter buffer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::codec::{clamp_sample_rate, downsample, mulaw_to_pcm16, pcm16_to_mulaw};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol_constants::{CARRIER_SAMPLE_RATE, MODEL_OUTPUT_DEFAULT_SAMPLE_RATE};

/// Payload field aliases checked for the base64 audio, in order.
const PAYLOAD_ALIASES: &[&str] = &["content", "payload", "chunk", "data"];

/// Media-type field aliases, in order.
const MEDIA_TYPE_ALIASES: &[&str] = &["mediaType", "media_type", "encoding"];

/// Sample-rate field aliases, in order.
const SAMPLE_RATE_ALIASES: &[&str] = &["sampleRateHz", "sample_rate_hz"];

/// Media-type substrings identifying μ-law payloads.
const MULAW_MARKERS: &[&str] = &["mulaw", "ulaw", "g.711", "g711"];

/// Audio encoding of a normalized model payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    MuLaw,
    Pcm16,
}

/// A model audio payload reduced to bytes + declared format.
#[derive(Debug)]
pub struct NormalizedAudio {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub bytes: Vec<u8>,
}

fn string_field<'a>(payload: &'a Value, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .find_map(|alias| payload.get(alias).and_then(Value::as_str))
}

fn rate_field(payload: &Value) -> Option<u32> {
    SAMPLE_RATE_ALIASES.iter().find_map(|alias| {
        payload
            .get(alias)
            .and_then(Value::as_u64)
            .map(|rate| rate as u32)
    })
}

/// Resolves an `audioOutput` payload into a tagged audio union.
///
/// The payload may be the base64 string itself or an object carrying it
/// under one of the recognized aliases. Missing audio is the only hard
/// failure; format hints degrade to defaults (PCM16, 24 kHz for PCM,
/// 8 kHz for μ-law).
pub fn normalize_audio_event(payload: &Value) -> BridgeResult<NormalizedAudio> {
    let base64_audio = if let Some(direct) = payload.as_str() {
        direct
    } else {
        string_field(payload, PAYLOAD_ALIASES).ok_or(BridgeError::MissingPayload)?
    };

    let bytes = BASE64
        .decode(base64_audio)
        .map_err(|err| BridgeError::CodecInput(format!("invalid base64 audio: {err}")))?;

    let is_mulaw = string_field(payload, MEDIA_TYPE_ALIASES)
        .map(|media_type| {
            let lower = media_type.to_ascii_lowercase();
            MULAW_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .unwrap_or(false);

    let declared_rate = rate_field(payload);
    let sample_rate = match (is_mulaw, declared_rate) {
        (true, None) => CARRIER_SAMPLE_RATE,
        (false, None) => MODEL_OUTPUT_DEFAULT_SAMPLE_RATE,
        (_, Some(rate)) => clamp_sample_rate(rate),
    };

    Ok(NormalizedAudio {
        encoding: if is_mulaw {
            AudioEncoding::MuLaw
        } else {
            AudioEncoding::Pcm16
        },
        sample_rate,
        bytes,
    })
}

/// Runs the reverse pipeline: normalized payload → μ-law @ 8 kHz.
pub fn process_model_audio(payload: &Value) -> BridgeResult<Vec<u8>> {
    let audio = normalize_audio_event(payload)?;

    let mulaw = match audio.encoding {
        AudioEncoding::MuLaw if audio.sample_rate == CARRIER_SAMPLE_RATE => audio.bytes,
        AudioEncoding::MuLaw => {
            let pcm = mulaw_to_pcm16(&audio.bytes);
            let pcm8k = downsample(&pcm, audio.sample_rate, CARRIER_SAMPLE_RATE);
            pcm16_to_mulaw(&pcm8k)
        }
        AudioEncoding::Pcm16 => {
            // Truncate an odd trailing byte before sample extraction.
            let even_len = audio.bytes.len() & !1;
            let pcm8k = downsample(
                &audio.bytes[..even_len],
                audio.sample_rate,
                CARRIER_SAMPLE_RATE,
            );
            pcm16_to_mulaw(&pcm8k)
        }
    };
    Ok(mulaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn payload_aliases_are_all_recognized() {
        for alias in ["content", "payload", "chunk", "data"] {
            let payload = json!({ alias: b64(&[0xFFu8; 160]) });
            let audio = normalize_audio_event(&payload).expect("alias recognized");
            assert_eq!(audio.bytes.len(), 160);
        }
    }

    #[test]
    fn bare_string_payload_is_accepted() {
        let payload = json!(b64(&[0xFFu8; 16]));
        let audio = normalize_audio_event(&payload).expect("bare string");
        assert_eq!(audio.bytes.len(), 16);
        assert_eq!(audio.encoding, AudioEncoding::Pcm16);
        assert_eq!(audio.sample_rate, 24_000, "ambiguous rate defaults");
    }

    #[test]
    fn missing_payload_is_the_only_hard_failure() {
        let payload = json!({ "somethingElse": true });
        assert!(matches!(
            normalize_audio_event(&payload),
            Err(BridgeError::MissingPayload)
        ));
    }

    #[test]
    fn invalid_base64_is_a_codec_error() {
        let payload = json!({ "content": "!!!not-base64!!!" });
        assert!(matches!(
            normalize_audio_event(&payload),
            Err(BridgeError::CodecInput(_))
        ));
    }

    #[test]
    fn mulaw_markers_are_detected_case_insensitively() {
        for media_type in ["audio/mulaw", "audio/x-ULAW", "G.711", "g711;rate=8000"] {
            let payload = json!({
                "content": b64(&[0xFFu8; 8]),
                "mediaType": media_type,
            });
            let audio = normalize_audio_event(&payload).expect("normalizes");
            assert_eq!(audio.encoding, AudioEncoding::MuLaw, "{media_type}");
            assert_eq!(audio.sample_rate, 8000, "μ-law defaults to 8 kHz");
        }
    }

    #[test]
    fn snake_case_rate_alias_is_recognized() {
        let payload = json!({
            "content": b64(&[0u8; 4]),
            "sample_rate_hz": 16_000,
        });
        let audio = normalize_audio_event(&payload).expect("normalizes");
        assert_eq!(audio.sample_rate, 16_000);
    }

    #[test]
    fn out_of_range_rates_fall_back_to_default() {
        let payload = json!({
            "content": b64(&[0u8; 4]),
            "sampleRateHz": 96_000,
        });
        let audio = normalize_audio_event(&payload).expect("normalizes");
        assert_eq!(audio.sample_rate, 24_000);
    }

    #[test]
    fn mulaw_at_8k_passes_through_untouched() {
        let source: Vec<u8> = (0..160u8).collect();
        let payload = json!({
            "content": b64(&source),
            "mediaType": "audio/mulaw",
            "sampleRateHz": 8000,
        });
        assert_eq!(process_model_audio(&payload).expect("passthrough"), source);
    }

    #[test]
    fn pcm_is_downsampled_and_companded() {
        // 480 samples of 24 kHz PCM → 160 samples → 160 μ-law bytes.
        let pcm: Vec<u8> = std::iter::repeat([0x00u8, 0x10])
            .take(480)
            .flatten()
            .collect();
        let payload = json!({
            "content": b64(&pcm),
            "sampleRateHz": 24_000,
        });
        let mulaw = process_model_audio(&payload).expect("converts");
        assert_eq!(mulaw.len(), 160);
    }

    #[test]
    fn odd_length_pcm_is_truncated() {
        let mut pcm = vec![0u8; 33];
        pcm[32] = 0x7F;
        let payload = json!({
            "content": b64(&pcm),
            "sampleRateHz": 8000,
        });
        let mulaw = process_model_audio(&payload).expect("converts");
        assert_eq!(mulaw.len(), 16);
    }

    #[test]
    fn round_trip_through_both_pipelines_preserves_tone() {
        // Scenario: a 440 Hz carrier frame through the forward pipeline,
        // its output fed back as model PCM @ 16 kHz, must come back as
        // 160 μ-law bytes strongly correlated with the original.
        let mut source_mulaw = Vec::with_capacity(160);
        for i in 0..160 {
            let t = i as f64 / 8000.0;
            let sample = (10_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16;
            source_mulaw.extend_from_slice(&crate::codec::pcm16_to_mulaw(&sample.to_le_bytes()));
        }

        let pcm16k = crate::audio::input::process_carrier_audio(&source_mulaw);
        assert_eq!(pcm16k.len(), 640);

        let payload = json!({
            "content": b64(&pcm16k),
            "sampleRateHz": 16_000,
        });
        let returned = process_model_audio(&payload).expect("reverse pipeline");
        assert_eq!(returned.len(), 160);

        let original: Vec<i16> = crate::codec::mulaw_to_pcm16(&source_mulaw)
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        let recovered: Vec<i16> = crate::codec::mulaw_to_pcm16(&returned)
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();

        let len = original.len().min(recovered.len());
        let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
        for i in 0..len {
            let (x, y) = (f64::from(original[i]), f64::from(recovered[i]));
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        let correlation = dot / (na.sqrt() * nb.sqrt());
        assert!(
            correlation > 0.8,
            "round-trip correlation {correlation} below 0.8"
        );
    }
}
