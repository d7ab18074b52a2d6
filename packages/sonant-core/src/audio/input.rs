//! Forward pipeline: carrier μ-law → model PCM.
//!
//! Each carrier media payload is decoded to PCM16 at 8 kHz, upsampled
//! to the model's 16 kHz input rate, padded to a 10 ms minimum, and
//! queued on the session as one `audioInput` event. Conversion never
//! fails on arbitrary bytes; garbage decodes to noise, which the model
//! tolerates better than a stalled stream.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::codec::{mulaw_to_pcm16, upsample_8k_to_16k};
use crate::protocol_constants::MODEL_INPUT_MIN_BYTES;
use crate::session::Session;

/// Converts one carrier μ-law payload to model-ready PCM16 @ 16 kHz.
///
/// Output shorter than 10 ms (320 bytes) is zero-padded up to it.
#[must_use]
pub fn process_carrier_audio(mulaw: &[u8]) -> Vec<u8> {
    let pcm8k = mulaw_to_pcm16(mulaw);
    let mut pcm16k = upsample_8k_to_16k(&pcm8k);
    if pcm16k.len() < MODEL_INPUT_MIN_BYTES {
        pcm16k.resize(MODEL_INPUT_MIN_BYTES, 0);
    }
    pcm16k
}

/// Runs the forward pipeline and queues the result on the session.
pub fn forward_to_session(session: &Session, mulaw: &[u8]) {
    if mulaw.is_empty() {
        return;
    }
    let pcm = process_carrier_audio(mulaw);
    session.enqueue_audio(&BASE64.encode(&pcm));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;

    #[test]
    fn carrier_frame_becomes_16k_pcm() {
        // 160 bytes μ-law (20 ms @ 8 kHz) → 320 samples @ 16 kHz → 640 bytes.
        let mulaw = vec![0x55u8; 160];
        let pcm = process_carrier_audio(&mulaw);
        assert_eq!(pcm.len(), 640);
    }

    #[test]
    fn short_payloads_are_padded_to_ten_ms() {
        // 40 bytes μ-law → 160 bytes @ 16 kHz, padded to 320.
        let pcm = process_carrier_audio(&[0x55u8; 40]);
        assert_eq!(pcm.len(), MODEL_INPUT_MIN_BYTES);
        assert!(pcm[160..].iter().all(|&b| b == 0), "zero padding");
    }

    #[test]
    fn exact_minimum_is_not_padded_further() {
        let pcm = process_carrier_audio(&[0x55u8; 80]);
        assert_eq!(pcm.len(), MODEL_INPUT_MIN_BYTES);
    }

    #[test]
    fn forward_queues_one_audio_input_event() {
        let session = Session::new("CAtest", InferenceConfig::default(), 200);
        session.activate();
        let depth = session.queue_len();

        forward_to_session(&session, &[0x55u8; 160]);
        assert_eq!(session.queue_len(), depth + 1);

        forward_to_session(&session, &[]);
        assert_eq!(session.queue_len(), depth + 1, "empty payload is a no-op");
    }

    #[test]
    fn arbitrary_bytes_never_panic() {
        let garbage: Vec<u8> = (0..=255).collect();
        let pcm = process_carrier_audio(&garbage);
        assert_eq!(pcm.len(), 1024);
    }
}
