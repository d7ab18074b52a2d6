//! G.711 μ-law transcoding and sample-rate conversion.
//!
//! Everything here is byte-oriented: μ-law buffers are one byte per
//! sample, PCM buffers are 16-bit signed little-endian. Both companding
//! directions run off lookup tables built once on first use; the decode
//! table is 256 entries, the encode table covers the full 16-bit input
//! domain so the hot path is a single indexed load per sample.

use std::sync::OnceLock;

use crate::protocol_constants::{MAX_SAMPLE_RATE, MODEL_OUTPUT_DEFAULT_SAMPLE_RATE};

/// μ-law companding bias (ITU-T G.711).
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude representable before bias overflow.
const MULAW_CLIP: i32 = 32_635;

/// Half-sample interpolation kernel for the 2× upsampler.
///
/// Symmetric 4-tap windowed-sinc approximation; passband flat to ~3 kHz,
/// which covers the full telephony band.
const UPSAMPLE_KERNEL: [f64; 4] = [-0.0625, 0.5625, 0.5625, -0.0625];

/// Anti-aliasing FIR applied around each output center when downsampling.
const DOWNSAMPLE_FIR: [f64; 5] = [-0.0234, 0.1563, 0.7344, 0.1563, -0.0234];

static DECODE_TABLE: OnceLock<[i16; 256]> = OnceLock::new();
static ENCODE_TABLE: OnceLock<Box<[u8; 65536]>> = OnceLock::new();

/// Decodes one μ-law byte from first principles.
///
/// Table construction only; the hot path goes through [`decode_table`].
fn mulaw_decode_byte(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0F);
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes one linear sample from first principles.
///
/// Table construction only; the hot path goes through [`encode_table`].
fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut s = i32::from(sample);
    let sign: u8 = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    if s > MULAW_CLIP {
        s = MULAW_CLIP;
    }
    s += MULAW_BIAS;

    // Segment: index of the highest set bit in [7, 14], zero-based at bit 7.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((s >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

fn decode_table() -> &'static [i16; 256] {
    DECODE_TABLE.get_or_init(|| {
        let mut table = [0i16; 256];
        for (byte, slot) in table.iter_mut().enumerate() {
            *slot = mulaw_decode_byte(byte as u8);
        }
        table
    })
}

fn encode_table() -> &'static [u8; 65536] {
    ENCODE_TABLE.get_or_init(|| {
        let mut table = vec![0u8; 65536].into_boxed_slice();
        for (bits, slot) in table.iter_mut().enumerate() {
            *slot = mulaw_encode_sample(bits as u16 as i16);
        }
        table.try_into().expect("table length is 65536")
    })
}

/// Forces both lookup tables to be built.
///
/// Called once at startup so the first media frame never pays the
/// 64 KiB table construction; `OnceLock` guarantees happens-before for
/// every later codec call regardless.
pub fn init_tables() {
    let _ = decode_table();
    let _ = encode_table();
}

// ─────────────────────────────────────────────────────────────────────────────
// Companding
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes μ-law bytes to PCM16LE. Output length is exactly `2 × input`.
#[must_use]
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let table = decode_table();
    let mut out = Vec::with_capacity(mulaw.len() * 2);
    for &byte in mulaw {
        out.extend_from_slice(&table[usize::from(byte)].to_le_bytes());
    }
    out
}

/// Encodes PCM16LE bytes to μ-law. An odd trailing byte is dropped.
#[must_use]
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Vec<u8> {
    let table = encode_table();
    let mut out = Vec::with_capacity(pcm.len() / 2);
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out.push(table[sample as u16 as usize]);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Sample-Rate Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Reads PCM16LE bytes into samples, ignoring an odd trailing byte.
fn samples_of(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Doubles the sample rate of a PCM16LE buffer from 8 kHz to 16 kHz.
///
/// Each input sample is passed through unchanged, followed by a
/// half-sample interpolation over its neighborhood. Edges replicate the
/// boundary sample. Output sample count is exactly `2 × input`.
#[must_use]
pub fn upsample_8k_to_16k(pcm: &[u8]) -> Vec<u8> {
    let samples = samples_of(pcm);
    if samples.is_empty() {
        return Vec::new();
    }

    let n = samples.len();
    let at = |index: isize| -> f64 {
        let clamped = index.clamp(0, n as isize - 1) as usize;
        f64::from(samples[clamped])
    };

    let mut out = Vec::with_capacity(n * 4);
    for i in 0..n as isize {
        out.extend_from_slice(&samples[i as usize].to_le_bytes());

        let interpolated = UPSAMPLE_KERNEL[0] * at(i - 1)
            + UPSAMPLE_KERNEL[1] * at(i)
            + UPSAMPLE_KERNEL[2] * at(i + 1)
            + UPSAMPLE_KERNEL[3] * at(i + 2);
        out.extend_from_slice(&clamp_i16(interpolated).to_le_bytes());
    }
    out
}

/// Clamps a sample rate to the supported domain.
///
/// Zero or above 48 kHz is impossible for this pipeline; such values are
/// logged and replaced with the model's default output rate.
#[must_use]
pub fn clamp_sample_rate(rate: u32) -> u32 {
    if rate == 0 || rate > MAX_SAMPLE_RATE {
        log::warn!(
            "[Codec] Unsupported sample rate {} Hz, assuming {} Hz",
            rate,
            MODEL_OUTPUT_DEFAULT_SAMPLE_RATE
        );
        MODEL_OUTPUT_DEFAULT_SAMPLE_RATE
    } else {
        rate
    }
}

/// Resamples a PCM16LE buffer from `src_rate` to `dst_rate` with
/// anti-aliasing.
///
/// Output sample count is `⌊input / (src_rate / dst_rate)⌋`. Each output
/// sample applies the 5-tap FIR centered on the nearest input sample,
/// skipping out-of-range taps and renormalizing by the coefficient sum
/// actually used. This is the single downsampling path for every ratio.
#[must_use]
pub fn downsample(pcm: &[u8], src_rate: u32, dst_rate: u32) -> Vec<u8> {
    let src_rate = clamp_sample_rate(src_rate);
    let dst_rate = clamp_sample_rate(dst_rate);

    let samples = samples_of(pcm);
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let n = samples.len();
    let out_count = (n as f64 / ratio).floor() as usize;

    let mut out = Vec::with_capacity(out_count * 2);
    for j in 0..out_count {
        let center = (j as f64 * ratio).round() as isize;

        let mut acc = 0.0;
        let mut weight = 0.0;
        for (k, &coeff) in DOWNSAMPLE_FIR.iter().enumerate() {
            let index = center + k as isize - 2;
            if index >= 0 && (index as usize) < n {
                acc += coeff * f64::from(samples[index as usize]);
                weight += coeff;
            }
        }

        let value = if weight.abs() > f64::EPSILON {
            acc / weight
        } else {
            0.0
        };
        out.extend_from_slice(&clamp_i16(value).to_le_bytes());
    }
    out
}
