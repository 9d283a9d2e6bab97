//! # Audio Transcoding
//!
//! Pure, stateless conversions between the telephony codec and the speech
//! service's PCM format. Every inbound and outbound frame passes through
//! these functions.
//!
//! ## Conversion chain (outbound, caller → speech service):
//! mu-law @ 8 kHz → PCM16 @ 8 kHz → PCM16 @ 24 kHz → base64
//!
//! ## Conversion chain (inbound, speech service → caller):
//! base64 → PCM16 @ 24 kHz → PCM16 @ 8 kHz → mu-law @ 8 kHz
//!
//! ## Guarantees:
//! - Deterministic: same input always yields the same output
//! - Mono throughout; sample count scales exactly with the rate ratio
//!   (8 → 24 kHz triples, 24 → 8 kHz divides by three)
//! - 16-bit saturation, never overflow wrap
//! - Empty input at any stage is a logged no-op, never an error

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

/// Telephony-side sample rate (G.711 narrowband).
pub const TELEPHONY_RATE: u32 = 8_000;

/// Speech-service sample rate (realtime API fixed PCM16 rate).
pub const SERVICE_RATE: u32 = 24_000;

/// Compress one linear PCM sample to 8-bit mu-law (ITU-T G.711).
pub fn mulaw_compress(sample: i16) -> u8 {
    let absno = if sample < 0 {
        (((!sample) as u16) >> 2) as i16 + 33
    } else {
        (sample >> 2) + 33
    };
    let absno = absno.min(0x1FFF);

    let mut i = absno >> 6;
    let mut segno = 1;
    while i != 0 {
        segno += 1;
        i >>= 1;
    }

    let high_nibble = 0x0008 - segno;
    let low_nibble = 0x000F - ((absno >> segno) & 0x000F);
    let mut code = (high_nibble << 4) | low_nibble;
    if sample >= 0 {
        code |= 0x0080;
    }
    code as u8
}

/// Expand one 8-bit mu-law code to a linear PCM sample (ITU-T G.711).
pub fn mulaw_expand(code: u8) -> i16 {
    let sign: i16 = if code < 0x80 { -1 } else { 1 };
    let inverted = (!code) as i16;
    let exponent = (inverted >> 4) & 0x0007;
    let mantissa = inverted & 0x000F;
    let step = 4 << (exponent + 1);

    sign * ((0x0080 << exponent) + step * mantissa + step / 2 - 4 * 33)
}

/// Decode a mu-law frame to PCM16 samples.
///
/// One output sample per input byte; an empty frame decodes to an empty
/// vector.
pub fn mulaw_to_pcm(frame: &[u8]) -> Vec<i16> {
    if frame.is_empty() {
        debug!("mulaw_to_pcm called with empty frame");
        return Vec::new();
    }
    frame.iter().map(|&code| mulaw_expand(code)).collect()
}

/// Encode PCM16 samples as a mu-law frame.
///
/// One output byte per input sample.
pub fn pcm_to_mulaw(samples: &[i16]) -> Vec<u8> {
    if samples.is_empty() {
        debug!("pcm_to_mulaw called with empty input");
        return Vec::new();
    }
    samples.iter().map(|&s| mulaw_compress(s)).collect()
}

/// Resample mono PCM16 between the two fixed rates.
///
/// ## Algorithm:
/// Linear interpolation. Upsampling 8 → 24 kHz produces exactly three output
/// samples per input sample; downsampling 24 → 8 kHz produces one output
/// sample per three input samples. Interpolation happens in i32 and is
/// clamped back to i16, so intermediate values can never wrap.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() {
        debug!("resample called with empty input");
        return Vec::new();
    }
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);

    // Fixed-point source position: numerator over to_rate.
    for i in 0..out_len {
        let num = i as u64 * from_rate as u64;
        let idx = (num / to_rate as u64) as usize;
        let frac_num = num % to_rate as u64;

        let a = samples[idx] as i32;
        let b = if idx + 1 < samples.len() {
            samples[idx + 1] as i32
        } else {
            a
        };
        let interp = a + ((b - a) * frac_num as i32) / to_rate as i32;
        out.push(interp.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    }

    out
}

/// Convert raw little-endian PCM16 bytes to samples.
///
/// A trailing odd byte cannot form a sample and is dropped with a warning.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    if data.is_empty() {
        return Vec::new();
    }
    if data.len() % 2 != 0 {
        warn!(len = data.len(), "PCM16 frame has odd length, dropping trailing byte");
    }
    data.chunks_exact(2)
        .map(LittleEndian::read_i16)
        .collect()
}

/// Convert PCM16 samples to raw little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Outbound composite: telephony mu-law frame → base64 PCM16 @ 24 kHz.
///
/// Returns `None` for empty input so callers can skip the frame without
/// treating it as an error.
pub fn mulaw_to_service_b64(frame: &[u8]) -> Option<String> {
    if frame.is_empty() {
        debug!("skipping empty telephony frame");
        return None;
    }
    let pcm8k = mulaw_to_pcm(frame);
    let pcm24k = resample(&pcm8k, TELEPHONY_RATE, SERVICE_RATE);
    Some(BASE64.encode(samples_to_bytes(&pcm24k)))
}

/// Inbound composite: base64 PCM16 @ 24 kHz → telephony mu-law frame.
///
/// Malformed base64 or an empty payload yields `None`; the single frame is
/// dropped and logged, never escalated.
pub fn service_b64_to_mulaw(b64: &str) -> Option<Vec<u8>> {
    if b64.is_empty() {
        debug!("skipping empty service audio delta");
        return None;
    }
    let raw = match BASE64.decode(b64) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "failed to decode service audio delta, dropping frame");
            return None;
        }
    };
    if raw.is_empty() {
        return None;
    }
    let pcm24k = bytes_to_samples(&raw);
    let pcm8k = resample(&pcm24k, SERVICE_RATE, TELEPHONY_RATE);
    Some(pcm_to_mulaw(&pcm8k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_known_values() {
        // ITU-T G.711 reference vectors
        assert_eq!(mulaw_compress(0), 0xff);
        assert_eq!(mulaw_compress(128), 0xef);
        assert_eq!(mulaw_compress(1024), 0xcd);
        assert_eq!(mulaw_compress(-128), 0x6f);
        assert_eq!(mulaw_compress(-1024), 0x4d);

        assert_eq!(mulaw_expand(0xff), 0);
        assert_eq!(mulaw_expand(0xef), 132);
        assert_eq!(mulaw_expand(0xcd), 1052);
        assert_eq!(mulaw_expand(0x6f), -132);
        assert_eq!(mulaw_expand(0x4d), -1052);
    }

    #[test]
    fn test_mulaw_round_trip_error_bound() {
        for sample in [0i16, 100, -100, 1000, -1000, 10000, -10000] {
            let decoded = mulaw_expand(mulaw_compress(sample));
            let error = (decoded as i32 - sample as i32).abs();
            assert!(error < 2000, "quantization error too large for {sample}: {decoded}");
        }
    }

    #[test]
    fn test_mulaw_boundary_values_stay_in_range() {
        for sample in [i16::MIN, -32767, -1, 0, 1, 32766, i16::MAX] {
            let decoded = mulaw_expand(mulaw_compress(sample));
            assert!((i16::MIN..=i16::MAX).contains(&decoded));
        }
    }

    #[test]
    fn test_companding_class_is_stable() {
        // Lossy but stable: once a frame has been through the codec, a second
        // pass reproduces it exactly.
        for code in 0u8..=255 {
            let once = mulaw_compress(mulaw_expand(code));
            let twice = mulaw_compress(mulaw_expand(once));
            assert_eq!(once, twice, "companding not stable for code {code:#x}");
        }
    }

    #[test]
    fn test_frame_codec_no_size_drift() {
        let frame: Vec<u8> = (0..160).map(|i| (i % 256) as u8).collect();
        let pcm = mulaw_to_pcm(&frame);
        assert_eq!(pcm.len(), frame.len());
        let back = pcm_to_mulaw(&pcm);
        assert_eq!(back.len(), frame.len());
    }

    #[test]
    fn test_resample_exact_scaling() {
        let pcm: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        let up = resample(&pcm, TELEPHONY_RATE, SERVICE_RATE);
        assert_eq!(up.len(), 480);
        let down = resample(&up, SERVICE_RATE, TELEPHONY_RATE);
        assert_eq!(down.len(), 160);
    }

    #[test]
    fn test_resample_round_trip_no_clipping() {
        let pcm: Vec<i16> = (0..320)
            .map(|i| ((i as f32 * 0.7).sin() * 30000.0) as i16)
            .collect();
        let round = resample(&resample(&pcm, 8_000, 24_000), 24_000, 8_000);
        assert_eq!(round.len(), pcm.len());
        // Every interpolated value must remain a valid i16; clamp math makes
        // wrap impossible, this guards against regressions.
        for s in &round {
            assert!((i16::MIN..=i16::MAX).contains(s));
        }
    }

    #[test]
    fn test_resample_extremes_saturate() {
        let pcm = vec![i16::MAX, i16::MAX, i16::MIN, i16::MIN];
        let up = resample(&pcm, 8_000, 24_000);
        assert_eq!(up.len(), 12);
        for s in &up {
            assert!((i16::MIN..=i16::MAX).contains(s));
        }
    }

    #[test]
    fn test_twenty_ms_frame_sizes() {
        // A 20 ms narrowband frame: 160 mu-law bytes -> 320 bytes PCM16@8k
        // -> 960 bytes PCM16@24k.
        let frame = vec![0xffu8; 160];
        let pcm8k = mulaw_to_pcm(&frame);
        assert_eq!(samples_to_bytes(&pcm8k).len(), 320);
        let pcm24k = resample(&pcm8k, TELEPHONY_RATE, SERVICE_RATE);
        assert_eq!(samples_to_bytes(&pcm24k).len(), 960);
    }

    #[test]
    fn test_byte_sample_round_trip() {
        let samples = vec![0i16, 1, -1, 12345, -12345, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }

    #[test]
    fn test_empty_inputs_are_noops() {
        assert!(mulaw_to_pcm(&[]).is_empty());
        assert!(pcm_to_mulaw(&[]).is_empty());
        assert!(resample(&[], 8_000, 24_000).is_empty());
        assert!(mulaw_to_service_b64(&[]).is_none());
        assert!(service_b64_to_mulaw("").is_none());
    }

    #[test]
    fn test_malformed_base64_is_dropped() {
        assert!(service_b64_to_mulaw("not valid b64!!!").is_none());
    }

    #[test]
    fn test_outbound_composite_b64_shape() {
        let frame = vec![0x45u8; 160];
        let b64 = mulaw_to_service_b64(&frame).unwrap();
        let raw = BASE64.decode(b64).unwrap();
        assert_eq!(raw.len(), 960);
    }

    #[test]
    fn test_inbound_composite_frame_shape() {
        // 960 bytes of PCM16@24k comes back as a 160-byte mu-law frame.
        let pcm24k = vec![100i16; 480];
        let b64 = BASE64.encode(samples_to_bytes(&pcm24k));
        let mulaw = service_b64_to_mulaw(&b64).unwrap();
        assert_eq!(mulaw.len(), 160);
    }
}
