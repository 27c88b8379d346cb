//! PCM16 codec
//!
//! Samples travel as signed 16-bit little-endian integers. Float samples
//! are clamped to [-1, 1]; negative values scale by 32768 and positive
//! values by 32767 so both ends of the range are reachable.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{AppError, Result};

const NEG_SCALE: f32 = 32768.0;
const POS_SCALE: f32 = 32767.0;

/// Encode one float sample
#[inline]
pub fn encode_sample(sample: f32) -> i16 {
    // NaN maps to silence
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * NEG_SCALE).round() as i16
    } else {
        (s * POS_SCALE).round() as i16
    }
}

/// Decode one PCM16 sample
#[inline]
pub fn decode_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEG_SCALE
    } else {
        sample as f32 / POS_SCALE
    }
}

/// Encode a frame of float samples to PCM16 little-endian bytes
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&encode_sample(sample).to_le_bytes());
    }
    out
}

/// Decode PCM16 little-endian bytes to float samples
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::Encoding(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| decode_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Encode a frame straight to the base64 text used on the wire
pub fn encode_base64(samples: &[f32]) -> String {
    STANDARD.encode(encode_frame(samples))
}

/// Decode a base64 PCM16 payload to float samples
pub fn decode_base64(payload: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| AppError::Encoding(format!("Invalid base64 audio payload: {}", e)))?;
    decode_frame(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_ends() {
        assert_eq!(encode_sample(1.0), i16::MAX);
        assert_eq!(encode_sample(-1.0), i16::MIN);
        assert_eq!(encode_sample(0.0), 0);
        assert_eq!(encode_sample(3.5), i16::MAX);
        assert_eq!(encode_sample(-7.0), i16::MIN);
        assert_eq!(encode_sample(f32::NAN), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = encode_frame(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xff, 0x7f, 0x00, 0x80]);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let step = 1.0 / 32768.0;
        let samples: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 * 0.001).collect();

        let decoded = decode_frame(&encode_frame(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (orig, back) in samples.iter().zip(&decoded) {
            assert!(
                (orig - back).abs() <= step,
                "{} decoded as {}",
                orig,
                back
            );
        }
    }

    #[test]
    fn test_base64_path() {
        let text = encode_base64(&[0.25, -0.5]);
        let decoded = decode_base64(&text).unwrap();
        assert!((decoded[0] - 0.25).abs() <= 1.0 / 32768.0);
        assert!((decoded[1] + 0.5).abs() <= 1.0 / 32768.0);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(decode_frame(&[1, 2, 3]), Err(AppError::Encoding(_))));
        assert!(matches!(
            decode_base64("not base64!!"),
            Err(AppError::Encoding(_))
        ));
        // "AQID" is three bytes
        assert!(matches!(decode_base64("AQID"), Err(AppError::Encoding(_))));
        assert_eq!(decode_base64("").unwrap(), Vec::<f32>::new());
    }
}
