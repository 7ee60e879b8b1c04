//! Audio frame types and the PCM wire codec
//!
//! Outbound audio is captured as normalized f32, quantized to little-endian
//! signed 16-bit PCM and base64 encoded. Inbound audio takes the reverse path.

use crate::error::{LiveError, Result};
use base64::engine::general_purpose;
use base64::Engine;
use std::time::Duration;

const PCM_MIME: &str = "audio/pcm";

/// Block of captured samples, mono, normalized to [-1, 1].
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    pub samples: &'a [f32],
    pub sample_rate: u32,
}

/// Transport-safe encoding of one captured block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Format tag, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64 of little-endian i16 samples
    pub data: String,
}

/// Inbound audio exactly as the session received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub mime_type: Option<String>,
    pub data: String,
}

/// Decoded inbound audio ready for scheduling.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl InboundChunk {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Exact duration of `samples` at `sample_rate`, in whole nanoseconds.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

/// Number of samples covering `duration` at `sample_rate`, rounded down.
pub fn duration_to_samples(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as usize
}

/// MIME tag for 16-bit mono PCM at `sample_rate`.
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}

/// Extract the sample rate from a PCM MIME tag.
///
/// Returns `Ok(None)` for a bare `audio/pcm`, and an error for anything that
/// is not raw PCM.
pub fn parse_pcm_mime(mime: &str) -> Result<Option<u32>> {
    let mut params = mime.split(';').map(str::trim);
    let base = params.next().unwrap_or_default();
    if !base.eq_ignore_ascii_case(PCM_MIME) && !base.eq_ignore_ascii_case("audio/l16") {
        return Err(LiveError::Decode(format!("unsupported audio format: {}", mime)));
    }

    for param in params {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                let rate = value
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|r| *r > 0)
                    .ok_or_else(|| LiveError::Decode(format!("invalid rate in {}", mime)))?;
                return Ok(Some(rate));
            }
        }
    }
    Ok(None)
}

/// Quantize one normalized sample. Out-of-range input is clamped, NaN maps to 0.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode a captured block into a [`WireFrame`]. Holds no state between calls.
pub fn encode_frame(frame: AudioFrame<'_>) -> WireFrame {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in frame.samples {
        bytes.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }

    WireFrame {
        mime_type: pcm_mime(frame.sample_rate),
        data: general_purpose::STANDARD.encode(&bytes),
    }
}

/// Decode little-endian i16 PCM bytes.
pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode an inbound payload. `default_rate` applies when the payload does
/// not declare one.
pub fn decode_payload(payload: &InboundPayload, default_rate: u32) -> Result<InboundChunk> {
    let sample_rate = match payload.mime_type.as_deref() {
        Some(mime) => parse_pcm_mime(mime)?.unwrap_or(default_rate),
        None => default_rate,
    };

    let bytes = general_purpose::STANDARD
        .decode(payload.data.as_bytes())
        .map_err(|e| LiveError::Decode(format!("invalid base64 audio: {}", e)))?;
    if bytes.is_empty() {
        return Err(LiveError::Decode("empty audio payload".to_string()));
    }

    let samples = pcm_bytes_to_i16(&bytes)?
        .into_iter()
        .map(i16_to_f32)
        .collect();

    Ok(InboundChunk {
        samples,
        sample_rate,
    })
}
