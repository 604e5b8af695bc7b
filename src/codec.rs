use base64::Engine;
use thiserror::Error;

/// A per-chunk recoverable decode failure. The session drops the offending
/// chunk and keeps running; it never escalates to teardown.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("PCM payload has odd byte length: {0}")]
    OddByteLength(usize),

    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A decoded block of mono audio, ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert normalized f32 samples to 16-bit little-endian PCM, clamped to
/// [-1, 1].
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

/// Interpret raw bytes as 16-bit little-endian PCM mono at `sample_rate` and
/// convert to normalized f32 samples.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<AudioClip, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }

    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        let value = i16::from_le_bytes([chunk[0], chunk[1]]);
        samples.push(value as f32 / 32768.0);
    }

    Ok(AudioClip {
        samples,
        sample_rate,
    })
}

/// Decode a standard base64 string as received on the wire.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Encode raw bytes for outbound wire transmission.
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}
