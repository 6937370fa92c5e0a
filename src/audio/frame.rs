//! PCM frames and level metering

use crate::error::PacketError;

/// Full-scale magnitude of a signed 16-bit sample
const FULL_SCALE: f32 = 32768.0;

/// One fixed-size chunk of mono 16-bit PCM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A frame of digital silence
    pub fn silence(len: usize) -> Self {
        Self { samples: vec![0; len] }
    }

    /// Build a frame from little-endian PCM bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() % 2 != 0 {
            return Err(PacketError::MalformedPacket { len: bytes.len() });
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    /// Number of samples in the frame
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Payload size on the wire
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// RMS level normalized to full scale
    pub fn level(&self) -> f32 {
        rms_level(&self.samples)
    }
}

/// `clamp(sqrt(mean(s^2)) / 32768, 0, 1)`; an empty slice is silent.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;

    (rms / FULL_SCALE).clamp(0.0, 1.0)
}
