//! Playout post-processing: gain and a low-pass to cut capture hiss

use std::f32::consts::{FRAC_1_SQRT_2, PI};

/// Second-order Butterworth low-pass (RBJ biquad, direct form I)
#[derive(Debug, Clone)]
pub struct LowPass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl LowPass {
    pub fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f32;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;

        Self {
            b0: (1.0 - cos) / 2.0 / a0,
            b1: (1.0 - cos) / a0,
            b2: (1.0 - cos) / 2.0 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Converts PCM frames to device-ready floats
#[derive(Debug, Clone)]
pub struct PlayoutProcessor {
    gain: f32,
    lowpass: Option<LowPass>,
}

impl PlayoutProcessor {
    pub fn new(gain: f32, lowpass_hz: Option<f32>, sample_rate: u32) -> Self {
        Self {
            gain,
            lowpass: lowpass_hz.map(|cutoff| LowPass::new(cutoff, sample_rate)),
        }
    }

    /// Normalize, filter, amplify and clip to [-1, 1]
    pub fn process(&mut self, samples: &[i16]) -> Vec<f32> {
        samples
            .iter()
            .map(|&s| {
                let mut x = s as f32 / 32768.0;
                if let Some(filter) = self.lowpass.as_mut() {
                    x = filter.process(x);
                }
                (x * self.gain).clamp(-1.0, 1.0)
            })
            .collect()
    }
}
