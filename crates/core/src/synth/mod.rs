use std::{f64::consts::TAU, fmt, time::Duration};

use crate::{AudioConfig, Tempo};

/// Upper bound on click length regardless of tempo.
pub const MAX_CLICK_SECONDS: f64 = 0.05;
/// Fraction of the beat interval a click may occupy.
const CLICK_SHARE_OF_BEAT: f64 = 0.1;

/// Tone parameters for the synthesized click.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClickVoice {
    pub frequency_hz: f64,
    pub amplitude: f64,
    pub decay_exponent: f64,
}

impl Default for ClickVoice {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

impl From<&AudioConfig> for ClickVoice {
    fn from(config: &AudioConfig) -> Self {
        Self {
            frequency_hz: config.click_frequency_hz,
            amplitude: config.amplitude,
            decay_exponent: config.decay_exponent,
        }
    }
}

/// One click rendered as signed 16-bit little-endian mono PCM.
///
/// Buffers are immutable once built; a tempo change produces a fresh buffer
/// that replaces the old one wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct ClickBuffer {
    samples: Vec<i16>,
    bytes: Vec<u8>,
    sample_rate: u32,
}

impl ClickBuffer {
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            samples,
            bytes,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Raw PCM bytes, ready for a device that takes s16le frames.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

impl fmt::Debug for ClickBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickBuffer")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Click length for a tempo: a tenth of the beat, capped at 50 ms so clicks
/// never overlap even at the fastest tempo.
pub fn click_seconds(tempo: Tempo) -> f64 {
    (CLICK_SHARE_OF_BEAT * 60.0 / f64::from(tempo.bpm())).min(MAX_CLICK_SECONDS)
}

/// Renders the default 440 Hz click for `tempo`.
pub fn synthesize(tempo: Tempo, sample_rate: u32) -> ClickBuffer {
    synthesize_with(tempo, sample_rate, &ClickVoice::default())
}

/// Renders a decaying sine burst whose length follows [`click_seconds`].
pub fn synthesize_with(tempo: Tempo, sample_rate: u32, voice: &ClickVoice) -> ClickBuffer {
    let seconds = click_seconds(tempo);
    let len = (seconds * f64::from(sample_rate)) as usize;
    let step = if len == 0 { 0.0 } else { seconds / len as f64 };
    let envelope_span = len.saturating_sub(1).max(1) as f64;

    let samples = (0..len)
        .map(|index| {
            let t = index as f64 * step;
            let tone = voice.amplitude * (TAU * voice.frequency_hz * t).sin();
            let envelope = (-voice.decay_exponent * index as f64 / envelope_span).exp();
            quantize(tone * envelope)
        })
        .collect();

    ClickBuffer::from_samples(samples, sample_rate)
}

fn quantize(value: f64) -> i16 {
    (value.clamp(-1.0, 1.0) * f64::from(i16::MAX)) as i16
}
