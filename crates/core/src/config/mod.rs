use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Tempo;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub scheduler: SchedulerConfig,
    /// Quick-access tempos offered by the control surface.
    #[serde(default = "default_presets")]
    pub presets: Vec<Tempo>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            scheduler: SchedulerConfig::default(),
            presets: default_presets(),
        }
    }
}

impl AppConfig {
    pub fn desktop_defaults() -> Self {
        Self::default()
    }
}

fn default_presets() -> Vec<Tempo> {
    [80, 110, 140]
        .into_iter()
        .filter_map(|bpm| Tempo::new(bpm).ok())
        .collect()
}

/// Configuration specific to click synthesis and the output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub click_frequency_hz: f64,
    /// Peak amplitude as a fraction of full scale.
    pub amplitude: f64,
    /// Envelope reaches `exp(-decay_exponent)` on the last sample.
    pub decay_exponent: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            click_frequency_hz: 440.0,
            amplitude: 0.5,
            decay_exponent: 5.0,
        }
    }
}

/// Configuration for the beat worker thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long `stop` waits for the worker before giving up on it.
    pub join_timeout_ms: u64,
    /// Consecutive write failures before audio is reported as degraded.
    pub degraded_after_failures: u32,
}

impl SchedulerConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 1_000,
            degraded_after_failures: 3,
        }
    }
}
