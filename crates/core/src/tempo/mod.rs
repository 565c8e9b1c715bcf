use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{MetronomeError, Result};

/// Validated tempo in beats per minute.
///
/// A `Tempo` always lies within [`Tempo::MIN`]..=[`Tempo::MAX`], so code that
/// receives one (the synthesizer, the scheduler) never has to re-check it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u16")]
pub struct Tempo(u16);

/// Direction of a single tempo nudge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Up,
    Down,
}

impl Tempo {
    pub const MIN: Tempo = Tempo(30);
    pub const MAX: Tempo = Tempo(300);
    pub const DEFAULT: Tempo = Tempo(100);
    /// Amount applied by [`Tempo::step`].
    pub const STEP: u16 = 5;

    /// Validates a requested tempo. Out-of-range values are rejected rather
    /// than clamped.
    pub fn new(bpm: i64) -> Result<Self> {
        if (i64::from(Self::MIN.0)..=i64::from(Self::MAX.0)).contains(&bpm) {
            Ok(Self(bpm as u16))
        } else {
            Err(MetronomeError::InvalidTempo(bpm.to_string()))
        }
    }

    /// Builds a tempo by clamping into the supported range.
    pub fn clamped(bpm: i64) -> Self {
        Self(bpm.clamp(i64::from(Self::MIN.0), i64::from(Self::MAX.0)) as u16)
    }

    pub fn bpm(self) -> u16 {
        self.0
    }

    /// Nudges the tempo by [`Tempo::STEP`], saturating at the bounds.
    pub fn step(self, step: Step) -> Self {
        let delta = i64::from(Self::STEP);
        match step {
            Step::Up => Self::clamped(i64::from(self.0) + delta),
            Step::Down => Self::clamped(i64::from(self.0) - delta),
        }
    }

    /// Time between two consecutive beats.
    pub fn interval(self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.0))
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Tempo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BPM", self.0)
    }
}

impl FromStr for Tempo {
    type Err = MetronomeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let bpm = trimmed
            .parse::<i64>()
            .map_err(|_| MetronomeError::InvalidTempo(trimmed.to_string()))?;
        Self::new(bpm)
    }
}

impl TryFrom<i64> for Tempo {
    type Error = MetronomeError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Tempo> for u16 {
    fn from(value: Tempo) -> Self {
        value.0
    }
}

/// Tempo cell shared between the control thread and the beat worker.
///
/// Writers store whole values and the worker reads once per iteration, so a
/// relaxed atomic is all the synchronisation needed.
#[derive(Debug, Clone)]
pub struct SharedTempo {
    bpm: Arc<AtomicU16>,
}

impl SharedTempo {
    pub fn new(tempo: Tempo) -> Self {
        Self {
            bpm: Arc::new(AtomicU16::new(tempo.bpm())),
        }
    }

    pub fn load(&self) -> Tempo {
        Tempo(self.bpm.load(Ordering::Relaxed))
    }

    pub fn store(&self, tempo: Tempo) {
        self.bpm.store(tempo.bpm(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_value_in_range() {
        for bpm in 30..=300 {
            assert_eq!(Tempo::new(bpm).unwrap().bpm(), bpm as u16);
        }
    }

    #[test]
    fn rejects_values_outside_range() {
        for bpm in [i64::MIN, -100, 0, 29, 301, 1_000] {
            assert!(matches!(
                Tempo::new(bpm),
                Err(MetronomeError::InvalidTempo(_))
            ));
        }
    }

    #[test]
    fn steps_clamp_to_bounds() {
        assert_eq!(Tempo::new(298).unwrap().step(Step::Up), Tempo::MAX);
        assert_eq!(Tempo::new(32).unwrap().step(Step::Down), Tempo::MIN);
        assert_eq!(Tempo::MAX.step(Step::Up), Tempo::MAX);
        assert_eq!(Tempo::DEFAULT.step(Step::Up).bpm(), 105);
        assert_eq!(Tempo::DEFAULT.step(Step::Down).bpm(), 95);
    }

    #[test]
    fn parses_text_input() {
        assert_eq!(" 120 ".parse::<Tempo>().unwrap().bpm(), 120);
        assert!("abc".parse::<Tempo>().is_err());
        assert!("12.5".parse::<Tempo>().is_err());
        assert!("400".parse::<Tempo>().is_err());
    }

    #[test]
    fn interval_matches_bpm() {
        assert_eq!(Tempo::new(60).unwrap().interval(), Duration::from_secs(1));
        let drift = Tempo::DEFAULT.interval().as_secs_f64() - 0.6;
        assert!(drift.abs() < 1e-6);
    }

    #[test]
    fn serde_rejects_out_of_range() {
        let tempo: Tempo = serde_json::from_str("130").unwrap();
        assert_eq!(tempo.bpm(), 130);
        assert!(serde_json::from_str::<Tempo>("20").is_err());
        assert_eq!(serde_json::to_string(&tempo).unwrap(), "130");
    }

    #[test]
    fn shared_tempo_is_visible_across_clones() {
        let shared = SharedTempo::new(Tempo::DEFAULT);
        let reader = shared.clone();
        shared.store(Tempo::new(180).unwrap());
        assert_eq!(reader.load().bpm(), 180);
    }
}
