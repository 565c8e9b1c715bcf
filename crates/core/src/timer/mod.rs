use std::time::{Duration, Instant};

/// Stopwatch shown next to the beat counter.
///
/// While running, elapsed time is measured from the start instant. Stopping
/// clears the instant but keeps the last reading so the display stays frozen
/// until the next start.
#[derive(Debug, Default, Clone)]
pub struct ElapsedTimer {
    started_at: Option<Instant>,
    frozen: Duration,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.frozen = Duration::ZERO;
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    pub fn stop_at(&mut self, now: Instant) {
        if let Some(start) = self.started_at.take() {
            self.frozen = now.saturating_duration_since(start);
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(start) => now.saturating_duration_since(start),
            None => self.frozen,
        }
    }
}

/// Formats whole seconds as `HH:MM:SS`.
pub fn format_hms(total_seconds: u64) -> String {
    let hours = total_seconds / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
