//! Gateway between the control surface and the beat machinery.
//!
//! [`Metronome`] keeps the tempo, the click buffer and the playback state in
//! step: every accepted tempo change regenerates the click before returning,
//! and start/stop drive both the scheduler and the stopwatch.

use std::{str::FromStr, sync::Arc};

use arc_swap::ArcSwap;

use crate::{
    synth::{self, ClickVoice},
    AppConfig, AudioSink, BeatObserver, BeatScheduler, ClickBuffer, ElapsedTimer, MetronomeError,
    PersistedState, PlaybackState, Result, SharedClick, SharedTempo, Step, StopOutcome, Tempo,
};

/// Requests a control surface can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    SetTempo(i64),
    Step(Step),
    /// Zero-based index into the configured presets.
    Preset(usize),
    Status,
    Exit,
}

impl FromStr for Command {
    type Err = MetronomeError;

    /// Parses one line of user input, e.g. `start`, `tempo 120`, `120`, `+`,
    /// `preset 2` (presets are numbered from 1 in text).
    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let head = words
            .next()
            .ok_or_else(|| MetronomeError::msg("empty command"))?
            .to_ascii_lowercase();
        let arg = words.next();
        if words.next().is_some() {
            return Err(MetronomeError::msg(format!("too many arguments in `{line}`")));
        }

        let command = match (head.as_str(), arg) {
            ("start", None) => Command::Start,
            ("stop", None) => Command::Stop,
            ("+" | "up", None) => Command::Step(Step::Up),
            ("-" | "down", None) => Command::Step(Step::Down),
            ("status", None) => Command::Status,
            ("exit" | "quit" | "q", None) => Command::Exit,
            ("tempo" | "bpm", Some(value)) => Command::SetTempo(parse_bpm(value)?),
            ("preset", Some(value)) => match value.parse::<usize>() {
                Ok(n) if n > 0 => Command::Preset(n - 1),
                _ => return Err(MetronomeError::msg(format!("invalid preset `{value}`"))),
            },
            (number, None) if number.parse::<i64>().is_ok() => {
                Command::SetTempo(parse_bpm(number)?)
            }
            _ => return Err(MetronomeError::msg(format!("unknown command `{line}`"))),
        };
        Ok(command)
    }
}

fn parse_bpm(value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| MetronomeError::InvalidTempo(value.to_string()))
}

/// Snapshot published to the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub tempo: Tempo,
    pub beat_count: u64,
    pub elapsed_seconds: u64,
    pub is_running: bool,
}

/// What happened in response to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    AlreadyRunning,
    Stopped(StopOutcome),
    Tempo { tempo: Tempo, accepted: bool },
    Status(Status),
    Exit,
}

/// Tempo and playback state owned by the control thread.
#[derive(Debug)]
pub struct Metronome {
    tempo: SharedTempo,
    click: SharedClick,
    sample_rate: u32,
    voice: ClickVoice,
    presets: Vec<Tempo>,
    scheduler: BeatScheduler,
    timer: ElapsedTimer,
}

impl Metronome {
    /// Builds a stopped metronome. `sink` is `None` when audio could not be
    /// opened; the metronome then runs silently.
    pub fn new(config: &AppConfig, initial: Tempo, sink: Option<Box<dyn AudioSink>>) -> Self {
        let voice = ClickVoice::from(&config.audio);
        let sample_rate = config.audio.sample_rate;
        if let Some(sink) = &sink {
            if sink.format().sample_rate != sample_rate {
                tracing::warn!(
                    stream = sink.format().sample_rate,
                    clicks = sample_rate,
                    "audio stream and click sample rates differ"
                );
            }
        }
        let click = synth::synthesize_with(initial, sample_rate, &voice);

        Self {
            tempo: SharedTempo::new(initial),
            click: Arc::new(ArcSwap::from_pointee(click)),
            sample_rate,
            voice,
            presets: config.presets.clone(),
            scheduler: BeatScheduler::new(config.scheduler.clone(), sink),
            timer: ElapsedTimer::new(),
        }
    }

    /// Routes scheduler events to `observer`.
    pub fn with_observer(mut self, observer: BeatObserver) -> Self {
        self.scheduler = self.scheduler.with_observer(observer);
        self
    }

    pub fn tempo(&self) -> Tempo {
        self.tempo.load()
    }

    /// The click the worker will play on its next beat.
    pub fn click(&self) -> Arc<ClickBuffer> {
        self.click.load_full()
    }

    pub fn presets(&self) -> &[Tempo] {
        &self.presets
    }

    pub fn state(&self) -> PlaybackState {
        self.scheduler.state()
    }

    pub fn has_audio(&self) -> bool {
        self.scheduler.has_audio()
    }

    /// Applies `bpm` if it is in range, otherwise returns the error and keeps
    /// the current tempo.
    pub fn try_set_tempo(&mut self, bpm: i64) -> Result<Tempo> {
        let tempo = Tempo::new(bpm)?;
        self.apply_tempo(tempo);
        tracing::info!(bpm = tempo.bpm(), "tempo set");
        Ok(tempo)
    }

    /// Returns the tempo in effect afterwards: `bpm` when accepted, the
    /// previous tempo when rejected.
    pub fn set_tempo(&mut self, bpm: i64) -> Tempo {
        match self.try_set_tempo(bpm) {
            Ok(tempo) => tempo,
            Err(err) => {
                let kept = self.tempo();
                tracing::warn!(%err, kept = kept.bpm(), "tempo rejected");
                kept
            }
        }
    }

    /// Same as [`Metronome::set_tempo`] for raw text input.
    pub fn set_tempo_text(&mut self, text: &str) -> Tempo {
        match parse_bpm(text.trim()) {
            Ok(bpm) => self.set_tempo(bpm),
            Err(err) => {
                let kept = self.tempo();
                tracing::warn!(%err, kept = kept.bpm(), "tempo rejected");
                kept
            }
        }
    }

    /// Nudges the tempo by one step, clamped to the supported range. At a
    /// bound this changes nothing, the beat count included.
    pub fn step(&mut self, step: Step) -> Tempo {
        let tempo = self.tempo().step(step);
        if tempo == self.tempo() {
            tracing::debug!(bpm = tempo.bpm(), ?step, "tempo already at its limit");
            return tempo;
        }
        self.apply_tempo(tempo);
        tracing::info!(bpm = tempo.bpm(), ?step, "tempo stepped");
        tempo
    }

    pub fn preset(&mut self, index: usize) -> Result<Tempo> {
        let tempo = self.presets.get(index).copied().ok_or_else(|| {
            MetronomeError::msg(format!("no preset {} configured", index + 1))
        })?;
        self.try_set_tempo(i64::from(tempo.bpm()))
    }

    /// Starts the beat loop, resetting the counter and stopwatch. Returns
    /// `false` if it was already running.
    pub fn start(&mut self) -> Result<bool> {
        let started = self.scheduler.start(&self.tempo, &self.click)?;
        if started {
            self.timer.start();
        }
        Ok(started)
    }

    /// Stops the beat loop. The counter and stopwatch keep their last values.
    pub fn stop(&mut self) -> StopOutcome {
        let outcome = self.scheduler.stop();
        if outcome != StopOutcome::NotRunning {
            self.timer.stop();
        }
        outcome
    }

    pub fn status(&self) -> Status {
        Status {
            tempo: self.tempo(),
            beat_count: self.scheduler.beat_count(),
            elapsed_seconds: self.timer.elapsed().as_secs(),
            is_running: self.scheduler.is_running(),
        }
    }

    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            last_tempo: self.tempo(),
        }
    }

    pub fn apply(&mut self, command: Command) -> Result<Outcome> {
        let outcome = match command {
            Command::Start => {
                if self.start()? {
                    Outcome::Started
                } else {
                    Outcome::AlreadyRunning
                }
            }
            Command::Stop => Outcome::Stopped(self.stop()),
            Command::SetTempo(bpm) => {
                let tempo = self.set_tempo(bpm);
                Outcome::Tempo {
                    tempo,
                    accepted: i64::from(tempo.bpm()) == bpm,
                }
            }
            Command::Step(step) => Outcome::Tempo {
                tempo: self.step(step),
                accepted: true,
            },
            Command::Preset(index) => Outcome::Tempo {
                tempo: self.preset(index)?,
                accepted: true,
            },
            Command::Status => Outcome::Status(self.status()),
            Command::Exit => Outcome::Exit,
        };
        Ok(outcome)
    }

    /// Stops playback, releases the audio device and returns the state to
    /// persist.
    pub fn shutdown(mut self) -> PersistedState {
        self.stop();
        if let Err(err) = self.scheduler.close_audio() {
            tracing::error!(%err, "failed to close audio output");
        }
        self.persisted()
    }

    fn apply_tempo(&mut self, tempo: Tempo) {
        let click = synth::synthesize_with(tempo, self.sample_rate, &self.voice);
        tracing::debug!(
            bpm = tempo.bpm(),
            click_ms = click.duration().as_secs_f64() * 1e3,
            "regenerated click"
        );
        let changed = tempo != self.tempo();
        self.click.store(Arc::new(click));
        self.tempo.store(tempo);
        if changed && self.state() == PlaybackState::Stopped {
            self.scheduler.reset_beats();
        }
    }
}
