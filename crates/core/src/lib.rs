//! Core library for the Metronome application.
//!
//! The crate holds everything except the user interface: tempo validation,
//! click synthesis, the background beat scheduler, the stopwatch, and the
//! gateway type ([`Metronome`]) a control surface drives. Audio output is
//! reached through the [`AudioSink`] trait so the scheduler can be exercised
//! without a sound card.

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod scheduler;
pub mod state;
pub mod synth;
pub mod tempo;
pub mod timer;

pub use audio::{AudioOutput, AudioSink, NullOutput, NullSink, SampleFormat, StreamFormat};
pub use config::{AppConfig, AudioConfig, SchedulerConfig};
pub use control::{Command, Metronome, Outcome, Status};
pub use error::{MetronomeError, Result};
pub use scheduler::{
    BeatCounter, BeatObserver, BeatScheduler, CancelToken, PlaybackState, SchedulerEvent,
    SharedClick, StopOutcome,
};
pub use state::{default_state_path, PersistedState};
pub use synth::{ClickBuffer, ClickVoice};
pub use tempo::{SharedTempo, Step, Tempo};
pub use timer::{format_hms, ElapsedTimer};
