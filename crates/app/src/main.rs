use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use metronome_core::{
    default_state_path, format_hms, synth, AppConfig, AudioOutput, AudioSink, BeatObserver,
    Command, Metronome, NullOutput, Outcome, PersistedState, SchedulerEvent, Status, StopOutcome,
    StreamFormat, Tempo,
};
use tracing_subscriber::EnvFilter;

/// How often the status line is refreshed while running.
const REFRESH: Duration = Duration::from_secs(1);

fn main() -> metronome_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_interactive(&args),
        Commands::Click {
            bpm,
            output,
            sample_rate,
        } => export_click(bpm, &output, sample_rate),
    }
}

fn run_interactive(args: &RunArgs) -> metronome_core::Result<()> {
    let mut config = AppConfig::desktop_defaults();
    if let Some(rate) = args.sample_rate {
        config.audio.sample_rate = rate;
    }
    if let Some(frequency) = args.frequency {
        config.audio.click_frequency_hz = frequency;
    }

    let state_path = args.state.clone().or_else(default_state_path);
    let saved = match &state_path {
        Some(path) => PersistedState::load(path),
        None => {
            tracing::warn!("no state directory available; tempo will not be remembered");
            PersistedState::default()
        }
    };
    let initial = args.tempo.unwrap_or(saved.last_tempo);
    tracing::info!(bpm = initial.bpm(), ?state_path, "starting metronome");

    let format = StreamFormat::mono_i16(config.audio.sample_rate);

    #[cfg(feature = "playback")]
    let device = if args.silent {
        None
    } else {
        report_audio(metronome_core::audio::DeviceOutput::try_default())
    };
    #[cfg(feature = "playback")]
    let output: Option<&dyn AudioOutput> = match &device {
        Some(device) => Some(device),
        None if args.silent => Some(&NullOutput),
        None => None,
    };
    #[cfg(not(feature = "playback"))]
    let output: Option<&dyn AudioOutput> = {
        if !args.silent {
            tracing::info!("built without the `playback` feature; clicks are silent");
        }
        Some(&NullOutput)
    };
    let sink: Option<Box<dyn AudioSink>> =
        output.and_then(|output| report_audio(output.open(format)));

    let (events, inbox) = mpsc::channel();
    let scheduler_events = events.clone();
    let observer: BeatObserver = Arc::new(move |event: SchedulerEvent| {
        let _ = scheduler_events.send(UiEvent::Scheduler(event));
    });
    let mut metronome = Metronome::new(&config, initial, sink).with_observer(observer);

    spawn_stdin_reader(events)?;
    print_help(&metronome);

    if args.start {
        metronome.start()?;
    }
    render(&metronome.status());

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut degraded_reported = false;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::info!("run time elapsed");
            break;
        }

        match inbox.recv_timeout(REFRESH) {
            Ok(UiEvent::Line(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("help") {
                    print_help(&metronome);
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => match metronome.apply(command) {
                        Ok(Outcome::Exit) => break,
                        Ok(outcome) => report(&outcome),
                        Err(err) => tracing::warn!(%err, "command failed"),
                    },
                    Err(err) => tracing::warn!(%err, "ignoring input; type `help` for commands"),
                }
                render(&metronome.status());
            }
            Ok(UiEvent::InputClosed) => {
                tracing::debug!("stdin closed");
                if deadline.is_none() {
                    break;
                }
            }
            Ok(UiEvent::Scheduler(SchedulerEvent::AudioDegraded {
                consecutive_failures,
            })) => {
                if !degraded_reported {
                    tracing::error!(consecutive_failures, "audio output is failing repeatedly");
                    degraded_reported = true;
                }
            }
            Ok(UiEvent::Scheduler(SchedulerEvent::Beat { .. })) => render(&metronome.status()),
            Ok(UiEvent::Scheduler(_)) => {}
            Err(RecvTimeoutError::Timeout) => {
                if metronome.status().is_running {
                    render(&metronome.status());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("closing: stopping metronome and saving state");
    let state = metronome.shutdown();
    if let Some(path) = &state_path {
        if let Err(err) = state.save(path) {
            tracing::error!(%err, ?path, "failed to save state");
        }
    }
    Ok(())
}

fn export_click(bpm: Tempo, output: &Path, sample_rate: u32) -> metronome_core::Result<()> {
    let click = synth::synthesize(bpm, sample_rate);
    tracing::info!(
        ?output,
        bpm = bpm.bpm(),
        samples = click.len(),
        "writing click as raw s16le mono PCM"
    );
    std::fs::write(output, click.as_bytes())?;
    Ok(())
}

/// Logs an audio failure once and disables playback for the session.
fn report_audio<T>(result: metronome_core::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(%err, "audio unavailable; playback disabled for this session");
            None
        }
    }
}

/// Events handled on the control thread.
enum UiEvent {
    Line(String),
    InputClosed,
    Scheduler(SchedulerEvent),
}

fn spawn_stdin_reader(events: mpsc::Sender<UiEvent>) -> metronome_core::Result<()> {
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if events.send(UiEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to read input");
                        break;
                    }
                }
            }
            let _ = events.send(UiEvent::InputClosed);
        })?;
    Ok(())
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Started => tracing::info!("metronome started"),
        Outcome::AlreadyRunning => tracing::debug!("already running"),
        Outcome::Stopped(StopOutcome::TimedOut) => {
            tracing::warn!("metronome stopped but the audio thread did not exit in time")
        }
        Outcome::Stopped(StopOutcome::NotRunning) => tracing::debug!("already stopped"),
        Outcome::Stopped(_) => tracing::info!("metronome stopped"),
        Outcome::Tempo {
            tempo,
            accepted: false,
        } => println!("Tempo must be between 30 and 300; keeping {tempo}"),
        Outcome::Tempo { .. } | Outcome::Status(_) | Outcome::Exit => {}
    }
}

fn render(status: &Status) {
    println!(
        "Beat: {:<6} {}  {:>3} BPM  {}",
        status.beat_count,
        format_hms(status.elapsed_seconds),
        status.tempo.bpm(),
        if status.is_running { "running" } else { "stopped" }
    );
}

fn print_help(metronome: &Metronome) {
    let presets = metronome
        .presets()
        .iter()
        .enumerate()
        .map(|(i, tempo)| format!("{}={}", i + 1, tempo.bpm()))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "commands: start | stop | tempo <30-300> | + | - | preset <n> ({presets}) | status | exit"
    );
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Software metronome with a precise click", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metronome, reading commands from standard input.
    Run(RunArgs),
    /// Render a single click for a tempo and write it as raw PCM.
    Click {
        /// Tempo the click is sized for.
        bpm: Tempo,
        /// Destination for the s16le mono samples.
        output: PathBuf,
        #[arg(long, default_value_t = 44_100, value_parser = sample_rate_parser())]
        sample_rate: u32,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Initial tempo; defaults to the tempo saved on last exit.
    #[arg(short, long)]
    tempo: Option<Tempo>,
    /// State file that remembers the last tempo.
    #[arg(long)]
    state: Option<PathBuf>,
    /// Do not open an audio device.
    #[arg(long)]
    silent: bool,
    /// Start playing immediately.
    #[arg(long)]
    start: bool,
    /// Exit automatically after this many seconds.
    #[arg(long)]
    seconds: Option<u64>,
    /// Click sample rate in Hz.
    #[arg(long, value_parser = sample_rate_parser())]
    sample_rate: Option<u32>,
    /// Click tone frequency in Hz.
    #[arg(long)]
    frequency: Option<f64>,
}

/// Sample rates must be positive; a zero rate yields an empty click.
fn sample_rate_parser() -> clap::builder::RangedI64ValueParser<u32> {
    clap::value_parser!(u32).range(1..)
}
