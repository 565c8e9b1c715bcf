//! Background beat loop.
//!
//! [`BeatScheduler`] owns at most one worker thread. The worker reads the
//! shared tempo and click buffer every iteration, writes the click to the
//! audio sink, then waits out the rest of the beat on a [`CancelToken`] so a
//! stop request wakes it immediately.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;

use crate::{AudioSink, ClickBuffer, MetronomeError, Result, SchedulerConfig, SharedTempo};

/// Click buffer slot shared with the worker. Replaced wholesale, never edited.
pub type SharedClick = Arc<ArcSwap<ClickBuffer>>;

/// Callback invoked on the worker thread for every [`SchedulerEvent`].
///
/// Implementations should hand the event to their own thread (a channel send,
/// for instance) instead of touching UI state directly.
pub type BeatObserver = Arc<dyn Fn(SchedulerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Running,
}

/// Notifications published by the beat worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A beat finished; `count` is the new counter value.
    Beat { count: u64 },
    /// Writing the click took the whole interval, so there was no sleep.
    Overrun {
        beat: u64,
        interval: Duration,
        elapsed: Duration,
    },
    /// Several writes in a row failed.
    AudioDegraded { consecutive_failures: u32 },
}

/// Result of [`BeatScheduler::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Joined,
    /// The worker did not finish in time. It is kept aside and reaped by the
    /// next [`BeatScheduler::start`], which also recovers its audio sink.
    TimedOut,
    /// The worker panicked; its audio sink is gone.
    Panicked,
}

/// One-shot stop signal that can interrupt a sleeping worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`, returning early once cancelled. Returns
    /// whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Beat count readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct BeatCounter {
    count: Arc<AtomicU64>,
}

impl BeatCounter {
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Default)]
struct Diagnostics {
    overruns: AtomicU64,
    failed_writes: AtomicU64,
}

/// Owns the beat worker and the audio sink it plays through.
pub struct BeatScheduler {
    config: SchedulerConfig,
    sink: Option<Box<dyn AudioSink>>,
    beats: BeatCounter,
    diagnostics: Arc<Diagnostics>,
    observer: Option<BeatObserver>,
    worker: Option<Worker>,
    /// Worker whose stop timed out; still holds the counter and the sink.
    lingering: Option<Worker>,
}

struct Worker {
    cancel: CancelToken,
    has_sink: bool,
    finished: mpsc::Receiver<Option<Box<dyn AudioSink>>>,
    handle: JoinHandle<()>,
}

impl BeatScheduler {
    /// Creates a stopped scheduler. Without a sink the worker still keeps
    /// time and counts beats, it just stays silent.
    pub fn new(config: SchedulerConfig, sink: Option<Box<dyn AudioSink>>) -> Self {
        Self {
            config,
            sink,
            beats: BeatCounter::default(),
            diagnostics: Arc::new(Diagnostics::default()),
            observer: None,
            worker: None,
            lingering: None,
        }
    }

    pub fn with_observer(mut self, observer: BeatObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> PlaybackState {
        if self.worker.is_some() {
            PlaybackState::Running
        } else {
            PlaybackState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PlaybackState::Running
    }

    pub fn beat_count(&self) -> u64 {
        self.beats.get()
    }

    /// Handle for reading the beat count without borrowing the scheduler.
    pub fn beat_counter(&self) -> BeatCounter {
        self.beats.clone()
    }

    /// Zeroes the counter. Ignored while running.
    pub fn reset_beats(&self) {
        if !self.is_running() {
            self.beats.reset();
        }
    }

    /// Whether the scheduler currently holds an audio sink, either idle or
    /// lent to the worker.
    pub fn has_audio(&self) -> bool {
        self.sink.is_some() || self.worker.as_ref().is_some_and(|w| w.has_sink)
    }

    pub fn overruns(&self) -> u64 {
        self.diagnostics.overruns.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.diagnostics.failed_writes.load(Ordering::Relaxed)
    }

    /// Spawns the worker. Returns `Ok(false)` without side effects if a worker
    /// is already running, and an error while a timed-out worker from the
    /// previous run is still alive.
    pub fn start(&mut self, tempo: &SharedTempo, click: &SharedClick) -> Result<bool> {
        if self.worker.is_some() {
            tracing::debug!("start ignored: beat loop already running");
            return Ok(false);
        }
        if !self.reap_lingering(self.config.join_timeout()) {
            return Err(MetronomeError::msg(
                "previous beat loop has not exited yet; try again shortly",
            ));
        }

        self.beats.reset();
        let cancel = CancelToken::new();
        let (finished_tx, finished) = mpsc::channel();
        let has_sink = self.sink.is_some();
        let beat_loop = BeatLoop {
            tempo: tempo.clone(),
            click: Arc::clone(click),
            sink: self.sink.take(),
            cancel: cancel.clone(),
            beats: self.beats.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            observer: self.observer.clone(),
            degraded_after: self.config.degraded_after_failures,
            consecutive_failures: 0,
        };

        let handle = thread::Builder::new()
            .name("beat-scheduler".to_string())
            .spawn(move || {
                let sink = beat_loop.run();
                let _ = finished_tx.send(sink);
            })?;

        self.worker = Some(Worker {
            cancel,
            has_sink,
            finished,
            handle,
        });
        tracing::info!(bpm = tempo.load().bpm(), "beat loop started");
        Ok(true)
    }

    /// Signals the worker and waits for it, bounded by the configured join
    /// timeout. Once this returns `Joined`, no further click is written.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(worker) = self.worker.take() else {
            tracing::debug!("stop ignored: beat loop not running");
            return StopOutcome::NotRunning;
        };

        worker.cancel.cancel();
        let timeout = self.config.join_timeout();
        let outcome = match worker.finished.recv_timeout(timeout) {
            Ok(sink) => {
                self.sink = sink;
                if worker.handle.join().is_err() {
                    tracing::warn!("beat worker panicked after releasing audio");
                }
                StopOutcome::Joined
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "beat worker did not exit in time; it will be reaped before the next start"
                );
                self.lingering = Some(worker);
                StopOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                tracing::error!("beat worker panicked; audio output lost");
                StopOutcome::Panicked
            }
        };

        tracing::info!(beats = self.beats.get(), ?outcome, "beat loop stopped");
        outcome
    }

    /// Waits up to `timeout` for a worker left behind by a timed-out stop.
    /// Returns whether no such worker remains.
    fn reap_lingering(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.lingering.take() else {
            return true;
        };
        match worker.finished.recv_timeout(timeout) {
            Ok(sink) => {
                self.sink = sink;
                let _ = worker.handle.join();
                tracing::debug!(recovered_audio = self.sink.is_some(), "reaped beat worker");
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                tracing::error!("lingering beat worker panicked; audio output lost");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.lingering = Some(worker);
                false
            }
        }
    }

    /// Stops the worker if needed and closes the audio sink.
    pub fn close_audio(&mut self) -> Result<()> {
        self.stop();
        self.reap_lingering(Duration::ZERO);
        match self.sink.take() {
            Some(mut sink) => sink.close(),
            None => Ok(()),
        }
    }
}

impl Drop for BeatScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for BeatScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatScheduler")
            .field("state", &self.state())
            .field("beats", &self.beats.get())
            .field("idle_sink", &self.sink.is_some())
            .field("overruns", &self.overruns())
            .finish()
    }
}

/// State moved onto the worker thread.
struct BeatLoop {
    tempo: SharedTempo,
    click: SharedClick,
    sink: Option<Box<dyn AudioSink>>,
    cancel: CancelToken,
    beats: BeatCounter,
    diagnostics: Arc<Diagnostics>,
    observer: Option<BeatObserver>,
    degraded_after: u32,
    consecutive_failures: u32,
}

impl BeatLoop {
    fn run(mut self) -> Option<Box<dyn AudioSink>> {
        while !self.cancel.is_cancelled() {
            self.iterate();
        }
        self.sink
    }

    fn iterate(&mut self) {
        let started = Instant::now();
        let interval = self.tempo.load().interval();
        let click = self.click.load_full();

        self.play(&click);

        let elapsed = started.elapsed();
        match interval.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                // Wakes early on stop; the beat still counts since it played.
                self.cancel.wait_timeout(remaining);
            }
            _ => {
                let beat = self.beats.get() + 1;
                self.diagnostics.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    beat,
                    interval_ms = interval.as_secs_f64() * 1e3,
                    elapsed_ms = elapsed.as_secs_f64() * 1e3,
                    "metronome falling behind, no sleep this beat"
                );
                self.publish(SchedulerEvent::Overrun {
                    beat,
                    interval,
                    elapsed,
                });
            }
        }

        let count = self.beats.increment();
        tracing::debug!(count, "beat");
        self.publish(SchedulerEvent::Beat { count });
    }

    fn play(&mut self, click: &ClickBuffer) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        match sink.write(click) {
            Ok(()) => self.consecutive_failures = 0,
            Err(err) => {
                self.diagnostics.failed_writes.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures += 1;
                tracing::error!(
                    %err,
                    failures = self.consecutive_failures,
                    "audio write failed, skipping beat"
                );
                if self.degraded_after > 0 && self.consecutive_failures == self.degraded_after {
                    self.publish(SchedulerEvent::AudioDegraded {
                        consecutive_failures: self.consecutive_failures,
                    });
                }
            }
        }
    }

    fn publish(&self, event: SchedulerEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, Sender};

    use super::*;
    use crate::{synth, MetronomeError, StreamFormat, Tempo};

    const WAIT: Duration = Duration::from_secs(5);

    /// Sink that reports every write on a channel and can be told to fail or
    /// to stall.
    struct ProbeSink {
        writes: Arc<AtomicU64>,
        written: Sender<u64>,
        fail: bool,
        stall: Option<Duration>,
        closed: Arc<AtomicU64>,
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    struct Probe {
        writes: Arc<AtomicU64>,
        written: Receiver<u64>,
        closed: Arc<AtomicU64>,
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    fn probe_sink(fail: bool, stall: Option<Duration>) -> (Box<dyn AudioSink>, Probe) {
        let writes = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let sink = ProbeSink {
            writes: Arc::clone(&writes),
            written: tx,
            fail,
            stall,
            closed: Arc::clone(&closed),
            lengths: Arc::clone(&lengths),
        };
        let probe = Probe {
            writes,
            written: rx,
            closed,
            lengths,
        };
        (Box::new(sink), probe)
    }

    impl AudioSink for ProbeSink {
        fn format(&self) -> StreamFormat {
            StreamFormat::mono_i16(44_100)
        }

        fn write(&mut self, click: &ClickBuffer) -> Result<()> {
            if let Some(stall) = self.stall {
                thread::sleep(stall);
            }
            self.lengths.lock().unwrap().push(click.len());
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.written.send(n);
            if self.fail {
                Err(MetronomeError::audio("device unplugged"))
            } else {
                Ok(())
            }
        }

        fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn shared(bpm: i64) -> (SharedTempo, SharedClick) {
        let tempo = Tempo::new(bpm).unwrap();
        let click = Arc::new(ArcSwap::from_pointee(synth::synthesize(tempo, 44_100)));
        (SharedTempo::new(tempo), click)
    }

    fn observed() -> (BeatObserver, Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let observer: BeatObserver = Arc::new(move |event: SchedulerEvent| {
            let _ = tx.lock().unwrap().send(event);
        });
        (observer, rx)
    }

    #[test]
    fn stop_after_first_write_counts_exactly_one_beat() {
        let (sink, probe) = probe_sink(false, None);
        let (tempo, click) = shared(100);
        let mut scheduler = BeatScheduler::new(SchedulerConfig::default(), Some(sink));

        assert!(scheduler.start(&tempo, &click).unwrap());
        assert_eq!(probe.written.recv_timeout(WAIT).unwrap(), 1);

        let begun = Instant::now();
        assert_eq!(scheduler.stop(), StopOutcome::Joined);
        assert!(begun.elapsed() < Duration::from_millis(500));

        assert_eq!(probe.writes.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.beat_count(), 1);
        assert_eq!(scheduler.state(), PlaybackState::Stopped);
        assert!(scheduler.has_audio());
    }

    #[test]
    fn redundant_start_and_stop_are_no_ops() {
        let (tempo, click) = shared(300);
        let mut scheduler = BeatScheduler::new(SchedulerConfig::default(), None);

        assert_eq!(scheduler.stop(), StopOutcome::NotRunning);
        assert!(scheduler.start(&tempo, &click).unwrap());
        assert!(!scheduler.start(&tempo, &click).unwrap());
        assert!(scheduler.is_running());
        assert_eq!(scheduler.stop(), StopOutcome::Joined);
        assert_eq!(scheduler.stop(), StopOutcome::NotRunning);
    }

    #[test]
    fn start_resets_count_and_stop_keeps_it() {
        let (tempo, click) = shared(300);
        let (observer, events) = observed();
        let mut scheduler =
            BeatScheduler::new(SchedulerConfig::default(), None).with_observer(observer);

        scheduler.start(&tempo, &click).unwrap();
        while events.recv_timeout(WAIT).unwrap() != (SchedulerEvent::Beat { count: 2 }) {}
        scheduler.stop();
        let kept = scheduler.beat_count();
        assert!(kept >= 2);
        assert_eq!(scheduler.beat_count(), kept);

        scheduler.start(&tempo, &click).unwrap();
        assert!(scheduler.beat_count() <= 1);
        scheduler.stop();
    }

    #[test]
    fn reports_overrun_when_write_exceeds_interval() {
        let (sink, _probe) = probe_sink(false, Some(Duration::from_millis(250)));
        let (tempo, click) = shared(300);
        let (observer, events) = observed();
        let mut scheduler =
            BeatScheduler::new(SchedulerConfig::default(), Some(sink)).with_observer(observer);

        scheduler.start(&tempo, &click).unwrap();
        let overrun = loop {
            if let SchedulerEvent::Overrun { beat, interval, elapsed } =
                events.recv_timeout(WAIT).unwrap()
            {
                break (beat, interval, elapsed);
            }
        };
        scheduler.stop();

        assert_eq!(overrun.0, 1);
        assert!(overrun.2 >= overrun.1);
        assert!(scheduler.overruns() >= 1);
    }

    #[test]
    fn failed_writes_do_not_end_the_session() {
        let (sink, probe) = probe_sink(true, None);
        let (tempo, click) = shared(300);
        let (observer, events) = observed();
        let config = SchedulerConfig {
            degraded_after_failures: 2,
            ..SchedulerConfig::default()
        };
        let mut scheduler = BeatScheduler::new(config, Some(sink)).with_observer(observer);

        scheduler.start(&tempo, &click).unwrap();
        loop {
            if let SchedulerEvent::AudioDegraded {
                consecutive_failures,
            } = events.recv_timeout(WAIT).unwrap()
            {
                assert_eq!(consecutive_failures, 2);
                break;
            }
        }
        assert!(probe.written.recv_timeout(WAIT).is_ok());
        scheduler.stop();

        assert!(scheduler.failed_writes() >= 2);
        assert!(scheduler.beat_count() >= 2);
    }

    #[test]
    fn silent_scheduler_still_counts_beats() {
        let (tempo, click) = shared(300);
        let (observer, events) = observed();
        let mut scheduler =
            BeatScheduler::new(SchedulerConfig::default(), None).with_observer(observer);

        scheduler.start(&tempo, &click).unwrap();
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            SchedulerEvent::Beat { count: 1 }
        );
        scheduler.stop();
        assert!(!scheduler.has_audio());
    }

    #[test]
    fn join_timeout_detaches_stuck_worker() {
        let (sink, probe) = probe_sink(false, Some(Duration::from_millis(400)));
        let (tempo, click) = shared(300);
        let config = SchedulerConfig {
            join_timeout_ms: 20,
            ..SchedulerConfig::default()
        };
        let mut scheduler = BeatScheduler::new(config, Some(sink));

        scheduler.start(&tempo, &click).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(scheduler.stop(), StopOutcome::TimedOut);
        assert!(!scheduler.is_running());
        assert!(!scheduler.has_audio());
        drop(probe);
    }

    #[test]
    fn restart_waits_for_timed_out_worker() {
        let (sink, probe) = probe_sink(false, Some(Duration::from_millis(400)));
        let (tempo, click) = shared(300);
        let config = SchedulerConfig {
            join_timeout_ms: 20,
            ..SchedulerConfig::default()
        };
        let mut scheduler = BeatScheduler::new(config, Some(sink));

        scheduler.start(&tempo, &click).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(scheduler.stop(), StopOutcome::TimedOut);

        // The old worker is mid-write, so a restart is refused.
        assert!(scheduler.start(&tempo, &click).is_err());
        assert!(!scheduler.is_running());

        probe.written.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(100));

        tempo.store(Tempo::new(30).unwrap());
        assert!(scheduler.start(&tempo, &click).unwrap());
        assert!(scheduler.has_audio());

        // First beat of the new run lands after 2 s; nothing may touch the
        // counter before then.
        thread::sleep(Duration::from_millis(700));
        assert_eq!(scheduler.beat_count(), 0);
        scheduler.stop();
    }

    #[test]
    fn live_tempo_change_reaches_the_worker() {
        let (sink, probe) = probe_sink(false, None);
        let (tempo, click) = shared(100);
        let mut scheduler = BeatScheduler::new(SchedulerConfig::default(), Some(sink));

        scheduler.start(&tempo, &click).unwrap();
        probe.written.recv_timeout(WAIT).unwrap();

        let faster = Tempo::new(300).unwrap();
        click.store(Arc::new(synth::synthesize(faster, 44_100)));
        tempo.store(faster);

        // Next write is due within one 600 ms beat.
        probe.written.recv_timeout(Duration::from_millis(1_500)).unwrap();
        scheduler.stop();

        let lengths = probe.lengths.lock().unwrap();
        assert_eq!(lengths[0], 2205);
        assert_eq!(lengths[1], 882);
    }

    #[test]
    fn close_audio_stops_and_closes_sink() {
        let (sink, probe) = probe_sink(false, None);
        let (tempo, click) = shared(300);
        let mut scheduler = BeatScheduler::new(SchedulerConfig::default(), Some(sink));

        scheduler.start(&tempo, &click).unwrap();
        probe.written.recv_timeout(WAIT).unwrap();
        scheduler.close_audio().unwrap();

        assert!(!scheduler.is_running());
        assert!(!scheduler.has_audio());
        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_wakes_a_long_wait() {
        let token = CancelToken::new();
        let remote = token.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let begun = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(30)));
        assert!(begun.elapsed() < WAIT);
        waker.join().unwrap();
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }
}
