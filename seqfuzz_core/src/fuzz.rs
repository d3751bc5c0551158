//! The fuzzing loop: generate a message, send it, retry on silence, declare a
//! crash after repeated silence, and wait for the target to come back.

use crate::error::{Cancelled, LibraryError};
use crate::generator::MessageGenerator;
use crate::process::{CancelToken, ProcessHandle, ProcessOutcome, ProcessState, ProgressReporter};
use crate::recording::{RecordingKind, Recordings};
use crate::structure::InjectedStructure;
use crate::transmit::Transmitter;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime};

/// Send attempts per message before the target is considered crashed.
pub const SEND_ATTEMPTS: u32 = 3;
const BACKOFF_EXPONENT: f64 = 0.75;

/// Which exchanges end up in the recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingPolicy {
    /// Every successful request and response, plus crashes.
    #[default]
    All,
    /// Crashes only.
    Critical,
}

#[derive(Debug, Clone)]
pub struct FuzzSettings {
    /// Pause after every message; also the unit of the retry backoff.
    pub interval: Duration,
    pub policy: RecordingPolicy,
    /// Stop after this many messages even if the generator could go on.
    pub max_iterations: Option<u64>,
    /// Human-readable target, kept in the report.
    pub target: String,
}

impl Default for FuzzSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            policy: RecordingPolicy::All,
            max_iterations: None,
            target: String::new(),
        }
    }
}

/// Summary of a fuzzing run, complete or not.
#[derive(Debug)]
pub struct FuzzReport {
    pub state: ProcessState,
    pub recordings: Recordings,
    /// Messages taken from the generator.
    pub messages: u64,
    /// Individual send attempts, retries included.
    pub attempts: u64,
    pub crashes: u64,
    /// Time from each crash's first failed attempt until the target accepted
    /// connections again, summed.
    pub downtime: Duration,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub structure: InjectedStructure,
    pub target: String,
}

fn backoff(interval: Duration, factor: u32) -> Duration {
    interval.mul_f64(f64::from(factor).powf(BACKOFF_EXPONENT))
}

pub struct FuzzingLoop<T, R> {
    transmitter: T,
    rng: R,
    settings: FuzzSettings,
    structure: InjectedStructure,
    generator: MessageGenerator,
    recordings: Recordings,
    state: ProcessState,
    done: u64,
    work_total: Option<u64>,
    messages: u64,
    attempts: u64,
    crashes: u64,
    downtime: Duration,
    crash_started: Option<(SystemTime, Instant)>,
}

impl<T: Transmitter, R: RngCore> FuzzingLoop<T, R> {
    /// Takes its own copy of `structure` and loads the libraries it names.
    pub fn new(
        structure: &InjectedStructure,
        transmitter: T,
        rng: R,
        settings: FuzzSettings,
        recordings: Recordings,
    ) -> Result<Self, LibraryError> {
        let structure = structure.clone();
        let generator = MessageGenerator::new(&structure)?;
        let messages = match (generator.remaining(), settings.max_iterations) {
            (Some(count), Some(max)) => Some(count.min(max)),
            (count, max) => count.or(max),
        };
        Ok(Self {
            transmitter,
            rng,
            settings,
            structure,
            generator,
            recordings,
            state: ProcessState::NotStarted,
            done: 0,
            // One extra unit for a crash on the last message.
            work_total: messages.map(|m| m + 1),
            messages: 0,
            attempts: 0,
            crashes: 0,
            downtime: Duration::ZERO,
            crash_started: None,
        })
    }

    pub fn work_total(&self) -> Option<u64> {
        self.work_total
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Runs until the generator is exhausted, the iteration cap is hit, the
    /// token is cancelled or recording fails. Whatever was recorded until then
    /// is part of the outcome.
    pub fn run(
        mut self,
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> ProcessOutcome<FuzzReport> {
        let started_at = SystemTime::now();
        let clock = Instant::now();
        self.state = ProcessState::Running;
        log::info!(
            "Fuzzing {} ({} messages)",
            self.settings.target,
            self.work_total
                .map_or_else(|| "unbounded".to_string(), |t| (t - 1).to_string())
        );

        let result = self.drive(cancel, reporter);
        self.state = match &result {
            Ok(()) => ProcessState::Finished,
            Err(e) if e.is::<Cancelled>() => ProcessState::Cancelled,
            Err(_) => ProcessState::Failed,
        };
        log::info!(
            "Fuzzing ended {:?} after {} messages, {} crashes",
            self.state,
            self.messages,
            self.crashes
        );

        let report = FuzzReport {
            state: self.state,
            recordings: self.recordings,
            messages: self.messages,
            attempts: self.attempts,
            crashes: self.crashes,
            downtime: self.downtime,
            started_at,
            duration: clock.elapsed(),
            structure: self.structure,
            target: self.settings.target,
        };
        match result {
            Ok(()) => ProcessOutcome::Finished(report),
            Err(e) if e.is::<Cancelled>() => ProcessOutcome::Cancelled(Some(report)),
            Err(e) => ProcessOutcome::Failed(e, Some(report)),
        }
    }

    fn drive(&mut self, cancel: &CancelToken, reporter: &ProgressReporter) -> anyhow::Result<()> {
        reporter.progress(self.done, self.work_total);
        loop {
            cancel.check()?;
            if self
                .settings
                .max_iterations
                .is_some_and(|max| self.messages >= max)
            {
                log::info!("Reached the iteration limit");
                return Ok(());
            }
            let Some(message) = self.generator.next_message(&mut self.rng) else {
                log::info!("Message generator exhausted");
                return Ok(());
            };
            self.messages += 1;

            for attempt in 0..SEND_ATTEMPTS {
                cancel.check()?;
                self.attempts += 1;
                let outcome = self.transmitter.transmit(&message);
                if outcome.is_success() {
                    self.crash_started = None;
                    if self.settings.policy == RecordingPolicy::All {
                        let now = SystemTime::now();
                        self.recordings.record(RecordingKind::Request, &message, now)?;
                        self.recordings.record(
                            RecordingKind::Response,
                            self.transmitter.last_response(),
                            now,
                        )?;
                    }
                    self.advance(reporter);
                    break;
                }
                log::debug!(
                    "Attempt {} of message {} failed: {:?}",
                    attempt + 1,
                    self.messages,
                    outcome
                );
                self.handle_timeout(attempt, &message, cancel, reporter)?;
            }

            cancel.sleep(self.settings.interval)?;
        }
    }

    fn advance(&mut self, reporter: &ProgressReporter) {
        self.done += 1;
        reporter.progress(self.done, self.work_total);
    }

    fn handle_timeout(
        &mut self,
        attempt: u32,
        message: &[u8],
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> anyhow::Result<()> {
        if attempt == 0 {
            self.crash_started = Some((SystemTime::now(), Instant::now()));
        }
        if attempt + 1 < SEND_ATTEMPTS {
            cancel.sleep(backoff(self.settings.interval, attempt + 2))?;
            return Ok(());
        }

        let (crash_time, crash_clock) = self
            .crash_started
            .take()
            .unwrap_or_else(|| (SystemTime::now(), Instant::now()));
        log::warn!("Target {} stopped responding", self.settings.target);
        self.recordings.record(RecordingKind::Crash, message, crash_time)?;
        self.crashes += 1;
        self.advance(reporter);

        let mut count = 1;
        while !self.transmitter.handshake() {
            cancel.sleep(backoff(self.settings.interval, count))?;
            count += 1;
        }
        let down = crash_clock.elapsed();
        self.downtime += down;
        log::info!("Target {} is back after {:?}", self.settings.target, down);
        Ok(())
    }
}

/// Runs a [`FuzzingLoop`] on a background thread.
///
/// Libraries are loaded before the thread starts, so configuration problems
/// surface here rather than as a failed run.
pub fn spawn_fuzzing<T, R>(
    structure: &InjectedStructure,
    transmitter: T,
    rng: R,
    settings: FuzzSettings,
    recordings: Recordings,
) -> anyhow::Result<ProcessHandle<FuzzReport>>
where
    T: Transmitter + Send + 'static,
    R: RngCore + Send + 'static,
{
    let fuzzing = FuzzingLoop::new(structure, transmitter, rng, settings, recordings)?;
    Ok(ProcessHandle::spawn("seqfuzz-fuzz", move |cancel, reporter| {
        fuzzing.run(cancel, reporter)
    })?)
}
