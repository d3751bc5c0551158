//! Background execution of learning and fuzzing runs.
//!
//! A run executes on its own thread. The caller keeps a [`ProcessHandle`] which
//! receives [`ProcessEvent`]s over a channel, can request cancellation, and
//! finally yields a [`ProcessOutcome`].

use crate::error::Cancelled;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cooperative cancellation shared between a caller and a worker.
///
/// Sleeping through the token wakes up as soon as [`CancelToken::cancel`] is
/// called, so backoff delays never hold up a shutdown.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag()
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.flag();
        loop {
            if *cancelled {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _timeout) = self
                .inner
                .1
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cancelled = guard;
        }
    }
}

/// Lifecycle of a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Finished,
    Cancelled,
    /// Halted on an internal error; anything already committed is kept.
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::Cancelled | ProcessState::Failed
        )
    }
}

/// Units of work completed so far. `total` is `None` while the amount of work
/// is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub done: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// The total as a signed number, `-1` meaning unbounded.
    pub fn total_raw(&self) -> i64 {
        self.total.map_or(-1, |t| t as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    State(ProcessState),
    Progress(Progress),
}

/// How a background operation ended.
///
/// `Cancelled` and `Failed` carry whatever the run had already committed when
/// that partial result still means something (the recordings of a fuzzing
/// run). A learning run never has one.
#[derive(Debug)]
pub enum ProcessOutcome<T> {
    Finished(T),
    Cancelled(Option<T>),
    Failed(anyhow::Error, Option<T>),
}

impl<T> ProcessOutcome<T> {
    /// Maps an all-or-nothing result: a [`Cancelled`] error becomes
    /// `Cancelled(None)` and any other error `Failed(e, None)`.
    pub fn from_result(result: Result<T, anyhow::Error>) -> Self {
        match result {
            Ok(value) => ProcessOutcome::Finished(value),
            Err(e) if e.is::<Cancelled>() => ProcessOutcome::Cancelled(None),
            Err(e) => ProcessOutcome::Failed(e, None),
        }
    }

    pub fn state(&self) -> ProcessState {
        match self {
            ProcessOutcome::Finished(_) => ProcessState::Finished,
            ProcessOutcome::Cancelled(_) => ProcessState::Cancelled,
            ProcessOutcome::Failed(..) => ProcessState::Failed,
        }
    }

    /// The full or partial result, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            ProcessOutcome::Finished(value) => Some(value),
            ProcessOutcome::Cancelled(partial) | ProcessOutcome::Failed(_, partial) => partial,
        }
    }
}

/// Worker-side half of the event channel.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: Option<Sender<ProcessEvent>>,
}

impl ProgressReporter {
    /// A reporter that drops every event, for running orchestrators inline.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: ProcessEvent) {
        if let Some(tx) = &self.tx {
            // The caller may have dropped its handle; the run carries on regardless.
            let _ = tx.send(event);
        }
    }

    pub fn state(&self, state: ProcessState) {
        self.send(ProcessEvent::State(state));
    }

    pub fn progress(&self, done: u64, total: Option<u64>) {
        self.send(ProcessEvent::Progress(Progress { done, total }));
    }
}

/// Caller-side handle to a running background operation.
pub struct ProcessHandle<T> {
    cancel: CancelToken,
    events: Receiver<ProcessEvent>,
    worker: Option<JoinHandle<ProcessOutcome<T>>>,
    state: ProcessState,
    progress: Progress,
}

impl<T: Send + 'static> ProcessHandle<T> {
    /// Spawns `job` on a dedicated named thread.
    ///
    /// The job receives the cancellation token and a progress reporter. The
    /// terminal state event follows from the outcome it returns.
    pub fn spawn<F>(name: &str, job: F) -> std::io::Result<Self>
    where
        F: FnOnce(&CancelToken, &ProgressReporter) -> ProcessOutcome<T> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let reporter = ProgressReporter { tx: Some(tx) };
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                reporter.state(ProcessState::Running);
                let outcome = job(&worker_cancel, &reporter);
                if let ProcessOutcome::Failed(e, _) = &outcome {
                    log::error!("Background process failed: {e:#}");
                }
                reporter.state(outcome.state());
                outcome
            })?;

        Ok(Self {
            cancel,
            events: rx,
            worker: Some(worker),
            state: ProcessState::NotStarted,
            progress: Progress::default(),
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// State as of the last event drained from the channel.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    fn apply(&mut self, event: &ProcessEvent) {
        match event {
            ProcessEvent::State(s) => self.state = *s,
            ProcessEvent::Progress(p) => self.progress = *p,
        }
    }

    /// Drains every pending event without blocking.
    pub fn try_events(&mut self) -> Vec<ProcessEvent> {
        let mut drained = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    drained.push(event);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Waits up to `timeout` for the next event. `None` on timeout or once the
    /// worker has gone away.
    pub fn recv_event(&mut self, timeout: Duration) -> Option<ProcessEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.apply(&event);
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Blocks until the worker ends.
    pub fn join(mut self) -> ProcessOutcome<T> {
        let outcome = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(outcome) => outcome,
                Err(_) => ProcessOutcome::Failed(anyhow::anyhow!("Worker thread panicked"), None),
            },
            None => ProcessOutcome::Failed(anyhow::anyhow!("Worker was already joined"), None),
        };
        self.try_events();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_interrupts_sleep_promptly() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let result = handle.join().expect("sleeper panicked");
        assert_eq!(result, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn uncancelled_sleep_completes() {
        let token = CancelToken::new();
        assert_eq!(token.sleep(Duration::from_millis(5)), Ok(()));
        assert_eq!(token.check(), Ok(()));
    }

    #[test]
    fn finished_process_reports_running_then_finished() {
        let handle = ProcessHandle::spawn("test-finish", |_cancel, reporter| {
            reporter.progress(1, Some(1));
            ProcessOutcome::Finished(42u32)
        })
        .expect("spawn failed");
        let outcome = handle.join();
        assert!(matches!(outcome, ProcessOutcome::Finished(42)));
    }

    #[test]
    fn events_arrive_in_order() {
        let mut handle = ProcessHandle::spawn("test-events", |_cancel, reporter| {
            reporter.progress(1, None);
            reporter.progress(2, None);
            ProcessOutcome::Finished(())
        })
        .expect("spawn failed");
        let mut seen = Vec::new();
        while let Some(event) = handle.recv_event(Duration::from_secs(5)) {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ProcessEvent::State(ProcessState::Running),
                ProcessEvent::Progress(Progress { done: 1, total: None }),
                ProcessEvent::Progress(Progress { done: 2, total: None }),
                ProcessEvent::State(ProcessState::Finished),
            ]
        );
        assert_eq!(handle.state(), ProcessState::Finished);
        assert!(handle.state().is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert_eq!(handle.progress().total_raw(), -1);
    }

    #[test]
    fn cancellation_maps_to_cancelled_outcome() {
        let handle = ProcessHandle::spawn("test-cancel", |cancel, _reporter| {
            ProcessOutcome::from_result(
                cancel
                    .sleep(Duration::from_secs(30))
                    .map_err(anyhow::Error::from),
            )
        })
        .expect("spawn failed");
        handle.cancel();
        assert!(matches!(handle.join(), ProcessOutcome::Cancelled(None)));
    }

    #[test]
    fn partial_results_survive_cancellation() {
        let outcome: ProcessOutcome<Vec<u8>> = ProcessOutcome::Cancelled(Some(vec![1, 2]));
        assert_eq!(outcome.state(), ProcessState::Cancelled);
        assert_eq!(outcome.into_value(), Some(vec![1, 2]));
    }

    #[test]
    fn errors_map_to_failed_outcome() {
        let handle: ProcessHandle<()> = ProcessHandle::spawn("test-fail", |_c, _r| {
            ProcessOutcome::from_result(Err(anyhow::anyhow!("disk full")))
        })
        .expect("spawn failed");
        match handle.join() {
            ProcessOutcome::Failed(e, None) => assert!(e.to_string().contains("disk full")),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }
}
