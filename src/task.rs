//! Periodic acquire/publish loop shared by every polling task.
//!
//! A [`PeriodicTask`] repeatedly asks its [`Poller`] for a reading and hands
//! the reading back to the poller for publishing, sleeping `interval` between
//! iterations. The loop only ends when the [`CancellationSignal`] fires or
//! when the poller cannot be set up at all. A failed read, a missing reading
//! or a failed write is logged and the loop carries on with the next
//! scheduled iteration.

use crate::cancel::CancellationSignal;
use crate::scanner::ScanError;
use crate::sink::SinkError;
use crate::source::SourceError;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound for a single acquire or publish call unless overridden.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Errors from one acquire or publish call.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Why a task stopped without being cancelled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFault {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("aborted")]
    Aborted,
}

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Stopped after observing the cancellation signal
    Cancelled,
    Faulted(TaskFault),
}

impl TaskOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// A unit the orchestrator can start.
pub trait Task: Send + 'static {
    fn name(&self) -> &str;

    fn run(self: Box<Self>, signal: CancellationSignal) -> BoxFuture<'static, TaskOutcome>;
}

/// The acquire and publish halves of a periodic task.
pub trait Poller: Send + 'static {
    type Reading: Send;

    /// One-time initialization. An error here ends the task as faulted
    /// before the first iteration.
    fn setup(&mut self) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async { Ok(()) })
    }

    /// Fetch one reading; `Ok(None)` means "no data this time".
    fn acquire(&mut self) -> BoxFuture<'_, Result<Option<Self::Reading>, TaskError>>;

    fn publish(&mut self, reading: Self::Reading) -> BoxFuture<'_, Result<(), TaskError>>;

    /// Release whatever the poller holds. Called on every exit path.
    fn teardown(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Result of one loop iteration, used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Published,
    NoData,
    AcquireFailed,
    PublishFailed,
}

pub struct PeriodicTask<P> {
    name: String,
    poller: P,
    interval: Duration,
    deadline: Duration,
}

impl<P: Poller> PeriodicTask<P> {
    pub fn new(name: impl Into<String>, poller: P, interval: Duration) -> Self {
        Self {
            name: name.into(),
            poller,
            interval,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Bound each acquire and publish call to `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run until cancelled. Never returns early because of a failed iteration.
    pub async fn run(mut self, signal: CancellationSignal) -> TaskOutcome {
        if let Err(e) = self.poller.setup().await {
            error!(task = %self.name, error = %e, "setup failed, task not started");
            self.poller.teardown().await;
            return TaskOutcome::Faulted(TaskFault::Setup(e.to_string()));
        }
        info!(task = %self.name, interval = ?self.interval, "task started");

        let mut iteration: u64 = 0;
        while !signal.is_triggered() {
            iteration += 1;
            let result = self.iterate().await;
            debug!(task = %self.name, iteration, ?result, "iteration finished");

            if signal.sleep(self.interval).await {
                break;
            }
        }

        self.poller.teardown().await;
        info!(task = %self.name, iterations = iteration, "task stopped");
        TaskOutcome::Cancelled
    }

    async fn iterate(&mut self) -> Iteration {
        let reading = match timeout(self.deadline, self.poller.acquire()).await {
            Ok(Ok(Some(reading))) => reading,
            Ok(Ok(None)) => {
                warn!(task = %self.name, "no data");
                return Iteration::NoData;
            }
            Ok(Err(e)) => {
                warn!(task = %self.name, error = %e, "acquire failed");
                return Iteration::AcquireFailed;
            }
            Err(_) => {
                warn!(task = %self.name, error = %TaskError::Timeout(self.deadline), "acquire failed");
                return Iteration::AcquireFailed;
            }
        };

        match timeout(self.deadline, self.poller.publish(reading)).await {
            Ok(Ok(())) => Iteration::Published,
            Ok(Err(e)) => {
                error!(task = %self.name, error = %e, "publish failed");
                Iteration::PublishFailed
            }
            Err(_) => {
                error!(task = %self.name, error = %TaskError::Timeout(self.deadline), "publish failed");
                Iteration::PublishFailed
            }
        }
    }
}

impl<P: Poller> Task for PeriodicTask<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, signal: CancellationSignal) -> BoxFuture<'static, TaskOutcome> {
        Box::pin(PeriodicTask::run(*self, signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Shared log of what a scripted poller did, with virtual timestamps.
    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<(Instant, &'static str)>>>);

    impl Journal {
        fn push(&self, what: &'static str) {
            self.0.lock().unwrap().push((Instant::now(), what));
        }

        fn entries(&self) -> Vec<(Instant, &'static str)> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, what: &str) -> usize {
            self.entries().iter().filter(|(_, w)| *w == what).count()
        }
    }

    /// Poller whose behavior on iteration `n` (1-based) is given by `script`.
    struct Scripted {
        journal: Journal,
        iteration: u32,
        script: fn(u32) -> Step,
        setup_fails: bool,
    }

    #[derive(Clone, Copy)]
    enum Step {
        Ok,
        NoData,
        AcquireFails,
        PublishFails,
        Hang,
        Panic,
    }

    impl Scripted {
        fn new(journal: Journal, script: fn(u32) -> Step) -> Self {
            Self {
                journal,
                iteration: 0,
                script,
                setup_fails: false,
            }
        }
    }

    impl Poller for Scripted {
        type Reading = u32;

        fn setup(&mut self) -> BoxFuture<'_, Result<(), TaskError>> {
            Box::pin(async move {
                if self.setup_fails {
                    Err(TaskError::Other("no sensor".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn acquire(&mut self) -> BoxFuture<'_, Result<Option<u32>, TaskError>> {
            Box::pin(async move {
                self.iteration += 1;
                self.journal.push("acquire");
                match (self.script)(self.iteration) {
                    Step::Ok | Step::PublishFails => Ok(Some(self.iteration)),
                    Step::NoData => Ok(None),
                    Step::AcquireFails => Err(TaskError::Other("read failed".into())),
                    Step::Hang => {
                        futures::future::pending::<()>().await;
                        unreachable!()
                    }
                    Step::Panic => panic!("driver bug"),
                }
            })
        }

        fn publish(&mut self, reading: u32) -> BoxFuture<'_, Result<(), TaskError>> {
            Box::pin(async move {
                match (self.script)(reading) {
                    Step::PublishFails => {
                        self.journal.push("publish failed");
                        Err(TaskError::Other("sink down".into()))
                    }
                    _ => {
                        self.journal.push("published");
                        Ok(())
                    }
                }
            })
        }

        fn teardown(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.journal.push("teardown") })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_acquire_runs_until_cancelled() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |_| Step::AcquireFails);
        let task = PeriodicTask::new("env", poller, Duration::from_secs(10));
        let signal = CancellationSignal::new();
        let handle = tokio::spawn(task.run(signal.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!handle.is_finished());
        assert_eq!(journal.count("acquire"), 10);
        assert_eq!(journal.count("published"), 0);

        let cancelled_at = Instant::now();
        signal.trigger();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(10));
        assert_eq!(journal.count("teardown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_wakes_immediately() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |_| Step::Ok);
        let task = PeriodicTask::new("env", poller, Duration::from_secs(3600));
        let signal = CancellationSignal::new();
        let handle = tokio::spawn(task.run(signal.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled_at = Instant::now();
        signal.trigger();
        assert_eq!(handle.await.unwrap(), TaskOutcome::Cancelled);

        assert!(cancelled_at.elapsed() < Duration::from_millis(10));
        assert_eq!(journal.count("published"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_runs_no_iteration() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |_| Step::Ok);
        let signal = CancellationSignal::new();
        signal.trigger();

        let outcome = PeriodicTask::new("env", poller, Duration::from_secs(1))
            .run(signal)
            .await;

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(journal.count("acquire"), 0);
        assert_eq!(journal.count("teardown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_faults_without_iterating() {
        let journal = Journal::default();
        let mut poller = Scripted::new(journal.clone(), |_| Step::Ok);
        poller.setup_fails = true;

        let outcome = PeriodicTask::new("env", poller, Duration::from_secs(1))
            .run(CancellationSignal::new())
            .await;

        assert_eq!(
            outcome,
            TaskOutcome::Faulted(TaskFault::Setup("no sensor".into()))
        );
        assert_eq!(journal.count("acquire"), 0);
        assert_eq!(journal.count("teardown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_iterations_do_not_stop_the_loop() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |n| match n {
            1 => Step::NoData,
            2 => Step::AcquireFails,
            3 => Step::PublishFails,
            _ => Step::Ok,
        });
        let task = PeriodicTask::new("env", poller, Duration::from_secs(5));
        let signal = CancellationSignal::new();
        let handle = tokio::spawn(task.run(signal.clone()));

        tokio::time::sleep(Duration::from_secs(22)).await;
        signal.trigger();
        assert_eq!(handle.await.unwrap(), TaskOutcome::Cancelled);

        // Iterations at t = 0, 5, 10, 15, 20.
        assert_eq!(journal.count("acquire"), 5);
        assert_eq!(journal.count("publish failed"), 1);
        assert_eq!(journal.count("published"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_acquire_is_bounded_by_deadline() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |n| if n == 1 { Step::Hang } else { Step::Ok });
        let task = PeriodicTask::new("scan", poller, Duration::from_secs(5))
            .with_deadline(Duration::from_secs(2));
        let signal = CancellationSignal::new();
        let handle = tokio::spawn(task.run(signal.clone()));

        // First iteration times out at t=2, the second runs at t=7.
        tokio::time::sleep(Duration::from_secs(8)).await;
        signal.trigger();
        assert_eq!(handle.await.unwrap(), TaskOutcome::Cancelled);

        let entries = journal.entries();
        assert_eq!(journal.count("acquire"), 2);
        assert_eq!(journal.count("published"), 1);
        let gap = entries[1].0 - entries[0].0;
        assert_eq!(gap, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_poller_surfaces_as_join_error() {
        let journal = Journal::default();
        let poller = Scripted::new(journal.clone(), |_| Step::Panic);
        let task = PeriodicTask::new("env", poller, Duration::from_secs(5));

        let result = tokio::spawn(task.run(CancellationSignal::new())).await;

        assert!(result.unwrap_err().is_panic());
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulting_task_does_not_disturb_sibling() {
        let journal_a = Journal::default();
        let journal_b = Journal::default();
        let task_a = PeriodicTask::new(
            "a",
            Scripted::new(journal_a.clone(), |n| {
                if n == 2 { Step::AcquireFails } else { Step::Ok }
            }),
            Duration::from_secs(5),
        );
        let task_b = PeriodicTask::new(
            "b",
            Scripted::new(journal_b.clone(), |_| Step::Ok),
            Duration::from_secs(5),
        );
        let signal = CancellationSignal::new();
        let start = Instant::now();
        let a = tokio::spawn(task_a.run(signal.clone()));
        let b = tokio::spawn(task_b.run(signal.clone()));

        tokio::time::sleep(Duration::from_secs(12)).await;
        signal.trigger();
        assert_eq!(a.await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(b.await.unwrap(), TaskOutcome::Cancelled);

        let acquire_times = |journal: &Journal| -> Vec<Duration> {
            journal
                .entries()
                .into_iter()
                .filter(|(_, w)| *w == "acquire")
                .map(|(t, _)| t - start)
                .collect()
        };
        let schedule = vec![
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_secs(10),
        ];
        assert_eq!(acquire_times(&journal_a), schedule);
        assert_eq!(acquire_times(&journal_b), schedule);
        assert_eq!(journal_a.count("published"), 2);
        assert_eq!(journal_b.count("published"), 3);
    }
}
