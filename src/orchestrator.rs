//! Starts every task, wires operator interrupts to the shared
//! [`CancellationSignal`], and collects one outcome per task.

use crate::cancel::CancellationSignal;
use crate::task::{Task, TaskFault, TaskOutcome};
use futures::future::join_all;
use std::fmt;
use std::io;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

/// Terminal state of one task, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            TaskOutcome::Cancelled => write!(f, "{}: stopped", self.name),
            TaskOutcome::Faulted(fault) => write!(f, "{}: {}", self.name, fault),
        }
    }
}

/// Outcomes of every task, in start order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    /// True when every task ended by observing cancellation.
    pub fn is_clean(&self) -> bool {
        self.tasks.iter().all(|t| t.outcome.is_clean())
    }

    pub fn faults(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.outcome.is_clean())
    }
}

pub struct Orchestrator {
    signal: CancellationSignal,
    interrupts: Option<JoinHandle<()>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(CancellationSignal::new())
    }
}

impl Orchestrator {
    pub fn new(signal: CancellationSignal) -> Self {
        Self {
            signal,
            interrupts: None,
        }
    }

    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Trigger the signal on SIGINT or SIGTERM (Ctrl-C elsewhere).
    ///
    /// Further interrupts after the first are logged and ignored.
    pub fn install_interrupt_handlers(&mut self) -> io::Result<()> {
        let signal = self.signal.clone();

        #[cfg(unix)]
        let handle = {
            use tokio::signal::unix::{SignalKind, signal as unix_signal};

            let mut interrupt = unix_signal(SignalKind::interrupt())?;
            let mut terminate = unix_signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                loop {
                    let name = tokio::select! {
                        Some(()) = interrupt.recv() => "SIGINT",
                        Some(()) = terminate.recv() => "SIGTERM",
                        else => break,
                    };
                    on_interrupt(&signal, name);
                }
            })
        };

        #[cfg(not(unix))]
        let handle = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt(&signal, "Ctrl-C");
            }
        });

        if let Some(previous) = self.interrupts.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Run every task to completion and report how each one ended.
    ///
    /// A faulted or panicked task does not cancel the others; only the
    /// signal does.
    pub async fn run(mut self, tasks: Vec<Box<dyn Task>>) -> RunReport {
        let mut names = Vec::with_capacity(tasks.len());
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            names.push(task.name().to_string());
            handles.push(tokio::spawn(task.run(self.signal.clone())));
        }
        info!(tasks = names.len(), "all tasks started");

        let results = join_all(handles).await;

        let tasks = names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                let outcome = outcome_of(result);
                match &outcome {
                    TaskOutcome::Cancelled => info!(task = %name, "task finished"),
                    TaskOutcome::Faulted(fault) => error!(task = %name, %fault, "task faulted"),
                }
                TaskReport { name, outcome }
            })
            .collect();

        if let Some(interrupts) = self.interrupts.take() {
            interrupts.abort();
        }
        RunReport { tasks }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(interrupts) = self.interrupts.take() {
            interrupts.abort();
        }
    }
}

fn on_interrupt(signal: &CancellationSignal, name: &str) {
    if signal.trigger() {
        info!(signal = name, "shutting down");
    } else {
        warn!(signal = name, "shutdown already in progress");
    }
}

fn outcome_of(result: Result<TaskOutcome, JoinError>) -> TaskOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TaskOutcome::Faulted(TaskFault::Panicked(message))
        }
        Err(_) => TaskOutcome::Faulted(TaskFault::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Task that ends the way it is told to, optionally after waiting.
    struct Fake {
        name: &'static str,
        ending: Ending,
    }

    enum Ending {
        Cancelled,
        FaultAfter(Duration),
        PanicAfter(Duration),
    }

    impl Task for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn run(self: Box<Self>, signal: CancellationSignal) -> BoxFuture<'static, TaskOutcome> {
            Box::pin(async move {
                match self.ending {
                    Ending::Cancelled => {
                        signal.cancelled().await;
                        TaskOutcome::Cancelled
                    }
                    Ending::FaultAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        TaskOutcome::Faulted(TaskFault::Setup("no sensor".into()))
                    }
                    Ending::PanicAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        panic!("sensor driver bug");
                    }
                }
            })
        }
    }

    fn fake(name: &'static str, ending: Ending) -> Box<dyn Task> {
        Box::new(Fake { name, ending })
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tasks_cancelled_is_clean() {
        let orchestrator = Orchestrator::default();
        let signal = orchestrator.signal().clone();
        let run = tokio::spawn(orchestrator.run(vec![
            fake("environment", Ending::Cancelled),
            fake("location", Ending::Cancelled),
        ]));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!run.is_finished());
        signal.trigger();
        let report = run.await.unwrap();

        assert!(report.is_clean());
        let names: Vec<&str> = report.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["environment", "location"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_does_not_cancel_siblings() {
        let orchestrator = Orchestrator::default();
        let signal = orchestrator.signal().clone();
        let run = tokio::spawn(orchestrator.run(vec![
            fake("environment", Ending::FaultAfter(Duration::from_secs(1))),
            fake("location", Ending::Cancelled),
        ]));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!signal.is_triggered());
        assert!(!run.is_finished());

        signal.trigger();
        let report = run.await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            report.tasks[0].outcome,
            TaskOutcome::Faulted(TaskFault::Setup("no sensor".into()))
        );
        assert_eq!(report.tasks[1].outcome, TaskOutcome::Cancelled);
        assert_eq!(report.faults().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_reported_not_propagated() {
        let orchestrator = Orchestrator::default();
        let signal = orchestrator.signal().clone();
        let run = tokio::spawn(orchestrator.run(vec![
            fake("environment", Ending::PanicAfter(Duration::from_secs(1))),
            fake("location", Ending::Cancelled),
        ]));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let cancelled_at = Instant::now();
        signal.trigger();
        let report = run.await.unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(
            report.tasks[0].outcome,
            TaskOutcome::Faulted(TaskFault::Panicked("sensor driver bug".into()))
        );
        assert_eq!(report.tasks[1].outcome, TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_task_list_returns_immediately() {
        let report = Orchestrator::default().run(Vec::new()).await;
        assert!(report.tasks.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_repeated_interrupt_triggers_once() {
        let signal = CancellationSignal::new();
        on_interrupt(&signal, "SIGINT");
        on_interrupt(&signal, "SIGTERM");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_install_interrupt_handlers_twice() {
        let mut orchestrator = Orchestrator::default();
        orchestrator.install_interrupt_handlers().unwrap();
        orchestrator.install_interrupt_handlers().unwrap();
        assert!(!orchestrator.signal().is_triggered());
    }

    #[test]
    fn test_report_display() {
        let report = TaskReport {
            name: "location".into(),
            outcome: TaskOutcome::Faulted(TaskFault::Setup("adapter missing".into())),
        };
        assert_eq!(report.to_string(), "location: setup failed: adapter missing");
    }
}
