//! Run progress reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events emitted while registering and running a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task was registered
    Registered {
        task: String,
        cache_hit: bool,
    },
    /// This worker is starting a task or view
    Started {
        task: String,
        rank: usize,
    },
    /// A task finished and its result was cached
    Completed {
        task: String,
        duration: Duration,
    },
    /// A task or view body returned an error
    Failed {
        task: String,
        error: String,
    },
    /// A task or view was settled without running here
    Skipped {
        task: String,
        reason: String,
    },
    /// A scheduler iteration finished
    IterationFinished {
        iteration: usize,
        remaining: usize,
    },
    /// A view was shown
    ViewShown {
        view: String,
    },
    /// The run finished
    AllCompleted {
        executed: usize,
        cached: usize,
        iterations: usize,
        duration: Duration,
    },
}

/// Trait for reporting run progress
pub trait TaskReporter: Send + Sync {
    /// Handle an event
    fn report(&self, event: &TaskEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Registered { task, cache_hit } => {
                if *cache_hit {
                    tracing::info!("[Cache hit!] Task {} will be skipped", task);
                } else {
                    tracing::info!("[Added Task] {}", task);
                }
            }
            TaskEvent::Started { task, rank } => {
                tracing::info!("[Rank {}] running: {}", rank, task);
            }
            TaskEvent::Completed { task, duration } => {
                tracing::info!("{} completed in {:.3}s", task, duration.as_secs_f64());
            }
            TaskEvent::Failed { task, error } => {
                tracing::error!("{} failed: {}", task, error);
            }
            TaskEvent::Skipped { task, reason } => {
                tracing::debug!("{} skipped: {}", task, reason);
            }
            TaskEvent::IterationFinished {
                iteration,
                remaining,
            } => {
                tracing::info!("Iteration {} finished. {} left", iteration, remaining);
            }
            TaskEvent::ViewShown { view } => {
                tracing::info!("Showed {}", view);
            }
            TaskEvent::AllCompleted {
                executed,
                cached,
                iterations,
                duration,
            } => {
                tracing::info!(
                    "All done: {} executed, {} cached, {} iterations ({:.1}s)",
                    executed,
                    cached,
                    iterations,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

impl<R: TaskReporter + ?Sized> TaskReporter for Arc<R> {
    fn report(&self, event: &TaskEvent) {
        (**self).report(event);
    }
}

/// Registry of reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskReporterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReporterRegistry")
            .field("reporters", &self.reporters.len())
            .finish()
    }
}
