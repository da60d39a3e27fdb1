//! The run loop
//!
//! A run is a task sweep followed by a view sweep. Each sweep iterates:
//! collect what is ready, execute this worker's share (round-robin over the
//! ready list), then meet the other workers at a barrier where every member
//! publishes the outcome of each item it ran. An iteration that settles
//! nothing while work remains is fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use console::style;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::telemetry::{memcheck_csv, timing_csv, write_report, TelemetryRow};
use super::{resolve_inputs, Pipeline, RunOptions, RunSummary};
use crate::cache::LogTag;
use crate::comm::all_gather;
use crate::error::{Error, PipelineError, Result, SyncError};
use crate::memory;
use crate::reporter::TaskEvent;
use crate::task::{Fingerprint, Telemetry};

/// Number of pending items named in a no-progress error
const PENDING_LISTED: usize = 5;

/// What one worker did with one item of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Outcome {
    Completed,
    Failed(String),
}

/// Registration summary compared across workers before the first batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Hello {
    tasks: Vec<Fingerprint>,
    views: usize,
    done: Vec<bool>,
}

#[derive(Debug, Default)]
struct Progress {
    iterations: usize,
    executed: BTreeSet<usize>,
    views_shown: usize,
}

impl Pipeline {
    /// Execute every registered task that is not done, then show every view.
    ///
    /// Fatal conditions are written to the run log and the console before
    /// the error is returned.
    #[instrument(skip_all, fields(pipeline = %self.name, rank = self.comm.rank()))]
    pub fn run(&mut self, options: RunOptions) -> Result<RunSummary> {
        match self.run_inner(&options) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.fatal(&e);
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let start = Instant::now();

        if self.size() > 1 {
            self.root_log(&format!(
                "Initializing parallel run with {} processes",
                self.size()
            ));
        }
        if options.rerun {
            self.clear_cache()?;
        }
        if options.memcheck && !memory::is_tracking() {
            warn!("memcheck requested but the tracking allocator is not installed; memory figures will be zero");
        }

        self.handshake()?;
        for view in &mut self.views {
            view.reset();
        }

        let cached = self.tasks.iter().filter(|t| t.is_done()).count();
        self.root_log(&format!(
            "Starting a run with {} tasks",
            self.tasks.len() - cached
        ));

        let mut progress = Progress::default();
        let done_before: Vec<bool> = self.tasks.iter().map(|t| t.is_done()).collect();
        let swept = self.sweeps(options, &mut progress);
        if options.dry_run {
            // Nothing was computed, so nothing may stay DONE
            for (task, was_done) in self.tasks.iter_mut().zip(done_before) {
                if !was_done {
                    task.reset();
                }
            }
        }
        swept?;

        let (timing_file, memcheck_file) = self.write_telemetry(options, &progress)?;
        self.cache.reload()?;

        let duration = start.elapsed();
        self.reporters.broadcast(&TaskEvent::AllCompleted {
            executed: progress.executed.len(),
            cached,
            iterations: progress.iterations,
            duration,
        });
        self.root_log("All done.");

        Ok(RunSummary {
            executed: progress.executed.len(),
            cached,
            views_shown: progress.views_shown,
            iterations: progress.iterations,
            duration,
            timing_file,
            memcheck_file,
        })
    }

    /// Check that every worker registered the same pipeline and agree on
    /// which tasks are already cached
    fn handshake(&mut self) -> Result<()> {
        let hello = Hello {
            tasks: self.tasks.iter().map(|t| t.fingerprint().clone()).collect(),
            views: self.views.len(),
            done: self.tasks.iter().map(|t| t.is_done()).collect(),
        };
        let hellos = all_gather(self.comm.as_mut(), &hello)?;

        for (rank, other) in hellos.iter().enumerate() {
            if other.tasks.len() != hello.tasks.len() || other.views != hello.views {
                return Err(SyncError::Diverged(format!(
                    "rank {rank} registered {} tasks and {} views, rank {} registered {} and {}",
                    other.tasks.len(),
                    other.views,
                    self.rank(),
                    hello.tasks.len(),
                    hello.views
                ))
                .into());
            }
            if let Some(i) = (0..hello.tasks.len()).find(|&i| other.tasks[i] != hello.tasks[i]) {
                return Err(SyncError::Diverged(format!(
                    "task #{i} has fingerprint {} on rank {rank} but {} on rank {}",
                    other.tasks[i].short(),
                    hello.tasks[i].short(),
                    self.rank()
                ))
                .into());
            }
        }

        // A cache entry one worker saw at registration is shared by all
        for i in 0..self.tasks.len() {
            if !self.tasks[i].is_done() && hellos.iter().any(|h| h.done[i]) {
                debug!(task = %self.tasks[i].description(), "cached on another worker");
                self.tasks[i].mark_settled();
            }
        }
        Ok(())
    }

    fn sweeps(&mut self, options: &RunOptions, progress: &mut Progress) -> Result<()> {
        self.task_sweep(options, progress)?;
        self.root_log(&format!(
            "Finished all tasks after {} iterations",
            progress.iterations
        ));

        self.view_sweep(options, progress)?;
        self.root_log(&format!("Completed all {} views", self.views.len()));
        Ok(())
    }

    fn task_sweep(&mut self, options: &RunOptions, progress: &mut Progress) -> Result<()> {
        let rank = self.rank();
        let size = self.size();
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();
        let mut waiting = self.waiting_tasks();

        while waiting > 0 {
            self.next_iteration(progress)?;

            let mut runnable = Vec::new();
            for i in 0..self.tasks.len() {
                if self.tasks[i].is_done() || failures.contains_key(&i) {
                    continue;
                }
                let (before, rest) = self.tasks.split_at_mut(i);
                if rest[0].ready_to_run(before) {
                    runnable.push(i);
                }
            }

            let mut outcomes: Vec<(usize, Outcome)> = Vec::new();
            for (slot, &i) in runnable.iter().enumerate() {
                if slot % size != rank {
                    continue;
                }
                let description = self.tasks[i].short_description();

                if options.dry_run {
                    self.tasks[i].mark_settled();
                    self.reporters.broadcast(&TaskEvent::Skipped {
                        task: description,
                        reason: "dry run".to_string(),
                    });
                    outcomes.push((i, Outcome::Completed));
                    continue;
                }

                self.reporters.broadcast(&TaskEvent::Started {
                    task: description.clone(),
                    rank,
                });
                match self.execute_task(i, options) {
                    Ok(()) => {
                        progress.executed.insert(i);
                        self.reporters.broadcast(&TaskEvent::Completed {
                            task: description,
                            duration: self.tasks[i].telemetry().wall_time,
                        });
                        outcomes.push((i, Outcome::Completed));
                    }
                    Err(e @ Error::Pipeline(PipelineError::TaskFailed { .. })) if size > 1 => {
                        let message = e.to_string();
                        error!(rank, task = %description, error = %message, "task failed");
                        self.cache.log().record(
                            LogTag::Error,
                            &format!("[Rank {rank}] {message}"),
                        );
                        self.reporters.broadcast(&TaskEvent::Failed {
                            task: description,
                            error: message.clone(),
                        });
                        outcomes.push((i, Outcome::Failed(message)));
                    }
                    Err(e) => return Err(e),
                }
            }

            let reports = all_gather(self.comm.as_mut(), &outcomes)?;
            for (member, report) in reports.into_iter().enumerate() {
                for (i, outcome) in report {
                    match outcome {
                        Outcome::Completed if member != rank => {
                            if let Some(task) = self.tasks.get_mut(i) {
                                task.mark_settled();
                            }
                        }
                        Outcome::Completed => {}
                        Outcome::Failed(message) => {
                            failures.insert(i, message);
                        }
                    }
                }
            }

            let now_waiting = self.waiting_tasks();
            self.reporters.broadcast(&TaskEvent::IterationFinished {
                iteration: progress.iterations,
                remaining: now_waiting,
            });
            self.root_log(&format!(
                "Iteration {} finished. {} Tasks left",
                progress.iterations, now_waiting
            ));

            if now_waiting > 0 && now_waiting >= waiting {
                if !failures.is_empty() {
                    return Err(PipelineError::RemoteFailures(failures.into_values().collect()).into());
                }
                let pending = self
                    .tasks
                    .iter()
                    .filter(|t| !t.is_done())
                    .take(PENDING_LISTED)
                    .map(|t| t.short_description())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(PipelineError::NoProgress {
                    waiting: now_waiting,
                    pending,
                }
                .into());
            }
            waiting = now_waiting;
        }
        Ok(())
    }

    fn view_sweep(&mut self, options: &RunOptions, progress: &mut Progress) -> Result<()> {
        let rank = self.rank();
        let size = self.size();
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();
        let mut waiting = self.views.len();
        self.root_log(&format!("{waiting} views remaining"));

        while waiting > 0 {
            self.next_iteration(progress)?;

            let runnable: Vec<usize> = (0..self.views.len())
                .filter(|&v| !self.views[v].is_shown() && !failures.contains_key(&v))
                .filter(|&v| self.views[v].ready_to_run(&self.tasks))
                .collect();

            let mut outcomes: Vec<(usize, Outcome)> = Vec::new();
            for (slot, &v) in runnable.iter().enumerate() {
                let description = self.views[v].short_description();
                let mine = if self.views[v].is_root_only() {
                    rank == 0
                } else {
                    slot % size == rank
                };

                if !mine || options.dry_run {
                    self.views[v].mark_shown();
                    let reason = if options.dry_run {
                        "dry run".to_string()
                    } else {
                        "shown by another worker".to_string()
                    };
                    self.reporters.broadcast(&TaskEvent::Skipped {
                        task: description,
                        reason,
                    });
                    continue;
                }

                self.reporters.broadcast(&TaskEvent::Started {
                    task: description.clone(),
                    rank,
                });
                let args = self.views[v].args().to_vec();
                let kwargs = self.views[v].kwargs().clone();
                let inputs =
                    resolve_inputs(&mut self.tasks, &self.cache, self.id, &args, kwargs, None)?;

                match self.views[v].run(&inputs) {
                    Ok(()) => {
                        progress.views_shown += 1;
                        self.reporters
                            .broadcast(&TaskEvent::ViewShown { view: description });
                    }
                    Err(error) => {
                        let err = PipelineError::ViewFailed {
                            view: description.clone(),
                            error,
                        };
                        if size == 1 {
                            return Err(err.into());
                        }
                        let message = err.to_string();
                        error!(rank, view = %description, error = %message, "view failed");
                        self.cache
                            .log()
                            .record(LogTag::Error, &format!("[Rank {rank}] {message}"));
                        self.reporters.broadcast(&TaskEvent::Failed {
                            task: description,
                            error: message.clone(),
                        });
                        outcomes.push((v, Outcome::Failed(message)));
                    }
                }
            }

            let reports = all_gather(self.comm.as_mut(), &outcomes)?;
            for (v, outcome) in reports.into_iter().flatten() {
                if let Outcome::Failed(message) = outcome {
                    failures.insert(v, message);
                }
            }

            let now_waiting = self
                .views
                .iter()
                .filter(|view| !view.is_shown() && !failures.contains_key(&view.index()))
                .count();
            self.reporters.broadcast(&TaskEvent::IterationFinished {
                iteration: progress.iterations,
                remaining: now_waiting,
            });

            if now_waiting > 0 && now_waiting >= waiting {
                let pending = self
                    .views
                    .iter()
                    .filter(|view| !view.is_shown())
                    .take(PENDING_LISTED)
                    .map(|view| view.short_description())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(PipelineError::NoProgress {
                    waiting: now_waiting,
                    pending,
                }
                .into());
            }
            waiting = now_waiting;
        }

        if !failures.is_empty() {
            return Err(PipelineError::RemoteFailures(failures.into_values().collect()).into());
        }
        Ok(())
    }

    /// Gather every worker's task telemetry; the root writes the CSV files
    fn write_telemetry(
        &mut self,
        options: &RunOptions,
        progress: &Progress,
    ) -> Result<(Option<std::path::PathBuf>, Option<std::path::PathBuf>)> {
        if !options.timeit && !options.memcheck {
            return Ok((None, None));
        }

        let local: Vec<(usize, Telemetry)> = progress
            .executed
            .iter()
            .map(|&i| (i, *self.tasks[i].telemetry()))
            .collect();
        let gathered = all_gather(self.comm.as_mut(), &local)?;
        if !self.is_root() {
            return Ok((None, None));
        }

        let mut merged: BTreeMap<usize, Telemetry> = BTreeMap::new();
        for (i, telemetry) in gathered.into_iter().flatten() {
            merged.insert(i, telemetry);
        }
        let rows: Vec<TelemetryRow> = self
            .tasks
            .iter()
            .map(|task| TelemetryRow {
                name: task.name().to_string(),
                telemetry: merged.get(&task.index()).copied().unwrap_or_default(),
            })
            .collect();

        let root = self.cache.root().to_path_buf();
        let timing = options
            .timeit
            .then(|| write_report(&root, &self.name, "timing", &timing_csv(&rows)))
            .flatten();
        let memcheck = options
            .memcheck
            .then(|| write_report(&root, &self.name, "memcheck", &memcheck_csv(&rows)))
            .flatten();
        Ok((timing, memcheck))
    }

    fn next_iteration(&self, progress: &mut Progress) -> Result<()> {
        let ceiling = self.config.max_iterations;
        if progress.iterations >= ceiling {
            return Err(PipelineError::IterationLimit(ceiling).into());
        }
        progress.iterations += 1;
        Ok(())
    }

    fn waiting_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_done()).count()
    }

    fn root_log(&self, message: &str) {
        if self.is_root() {
            info!("{}", message);
            self.cache.log().record(LogTag::Info, message);
        }
    }

    /// Report a fatal error everywhere a user might look, and release any
    /// worker still waiting on this one
    fn fatal(&mut self, err: &Error) {
        if matches!(err, Error::Pipeline(PipelineError::Cancelled)) {
            return;
        }

        let collective = matches!(
            err,
            Error::Pipeline(
                PipelineError::NoProgress { .. }
                    | PipelineError::RemoteFailures(_)
                    | PipelineError::IterationLimit(_)
            ) | Error::Sync(SyncError::Aborted)
        );
        if self.size() > 1 && !collective {
            self.comm.abort();
        }

        let rank = self.rank();
        error!(rank, error = %err, "pipeline run failed");
        self.cache
            .log()
            .record(LogTag::Error, &format!("[Rank {rank}] {err}"));
        eprintln!("{} {}", style("[Error]").red().bold(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use crate::confirm::{AssumeNo, AssumeYes};
    use crate::reporter::CollectingReporter;
    use crate::task::{Callable, Invocation, Output, Status, TaskRef};
    use crate::view::ViewInvocation;
    use crate::{callable, Config};
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn pipeline(root: &Path) -> Pipeline {
        Pipeline::builder()
            .name("test")
            .cache_dir(root)
            .communicator(crate::comm::Solo)
            .confirm(AssumeYes)
            .build()
            .unwrap()
    }

    fn counting(name: &str, value: i64, calls: &Arc<AtomicUsize>) -> Callable {
        let calls = calls.clone();
        Callable::versioned(name, 1, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Output::Value(json!(value)))
        })
    }

    fn sum() -> Callable {
        callable!("sum", |inputs| {
            let a: f64 = inputs.arg(0)?;
            let b: f64 = inputs.arg(1)?;
            Output::value(&(a + b))
        })
    }

    #[test]
    fn test_a_plus_b_scenario() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(temp.path());

        let a = pipe.add_task(counting("a", 5, &calls));
        let b = pipe.add_task(counting("b", 7, &calls));
        let c = pipe.add_task(Invocation::new(sum()).arg(a).arg(b));

        let summary = pipe.run(RunOptions::default()).unwrap();
        assert_eq!(summary.executed, 3);
        assert_eq!(pipe.status(c).unwrap(), Status::Done);
        let first: f64 = pipe.result_as(c).unwrap();
        assert_eq!(first, 12.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let cleared = pipe.clear_cache().unwrap();
        assert!(matches!(cleared, crate::ClearOutcome::Cleared(ref files) if files.len() == 3));
        assert_eq!(pipe.status(c).unwrap(), Status::Waiting);

        pipe.run(RunOptions::default()).unwrap();
        let second: f64 = pipe.result_as(c).unwrap();
        assert_eq!(second.to_bits(), first.to_bits());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_cache_hit_skips_body() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = pipeline(temp.path());
        let a = first.add_task(counting("a", 5, &calls));
        first.run(RunOptions::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut second = pipeline(temp.path());
        let a2 = second.add_task(counting("a", 5, &calls));
        assert_eq!(second.status(a2).unwrap(), Status::Done);
        let summary = second.run(RunOptions::default()).unwrap();

        assert_eq!(summary.executed, 0);
        assert_eq!(summary.cached, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.result(a2).unwrap(), json!(5));
        assert_eq!(first.fingerprint(a).unwrap(), second.fingerprint(a2).unwrap());
    }

    #[test]
    fn test_changed_kwarg_is_a_new_task() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let body = {
            let calls = calls.clone();
            Callable::versioned("a", 1, move |inputs| {
                calls.fetch_add(1, Ordering::SeqCst);
                let n: u64 = inputs.kwarg("n")?;
                Output::value(&(n * 2))
            })
        };

        let mut first = pipeline(temp.path());
        let ten = first.add_task(Invocation::new(body.clone()).kwarg("n", 10));
        first.run(RunOptions::default()).unwrap();

        let mut second = pipeline(temp.path());
        let twenty = second.add_task(Invocation::new(body).kwarg("n", 20));
        assert_eq!(second.status(twenty).unwrap(), Status::Waiting);
        second.run(RunOptions::default()).unwrap();

        assert_ne!(first.fingerprint(ten).unwrap(), second.fingerprint(twenty).unwrap());
        assert_eq!(second.result(twenty).unwrap(), json!(40));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_dependency_is_no_progress() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut other = pipeline(&temp.path().join("other"));
        let foreign = other.add_task(counting("x", 1, &calls));

        let mut pipe = pipeline(&temp.path().join("main"));
        pipe.add_task(counting("a", 5, &calls));
        pipe.add_task(Invocation::new(sum()).arg(foreign).arg(2));

        let err = pipe.run(RunOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline(PipelineError::NoProgress { waiting: 1, .. })
        ));
        assert!(err.is_config());
        assert!(pipe.run_log().unwrap().contains("[Error]"));
    }

    #[test]
    fn test_task_failure_aborts_single_worker() {
        let temp = TempDir::new().unwrap();
        let mut pipe = pipeline(temp.path());
        pipe.add_task(Callable::versioned("boom", 1, |_| anyhow::bail!("exploded")));

        let err = pipe.run(RunOptions::default()).unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_rerun_propagates_downstream() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = pipeline(temp.path());
        let a = first.add_task(counting("a", 5, &calls));
        let b = first.add_task(Invocation::new(sum()).arg(a).arg(1));
        first.run(RunOptions::default()).unwrap();

        let mut second = pipeline(temp.path());
        let a2 = second.add_task(Invocation::new(counting("a", 5, &calls)).rerun(true));
        let b2 = second.add_task(Invocation::new(sum()).arg(a2).arg(1));
        assert_eq!(second.status(a2).unwrap(), Status::Waiting);
        assert_eq!(second.status(b2).unwrap(), Status::Waiting);
        assert!(second.task(b2).unwrap().is_forced());

        let summary = second.run(RunOptions::default()).unwrap();
        assert_eq!(summary.executed, 2);
        assert_eq!(second.result(b2).unwrap(), first.result(b).unwrap());
    }

    #[test]
    fn test_dry_run_invokes_nothing() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let shown = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(temp.path());

        let a = pipe.add_task(counting("a", 5, &calls));
        let seen = shown.clone();
        pipe.add_view(ViewInvocation::new("show", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).arg(a));

        let summary = pipe.run(RunOptions::default().dry_run(true)).unwrap();
        assert_eq!(summary.executed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(shown.load(Ordering::SeqCst), 0);
        assert!(!pipe.cache().exists(pipe.fingerprint(a).unwrap().as_str()));
        assert_eq!(pipe.status(a).unwrap(), Status::Waiting);
    }

    #[test]
    fn test_real_run_after_dry_run() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(temp.path());

        let a = pipe.add_task(counting("a", 5, &calls));
        let b = pipe.add_task(Invocation::new(sum()).arg(a).arg(1));

        pipe.run(RunOptions::default().dry_run(true)).unwrap();
        assert_eq!(pipe.status(b).unwrap(), Status::Waiting);
        assert!(pipe.result(b).unwrap_err().is_not_ready());

        let summary = pipe.run(RunOptions::default()).unwrap();
        assert_eq!(summary.executed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.result(b).unwrap(), json!(6.0));
        assert!(!pipe.run_log().unwrap().contains("is gone"));
    }

    #[test]
    fn test_views_receive_results() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipe = pipeline(temp.path());

        let a = pipe.add_task(counting("a", 5, &calls));
        let b = pipe.add_task(counting("b", 7, &calls));
        let sink = seen.clone();
        let view = pipe.add_view(
            ViewInvocation::new("table", move |inputs| {
                let values: Vec<i64> = inputs.arg(0)?;
                let title: String = inputs.kwarg("title")?;
                sink.lock().unwrap().push((title, values));
                Ok(())
            })
            .arg(vec![a, b])
            .kwarg("title", "results"),
        );

        let summary = pipe.run(RunOptions::default()).unwrap();
        assert_eq!(summary.views_shown, 1);
        assert!(pipe.view(view).unwrap().is_shown());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("results".to_string(), vec![5, 7])]
        );
    }

    #[test]
    fn test_view_failure_single_worker() {
        let temp = TempDir::new().unwrap();
        let mut pipe = pipeline(temp.path());
        pipe.add_view(ViewInvocation::new("broken", |_| anyhow::bail!("no display")));

        let err = pipe.run(RunOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Pipeline(PipelineError::ViewFailed { .. })));
    }

    #[test]
    fn test_file_output() {
        let temp = TempDir::new().unwrap();
        let mut pipe = pipeline(temp.path());

        let plot = pipe.add_task(callable!("plot", |inputs| {
            std::fs::write(inputs.cache_path("plot.txt"), "xy")?;
            Ok(Output::file("plot.txt"))
        }));
        pipe.run(RunOptions::default()).unwrap();

        assert_eq!(pipe.result(plot).unwrap(), json!("plot.txt"));
        assert!(pipe.cache().manifest().get("plot.txt").is_some());

        let cleared = pipe.clear_cache().unwrap();
        assert!(matches!(cleared, crate::ClearOutcome::Cleared(ref files) if files.len() == 2));
        assert!(!temp.path().join("plot.txt").exists());
    }

    #[test]
    fn test_clear_cache_declined_or_empty() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut pipe = Pipeline::builder()
            .cache_dir(temp.path())
            .communicator(crate::comm::Solo)
            .confirm(AssumeNo)
            .build()
            .unwrap();
        let a = pipe.add_task(counting("a", 5, &calls));
        assert_eq!(pipe.clear_cache().unwrap(), crate::ClearOutcome::NothingToClear);

        pipe.run(RunOptions::default()).unwrap();
        let err = pipe.clear_cache().unwrap_err();
        assert!(matches!(err, Error::Pipeline(PipelineError::Cancelled)));
        assert!(pipe.cache().exists(pipe.fingerprint(a).unwrap().as_str()));

        let err = pipe.run(RunOptions::default().rerun(true)).unwrap_err();
        assert!(matches!(err, Error::Pipeline(PipelineError::Cancelled)));
    }

    #[test]
    fn test_run_task_eagerly() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(temp.path());

        let a = pipe.add_task(counting("a", 5, &calls));
        let b = pipe.add_task(Invocation::new(sum()).arg(a).arg(1));

        assert!(pipe.run_task(b).unwrap_err().is_not_ready());
        assert_eq!(pipe.run_task(a).unwrap(), json!(5));
        assert_eq!(pipe.run_task(b).unwrap(), json!(6.0));
        assert_eq!(pipe.run_task(a).unwrap(), json!(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timing_file_written() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(temp.path());
        pipe.add_task(counting("a", 5, &calls));

        let summary = pipe
            .run(RunOptions::default().memcheck(true))
            .unwrap();
        let timing = std::fs::read_to_string(summary.timing_file.unwrap()).unwrap();
        assert!(timing.starts_with("a, "));
        let memcheck = std::fs::read_to_string(summary.memcheck_file.unwrap()).unwrap();
        assert_eq!(memcheck.lines().count(), 1);
        assert!(temp.path().join("test_timing.csv").exists());
    }

    #[test]
    fn test_iteration_limit() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = Pipeline::builder()
            .config(Config::new(temp.path()).with_max_iterations(1))
            .communicator(crate::comm::Solo)
            .build()
            .unwrap();
        let a = pipe.add_task(counting("a", 5, &calls));
        pipe.add_task(Invocation::new(sum()).arg(a).arg(1));

        let err = pipe.run(RunOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Pipeline(PipelineError::IterationLimit(1))));
    }

    #[test]
    fn test_reporter_sees_lifecycle() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = Arc::new(CollectingReporter::default());
        let mut pipe = Pipeline::builder()
            .cache_dir(temp.path())
            .communicator(crate::comm::Solo)
            .reporter(reporter.clone())
            .build()
            .unwrap();
        pipe.add_task(counting("a", 5, &calls));
        pipe.run(RunOptions::default()).unwrap();

        let events = reporter.events();
        assert!(matches!(events[0], TaskEvent::Registered { cache_hit: false, .. }));
        assert!(events.iter().any(|e| matches!(e, TaskEvent::Completed { .. })));
        assert!(matches!(events.last(), Some(TaskEvent::AllCompleted { executed: 1, .. })));
    }

    #[test]
    fn test_pack_referenced_entries() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipe = pipeline(&temp.path().join("cache"));
        pipe.add_task(counting("a", 5, &calls));
        pipe.run(RunOptions::default()).unwrap();

        let summary = pipe
            .pack(temp.path().join("bundle.tar.gz"))
            .unwrap()
            .unwrap();
        assert_eq!(summary.files.len(), 1);
        assert!(summary.missing.is_empty());
    }

    /// Per-member pipeline for the threaded group tests
    fn member(root: &Path, comm: LocalGroup, counts: Arc<Mutex<HashMap<String, usize>>>, n: usize) -> (Pipeline, Vec<TaskRef>) {
        let mut pipe = Pipeline::builder()
            .name("group")
            .cache_dir(root)
            .communicator(comm)
            .reporters(crate::reporter::TaskReporterRegistry::empty())
            .confirm(AssumeYes)
            .build()
            .unwrap();

        let body = Callable::versioned("work", 1, move |inputs| {
            let key = inputs.fingerprint().map(|f| f.to_string()).unwrap_or_default();
            *counts.lock().unwrap().entry(key).or_default() += 1;
            let i: u64 = inputs.arg(0)?;
            Output::value(&(i * i))
        });
        let handles = (0..n)
            .map(|i| pipe.add_task(Invocation::new(body.clone()).arg(i)))
            .collect();
        (pipe, handles)
    }

    #[test]
    fn test_three_workers_run_each_task_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let counts: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let threads: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|comm| {
                let root = root.clone();
                let counts = counts.clone();
                std::thread::spawn(move || {
                    let (mut pipe, handles) = member(&root, comm, counts, 5);
                    pipe.run(RunOptions::default()).unwrap();
                    let results: Vec<serde_json::Value> =
                        handles.iter().map(|&h| pipe.result(h).unwrap()).collect();
                    results
                })
            })
            .collect();

        for thread in threads {
            let results = thread.join().unwrap();
            assert_eq!(results, vec![json!(0), json!(1), json!(4), json!(9), json!(16)]);
        }

        let counts = counts.lock().unwrap();
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|&c| c == 1));
        assert!(root.join("group_timing.csv").exists());
    }

    #[test]
    fn test_remote_failure_is_seen_by_every_worker() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let threads: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let mut pipe = Pipeline::builder()
                        .cache_dir(&root)
                        .communicator(comm)
                        .reporters(crate::reporter::TaskReporterRegistry::empty())
                        .build()
                        .unwrap();
                    let ok = pipe.add_task(Callable::versioned("ok", 1, |_| Ok(Output::Value(json!(1)))));
                    let bad = pipe.add_task(Callable::versioned("bad", 1, |_| anyhow::bail!("broken input")));
                    pipe.add_task(Invocation::new(sum()).arg(ok).arg(bad));
                    pipe.run(RunOptions::default()).unwrap_err()
                })
            })
            .collect();

        for thread in threads {
            let err = thread.join().unwrap();
            match err {
                Error::Pipeline(PipelineError::RemoteFailures(failures)) => {
                    assert_eq!(failures.len(), 1);
                    assert!(failures[0].contains("broken input"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_file_group_chain_and_root_only_view() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let shown = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..2)
            .map(|rank| {
                let root = root.clone();
                let shown = shown.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    let comm = crate::comm::FileGroup::join(
                        root.join(".sync"),
                        "chain",
                        rank,
                        2,
                        Some(std::time::Duration::from_secs(30)),
                    )
                    .unwrap();
                    let mut pipe = Pipeline::builder()
                        .name("chain")
                        .cache_dir(&root)
                        .communicator(comm)
                        .reporters(crate::reporter::TaskReporterRegistry::empty())
                        .build()
                        .unwrap();

                    let a = pipe.add_task(counting("a", 5, &calls));
                    let b = pipe.add_task(counting("b", 7, &calls));
                    let c = pipe.add_task(Invocation::new(sum()).arg(a).arg(b));
                    pipe.add_view(
                        ViewInvocation::new("report", move |inputs| {
                            let total: f64 = inputs.arg(0)?;
                            assert_eq!(total, 12.0);
                            shown.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .arg(c)
                        .root_only(true),
                    );

                    pipe.run(RunOptions::default()).unwrap();
                    pipe.result(c).unwrap()
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(thread.join().unwrap(), json!(12.0));
        }
        assert_eq!(shown.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_argument_boundaries_do_not_share_entries() {
        let temp = TempDir::new().unwrap();

        let mut first = pipeline(temp.path());
        let joined = first.add_task(Invocation::new(sum()).arg(1).arg(23));
        first.run(RunOptions::default()).unwrap();

        let mut second = pipeline(temp.path());
        let split = second.add_task(Invocation::new(sum()).arg(12).arg(3));
        assert_eq!(second.status(split).unwrap(), Status::Waiting);
        assert_ne!(first.fingerprint(joined).unwrap(), second.fingerprint(split).unwrap());

        second.run(RunOptions::default()).unwrap();
        assert_eq!(second.result(split).unwrap(), json!(15.0));
    }

    #[test]
    fn test_diverged_registration() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let threads: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let rank = crate::comm::Communicator::rank(&comm);
                    let mut pipe = Pipeline::builder()
                        .cache_dir(&root)
                        .communicator(comm)
                        .reporters(crate::reporter::TaskReporterRegistry::empty())
                        .build()
                        .unwrap();
                    for i in 0..=rank {
                        pipe.add_task(Invocation::new(Callable::versioned("t", 1, |_| Ok(Output::Empty))).arg(i));
                    }
                    pipe.run(RunOptions::default()).unwrap_err()
                })
            })
            .collect();

        for thread in threads {
            let err = thread.join().unwrap();
            assert!(matches!(err, Error::Sync(SyncError::Diverged(_)) | Error::Sync(SyncError::Aborted)));
        }
    }
}
