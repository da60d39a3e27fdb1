//! Tasks: fingerprinted units of work and their lifecycle
//!
//! ```text
//! WAITING → READY → RUNNING → DONE
//! ```
//!
//! A task whose fingerprint already has a cache entry starts `DONE`. A task
//! whose body fails drops back to `WAITING`; there is no failure state.

mod callable;
mod fingerprint;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub use callable::{Arg, Callable, Inputs, Invocation, Output, TaskFn};
pub use fingerprint::{normalize_logic, Fingerprint};

pub(crate) use callable::value_repr;

use crate::cache::{CacheStore, LogTag};
use crate::error::{CacheError, Error, PipelineError, Result};
use crate::memory::{self, MemorySample};

const DESCRIPTION_LIMIT: usize = 50;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// At least one dependency is not done
    Waiting,
    /// Every dependency is done
    Ready,
    /// Executing
    Running,
    /// Result available
    Done,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Handle to a registered task, usable as a dependency of later tasks.
///
/// Handles carry the id of the pipeline that issued them, so a handle from
/// another pipeline is never mistaken for a local task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pipeline: u64,
    index: usize,
}

impl TaskRef {
    pub(crate) fn new(pipeline: u64, index: usize) -> Self {
        Self { pipeline, index }
    }

    /// Registration order within the issuing pipeline
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn pipeline(&self) -> u64 {
        self.pipeline
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Per-task run statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Wall-clock time of the last execution
    pub wall_time: Duration,
    /// Allocator figures around the last execution
    pub memory: MemorySample,
}

/// Flags the scheduler passes down to a single execution
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExecFlags {
    pub timeit: bool,
    pub memcheck: bool,
}

/// A registered unit of work
#[derive(Debug)]
pub struct Task {
    index: usize,
    callable: Callable,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Value>,
    /// Local indices of dependencies, in declaration order, deduplicated
    deps: Vec<usize>,
    /// Dependency handles that do not name an earlier task of this pipeline
    unresolved: Vec<TaskRef>,
    fingerprint: Fingerprint,
    description: String,
    forced: bool,
    status: Status,
    result: Option<Value>,
    telemetry: Telemetry,
}

impl Task {
    /// Create a task and check the cache for an existing result.
    ///
    /// `earlier` holds every task registered before this one; dependency
    /// handles are resolved against it.
    pub(crate) fn new(
        index: usize,
        invocation: Invocation,
        pipeline: u64,
        earlier: &[Task],
        cache: &CacheStore,
    ) -> Self {
        let Invocation {
            callable,
            args,
            kwargs,
            rerun,
        } = invocation;

        let resolve = |task: &TaskRef| -> Option<&Task> {
            (task.pipeline() == pipeline)
                .then(|| earlier.get(task.index()))
                .flatten()
        };

        let mut deps = Vec::new();
        let mut unresolved = Vec::new();
        for task in args.iter().flat_map(Arg::task_refs) {
            match resolve(task) {
                Some(dep) if !deps.contains(&dep.index) => deps.push(dep.index),
                Some(_) => {}
                None if !unresolved.contains(task) => unresolved.push(*task),
                None => {}
            }
        }

        let arg_repr = |arg: &Arg| -> String {
            let one = |task: &TaskRef| match resolve(task) {
                Some(dep) => format!("@{}", dep.fingerprint),
                None => format!("@?{}:{}", task.pipeline(), task.index()),
            };
            match arg {
                Arg::Value(value) => value_repr(value),
                Arg::Task(task) => one(task),
                Arg::Tasks(tasks) => {
                    format!("[{}]", tasks.iter().map(one).collect::<Vec<_>>().join(","))
                }
            }
        };

        let arg_strings: Vec<String> = args.iter().map(arg_repr).collect();
        let kwarg_strings: BTreeMap<String, String> = kwargs
            .iter()
            .map(|(k, v)| (k.clone(), value_repr(v)))
            .collect();
        let fingerprint = Fingerprint::compute(
            callable.name(),
            callable.logic(),
            deps.iter().map(|&d| &earlier[d].fingerprint),
            &arg_strings,
            &kwarg_strings,
        );

        let description = describe(callable.name(), &args, &kwargs, |task| {
            resolve(task)
                .map(|dep| format!("@{}", dep.fingerprint.short()))
                .unwrap_or_else(|| format!("@?{task}"))
        });

        let forced = rerun || deps.iter().any(|&d| earlier[d].forced);
        let status = if !forced && cache.exists(fingerprint.as_str()) {
            Status::Done
        } else {
            Status::Waiting
        };

        debug!(
            task = %description,
            fingerprint = %fingerprint,
            %status,
            forced,
            "task registered"
        );

        Self {
            index,
            callable,
            args,
            kwargs,
            deps,
            unresolved,
            fingerprint,
            description,
            forced,
            status,
            result: None,
            telemetry: Telemetry::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        self.callable.name()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    /// Whether `rerun` was requested here or on any upstream task
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn dependencies(&self) -> &[usize] {
        &self.deps
    }

    pub fn unresolved(&self) -> &[TaskRef] {
        &self.unresolved
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// `name(arg, ..., key=value)` with task arguments shown as short
    /// fingerprints
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Description truncated for log lines
    pub fn short_description(&self) -> String {
        truncate(&self.description, DESCRIPTION_LIMIT)
    }

    /// Re-evaluate readiness against `tasks`, the pipeline's task list.
    ///
    /// Moves `WAITING` to `READY` when every dependency is done and back
    /// again when one is not; leaves `RUNNING` and `DONE` alone.
    pub(crate) fn ready_to_run(&mut self, tasks: &[Task]) -> bool {
        let ready = self.unresolved.is_empty()
            && self
                .deps
                .iter()
                .all(|&d| tasks.get(d).is_some_and(Task::is_done));

        match self.status {
            Status::Waiting | Status::Ready => {
                self.status = if ready { Status::Ready } else { Status::Waiting };
            }
            Status::Running | Status::Done => {}
        }
        ready
    }

    /// Execute the body with `inputs` and persist its output under the
    /// fingerprint.
    ///
    /// On failure the task returns to `WAITING` and the error is returned.
    pub(crate) fn run(
        &mut self,
        inputs: &Inputs,
        cache: &mut CacheStore,
        flags: ExecFlags,
    ) -> Result<()> {
        if self.status == Status::Running {
            return Err(PipelineError::Reentrant(self.short_description()).into());
        }
        self.status = Status::Running;
        debug!(task = %self.description, "running task");

        let before = flags.memcheck.then(memory::begin_sample);
        let start = Instant::now();
        let outcome = self.callable.call(inputs);
        if flags.timeit {
            self.telemetry.wall_time = start.elapsed();
        }
        if let Some(sample) = before {
            self.telemetry.memory = memory::end_sample(sample);
        }

        let output = match outcome {
            Ok(output) => output,
            Err(error) => {
                self.status = Status::Waiting;
                return Err(PipelineError::TaskFailed {
                    task: self.short_description(),
                    error,
                }
                .into());
            }
        };

        if let Err(e) = self.store(output, cache) {
            self.status = Status::Waiting;
            return Err(e);
        }
        self.status = Status::Done;
        Ok(())
    }

    fn store(&mut self, output: Output, cache: &mut CacheStore) -> Result<()> {
        let key = self.fingerprint.as_str();
        let value = match output {
            Output::Value(value) => {
                cache.save(key, &value, &self.description)?;
                value
            }
            Output::File(name) => {
                cache.save_file_ref(key, &name, &self.description)?;
                Value::String(name)
            }
            Output::Empty => {
                let message = format!("{} returned no result; caching null", self.description);
                warn!(task = %self.description, "task returned no result");
                cache.log().record(LogTag::Warning, &message);
                cache.save(key, &Value::Null, &self.description)?;
                Value::Null
            }
        };
        self.result = Some(value);
        Ok(())
    }

    /// The task's result, loading it from the cache on first access
    pub(crate) fn result(&mut self, cache: &CacheStore) -> Result<Value> {
        if self.status != Status::Done {
            return Err(PipelineError::NotReady(self.short_description()).into());
        }
        if let Some(value) = &self.result {
            return Ok(value.clone());
        }

        let value = cache
            .load(self.fingerprint.as_str())
            .map_err(|e| match e {
                CacheError::NotFound(_) => {
                    let message = format!(
                        "{} is marked done but its cache entry {} is gone",
                        self.description, self.fingerprint
                    );
                    cache.log().record(LogTag::Error, &message);
                    Error::from(e)
                }
                other => Error::from(other),
            })?;
        self.result = Some(value.clone());
        Ok(value)
    }

    /// Mark done without executing: the result was produced elsewhere (or
    /// not at all in a dry run) and is fetched from the cache on demand.
    pub(crate) fn mark_settled(&mut self) {
        self.status = Status::Done;
    }

    /// Back to `WAITING` with no in-memory result
    pub(crate) fn reset(&mut self) {
        self.status = Status::Waiting;
        self.result = None;
        self.telemetry = Telemetry::default();
    }
}

/// Render `name(args, key=value)` for logs and the manifest
pub(crate) fn describe(
    name: &str,
    args: &[Arg],
    kwargs: &BTreeMap<String, Value>,
    task_label: impl Fn(&TaskRef) -> String,
) -> String {
    let mut parts: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            Arg::Value(value) => value_repr(value),
            Arg::Task(task) => task_label(task),
            Arg::Tasks(tasks) => format!(
                "[{}]",
                tasks.iter().map(&task_label).collect::<Vec<_>>().join(", ")
            ),
        })
        .collect();
    parts.extend(kwargs.iter().map(|(k, v)| format!("{k}={}", value_repr(v))));
    format!("{name}({})", parts.join(", "))
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
