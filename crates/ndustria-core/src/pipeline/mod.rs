//! The pipeline: task registry, cache owner and scheduler

mod options;
mod scheduler;
mod telemetry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub use options::{ClearOutcome, RunOptions, RunSummary};
pub use telemetry::{memcheck_csv, timing_csv, TelemetryRow};

use crate::cache::{CacheStore, LogTag, PackSummary};
use crate::comm::{self, all_gather, Communicator};
use crate::config::{load_config, Config};
use crate::confirm::{Confirm, Interactive};
use crate::error::{CacheError, PipelineError, Result};
use crate::reporter::{TaskEvent, TaskReporter, TaskReporterRegistry};
use crate::task::{Arg, Fingerprint, Inputs, Invocation, Status, Task, TaskRef};
use crate::view::{view_ref, View, ViewInvocation, ViewRef};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Builder for [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    name: Option<String>,
    config: Option<Config>,
    comm: Option<Box<dyn Communicator>>,
    reporters: Option<TaskReporterRegistry>,
    confirm: Option<Box<dyn Confirm>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used for the telemetry files; defaults to the program name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use this cache root instead of the environment or config file
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        let config = match self.config.take() {
            Some(mut config) => {
                config.cache_dir = path.into();
                config
            }
            None => Config::new(path),
        };
        self.config = Some(config);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Run as a member of this worker group instead of the one described by
    /// the environment
    pub fn communicator(mut self, comm: impl Communicator + 'static) -> Self {
        self.comm = Some(Box::new(comm));
        self
    }

    /// Add a reporter next to the default tracing one
    pub fn reporter(mut self, reporter: impl TaskReporter + 'static) -> Self {
        self.reporters
            .get_or_insert_with(TaskReporterRegistry::new)
            .register(reporter);
        self
    }

    /// Replace the reporters entirely
    pub fn reporters(mut self, reporters: TaskReporterRegistry) -> Self {
        self.reporters = Some(reporters);
        self
    }

    /// How [`Pipeline::clear_cache`] asks for permission; defaults to the
    /// terminal
    pub fn confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Some(Box::new(confirm));
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = match self.config {
            Some(config) => config,
            None => load_config()?,
        };
        let cache = CacheStore::open(&config.cache_dir)?;
        let comm = match self.comm {
            Some(comm) => comm,
            None => comm::from_env(cache.root(), config.sync_timeout)?,
        };
        let name = self.name.unwrap_or_else(program_name);

        let pipeline = Pipeline {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            config,
            cache,
            comm,
            tasks: Vec::new(),
            views: Vec::new(),
            reporters: self.reporters.unwrap_or_default(),
            confirm: self.confirm.unwrap_or_else(|| Box::new(Interactive)),
        };

        if pipeline.is_root() {
            pipeline.cache.log().record(
                LogTag::Info,
                &format!(
                    "Pipeline {} created with cache located at {}",
                    pipeline.name,
                    pipeline.cache.root().display()
                ),
            );
        }
        info!(
            pipeline = %pipeline.name,
            cache = %pipeline.cache.root().display(),
            rank = pipeline.rank(),
            size = pipeline.size(),
            "pipeline created"
        );
        Ok(pipeline)
    }
}

/// Registry of tasks and views over one cache store
pub struct Pipeline {
    id: u64,
    name: String,
    config: Config,
    cache: CacheStore,
    comm: Box<dyn Communicator>,
    tasks: Vec<Task>,
    views: Vec<View>,
    reporters: TaskReporterRegistry,
    confirm: Box<dyn Confirm>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Pipeline over the cache root and worker group named by the
    /// environment
    pub fn from_env() -> Result<Self> {
        PipelineBuilder::new().build()
    }

    /// Single-worker pipeline over `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        PipelineBuilder::new()
            .cache_dir(cache_dir)
            .communicator(comm::Solo)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_root(&self) -> bool {
        self.comm.is_root()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Register a task. The cache is checked immediately; on a hit the task
    /// starts done and its body never runs.
    pub fn add_task(&mut self, invocation: impl Into<Invocation>) -> TaskRef {
        let index = self.tasks.len();
        let task = Task::new(index, invocation.into(), self.id, &self.tasks, &self.cache);
        let cache_hit = task.is_done();

        if self.is_root() {
            let line = if cache_hit {
                format!("[Cache hit!] Task {} will be skipped", task.short_description())
            } else {
                format!("[Added Task] {}", task.short_description())
            };
            self.cache.log().record(LogTag::Info, &line);
        }
        self.reporters.broadcast(&TaskEvent::Registered {
            task: task.short_description(),
            cache_hit,
        });

        self.tasks.push(task);
        TaskRef::new(self.id, index)
    }

    /// Register a view; task handles among its arguments become
    /// dependencies
    pub fn add_view(&mut self, invocation: ViewInvocation) -> ViewRef {
        let index = self.views.len();
        let view = View::new(index, invocation, self.id, &self.tasks);
        if self.is_root() {
            self.cache
                .log()
                .record(LogTag::Info, &format!("[Added View] {}", view.short_description()));
        }
        self.views.push(view);
        view_ref(index)
    }

    /// The registered task behind `handle`
    pub fn task(&self, handle: TaskRef) -> Result<&Task> {
        let index = self.local_index(handle)?;
        Ok(&self.tasks[index])
    }

    pub fn view(&self, handle: ViewRef) -> Option<&View> {
        self.views.get(handle.index())
    }

    pub fn status(&self, handle: TaskRef) -> Result<Status> {
        Ok(self.task(handle)?.status())
    }

    pub fn fingerprint(&self, handle: TaskRef) -> Result<&Fingerprint> {
        Ok(self.task(handle)?.fingerprint())
    }

    /// Result of a done task, loaded from the cache on first access.
    ///
    /// Fails with [`PipelineError::NotReady`] before the task is done.
    pub fn result(&mut self, handle: TaskRef) -> Result<Value> {
        let index = self.local_index(handle)?;
        self.tasks[index].result(&self.cache)
    }

    /// [`Pipeline::result`] deserialized into `T`
    pub fn result_as<T: DeserializeOwned>(&mut self, handle: TaskRef) -> Result<T> {
        let value = self.result(handle)?;
        serde_json::from_value(value).map_err(|e| CacheError::Serialization(e).into())
    }

    /// Run one task now, outside the scheduler, and return its result.
    ///
    /// A done task returns its result without running. A task whose
    /// dependencies are not done fails with [`PipelineError::NotReady`].
    pub fn run_task(&mut self, handle: TaskRef) -> Result<Value> {
        let index = self.local_index(handle)?;
        if !self.tasks[index].is_done() {
            let (before, rest) = self.tasks.split_at_mut(index);
            if !rest[0].ready_to_run(before) {
                return Err(PipelineError::NotReady(rest[0].short_description()).into());
            }
            self.execute_task(index, &RunOptions::default())?;
        }
        self.tasks[index].result(&self.cache)
    }

    /// Delete the cache files of every registered task and reset all tasks
    /// and views for a fresh run.
    ///
    /// The root worker asks for confirmation and shares the answer with the
    /// group; a refusal fails with [`PipelineError::Cancelled`] everywhere.
    pub fn clear_cache(&mut self) -> Result<ClearOutcome> {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        enum Decision {
            Clear,
            Keep,
            Nothing,
            Follower,
        }

        let files = self.referenced_files()?;
        let decision = if !self.is_root() {
            Decision::Follower
        } else if files.is_empty() {
            println!("Nothing found in the cache. No need to clear.");
            Decision::Nothing
        } else if self.confirm.confirm(&files)? {
            Decision::Clear
        } else {
            Decision::Keep
        };

        let decisions = all_gather(self.comm.as_mut(), &decision)?;
        let decision = decisions.first().copied().unwrap_or(Decision::Nothing);

        let outcome = match decision {
            Decision::Keep => {
                if self.is_root() {
                    println!("Got it. Your files are safe.");
                }
                return Err(PipelineError::Cancelled.into());
            }
            Decision::Clear => {
                if self.is_root() {
                    for file in &files {
                        self.cache.remove(file)?;
                    }
                    self.cache
                        .log()
                        .record(LogTag::Info, &format!("Cleared {} cache file(s)", files.len()));
                    info!(files = files.len(), "cache cleared");
                }
                ClearOutcome::Cleared(files)
            }
            Decision::Nothing | Decision::Follower => ClearOutcome::NothingToClear,
        };

        self.comm.barrier()?;
        self.cache.reload()?;
        for task in &mut self.tasks {
            task.reset();
        }
        for view in &mut self.views {
            view.reset();
        }
        debug!("tasks reset after cache clear");
        Ok(outcome)
    }

    /// Archive the cache files of every registered task into `dest`.
    ///
    /// Only the root worker writes the archive; every member waits for it.
    pub fn pack(&mut self, dest: impl AsRef<Path>) -> Result<Option<PackSummary>> {
        let summary = if self.is_root() {
            let keys = self.referenced_keys()?;
            Some(self.cache.pack(keys.iter().map(String::as_str), dest.as_ref())?)
        } else {
            None
        };
        self.comm.barrier()?;
        Ok(summary)
    }

    /// Contents of `cache_info`
    pub fn cache_info(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.cache.info_path())?)
    }

    /// Contents of `last_run.log`
    pub fn run_log(&self) -> Result<String> {
        Ok(self.cache.log().read()?)
    }

    /// Print `cache_info` to standard output
    pub fn print_cache_info(&self) -> Result<()> {
        print!("{}", self.cache_info()?);
        Ok(())
    }

    /// Print `last_run.log` to standard output
    pub fn print_log(&self) -> Result<()> {
        print!("{}", self.run_log()?);
        Ok(())
    }

    fn local_index(&self, handle: TaskRef) -> Result<usize> {
        if handle.pipeline() == self.id && handle.index() < self.tasks.len() {
            Ok(handle.index())
        } else {
            Err(PipelineError::UnknownTask(handle.index()).into())
        }
    }

    /// Cache keys of every registered task plus the files they point to
    fn referenced_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for task in &self.tasks {
            let key = task.fingerprint().as_str();
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
            if self.cache.exists(key) {
                if let Some(file) = self.cache.referenced_file(key)? {
                    if !keys.contains(&file) {
                        keys.push(file);
                    }
                }
            }
        }
        Ok(keys)
    }

    /// [`Pipeline::referenced_keys`] that exist on disk
    fn referenced_files(&self) -> Result<Vec<String>> {
        Ok(self
            .referenced_keys()?
            .into_iter()
            .filter(|key| self.cache.exists(key))
            .collect())
    }

    /// Resolve the arguments of task `index` and run it
    pub(crate) fn execute_task(&mut self, index: usize, options: &RunOptions) -> Result<()> {
        let args = self.tasks[index].args().to_vec();
        let kwargs = self.tasks[index].kwargs().clone();
        let fingerprint = self.tasks[index].fingerprint().clone();

        let inputs = resolve_inputs(
            &mut self.tasks[..index],
            &self.cache,
            self.id,
            &args,
            kwargs,
            Some(fingerprint),
        )?;
        let flags = crate::task::ExecFlags {
            timeit: options.timeit,
            memcheck: options.memcheck,
        };
        self.tasks[index].run(&inputs, &mut self.cache, flags)
    }
}

/// Replace task handles among `args` by the tasks' results
pub(crate) fn resolve_inputs(
    tasks: &mut [Task],
    cache: &CacheStore,
    pipeline: u64,
    args: &[Arg],
    kwargs: BTreeMap<String, Value>,
    fingerprint: Option<Fingerprint>,
) -> Result<Inputs> {
    let mut fetch = |handle: &TaskRef| -> Result<Value> {
        if handle.pipeline() != pipeline {
            return Err(PipelineError::UnknownTask(handle.index()).into());
        }
        let task = tasks
            .get_mut(handle.index())
            .ok_or(PipelineError::UnknownTask(handle.index()))?;
        task.result(cache)
    };

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        let value = match arg {
            Arg::Value(value) => value.clone(),
            Arg::Task(handle) => fetch(handle)?,
            Arg::Tasks(handles) => Value::Array(
                handles
                    .iter()
                    .map(&mut fetch)
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        values.push(value);
    }

    Ok(Inputs::new(values, kwargs, fingerprint, cache.root().to_path_buf()))
}

/// Stem of the running program, used to name telemetry files
fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_stem)
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "pipeline".to_string())
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("cache", &self.cache.root())
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("tasks", &self.tasks.len())
            .field("views", &self.views.len())
            .finish()
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
