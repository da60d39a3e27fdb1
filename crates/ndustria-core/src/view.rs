//! Presentation units: consumers of finished task results
//!
//! Views follow the same readiness rule as tasks but cache nothing. A view
//! is settled once it has been shown, here or on another worker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::task::{describe, truncate, Arg, Inputs, Task, TaskRef};

/// Signature every view body implements
pub type ViewFn = dyn Fn(&Inputs) -> anyhow::Result<()> + Send + Sync;

/// Handle to a registered view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewRef(usize);

impl ViewRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A view registration request
#[derive(Clone)]
pub struct ViewInvocation {
    name: String,
    func: Arc<ViewFn>,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Value>,
    root_only: bool,
}

impl ViewInvocation {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Inputs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            root_only: false,
        }
    }

    /// Append a positional argument; task handles become dependencies
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Show only on the root worker
    pub fn root_only(mut self, root_only: bool) -> Self {
        self.root_only = root_only;
        self
    }
}

impl fmt::Debug for ViewInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewInvocation")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("root_only", &self.root_only)
            .finish_non_exhaustive()
    }
}

/// A registered view
pub struct View {
    index: usize,
    name: String,
    func: Arc<ViewFn>,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Value>,
    deps: Vec<usize>,
    unresolved: Vec<TaskRef>,
    root_only: bool,
    description: String,
    shown: bool,
}

impl View {
    pub(crate) fn new(index: usize, invocation: ViewInvocation, pipeline: u64, tasks: &[Task]) -> Self {
        let ViewInvocation {
            name,
            func,
            args,
            kwargs,
            root_only,
        } = invocation;

        let mut deps = Vec::new();
        let mut unresolved = Vec::new();
        for task in args.iter().flat_map(Arg::task_refs) {
            let local = (task.pipeline() == pipeline && task.index() < tasks.len()).then(|| task.index());
            match local {
                Some(i) if !deps.contains(&i) => deps.push(i),
                Some(_) => {}
                None if !unresolved.contains(task) => unresolved.push(*task),
                None => {}
            }
        }

        let description = describe(&name, &args, &kwargs, |task| {
            if task.pipeline() == pipeline {
                tasks
                    .get(task.index())
                    .map(|t| format!("@{}", t.fingerprint().short()))
                    .unwrap_or_else(|| format!("@?{task}"))
            } else {
                format!("@?{task}")
            }
        });
        debug!(view = %description, root_only, "view registered");

        Self {
            index,
            name,
            func,
            args,
            kwargs,
            deps,
            unresolved,
            root_only,
            description,
            shown: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn is_root_only(&self) -> bool {
        self.root_only
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

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn short_description(&self) -> String {
        truncate(&self.description, 50)
    }

    /// True when every task this view reads is done
    pub(crate) fn ready_to_run(&self, tasks: &[Task]) -> bool {
        self.unresolved.is_empty()
            && self
                .deps
                .iter()
                .all(|&d| tasks.get(d).is_some_and(Task::is_done))
    }

    pub(crate) fn run(&mut self, inputs: &Inputs) -> anyhow::Result<()> {
        (self.func)(inputs)?;
        self.shown = true;
        Ok(())
    }

    pub(crate) fn mark_shown(&mut self) {
        self.shown = true;
    }

    pub(crate) fn reset(&mut self) {
        self.shown = false;
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("index", &self.index)
            .field("description", &self.description)
            .field("root_only", &self.root_only)
            .field("shown", &self.shown)
            .finish_non_exhaustive()
    }
}

pub(crate) fn view_ref(index: usize) -> ViewRef {
    ViewRef(index)
}
