//! User callables, their tagged arguments and their outputs

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{Fingerprint, TaskRef};

/// Signature every task body implements
pub type TaskFn = dyn Fn(&Inputs) -> anyhow::Result<Output> + Send + Sync;

/// A named unit of logic with a stable identity.
///
/// The `logic` text feeds the fingerprint, so it must change whenever the
/// behaviour does. [`callable!`](crate::callable) captures the closure's
/// source tokens; [`Callable::versioned`] takes an explicit tag instead.
#[derive(Clone)]
pub struct Callable {
    name: String,
    logic: String,
    func: Arc<TaskFn>,
}

impl Callable {
    pub fn new<F>(name: impl Into<String>, logic: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Inputs) -> anyhow::Result<Output> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            logic: logic.into(),
            func: Arc::new(func),
        }
    }

    /// Identify the logic by an author-maintained version tag
    pub fn versioned<F>(name: impl Into<String>, version: impl fmt::Display, func: F) -> Self
    where
        F: Fn(&Inputs) -> anyhow::Result<Output> + Send + Sync + 'static,
    {
        Self::new(name, format!("version:{version}"), func)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logic(&self) -> &str {
        &self.logic
    }

    pub(crate) fn call(&self, inputs: &Inputs) -> anyhow::Result<Output> {
        (self.func)(inputs)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("logic", &self.logic)
            .finish_non_exhaustive()
    }
}

/// Build a [`Callable`] whose identity is the closure's own source text.
///
/// ```
/// use ndustria_core::{callable, Output};
///
/// let double = callable!("double", |inputs| {
///     let x: i64 = inputs.arg(0)?;
///     Output::value(&(x * 2))
/// });
/// assert_eq!(double.name(), "double");
/// ```
#[macro_export]
macro_rules! callable {
    ($name:expr, $func:expr) => {
        $crate::Callable::new($name, stringify!($func), $func)
    };
}

/// What a task body hands back
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Serialized into the cache under the task's fingerprint
    Value(Value),
    /// The body already wrote this file inside the cache root
    File(String),
    /// Nothing worth keeping; a `null` placeholder is cached
    Empty,
}

impl Output {
    /// Serialize any value into an [`Output::Value`]
    pub fn value<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        let value = serde_json::to_value(value).context("task result is not serializable")?;
        Ok(Self::Value(value))
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::File(name.into())
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// One call argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Literal value
    Value(Value),
    /// Result of another task
    Task(TaskRef),
    /// Results of several tasks, passed as one array
    Tasks(Vec<TaskRef>),
}

impl Arg {
    /// Task handles this argument depends on
    pub fn task_refs(&self) -> &[TaskRef] {
        match self {
            Self::Value(_) => &[],
            Self::Task(task) => std::slice::from_ref(task),
            Self::Tasks(tasks) => tasks,
        }
    }

    /// Serialize any value into an [`Arg::Value`]
    pub fn value<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self::Value)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<TaskRef> for Arg {
    fn from(task: TaskRef) -> Self {
        Self::Task(task)
    }
}

impl From<&TaskRef> for Arg {
    fn from(task: &TaskRef) -> Self {
        Self::Task(*task)
    }
}

impl From<Vec<TaskRef>> for Arg {
    fn from(tasks: Vec<TaskRef>) -> Self {
        Self::Tasks(tasks)
    }
}

impl From<&[TaskRef]> for Arg {
    fn from(tasks: &[TaskRef]) -> Self {
        Self::Tasks(tasks.to_vec())
    }
}

macro_rules! arg_from_literal {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

arg_from_literal!(bool, i32, i64, u32, u64, usize, f32, f64, String, &str);

/// Arguments as handed to a task body, with task handles replaced by results
#[derive(Debug, Clone)]
pub struct Inputs {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    fingerprint: Option<Fingerprint>,
    cache_root: PathBuf,
}

impl Inputs {
    pub(crate) fn new(
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        fingerprint: Option<Fingerprint>,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            args,
            kwargs,
            fingerprint,
            cache_root,
        }
    }

    /// Deserialize positional argument `index`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {index} has an unexpected type"))
    }

    /// Raw positional argument
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Deserialize keyword argument `name`
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .kwargs
            .get(name)
            .with_context(|| format!("missing keyword argument '{name}'"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("keyword argument '{name}' has an unexpected type"))
    }

    /// Keyword argument `name`, or `default` when it was not passed
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> anyhow::Result<T> {
        if self.kwargs.contains_key(name) {
            self.kwarg(name)
        } else {
            Ok(default)
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    /// Fingerprint of the running task; views have none
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Where a body returning [`Output::File`] should write `name`
    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_root.join(name)
    }
}

/// A task registration request, built fluently and passed to
/// [`Pipeline::add_task`](crate::Pipeline::add_task)
#[derive(Debug, Clone)]
pub struct Invocation {
    pub(crate) callable: Callable,
    pub(crate) args: Vec<Arg>,
    pub(crate) kwargs: BTreeMap<String, Value>,
    pub(crate) rerun: bool,
}

impl Invocation {
    pub fn new(callable: Callable) -> Self {
        Self {
            callable,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            rerun: false,
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Ignore any cached result for this task and everything downstream of it
    pub fn rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }
}

impl From<Callable> for Invocation {
    fn from(callable: Callable) -> Self {
        Self::new(callable)
    }
}

/// Canonical string form of a literal for fingerprinting and descriptions
pub(crate) fn value_repr(value: &Value) -> String {
    value.to_string()
}
