use std::any::Any;
use thiserror::Error;

/// Error value produced by user code: a worker method, a caller-side
/// callback, or a module loader. It travels across the channel inside
/// `RESPONSE` and `CALLBACK_RESULT`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Exception {
    message: String,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for Exception {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for Exception {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum ConfigError {
    #[error("filename must be an absolute path, got {0:?}")]
    RelativeFilename(String),
    #[error("filename extension {0:?} is not a recognized module extension")]
    UnsupportedExtension(String),
    #[error("max_threads must be greater than zero")]
    ZeroMaxThreads,
    #[error("max_threads ({max}) must not be less than min_threads ({min})")]
    MaxBelowMin { min: usize, max: usize },
    #[error("worker_data cannot be sent to a worker: {0}")]
    InvalidWorkerData(String),
    #[error("a thread pool must be created inside a Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The call could not be dispatched, e.g. its arguments cannot be cloned.
    #[error("{0}")]
    Dispatch(String),
    /// The worker method threw or rejected.
    #[error(transparent)]
    Task(#[from] Exception),
    #[error("{0}")]
    WorkerFatal(String),
    #[error("{0}")]
    Destroyed(String),
    #[error("{0}")]
    Aborted(String),
}

impl PoolError {
    pub(crate) fn destroyed() -> Self {
        Self::Destroyed("Thread pool was destroyed".into())
    }

    pub(crate) fn aborted() -> Self {
        Self::Aborted("The operation was aborted".into())
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    pub fn is_task_error(&self) -> bool {
        matches!(self, Self::Task(_))
    }

    /// Human-readable message without the variant wrapper.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}
