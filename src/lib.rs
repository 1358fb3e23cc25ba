//! Offloads method calls to a pool of worker threads.
//!
//! # Features
//! - Workers scale between `min_threads` and `max_threads`, spawned lazily under load
//! - Each call yields a [`TaskHandle`] that settles exactly once
//! - Cancellation through `CancellationToken` signals
//! - Generator methods stream their values back as a [`TaskStream`]
//! - Callables passed as arguments can be called back from the worker
//! - Zero-copy buffer handoff with transfer lists and [`Movable`]
//! - Crashed or exited workers are replaced without disturbing the pool

pub mod config;
pub mod errors;
pub mod handle;
pub mod iterable;
pub mod model;
pub mod module;
pub mod movable;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod result;
pub mod value;
pub mod worker;

pub use config::{PoolConfig, WorkerOptions};
pub use errors::{ConfigError, Exception, PoolError};
pub use handle::{Reply, TaskHandle};
pub use iterable::TaskStream;
pub use model::{PoolEvent, PoolMetrics, WorkerState};
pub use module::{Export, FnLoader, Module, ModuleLoader};
pub use movable::{move_value, Movable};
pub use pool::{InvokeOptions, ThreadPool, ThreadPoolInner};
pub use result::PoolResult;
pub use value::{ArrayBuffer, Callback, Value};
