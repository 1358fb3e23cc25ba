use super::{
    errors::ConfigError,
    module::{ModuleLoader, RegistryLoader},
    value::{marshal_one, Value},
};
use std::{fmt, path::Path, sync::Arc};

/// Extensions a pool filename may carry besides none at all.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

pub(crate) const DEFAULT_WORKER_NAME: &str = "offload-worker";

pub fn physical_cores() -> usize {
    num_cpus::get_physical().max(1)
}

/// Pass-through configuration for each worker thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Thread name prefix; threads are named `<name>-<id>`.
    pub name: Option<String>,
    pub stack_size: Option<usize>,
    /// Copied into every worker, readable there via `worker::worker_data()`.
    pub worker_data: Value,
}

/// Pool configuration
#[derive(Clone)]
pub struct PoolConfig {
    pub filename: String,
    pub min_threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub worker: WorkerOptions,
    pub loader: Option<Arc<dyn ModuleLoader>>,
}

impl PoolConfig {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            min_threads: None,
            max_threads: None,
            worker: WorkerOptions::default(),
            loader: None,
        }
    }

    /// Keeps one live worker per physical core.
    pub fn cpu_bound(filename: impl Into<String>) -> Self {
        let cores = physical_cores();
        Self::new(filename).min_threads(cores).max_threads(cores)
    }

    /// Starts with no workers and grows to one per physical core under load.
    pub fn on_demand(filename: impl Into<String>) -> Self {
        Self::new(filename).min_threads(0).max_threads(physical_cores())
    }

    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = Some(n);
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n);
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.worker.stack_size = Some(bytes);
        self
    }

    pub fn worker_data(mut self, data: impl Into<Value>) -> Self {
        self.worker.worker_data = data.into();
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub(crate) fn normalize(self) -> Result<Settings, ConfigError> {
        if !self.filename.starts_with('/') || self.filename.contains('\\') {
            return Err(ConfigError::RelativeFilename(self.filename));
        }
        let extension = Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        if !extension.is_empty() && !RECOGNIZED_EXTENSIONS.contains(&extension) {
            return Err(ConfigError::UnsupportedExtension(extension.to_owned()));
        }

        let cores = physical_cores();
        let min_threads = self.min_threads.unwrap_or((cores / 2).max(1));
        let max_threads = match self.max_threads {
            Some(0) => return Err(ConfigError::ZeroMaxThreads),
            Some(max) if max < min_threads => {
                return Err(ConfigError::MaxBelowMin { min: min_threads, max })
            }
            Some(max) => max,
            None => cores.max(min_threads),
        };

        marshal_one(self.worker.worker_data.clone(), &[])
            .map_err(|e| ConfigError::InvalidWorkerData(e.message().to_owned()))?;

        Ok(Settings {
            filename: self.filename,
            min_threads,
            max_threads,
            worker: self.worker,
            loader: self.loader.unwrap_or_else(|| Arc::new(RegistryLoader)),
        })
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("filename", &self.filename)
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("worker", &self.worker)
            .field("custom_loader", &self.loader.is_some())
            .finish()
    }
}

/// Validated configuration.
pub(crate) struct Settings {
    pub filename: String,
    pub min_threads: usize,
    pub max_threads: usize,
    pub worker: WorkerOptions,
    pub loader: Arc<dyn ModuleLoader>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(config: PoolConfig) -> ConfigError {
        match config.normalize() {
            Ok(_) => panic!("configuration should have been rejected"),
            Err(err) => err,
        }
    }

    #[test]
    fn filename_must_be_absolute() {
        assert_eq!(
            reject(PoolConfig::new("test.so")),
            ConfigError::RelativeFilename("test.so".into())
        );
        assert!(matches!(
            reject(PoolConfig::new("C:\\test.dll")),
            ConfigError::RelativeFilename(_)
        ));
        assert!(matches!(
            reject(PoolConfig::new("/tmp\\test")),
            ConfigError::RelativeFilename(_)
        ));
    }

    #[test]
    fn extension_must_be_recognized() {
        assert_eq!(
            reject(PoolConfig::new("/test.txt")),
            ConfigError::UnsupportedExtension("txt".into())
        );
        for name in ["/test", "/lib/test.so", "/lib/test.dylib", "/lib/test.dll"] {
            assert!(PoolConfig::new(name).normalize().is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn thread_bounds() {
        assert_eq!(reject(PoolConfig::new("/x").max_threads(0)), ConfigError::ZeroMaxThreads);
        assert_eq!(
            reject(PoolConfig::new("/x").min_threads(2).max_threads(1)),
            ConfigError::MaxBelowMin { min: 2, max: 1 }
        );

        let s = PoolConfig::new("/x").min_threads(0).max_threads(1).normalize().unwrap();
        assert_eq!((s.min_threads, s.max_threads), (0, 1));

        let s = PoolConfig::new("/x").min_threads(500).normalize().unwrap();
        assert_eq!(s.max_threads, 500, "default max never falls below min");
    }

    #[test]
    fn defaults_follow_core_count() {
        let cores = physical_cores();
        let s = PoolConfig::new("/x").normalize().unwrap();
        assert_eq!(s.min_threads, (cores / 2).max(1));
        assert_eq!(s.max_threads, cores.max(s.min_threads));

        let s = PoolConfig::on_demand("/x").normalize().unwrap();
        assert_eq!((s.min_threads, s.max_threads), (0, cores));
    }

    #[test]
    fn worker_data_must_be_cloneable() {
        let config = PoolConfig::new("/x").worker_data(Value::sync_function(|_| Ok(Value::Null)));
        assert!(matches!(reject(config), ConfigError::InvalidWorkerData(_)));
    }
}
