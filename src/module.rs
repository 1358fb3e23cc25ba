//! Worker-side module contract: a name to method table, and the loaders
//! that resolve a pool's filename to one.

use crate::{errors::Exception, movable::Movable, value::Value};
use futures::{
    future::{BoxFuture, FutureExt},
    stream::{BoxStream, Stream, StreamExt},
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

pub type MethodFuture = BoxFuture<'static, Result<Movable, Exception>>;
pub type MethodStream = BoxStream<'static, Result<Movable, Exception>>;

#[derive(Clone)]
pub enum Method {
    Call(Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>),
    /// Produces a stream of values; the caller receives a `TaskStream`.
    Generator(Arc<dyn Fn(Vec<Value>) -> MethodStream + Send + Sync>),
}

/// Methods exported by a worker module, resolved once when it loads.
#[derive(Clone, Default)]
pub struct Module {
    methods: HashMap<String, Method>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Movable> + 'static,
    {
        let f = Arc::new(f);
        let call = move |args: Vec<Value>| -> MethodFuture {
            let f = Arc::clone(&f);
            async move { f(args).map(Into::<Movable>::into) }.boxed()
        };
        self.methods.insert(name.into(), Method::Call(Arc::new(call)));
        self
    }

    pub fn async_method<F, Fut, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Exception>> + Send + 'static,
        R: Into<Movable> + 'static,
    {
        let call = move |args: Vec<Value>| -> MethodFuture {
            FutureExt::boxed(FutureExt::map(f(args), |r| r.map(Into::<Movable>::into)))
        };
        self.methods.insert(name.into(), Method::Call(Arc::new(call)));
        self
    }

    pub fn generator<F, S, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<R, Exception>> + Send + 'static,
        R: Into<Movable> + 'static,
    {
        let produce = move |args: Vec<Value>| -> MethodStream {
            StreamExt::boxed(StreamExt::map(f(args), |r| r.map(Into::<Movable>::into)))
        };
        self.methods.insert(name.into(), Method::Generator(Arc::new(produce)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Module").field("methods", &names).finish()
    }
}

/// What loading a module yields. Only `Module` can back a pool; anything
/// else fails with "module must export an object".
#[derive(Debug)]
pub enum Export {
    Module(Module),
    Value(Value),
}

impl From<Module> for Export {
    fn from(module: Module) -> Self {
        Export::Module(module)
    }
}

impl From<Value> for Export {
    fn from(value: Value) -> Self {
        Export::Value(value)
    }
}

/// Resolves a filename to the worker's exports. Runs on the worker thread,
/// once per worker.
pub trait ModuleLoader: Send + Sync + 'static {
    fn load(&self, filename: &Path) -> BoxFuture<'static, Result<Export, Exception>>;
}

/// Adapter for synchronous loader closures.
pub struct FnLoader<F>(F);

impl<F> FnLoader<F>
where
    F: Fn(&Path) -> Result<Export, Exception> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ModuleLoader for FnLoader<F>
where
    F: Fn(&Path) -> Result<Export, Exception> + Send + Sync + 'static,
{
    fn load(&self, filename: &Path) -> BoxFuture<'static, Result<Export, Exception>> {
        futures::future::ready((self.0)(filename)).boxed()
    }
}

type Factory = Arc<dyn Fn() -> BoxFuture<'static, Result<Export, Exception>> + Send + Sync>;

/// Filename-keyed module factories.
#[derive(Default)]
pub struct Registry {
    modules: RwLock<HashMap<PathBuf, Factory>>,
}

impl Registry {
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::default)
    }

    pub fn register<F>(&self, filename: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> Result<Export, Exception> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let boxed: Factory = Arc::new(move || {
            let factory = Arc::clone(&factory);
            async move { factory() }.boxed()
        });
        self.modules.write().insert(filename.into(), boxed);
    }

    pub fn register_async<F, Fut>(&self, filename: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Export, Exception>> + Send + 'static,
    {
        let boxed: Factory = Arc::new(move || FutureExt::boxed(factory()));
        self.modules.write().insert(filename.into(), boxed);
    }

    pub fn unregister(&self, filename: impl AsRef<Path>) -> bool {
        self.modules.write().remove(filename.as_ref()).is_some()
    }

    pub fn contains(&self, filename: impl AsRef<Path>) -> bool {
        self.modules.read().contains_key(filename.as_ref())
    }
}

impl ModuleLoader for Registry {
    fn load(&self, filename: &Path) -> BoxFuture<'static, Result<Export, Exception>> {
        let factory = self.modules.read().get(filename).cloned();
        match factory {
            Some(factory) => factory(),
            None => {
                let message = format!("Cannot find module '{}'", filename.display());
                futures::future::ready(Err(Exception::new(message))).boxed()
            }
        }
    }
}

/// Default loader: the process-wide [`Registry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryLoader;

impl ModuleLoader for RegistryLoader {
    fn load(&self, filename: &Path) -> BoxFuture<'static, Result<Export, Exception>> {
        Registry::global().load(filename)
    }
}

/// Registers a module factory under `filename` in the global registry.
pub fn register<F>(filename: impl Into<PathBuf>, factory: F)
where
    F: Fn() -> Result<Export, Exception> + Send + Sync + 'static,
{
    Registry::global().register(filename, factory);
}

pub fn register_async<F, Fut>(filename: impl Into<PathBuf>, factory: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Export, Exception>> + Send + 'static,
{
    Registry::global().register_async(filename, factory);
}
