//! Worker runtime.
//!
//! Every worker is a dedicated OS thread driving its own current-thread
//! Tokio runtime. It loads the pool's module, reports `READY`, then serves
//! `REQUEST`s concurrently until it is terminated, exits, or fails. The free
//! functions at the bottom are usable from inside worker methods.

use super::{
    errors::{panic_message, Exception},
    module::{Export, Method, Module, ModuleLoader},
    movable::Movable,
    protocol::{Envelope, Message},
    value::{marshal, marshal_one, Callback, CallbackFn, Value},
};
use futures::{future::FutureExt, StreamExt};
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Once,
    },
    thread,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type WorkerId = u64;

pub(crate) struct WorkerSpec {
    pub id: WorkerId,
    pub filename: PathBuf,
    pub loader: Arc<dyn ModuleLoader>,
    pub name: String,
    pub stack_size: Option<usize>,
    pub worker_data: Value,
}

pub(crate) struct WorkerChannels {
    pub inbox: mpsc::UnboundedReceiver<Message>,
    pub outbox: mpsc::UnboundedSender<Envelope>,
    /// Cancelled by the pool to terminate the worker.
    pub terminate: CancellationToken,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Per-worker state reachable from user code through the free functions.
struct Shared {
    id: WorkerId,
    worker_data: Value,
    outbox: mpsc::UnboundedSender<Envelope>,
    exiting: AtomicBool,
    stop: CancellationToken,
    calls: Mutex<HashMap<u64, oneshot::Sender<Result<Value, Exception>>>>,
    next_call: AtomicU64,
}

impl Shared {
    fn post(&self, message: Message) {
        if self.exiting.load(Ordering::Acquire) {
            return;
        }
        trace!(worker = self.id, opcode = %message.opcode(), "outbound");
        let _ = self.outbox.send(Envelope::Message(message));
    }

    /// Reports an error the worker cannot recover from, then stops it.
    fn fatal(&self, message: String) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(worker = self.id, error = %message, "worker failed");
        let _ = self.outbox.send(Envelope::Error(message));
        self.stop.cancel();
    }

    fn exit(&self) {
        if !self.exiting.swap(true, Ordering::AcqRel) {
            debug!(worker = self.id, "worker exit requested");
        }
        self.stop.cancel();
    }

    fn resolve_call(&self, call_id: u64, result: Result<Value, Exception>) {
        match self.calls.lock().remove(&call_id) {
            Some(pending) => {
                let _ = pending.send(result);
            }
            None => warn!(worker = self.id, call_id, "callback result for unknown call"),
        }
    }
}

/// Signals the pool on every way out of the worker thread, panics included.
struct ExitGuard(mpsc::UnboundedSender<Envelope>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.0.send(Envelope::Exit);
    }
}

/// Makes every panic on a worker thread fatal to that worker, including
/// panics inside tasks the worker's runtime would otherwise swallow.
/// Chains to the previously installed hook.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(shared) = try_current() {
                shared.fatal(panic_message(info.payload()));
            }
            previous(info);
        }));
    });
}

pub(crate) fn start(
    spec: WorkerSpec,
    channels: WorkerChannels,
) -> io::Result<thread::JoinHandle<()>> {
    install_panic_hook();
    let mut builder = thread::Builder::new().name(format!("{}-{}", spec.name, spec.id));
    if let Some(size) = spec.stack_size {
        builder = builder.stack_size(size);
    }
    builder.spawn(move || run(spec, channels))
}

fn run(spec: WorkerSpec, channels: WorkerChannels) {
    let WorkerChannels {
        inbox,
        outbox,
        terminate,
    } = channels;
    let _exit = ExitGuard(outbox.clone());

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = outbox.send(Envelope::Error(format!("Failed to start worker runtime: {e}")));
            return;
        }
    };

    let shared = Arc::new(Shared {
        id: spec.id,
        worker_data: spec.worker_data,
        outbox,
        exiting: AtomicBool::new(false),
        stop: CancellationToken::new(),
        calls: Mutex::new(HashMap::new()),
        next_call: AtomicU64::new(0),
    });
    CURRENT.with(|current| *current.borrow_mut() = Some(shared.clone()));

    let served = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(serve(shared.clone(), spec.filename, spec.loader, inbox, terminate))
    }));
    if let Err(payload) = served {
        shared.fatal(panic_message(payload.as_ref()));
    }

    // drops every task still in flight
    drop(runtime);
    CURRENT.with(|current| current.borrow_mut().take());
    debug!(worker = spec.id, "worker thread finished");
}

async fn serve(
    shared: Arc<Shared>,
    filename: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    terminate: CancellationToken,
) {
    let loaded = tokio::select! {
        biased;
        _ = terminate.cancelled() => return,
        _ = shared.stop.cancelled() => return,
        loaded = AssertUnwindSafe(loader.load(&filename)).catch_unwind() => loaded,
    };
    let module = match loaded {
        Ok(Ok(Export::Module(module))) => Arc::new(module),
        Ok(Ok(Export::Value(_))) => return shared.fatal("module must export an object".into()),
        Ok(Err(e)) => return shared.fatal(e.message().to_owned()),
        Err(payload) => return shared.fatal(panic_message(payload.as_ref())),
    };
    debug!(worker = shared.id, methods = module.len(), "module loaded");
    shared.post(Message::Ready);

    loop {
        tokio::select! {
            biased;
            _ = terminate.cancelled() => {
                debug!(worker = shared.id, "terminated");
                break;
            }
            _ = shared.stop.cancelled() => break,
            message = inbox.recv() => match message {
                Some(Message::Request { method, args, callbacks }) => {
                    tokio::spawn(execute(shared.clone(), module.clone(), method, args, callbacks));
                }
                Some(Message::CallbackResult { call_id, result }) => {
                    shared.resolve_call(call_id, result)
                }
                Some(other) => {
                    let opcode = other.opcode();
                    warn!(worker = shared.id, %opcode, "ignoring unexpected message")
                }
                None => break,
            },
        }
    }
}

async fn execute(
    shared: Arc<Shared>,
    module: Arc<Module>,
    method: String,
    args: Vec<Value>,
    callbacks: Vec<usize>,
) {
    let ended = Arc::new(AtomicBool::new(false));
    let args = bind_callbacks(&shared, &ended, args, &callbacks);

    let outcome = AssertUnwindSafe(run_method(&shared, &module, &method, args, &ended))
        .catch_unwind()
        .await;
    ended.store(true, Ordering::Release);
    if let Err(payload) = outcome {
        shared.fatal(panic_message(payload.as_ref()));
    }
}

async fn run_method(
    shared: &Shared,
    module: &Module,
    name: &str,
    args: Vec<Value>,
    ended: &AtomicBool,
) {
    let Some(method) = module.get(name) else {
        ended.store(true, Ordering::Release);
        let err = Exception::new(format!("Worker method not found: {name}"));
        return shared.post(Message::Response { result: Err(err) });
    };
    trace!(worker = shared.id, method = name, "executing");

    match method {
        Method::Call(call) => {
            let result = call(args).await.and_then(export);
            ended.store(true, Ordering::Release);
            shared.post(Message::Response { result });
        }
        Method::Generator(produce) => {
            shared.post(Message::GeneratorStart);
            let mut items = produce(args);
            while let Some(item) = items.next().await {
                match item.and_then(export) {
                    Ok(value) => shared.post(Message::GeneratorYield { value }),
                    Err(err) => {
                        ended.store(true, Ordering::Release);
                        return shared.post(Message::Response { result: Err(err) });
                    }
                }
            }
            ended.store(true, Ordering::Release);
            shared.post(Message::Response { result: Ok(Value::Null) });
        }
    }
}

fn export(movable: Movable) -> Result<Value, Exception> {
    let (value, transfer_list) = movable.into_parts();
    marshal_one(value, &transfer_list)
}

fn bind_callbacks(
    shared: &Arc<Shared>,
    ended: &Arc<AtomicBool>,
    mut args: Vec<Value>,
    callbacks: &[usize],
) -> Vec<Value> {
    for &index in callbacks {
        if let Some(slot) = args.get_mut(index) {
            *slot = Value::Function(thunk(shared.clone(), ended.clone(), index));
        }
    }
    args
}

/// Stand-in for a caller-side callable. The `CALLBACK_CALL` is sent as soon
/// as the thunk is called; the returned future waits for the matching result.
fn thunk(shared: Arc<Shared>, ended: Arc<AtomicBool>, index: usize) -> Callback {
    let call: Arc<CallbackFn> = Arc::new(move |args: Vec<Value>| {
        if ended.load(Ordering::Acquire) {
            let err = Exception::new("Worker callback called after task ended");
            return futures::future::ready(Err(err)).boxed();
        }
        let args = match marshal(args, &[]) {
            Ok(args) => args,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };

        let (tx, rx) = oneshot::channel();
        let call_id = shared.next_call.fetch_add(1, Ordering::Relaxed);
        shared.calls.lock().insert(call_id, tx);
        trace!(worker = shared.id, call_id, index, "calling back");
        shared.post(Message::CallbackCall { call_id, index, args });

        async move {
            rx.await
                .unwrap_or_else(|_| Err(Exception::new("Worker thread is shutting down")))
        }
        .boxed()
    });
    Callback::from_raw(call)
}

fn current() -> Option<Arc<Shared>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Like `current`, tolerating a torn-down or borrowed slot.
fn try_current() -> Option<Arc<Shared>> {
    CURRENT
        .try_with(|current| current.try_borrow().ok().and_then(|shared| shared.clone()))
        .ok()
        .flatten()
}

/// True on a pool worker thread.
pub fn is_worker() -> bool {
    current().is_some()
}

pub fn worker_id() -> Option<u64> {
    current().map(|shared| shared.id)
}

/// The pool's `worker_data`, or `Value::Null` outside a worker.
pub fn worker_data() -> Value {
    current().map(|shared| shared.worker_data.clone()).unwrap_or_default()
}

/// Ends the current worker as if its thread exited. Nothing it sends
/// afterwards reaches the pool; an in-flight task is rejected with
/// "Worker thread exited prematurely".
pub fn exit() {
    if let Some(shared) = current() {
        shared.exit();
    }
}

/// Runs `future` in the background on the current worker.
///
/// A panic or an `Err` from the future is fatal to the worker: the pool
/// rejects its in-flight task with that error and replaces it.
pub fn spawn<F>(future: F)
where
    F: Future<Output = Result<(), Exception>> + Send + 'static,
{
    let Some(shared) = current() else {
        warn!("worker::spawn called outside a worker thread, future dropped");
        return;
    };
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => shared.fatal(err.message().to_owned()),
            Err(payload) => shared.fatal(panic_message(payload.as_ref())),
        }
    });
}
