use super::{
    config::{PoolConfig, WorkerOptions, DEFAULT_WORKER_NAME},
    errors::{panic_message, ConfigError, Exception, PoolError},
    handle::{Reply, TaskHandle},
    iterable::{self, StreamController},
    model::{PoolEvent, PoolMetrics, WorkerState},
    module::ModuleLoader,
    protocol::{Envelope, Message},
    queue::Queue,
    result::PoolResult,
    value::{marshal, marshal_one, ArrayBuffer, Callback, Value},
    worker::{self, WorkerChannels, WorkerId, WorkerSpec},
};
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{Arc, Weak},
};
use futures::{future::join_all, FutureExt};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

const EVENT_CAPACITY: usize = 64;

pub type ThreadPool = Arc<ThreadPoolInner>;

/// Arguments of a single call.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub args: Vec<Value>,
    /// Buffers among `args` to move to the worker instead of copying.
    pub transfer_list: Vec<ArrayBuffer>,
    /// Cancels the call: a queued call is dropped, a running one takes its worker down with it.
    pub signal: Option<CancellationToken>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn transfer(mut self, buffers: impl IntoIterator<Item = ArrayBuffer>) -> Self {
        self.transfer_list.extend(buffers);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

type JobId = u64;

struct Job {
    id: JobId,
    settle: Option<oneshot::Sender<PoolResult<Reply>>>,
    /// The REQUEST, until the job reaches a worker.
    outbound: Option<Message>,
    /// Abort observer; stopped when the job is dropped.
    cleanup: Option<JoinHandle<()>>,
    callbacks: Vec<(usize, Callback)>,
    stream: Option<StreamController<Value>>,
    /// Waits for the consumer to drain a stream the worker already finished.
    drain: Option<JoinHandle<()>>,
}

impl Job {
    fn callback(&self, index: usize) -> Option<Callback> {
        self.callbacks
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, callback)| callback.clone())
    }

    /// Resolves the caller with a live stream; later messages feed it.
    fn start_stream(&mut self) {
        if self.stream.is_some() {
            return;
        }
        if let Some(settle) = self.settle.take() {
            let (controller, stream) = iterable::channel();
            let _ = settle.send(Ok(Reply::Stream(stream)));
            self.stream = Some(controller);
        }
    }

    fn settle(mut self, result: PoolResult<Value>) {
        if let Some(stream) = self.stream.take() {
            match result {
                Ok(_) => stream.resolve(),
                Err(err) => stream.reject(err),
            }
        } else if let Some(settle) = self.settle.take() {
            let _ = settle.send(result.map(Reply::Value));
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(observer) = self.cleanup.take() {
            observer.abort();
        }
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

struct WorkerSlot {
    state: WorkerState,
    /// Set by READY; an exit before that is a startup failure.
    ready: bool,
    inbox: mpsc::UnboundedSender<Message>,
    terminate: CancellationToken,
    /// Cancelled once the worker thread is gone.
    exited: CancellationToken,
}

struct State {
    min_threads: usize,
    max_threads: usize,
    destroyed: bool,
    workers: HashMap<WorkerId, WorkerSlot>,
    idle: Vec<WorkerId>,
    assigned: HashMap<WorkerId, Job>,
    queue: Queue<Job>,
    next_worker: WorkerId,
    next_job: JobId,
    /// Last `online` value announced.
    online: usize,
}

impl State {
    fn online(&self) -> usize {
        self.idle.len() + self.assigned.len()
    }

    fn initializing(&self) -> usize {
        self.workers
            .values()
            .filter(|slot| slot.state == WorkerState::Initializing)
            .count()
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            thread_count: self.workers.len(),
            online_threads: self.online(),
            active_threads: self.assigned.len(),
            queued_tasks: self.queue.len(),
            pending_tasks: self.assigned.len() + self.queue.len(),
        }
    }
}

/// Pool of worker threads running the methods of one module.
pub struct ThreadPoolInner {
    this: Weak<ThreadPoolInner>,
    filename: String,
    loader: Arc<dyn ModuleLoader>,
    worker: WorkerOptions,
    runtime: Handle,
    events: broadcast::Sender<PoolEvent>,
    state: Mutex<State>,
}

impl ThreadPoolInner {
    pub fn new(filename: impl Into<String>) -> Result<ThreadPool, ConfigError> {
        Self::with_config(PoolConfig::new(filename))
    }

    /// Validates `config` and spawns `min_threads` workers. Must be called
    /// inside a Tokio runtime.
    pub fn with_config(config: PoolConfig) -> Result<ThreadPool, ConfigError> {
        let settings = config.normalize()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let pool = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            filename: settings.filename,
            loader: settings.loader,
            worker: settings.worker,
            runtime,
            events,
            state: Mutex::new(State {
                min_threads: settings.min_threads,
                max_threads: settings.max_threads,
                destroyed: false,
                workers: HashMap::new(),
                idle: Vec::new(),
                assigned: HashMap::new(),
                queue: Queue::new(),
                next_worker: 0,
                next_job: 0,
                online: 0,
            }),
        });
        debug!(
            filename = %pool.filename,
            min_threads = settings.min_threads,
            max_threads = settings.max_threads,
            "thread pool created"
        );

        {
            let mut state = pool.state.lock();
            pool.spawn_as_needed(&mut state);
        }
        Ok(pool)
    }

    /// `invoke` without transfer list or signal.
    pub fn call(&self, method: &str, args: Vec<Value>) -> TaskHandle {
        self.invoke(method, InvokeOptions::new().args(args))
    }

    pub fn invoke(&self, method: &str, options: InvokeOptions) -> TaskHandle {
        let InvokeOptions {
            args,
            transfer_list,
            signal,
        } = options;
        if signal.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return TaskHandle::settled(Err(PoolError::aborted()), signal);
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return TaskHandle::settled(Err(PoolError::destroyed()), signal);
        }

        let (args, callbacks) = extract_callbacks(args);
        let args = match marshal(args, &transfer_list) {
            Ok(args) => args,
            Err(err) => {
                let err = PoolError::Dispatch(err.message().to_owned());
                return TaskHandle::settled(Err(err), signal);
            }
        };

        let id = state.next_job;
        state.next_job += 1;
        let (tx, rx) = oneshot::channel();
        let job = Job {
            id,
            settle: Some(tx),
            outbound: Some(Message::Request {
                method: method.to_owned(),
                args,
                callbacks: callbacks.iter().map(|(index, _)| *index).collect(),
            }),
            cleanup: signal.clone().map(|signal| self.observe_abort(id, signal)),
            callbacks,
            stream: None,
            drain: None,
        };
        trace!(method, job = id, "dispatching");

        if let Some(worker) = state.idle.pop() {
            self.assign(&mut state, worker, job);
        } else {
            if state.workers.len() < state.max_threads {
                if let Err(err) = self.spawn_worker(&mut state) {
                    job.settle(Err(err));
                    return TaskHandle::new(rx, signal);
                }
            }
            state.queue.push(job);
        }
        self.sync_online(&mut state);
        TaskHandle::new(rx, signal)
    }

    /// Destroys the pool: every in-flight and queued task is rejected, no
    /// worker is spawned again. The destruction is immediate; the returned
    /// future completes once every worker thread has exited.
    pub fn destroy(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shutdown(None)
    }

    /// Like [`destroy`](Self::destroy), rejecting pending tasks with `error`.
    pub fn destroy_with(&self, error: PoolError) -> impl Future<Output = ()> + Send + 'static {
        self.shutdown(Some(error))
    }

    fn shutdown(&self, error: Option<PoolError>) -> impl Future<Output = ()> + Send + 'static {
        let exits: Vec<CancellationToken> = {
            let mut state = self.state.lock();
            self.destroy_locked(&mut state, error);
            self.sync_online(&mut state);
            state.workers.values().map(|slot| slot.exited.clone()).collect()
        };
        async move {
            join_all(exits.iter().map(CancellationToken::cancelled)).await;
        }
    }

    /// Receives events emitted after this call.
    ///
    /// The channel holds the last 64 events. A receiver that falls further
    /// behind gets `RecvError::Lagged(n)` once and resumes at the oldest
    /// retained event, so intermediate `Online` values are lost while the
    /// latest is kept. Read `online_thread_count()` after a lag for the
    /// current value.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.state.lock().metrics()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn online_thread_count(&self) -> usize {
        self.state.lock().online()
    }

    pub fn active_thread_count(&self) -> usize {
        self.state.lock().assigned.len()
    }

    pub fn pending_task_count(&self) -> usize {
        let state = self.state.lock();
        state.assigned.len() + state.queue.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub fn min_threads(&self) -> usize {
        self.state.lock().min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.state.lock().max_threads
    }

    /// States of the current workers, by spawn order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        let state = self.state.lock();
        let mut workers: Vec<_> = state
            .workers
            .iter()
            .map(|(id, slot)| (*id, slot.state))
            .collect();
        workers.sort_unstable_by_key(|(id, _)| *id);
        workers.into_iter().map(|(_, state)| state).collect()
    }

    fn spawn_as_needed(&self, state: &mut State) {
        while state.workers.len() < state.min_threads
            || (state.workers.len() < state.max_threads && state.initializing() < state.queue.len())
        {
            if let Err(err) = self.spawn_worker(state) {
                self.defer_fatal(err);
                break;
            }
        }
    }

    fn spawn_worker(&self, state: &mut State) -> PoolResult<()> {
        let id = state.next_worker;
        state.next_worker += 1;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let terminate = CancellationToken::new();
        let spec = WorkerSpec {
            id,
            filename: PathBuf::from(&self.filename),
            loader: self.loader.clone(),
            name: self.worker.name.clone().unwrap_or_else(|| DEFAULT_WORKER_NAME.to_owned()),
            stack_size: self.worker.stack_size,
            worker_data: marshal_one(self.worker.worker_data.clone(), &[]).unwrap_or_default(),
        };
        let channels = WorkerChannels {
            inbox: inbox_rx,
            outbox: outbox_tx,
            terminate: terminate.clone(),
        };
        worker::start(spec, channels)
            .map_err(|e| PoolError::WorkerFatal(format!("Failed to spawn worker thread: {e}")))?;

        let exited = CancellationToken::new();
        state.workers.insert(
            id,
            WorkerSlot {
                state: WorkerState::Initializing,
                ready: false,
                inbox: inbox_tx,
                terminate,
                exited: exited.clone(),
            },
        );
        self.runtime.spawn(listen(self.this.clone(), id, outbox_rx, exited));
        debug!(worker = id, threads = state.workers.len(), "spawned worker");
        Ok(())
    }

    fn handle_envelope(&self, id: WorkerId, envelope: Envelope) {
        let mut state = self.state.lock();
        if !state.workers.get(&id).is_some_and(|slot| slot.state != WorkerState::Gone) {
            return;
        }
        match envelope {
            Envelope::Message(message) => self.on_message(&mut state, id, message),
            Envelope::Error(message) => {
                self.on_error(&mut state, id, PoolError::WorkerFatal(message))
            }
            Envelope::Exit => self.on_exit(&mut state, id),
        }
        self.sync_online(&mut state);
    }

    fn handle_exit(&self, id: WorkerId) {
        let mut state = self.state.lock();
        self.on_exit(&mut state, id);
        self.sync_online(&mut state);
    }

    fn on_message(&self, state: &mut State, id: WorkerId, message: Message) {
        trace!(worker = id, opcode = %message.opcode(), "inbound");
        match message {
            Message::Ready => {
                match state.workers.get_mut(&id) {
                    Some(slot) if !slot.ready => slot.ready = true,
                    _ => return,
                }
                debug!(worker = id, "worker ready");
                self.standby(state, id);
            }
            Message::Response { result } => {
                let result = result.map_err(PoolError::Task);
                if result.is_ok() && self.drain_stream(state, id) {
                    return;
                }
                if self.respond(state, id, result) {
                    self.standby(state, id);
                }
            }
            Message::GeneratorStart => {
                if let Some(job) = state.assigned.get_mut(&id) {
                    job.start_stream();
                }
            }
            Message::GeneratorYield { value } => {
                if let Some(stream) = state.assigned.get(&id).and_then(|job| job.stream.as_ref()) {
                    stream.yield_value(value);
                }
            }
            Message::CallbackCall { call_id, index, args } => {
                self.run_callback(state, id, call_id, index, args)
            }
            other => {
                let opcode = other.opcode();
                warn!(worker = id, %opcode, "unexpected message from worker");
                let message = format!("Unexpected {opcode} message from worker");
                let err = PoolError::WorkerFatal(message);
                self.on_error(state, id, err);
            }
        }
    }

    /// Runs a caller-side callable for the worker and answers with
    /// `CALLBACK_RESULT`, failure included.
    fn run_callback(
        &self,
        state: &State,
        id: WorkerId,
        call_id: u64,
        index: usize,
        args: Vec<Value>,
    ) {
        let Some(inbox) = state.workers.get(&id).map(|slot| slot.inbox.clone()) else {
            return;
        };
        let callback = state.assigned.get(&id).and_then(|job| job.callback(index));
        trace!(worker = id, call_id, index, "running callback");

        self.runtime.spawn(async move {
            let result = match callback {
                Some(callback) => match AssertUnwindSafe(callback.call(args)).catch_unwind().await {
                    Ok(result) => result.and_then(|value| marshal_one(value, &[])),
                    Err(payload) => Err(Exception::new(panic_message(payload.as_ref()))),
                },
                None => Err(Exception::new(format!("No callback at argument {index}"))),
            };
            if inbox.send(Message::CallbackResult { call_id, result }).is_err() {
                debug!(worker = id, call_id, "worker gone before callback result");
            }
        });
    }

    /// Ends the stream of the worker's job. True when the consumer still has
    /// values to pull: the job then stays pending, and the worker busy, until
    /// the stream is drained or dropped.
    fn drain_stream(&self, state: &mut State, id: WorkerId) -> bool {
        let Some(job) = state.assigned.get_mut(&id) else {
            return false;
        };
        let finished = match job.stream.as_ref() {
            Some(stream) => {
                stream.resolve();
                if stream.is_done() {
                    return false;
                }
                stream.finished()
            }
            None => return false,
        };

        let pool = self.this.clone();
        let job_id = job.id;
        trace!(worker = id, job = job_id, "stream draining");
        job.drain = Some(self.runtime.spawn(async move {
            finished.cancelled().await;
            if let Some(pool) = pool.upgrade() {
                pool.drained(id, job_id);
            }
        }));
        true
    }

    fn drained(&self, id: WorkerId, job_id: JobId) {
        let mut state = self.state.lock();
        if !state.assigned.get(&id).is_some_and(|job| job.id == job_id) {
            return;
        }
        if let Some(mut job) = state.assigned.remove(&id) {
            // detach rather than abort the task running this
            job.drain.take();
            job.settle(Ok(Value::Null));
        }
        trace!(worker = id, job = job_id, "stream drained");
        self.standby(&mut state, id);
        self.sync_online(&mut state);
    }

    /// Settles the worker's assigned job. False when it had none.
    fn respond(&self, state: &mut State, id: WorkerId, result: PoolResult<Value>) -> bool {
        match state.assigned.remove(&id) {
            Some(job) => {
                job.settle(result);
                true
            }
            None => false,
        }
    }

    fn standby(&self, state: &mut State, id: WorkerId) {
        match state.queue.shift() {
            Some(job) => self.assign(state, id, job),
            None => {
                if let Some(slot) = state.workers.get_mut(&id) {
                    slot.state = WorkerState::Idle;
                    state.idle.push(id);
                }
            }
        }
    }

    fn assign(&self, state: &mut State, id: WorkerId, mut job: Job) {
        let Some(slot) = state.workers.get_mut(&id) else {
            state.queue.push(job);
            return;
        };
        slot.state = WorkerState::Busy;
        if let Some(request) = job.outbound.take() {
            trace!(worker = id, job = job.id, "sending request");
            if slot.inbox.send(request).is_err() {
                debug!(worker = id, "worker inbox closed, exit will settle the job");
            }
        }
        state.assigned.insert(id, job);
    }

    fn on_error(&self, state: &mut State, id: WorkerId, err: PoolError) {
        let ready = match state.workers.get_mut(&id) {
            Some(slot) if slot.state != WorkerState::Gone => {
                slot.state = WorkerState::Gone;
                slot.terminate.cancel();
                slot.ready
            }
            _ => return,
        };
        state.idle.retain(|worker| *worker != id);
        debug!(worker = id, error = %err, "terminating worker");

        if !self.respond(state, id, Err(err.clone())) {
            self.fatal(state, err, ready);
        }
    }

    fn on_exit(&self, state: &mut State, id: WorkerId) {
        let Some(slot) = state.workers.remove(&id) else {
            return;
        };
        state.idle.retain(|worker| *worker != id);
        let errored = slot.state == WorkerState::Gone;
        debug!(worker = id, errored, "worker exited");

        if !slot.ready {
            if !errored {
                let err = PoolError::WorkerFatal("Worker thread exited while starting up".into());
                self.fatal(state, err, false);
            }
            return;
        }
        if !errored {
            warn!(worker = id, "worker exited prematurely");
            let err = PoolError::WorkerFatal("Worker thread exited prematurely".into());
            self.respond(state, id, Err(err));
        }
        self.spawn_as_needed(state);
    }

    /// Reports a failure no job can carry. Destroys the pool unless
    /// `keep_workers`.
    fn fatal(&self, state: &mut State, err: PoolError, keep_workers: bool) {
        if state.destroyed {
            return;
        }
        error!(error = %err, keep_workers, "thread pool error");
        if !keep_workers {
            self.destroy_locked(state, Some(err.clone()));
        }
        let _ = self.events.send(PoolEvent::Error(err));
    }

    /// Gives the caller a scheduling turn to subscribe before the error fires.
    fn defer_fatal(&self, err: PoolError) {
        let pool = self.this.clone();
        self.runtime.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(pool) = pool.upgrade() {
                let mut state = pool.state.lock();
                pool.fatal(&mut state, err, false);
                pool.sync_online(&mut state);
            }
        });
    }

    fn destroy_locked(&self, state: &mut State, error: Option<PoolError>) {
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.min_threads = 0;
        state.max_threads = 0;
        debug!(threads = state.workers.len(), queued = state.queue.len(), "destroying thread pool");

        let error = error.unwrap_or_else(PoolError::destroyed);
        let ids: Vec<WorkerId> = state.workers.keys().copied().collect();
        for id in ids {
            self.on_error(state, id, error.clone());
        }
        while let Some(job) = state.queue.shift() {
            job.settle(Err(error.clone()));
        }
    }

    fn observe_abort(&self, job: JobId, signal: CancellationToken) -> JoinHandle<()> {
        let pool = self.this.clone();
        self.runtime.spawn(async move {
            signal.cancelled().await;
            if let Some(pool) = pool.upgrade() {
                pool.abort(job);
            }
        })
    }

    fn abort(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let queued = state.queue.take_where(|job| job.id == job_id);
        match queued {
            Some(job) => {
                debug!(job = job_id, "aborting queued task");
                job.settle(Err(PoolError::aborted()));
            }
            None => {
                let running = state
                    .assigned
                    .iter()
                    .find(|(_, job)| job.id == job_id)
                    .map(|(worker, _)| *worker);
                if let Some(worker) = running {
                    debug!(job = job_id, worker, "aborting running task");
                    self.on_error(&mut state, worker, PoolError::aborted());
                }
            }
        }
        self.sync_online(&mut state);
    }

    fn sync_online(&self, state: &mut State) {
        let online = state.online();
        if online != state.online {
            state.online = online;
            let _ = self.events.send(PoolEvent::Online(online));
        }
    }
}

impl Drop for ThreadPoolInner {
    fn drop(&mut self) {
        for slot in self.state.get_mut().workers.values() {
            slot.terminate.cancel();
        }
    }
}

/// Pulls top-level callables out of `args`; they stay with the job and only
/// their positions are sent.
fn extract_callbacks(args: Vec<Value>) -> (Vec<Value>, Vec<(usize, Callback)>) {
    let mut callbacks = Vec::new();
    let args = args
        .into_iter()
        .enumerate()
        .map(|(index, arg)| match arg {
            Value::Function(callback) => {
                callbacks.push((index, callback));
                Value::Null
            }
            other => other,
        })
        .collect();
    (args, callbacks)
}

async fn listen(
    pool: Weak<ThreadPoolInner>,
    id: WorkerId,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    exited: CancellationToken,
) {
    loop {
        match outbox.recv().await {
            Some(Envelope::Exit) | None => {
                if let Some(pool) = pool.upgrade() {
                    pool.handle_exit(id);
                }
                break;
            }
            Some(envelope) => match pool.upgrade() {
                Some(pool) => pool.handle_envelope(id, envelope),
                None => break,
            },
        }
    }
    exited.cancel();
}
