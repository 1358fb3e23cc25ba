#![allow(dead_code)]

use async_offload::{
    move_value, worker, ArrayBuffer, Callback, Exception, Export, FnLoader, Module, ModuleLoader,
    PoolConfig, PoolError, PoolEvent, Reply, ThreadPool, ThreadPoolInner, Value,
};
use futures::{
    future::{try_join_all, BoxFuture, FutureExt},
    stream,
};
use std::{
    cell::Cell,
    future::Future,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::broadcast;

pub const WORKER_FILE: &str = "/tests/worker.so";

static CALL_LATER: Mutex<Option<Exception>> = Mutex::new(None);
static SET_LATER: Mutex<Option<Value>> = Mutex::new(None);

thread_local! {
    static TICKETS: Cell<u64> = const { Cell::new(0) };
}

pub fn num(args: &[Value], index: usize) -> f64 {
    args.get(index).and_then(Value::as_f64).unwrap_or(0.0)
}

pub fn millis(args: &[Value], index: usize) -> Duration {
    Duration::from_millis(num(args, index) as u64)
}

pub fn text(args: &[Value], index: usize) -> String {
    args.get(index).and_then(Value::as_str).unwrap_or_default().to_owned()
}

pub fn callback(args: &[Value], index: usize) -> Result<Callback, Exception> {
    args.get(index)
        .and_then(Value::as_function)
        .cloned()
        .ok_or_else(|| Exception::new(format!("argument {index} must be a function")))
}

/// Methods every test pool serves.
pub fn worker_module() -> Module {
    Module::new()
        .method("echo", |args| Ok(Value::Array(args)))
        .method("add", |args| Ok(Value::from(num(&args, 0) + num(&args, 1))))
        .method("worker_data", |_| Ok(worker::worker_data()))
        .method("whoami", |_| Ok(Value::from(worker::worker_id())))
        .method("ticket", |_| {
            Ok(Value::from(TICKETS.with(|t| {
                t.set(t.get() + 1);
                t.get()
            })))
        })
        .async_method("concat_async", |args| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut out = Vec::new();
            for arg in &args {
                if let Some(buffer) = arg.as_buffer() {
                    out.extend(buffer.to_vec());
                }
            }
            Ok(Value::from(ArrayBuffer::new(out)))
        })
        .async_method("sleep", |args| async move {
            tokio::time::sleep(millis(&args, 0)).await;
            Ok(Value::Null)
        })
        .method("fail", |args| Err::<Value, _>(Exception::new(text(&args, 0))))
        .async_method("fail_async", |args| async move {
            tokio::task::yield_now().await;
            Err::<Value, _>(Exception::new(text(&args, 0)))
        })
        .method("exit", |_| {
            worker::exit();
            Ok(Value::Null)
        })
        .method("panic", |args| -> Result<Value, Exception> { panic!("{}", text(&args, 0)) })
        .async_method("uncaught_exception", |args| async move {
            let message = text(&args, 0);
            worker::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let outcome: Result<(), Exception> = Ok(());
                if !message.is_empty() {
                    panic!("{message}");
                }
                outcome
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        })
        .async_method("unhandled_rejection", |args| async move {
            let message = text(&args, 0);
            worker::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(Exception::new(message))
            });
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        })
        .async_method("detached_panic", |args| async move {
            let message = text(&args, 0);
            tokio::spawn(async move {
                if !message.is_empty() {
                    panic!("{message}");
                }
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::from("survived"))
        })
        .method("fail_later", |args| {
            let message = text(&args, 0);
            worker::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<(), _>(Exception::new(message))
            });
            Ok(Value::Null)
        })
        .method("is_worker", |_| Ok(Value::from(worker::is_worker())))
        .method("move_buffer", |args| {
            let buffer = args
                .first()
                .and_then(Value::as_buffer)
                .cloned()
                .ok_or_else(|| Exception::new("expected a buffer"))?;
            Ok(move_value(buffer.clone(), [buffer]))
        })
        .method("make_buffer", |args| {
            let buffer = ArrayBuffer::zeroed(num(&args, 0) as usize);
            Ok(move_value(buffer.clone(), [buffer]))
        })
        .method("return_function", |_| Ok(Value::sync_function(|_| Ok(Value::Null))))
        .generator("generate", |_| {
            stream::iter(["foo", "bar", "baz"].map(|word| Ok::<_, Exception>(Value::from(word))))
        })
        .generator("generate_slowly", |args| {
            let delay = millis(&args, 0);
            stream::unfold(0usize, move |i| async move {
                tokio::time::sleep(delay).await;
                ["foo", "bar", "baz"]
                    .get(i)
                    .map(|word| (Ok::<_, Exception>(Value::from(*word)), i + 1))
            })
        })
        .generator("generate_then_fail", |_| {
            stream::iter([
                Ok(Value::from("foo")),
                Err(Exception::new("generator failed")),
                Ok(Value::from("never")),
            ])
        })
        .async_method("map", |args| async move {
            let items = args.first().and_then(Value::as_array).cloned().unwrap_or_default();
            let f = callback(&args, 1)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                out.push(f.call(vec![item, Value::from(i)]).await?);
            }
            Ok(Value::Array(out))
        })
        .async_method("add_lazy", |args| async move {
            let mut sum = 0.0;
            for arg in args {
                sum += match arg {
                    Value::Function(f) => f.call(vec![]).await?.as_f64().unwrap_or(0.0),
                    other => other.as_f64().unwrap_or(0.0),
                };
            }
            Ok(Value::from(sum))
        })
        .async_method("expect_error", |args| async move {
            match callback(&args, 0)?.call(vec![]).await {
                Ok(value) => Ok(value),
                Err(err) => Ok(Value::from(err.message())),
            }
        })
        .async_method("call_many", |args| async move {
            let f = callback(&args, 0)?;
            let calls = (0..num(&args, 1) as usize).map(|i| f.call(vec![Value::from(i)]));
            Ok(Value::Array(try_join_all(calls).await?))
        })
        .method("call_later", |args| {
            if let Some(err) = CALL_LATER.lock().unwrap().take() {
                return Err(err);
            }
            let f = callback(&args, 0)?;
            worker::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if let Err(err) = f.call(vec![]).await {
                    *CALL_LATER.lock().unwrap() = Some(err);
                }
                Ok(())
            });
            Ok(Value::Null)
        })
        .method("set_later", |args| {
            let f = callback(&args, 0)?;
            let pending = f.call(vec![]);
            worker::spawn(async move {
                if let Ok(value) = pending.await {
                    *SET_LATER.lock().unwrap() = Some(value);
                }
                Ok(())
            });
            let previous = SET_LATER.lock().unwrap().take();
            Ok(previous.unwrap_or_else(|| args.get(1).cloned().unwrap_or_default()))
        })
}

pub fn worker_loader() -> Arc<dyn ModuleLoader> {
    Arc::new(FnLoader::new(|_: &Path| Ok(worker_module().into())))
}

pub fn config() -> PoolConfig {
    PoolConfig::new(WORKER_FILE).loader(worker_loader())
}

pub fn pool(min_threads: usize, max_threads: usize) -> ThreadPool {
    ThreadPoolInner::with_config(config().min_threads(min_threads).max_threads(max_threads))
        .expect("valid test configuration")
}

/// Loader whose module fails asynchronously, after a short delay.
pub struct SlowFailingLoader(pub &'static str);

impl ModuleLoader for SlowFailingLoader {
    fn load(&self, _filename: &Path) -> BoxFuture<'static, Result<Export, Exception>> {
        let message = self.0;
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Exception::new(message))
        }
        .boxed()
    }
}

/// Next `PoolEvent::Error`, skipping online notifications.
pub async fn next_error(events: &mut broadcast::Receiver<PoolEvent>) -> PoolError {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(PoolEvent::Error(err))) => return err,
            Ok(Ok(PoolEvent::Online(_))) => continue,
            other => panic!("expected an error event, got {other:?}"),
        }
    }
}

pub fn value(reply: Reply) -> Value {
    reply.into_value().expect("plain value reply")
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn measure<F, T>(name: &str, f: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    println!("  {} took {:?}", name, start.elapsed());
    result
}
