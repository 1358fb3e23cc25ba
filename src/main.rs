use async_offload::{module, Exception, Module, PoolConfig, ThreadPoolInner, Value};
use futures::future::join_all;
use std::time::Instant;
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;

const DEMO_MODULE: &str = "/demo/math";

fn number(args: &[Value], index: usize) -> Result<f64, Exception> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| Exception::new(format!("argument {index} must be a number")))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    module::register(DEMO_MODULE, || {
        Ok(Module::new()
            .method("add", |args| Ok(Value::from(number(&args, 0)? + number(&args, 1)?)))
            .async_method("square_later", |args| async move {
                tokio::task::yield_now().await;
                let n = number(&args, 0)?;
                Ok(Value::from(n * n))
            })
            .into())
    });

    let rt = Builder::new_multi_thread().worker_threads(4).enable_all().build()?;

    rt.block_on(async {
        let now = Instant::now();
        let pool = ThreadPoolInner::with_config(PoolConfig::on_demand(DEMO_MODULE))?;

        let calls = (0..100_000).map(|i| {
            let method = if i % 2 == 0 { "add" } else { "square_later" };
            pool.call(method, vec![i.into(), 1.into()])
        });
        let results = join_all(calls).await;
        let failed = results.iter().filter(|r| r.is_err()).count();

        let metrics = pool.metrics();
        pool.destroy().await;
        println!(
            "calls: {}, failed: {failed}, threads: {}, elapsed: {:?}",
            results.len(),
            metrics.thread_count,
            now.elapsed()
        );
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
