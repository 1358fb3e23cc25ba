mod common;

#[cfg(test)]
mod tests {
    use super::common::{self, measure, value};
    use async_offload::{PoolConfig, PoolError, ThreadPoolInner, Value};
    use futures::future::join_all;
    use std::time::Duration;

    #[tokio::test]
    async fn load_test_1_fifo_single_worker() {
        println!("\n=== LOAD TEST 1: 200 calls on a single worker ===");
        let pool = common::pool(1, 1);

        let handles: Vec<_> = (0..200).map(|_| pool.call("ticket", vec![])).collect();
        assert_eq!(pool.pending_task_count(), 200);
        let tickets = measure("200 tickets", join_all(handles)).await;

        let tickets: Vec<f64> = tickets
            .into_iter()
            .map(|reply| value(reply.unwrap()).as_f64().unwrap())
            .collect();
        assert!(tickets.windows(2).all(|w| w[0] < w[1]), "dispatched in submission order");
        assert_eq!(pool.pending_task_count(), 0);
        pool.destroy().await;
        println!("  ✓ Strictly increasing tickets");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_2_many_small_calls() {
        println!("\n=== LOAD TEST 2: 2k small calls ===");
        let config = PoolConfig::cpu_bound(common::WORKER_FILE).loader(common::worker_loader());
        let pool = ThreadPoolInner::with_config(config).unwrap();

        let handles: Vec<_> = (0..2_000)
            .map(|i| pool.call("add", vec![i.into(), 1.into()]))
            .collect();
        let results = measure("2k add calls", join_all(handles)).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(value(result.unwrap()), Value::from(i + 1));
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.pending_tasks, 0);
        println!(
            "  Threads: {}, utilization now: {:.1}%",
            metrics.thread_count,
            metrics.utilization() * 100.0
        );
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_3_counters_under_load() {
        println!("\n=== LOAD TEST 3: Counters under load ===");
        let pool = common::pool(0, 4);

        let handles: Vec<_> = (0..64).map(|i| pool.call("sleep", vec![(i % 5).into()])).collect();
        let watcher = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let m = pool.metrics();
                    assert_eq!(m.pending_tasks, m.active_threads + m.queued_tasks);
                    assert!(m.active_threads <= m.online_threads);
                    assert!(m.thread_count <= 4);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let results = measure("64 sleeps on 4 workers", join_all(handles)).await;
        watcher.await.unwrap();
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(pool.pending_task_count(), 0);
        pool.destroy().await;
        println!("  ✓ pending == active + queued throughout");
    }

    #[tokio::test]
    async fn load_test_4_burst_scaling() {
        println!("\n=== LOAD TEST 4: Burst grows to max_threads ===");
        let pool = common::pool(0, 4);

        let handles: Vec<_> = (0..8).map(|_| pool.call("sleep", vec![50.into()])).collect();
        assert_eq!(pool.thread_count(), 4, "one worker per queued call, capped");

        let results = measure("8 sleeps @ 50ms", join_all(handles)).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(pool.thread_count(), 4, "min_threads 0 keeps idle workers");
        pool.destroy().await;
        assert_eq!(pool.thread_count(), 0);
        println!("  ✓ Capped at 4, none left after destroy");
    }

    #[tokio::test]
    async fn load_test_5_destroy_under_load() {
        println!("\n=== LOAD TEST 5: Destroy with 500 pending calls ===");
        let pool = common::pool(2, 2);

        let handles: Vec<_> = (0..500).map(|_| pool.call("sleep", vec![10.into()])).collect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.destroy().await;

        let results = join_all(handles).await;
        let destroyed = results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::Destroyed(_))))
            .count();
        let completed = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(destroyed + completed, 500, "every call settles once");
        assert!(destroyed > 0);
        println!("  Completed: {completed}, rejected: {destroyed}");
    }
}
