//! Worker 池集成测试：有界并发与排队

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::join_all;
    use geoexec::capability::OperatingMode;
    use geoexec::config::PoolConfig;
    use geoexec::pool::{Task, WorkerPool};
    use geoexec::substrate::{MockSubstrate, Operation, SubstrateWorkerFactory};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn box_task(i: usize) -> Task {
        Task::new(
            Operation::new("MAKE_BOX", json!({"width": i + 1, "height": 1, "depth": 1})),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_six_tasks_on_two_to_four_workers() {
        let substrate = Arc::new(MockSubstrate::new().with_delay(Duration::from_millis(50)));
        let factory = Arc::new(SubstrateWorkerFactory::new(substrate.clone()));
        let pool = WorkerPool::new(
            PoolConfig::default(),
            2,
            4,
            OperatingMode::SingleThreadedSafe,
            factory.clone(),
            CancellationToken::new(),
        );
        pool.initialize().await.unwrap();
        assert_eq!(factory.spawned(), 2);

        let results = join_all((0..6).map(|i| {
            let pool = Arc::clone(&pool);
            async move { pool.execute(box_task(i)).await }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(factory.spawned(), 4);
        assert!(substrate.peak_in_flight() <= 4);

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 4);
        assert_eq!(stats.peak_queue_depth, 2);
        assert_eq!(stats.tasks_completed, 6);
        assert_eq!(stats.queued_tasks, 0);

        pool.shutdown().await;
        assert_eq!(pool.stats().total_workers, 0);
    }

    #[tokio::test]
    async fn test_failing_worker_does_not_block_others() {
        let substrate = Arc::new(MockSubstrate::new());
        let factory = Arc::new(SubstrateWorkerFactory::new(substrate.clone()));
        let pool = WorkerPool::new(
            PoolConfig::default(),
            2,
            2,
            OperatingMode::SingleThreadedSafe,
            factory,
            CancellationToken::new(),
        );
        pool.initialize().await.unwrap();

        substrate.fail_next(3, "kernel fault");
        for i in 0..3 {
            assert!(pool.execute(box_task(i)).await.is_err());
        }
        // 第一个 worker 连续失败 3 次后熔断，后续任务落到另一个 worker
        assert!(pool.execute(box_task(3)).await.is_ok());
        let stats = pool.stats();
        assert_eq!(stats.tasks_failed, 3);
        assert_eq!(stats.tripped_workers, 1);
        pool.shutdown().await;
    }
}
