use crate::monitor::ResourceMonitor;
use async_trait::async_trait;
use conveyor_core::{ConveyorError, ConveyorResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, liveness-probes, and tears down worker handles (browser
/// instances in the source system). The pool treats workers as opaque.
#[async_trait]
pub trait WorkerFactory<W: Send + 'static>: Send + Sync {
    async fn create(&self) -> ConveyorResult<W>;
    /// Cheap liveness probe. `false` means the worker must be recycled.
    async fn probe(&self, worker: &mut W) -> bool;
    async fn destroy(&self, worker: W);
}

/// A worker checked out of the pool together with its capacity permit.
///
/// Must be returned via [`WorkerPool::release`] or [`WorkerPool::recycle`];
/// dropping it without returning leaks a permit until process exit.
pub struct PooledWorker<W: Send + 'static> {
    pub worker: W,
    permit: OwnedSemaphorePermit,
}

impl<W: Send + 'static> std::fmt::Debug for PooledWorker<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker").finish_non_exhaustive()
    }
}

/// Bounded pool of expensive, stateful worker handles.
///
/// `acquire` blocks callers up to a timeout when saturated instead of
/// spawning unboundedly; this is the primary backpressure mechanism
/// protecting host resources. Health is checked lazily on acquire and
/// eagerly by a background sweep.
pub struct WorkerPool<W: Send + 'static> {
    factory: Arc<dyn WorkerFactory<W>>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<W>>,
    max: AtomicUsize,
    /// Permits to swallow on release after a shrinking resize.
    pending_shrink: AtomicUsize,
    live: AtomicUsize,
}

impl<W: Send + 'static> WorkerPool<W> {
    pub fn new(factory: Arc<dyn WorkerFactory<W>>, max_workers: usize) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            idle: Mutex::new(Vec::new()),
            max: AtomicUsize::new(max_workers),
            pending_shrink: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Check a worker out of the pool, waiting up to `timeout` for capacity.
    ///
    /// Idle workers are liveness-probed before being handed out; unhealthy
    /// ones are destroyed and replaced transparently.
    pub async fn acquire(&self, timeout: Duration) -> ConveyorResult<PooledWorker<W>> {
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(ConveyorError::ShuttingDown),
                Err(_) => {
                    return Err(ConveyorError::ResourceExhausted(format!(
                        "no worker available within {timeout:?}"
                    )))
                }
            };

        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(mut worker) => {
                    if self.factory.probe(&mut worker).await {
                        return Ok(PooledWorker { worker, permit });
                    }
                    warn!("idle worker failed liveness probe, recycling");
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    self.factory.destroy(worker).await;
                }
                None => break,
            }
        }

        let worker = self.factory.create().await?;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(live = self.live.load(Ordering::SeqCst), "created worker");
        Ok(PooledWorker { worker, permit })
    }

    /// Return a healthy worker to the idle list and free its permit.
    pub async fn release(&self, pooled: PooledWorker<W>) {
        let PooledWorker { worker, permit } = pooled;
        if self.take_shrink_slot() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.factory.destroy(worker).await;
            permit.forget();
            return;
        }
        self.idle.lock().await.push(worker);
        drop(permit);
    }

    /// Discard a worker suspected unhealthy. The replacement is created
    /// lazily on the next acquire.
    pub async fn recycle(&self, pooled: PooledWorker<W>) {
        let PooledWorker { worker, permit } = pooled;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.factory.destroy(worker).await;
        if self.take_shrink_slot() {
            permit.forget();
        } else {
            drop(permit);
        }
    }

    /// Change the capacity ceiling. Growing takes effect immediately;
    /// shrinking defers to upcoming releases for permits already checked out.
    pub async fn resize(&self, new_max: usize) {
        let old = self.max.swap(new_max, Ordering::SeqCst);
        if new_max > old {
            self.semaphore.add_permits(new_max - old);
            return;
        }
        self.pending_shrink.fetch_add(old - new_max, Ordering::SeqCst);
        // Swallow whatever free capacity exists right now; the rest is
        // absorbed as in-flight workers come back.
        while self.pending_shrink.load(Ordering::SeqCst) > 0 {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    if self.take_shrink_slot() {
                        permit.forget();
                        if let Some(worker) = self.idle.lock().await.pop() {
                            self.live.fetch_sub(1, Ordering::SeqCst);
                            self.factory.destroy(worker).await;
                        }
                    } else {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// One autoscale step: resize the ceiling to what the monitor says the
    /// host can hold, clamped to `1..=ceiling`. The floor of one keeps the
    /// queue draining under emergency pressure, where admissions are
    /// already paused. Returns the applied capacity.
    pub async fn resize_to_safe(
        &self,
        monitor: &ResourceMonitor,
        per_worker_cost_pct: f64,
        ceiling: usize,
    ) -> usize {
        let safe = monitor.safe_worker_count(per_worker_cost_pct).await;
        let target = safe.clamp(1, ceiling.max(1));
        if target != self.capacity() {
            info!(target, safe, "resizing pool to fit resource headroom");
            self.resize(target).await;
        }
        target
    }

    /// Spawn the periodic autoscaler driving [`resize_to_safe`](Self::resize_to_safe).
    pub fn spawn_autoscaler(
        self: &Arc<Self>,
        monitor: Arc<ResourceMonitor>,
        per_worker_cost_pct: f64,
        ceiling: usize,
        interval: Duration,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.resize_to_safe(&monitor, per_worker_cost_pct, ceiling)
                    .await;
            }
        })
    }

    /// Destroy idle workers that fail their liveness probe. Called eagerly
    /// by the background sweep, in addition to the lazy probe on acquire.
    pub async fn sweep_idle(&self) {
        let workers: Vec<W> = {
            let mut idle = self.idle.lock().await;
            idle.drain(..).collect()
        };
        let mut healthy = Vec::with_capacity(workers.len());
        for mut worker in workers {
            if self.factory.probe(&mut worker).await {
                healthy.push(worker);
            } else {
                warn!("health sweep destroying unhealthy worker");
                self.live.fetch_sub(1, Ordering::SeqCst);
                self.factory.destroy(worker).await;
            }
        }
        self.idle.lock().await.extend(healthy);
    }

    /// Spawn the eager health sweep at the given interval.
    pub fn spawn_health_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        })
    }

    /// Release all idle workers and stop handing out permits.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let workers: Vec<W> = {
            let mut idle = self.idle.lock().await;
            idle.drain(..).collect()
        };
        for worker in workers {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.factory.destroy(worker).await;
        }
    }

    pub fn capacity(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    fn take_shrink_slot(&self) -> bool {
        let mut current = self.pending_shrink.load(Ordering::SeqCst);
        while current > 0 {
            match self.pending_shrink.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// A fake browser handle.
    struct FakeWorker {
        id: usize,
    }

    struct FakeFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        healthy: AtomicBool,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl WorkerFactory<FakeWorker> for FakeFactory {
        async fn create(&self) -> ConveyorResult<FakeWorker> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeWorker { id })
        }

        async fn probe(&self, _worker: &mut FakeWorker) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _worker: FakeWorker) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_worker() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory.clone() as Arc<dyn WorkerFactory<FakeWorker>>, 2);

        let first = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let first_id = first.worker.id;
        pool.release(first).await;

        let second = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.worker.id, first_id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_saturated() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory as Arc<dyn WorkerFactory<FakeWorker>>, 1);

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ConveyorError::ResourceExhausted(_)));

        pool.release(held).await;
        assert!(pool.acquire(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_idle_worker_recycled_on_acquire() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory.clone() as Arc<dyn WorkerFactory<FakeWorker>>, 1);

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.release(held).await;

        // Probe fails, worker destroyed, fresh one created in its place.
        factory.healthy.store(false, Ordering::SeqCst);
        let result = pool.acquire(Duration::from_millis(100)).await;
        assert!(result.is_ok());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recycle_discards_and_replaces_lazily() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory.clone() as Arc<dyn WorkerFactory<FakeWorker>>, 1);

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.recycle(held).await;
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let replacement = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        pool.release(replacement).await;
    }

    #[tokio::test]
    async fn test_resize_grow_unblocks_waiters() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory as Arc<dyn WorkerFactory<FakeWorker>>, 1);

        let _held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.resize(2).await;
        assert!(pool.acquire(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_resize_shrink_absorbs_free_capacity() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory as Arc<dyn WorkerFactory<FakeWorker>>, 2);

        pool.resize(1).await;
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        // Capacity is now one; a second acquire must time out.
        assert!(pool.acquire(Duration::from_millis(50)).await.is_err());
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_health_sweep_destroys_unhealthy_idle() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory.clone() as Arc<dyn WorkerFactory<FakeWorker>>, 2);

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.release(held).await;
        assert_eq!(pool.idle_count().await, 1);

        factory.healthy.store(false, Ordering::SeqCst);
        pool.sweep_idle().await;
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resize_to_safe_tracks_monitor() {
        use crate::monitor::{ResourceProbe, ResourceSample, ResourceThresholds};
        use chrono::Utc;

        struct StaticProbe {
            usage: f64,
        }

        impl ResourceProbe for StaticProbe {
            fn sample(&mut self) -> ConveyorResult<ResourceSample> {
                Ok(ResourceSample {
                    mem_used_pct: self.usage,
                    cpu_used_pct: self.usage,
                    taken_at: Utc::now(),
                })
            }
        }

        let monitor_at = |usage: f64| {
            ResourceMonitor::new(
                Box::new(StaticProbe { usage }),
                ResourceThresholds::default(),
            )
            .unwrap()
        };

        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory as Arc<dyn WorkerFactory<FakeWorker>>, 8);

        // Light load: (70 - 20) / 10 per worker leaves room for five.
        let applied = pool.resize_to_safe(&monitor_at(20.0), 10.0, 8).await;
        assert_eq!(applied, 5);
        assert_eq!(pool.capacity(), 5);

        // Saturated host: shrink to the floor of one, never zero.
        let applied = pool.resize_to_safe(&monitor_at(95.0), 10.0, 8).await;
        assert_eq!(applied, 1);
        assert_eq!(pool.capacity(), 1);

        // Recovery grows back, capped by the ceiling.
        let applied = pool.resize_to_safe(&monitor_at(0.0), 5.0, 8).await;
        assert_eq!(applied, 8);
        assert_eq!(pool.capacity(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let factory = Arc::new(FakeFactory::new());
        let pool = WorkerPool::new(factory.clone() as Arc<dyn WorkerFactory<FakeWorker>>, 1);

        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.release(held).await;

        pool.shutdown().await;
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ConveyorError::ShuttingDown));
    }
}
