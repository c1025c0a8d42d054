//! Background sweeper complementing the lazy eviction of the cache, dedup
//! guard and pool.
//!
//! Lazy eviction alone lets stale entries pile up between reads; the sweeper
//! purges all three stores on its own schedule so memory stays bounded even
//! when traffic goes quiet. Shutdown is cooperative through a watch channel.

use crate::cache::TtlCache;
use crate::dedup::DedupGuard;
use crate::pool::HandlePool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    /// Abort without waiting; for teardown paths that cannot await.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn a task purging expired entries from all three stores every
/// `interval`. Requires a tokio runtime.
pub fn spawn<V, H>(
    cache: TtlCache<V>,
    dedup: DedupGuard<V>,
    pool: HandlePool<H>,
    interval: Duration,
) -> SweeperHandle
where
    V: Clone + Send + 'static,
    H: Clone + Send + 'static,
{
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        tracing::debug!(?interval, "sweeper started");
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    let cache_removed = cache.purge_expired();
                    let dedup_removed = dedup.purge_expired();
                    let pool_removed = pool.purge_idle();
                    if cache_removed + dedup_removed + pool_removed > 0 {
                        tracing::debug!(
                            cache_removed,
                            dedup_removed,
                            pool_removed,
                            "sweeper reclaimed expired entries"
                        );
                    }
                }
            }
        }
        tracing::debug!("sweeper stopped");
    });
    SweeperHandle { stop, task }
}
