//! Bounds how many runs may execute in parallel, independent of isolate pool
//! occupancy (spec §5: "independent parallel runs across isolates up to pool
//! capacity").

use futures::Future;

use crate::metrics;

/// Limits how many isolate executions can be actively running at the same
/// time, to avoid oversubscribing host CPU. `async-channel` is a linked list
/// under the hood, so a permit costs a constant amount of memory regardless
/// of `max_concurrency`.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        assert!(
            max_concurrency > 0,
            "max_concurrency must be greater than zero"
        );
        let (tx, rx) = async_channel::bounded(max_concurrency);
        Self { tx, rx }
    }

    pub fn unlimited() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    pub async fn acquire(&self) -> ConcurrencyPermit {
        let timer = metrics::concurrency_permit_acquire_timer();
        self.tx
            .send(())
            .await
            .expect("concurrency limiter channel closed while a receiver is held");
        timer.observe();
        ConcurrencyPermit {
            rx: self.rx.clone(),
            limiter: self.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        self.tx.try_send(()).ok()?;
        Some(ConcurrencyPermit {
            rx: self.rx.clone(),
            limiter: self.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ConcurrencyPermit {
    rx: async_channel::Receiver<()>,
    limiter: ConcurrencyLimiter,
}

impl ConcurrencyPermit {
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.rx
            .try_recv()
            .expect("concurrency permit token missing on drop");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{select_biased, FutureExt};

    use super::ConcurrencyLimiter;

    #[tokio::test]
    async fn limiter_blocks_past_capacity_and_recovers_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;

        assert!(limiter.try_acquire().is_none());

        drop(p1);
        let p3 = limiter.acquire().await;

        assert!(limiter.try_acquire().is_none());
        drop(p2);
        drop(p3);

        let result = select_biased! {
            _permit = limiter.acquire().fuse() => true,
            _ = tokio::time::sleep(Duration::from_millis(50)).fuse() => false,
        };
        assert!(result);
    }
}
