//! Per-connection admission of request memory.

use tokio::sync::Semaphore;

use driftrpc_common::error::{Result, RpcError};
use driftrpc_common::limits::ResourceLimits;

/// Tracks the remaining memory budget of one connection.
///
/// The read path acquires a request's estimated weight before dispatching
/// and the reply path returns it after the reply frame has been handed to
/// the writer, so acquires and releases balance exactly over the connection
/// lifetime. A weight larger than the whole budget is clamped to it, so an
/// oversized request waits for an idle connection instead of forever.
pub struct ConnectionResources {
    semaphore: Semaphore,
    max_memory: usize,
}

impl ConnectionResources {
    pub fn new(limits: ResourceLimits) -> Self {
        let max_memory = limits.max_memory.min(Semaphore::MAX_PERMITS);
        Self { semaphore: Semaphore::new(max_memory), max_memory }
    }

    fn clamp(&self, weight: usize) -> u32 {
        weight.min(self.max_memory).min(u32::MAX as usize) as u32
    }

    /// Suspends until `weight` bytes are available, then deducts them.
    pub async fn wait_for(&self, weight: usize) -> Result<()> {
        let permits = self.clamp(weight);
        let permit = self
            .semaphore
            .acquire_many(permits)
            .await
            .map_err(|_| RpcError::Closed)?;
        permit.forget();
        Ok(())
    }

    /// Returns a previously acquired weight to the budget.
    pub fn release(&self, weight: usize) {
        self.semaphore.add_permits(self.clamp(weight) as usize);
    }

    /// Bytes currently available for new requests.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize) -> ResourceLimits {
        ResourceLimits::new().with_max_memory(max)
    }

    #[tokio::test]
    async fn test_acquire_and_release_balance() {
        let resources = ConnectionResources::new(limits(1000));
        resources.wait_for(600).await.unwrap();
        assert_eq!(resources.available(), 400);
        resources.wait_for(400).await.unwrap();
        assert_eq!(resources.available(), 0);
        resources.release(600);
        resources.release(400);
        assert_eq!(resources.available(), 1000);
    }

    #[tokio::test]
    async fn test_admission_blocks_until_release() {
        use std::sync::Arc;

        let resources = Arc::new(ConnectionResources::new(limits(100)));
        resources.wait_for(100).await.unwrap();

        let waiter = {
            let resources = resources.clone();
            tokio::spawn(async move { resources.wait_for(50).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        resources.release(100);
        waiter.await.unwrap().unwrap();
        assert_eq!(resources.available(), 50);
    }

    #[tokio::test]
    async fn test_oversized_weight_is_clamped_to_budget() {
        let resources = ConnectionResources::new(limits(100));
        resources.wait_for(10_000).await.unwrap();
        assert_eq!(resources.available(), 0);
        resources.release(10_000);
        assert_eq!(resources.available(), 100);
    }
}
