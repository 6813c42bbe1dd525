use async_trait::async_trait;
use std::time::Duration;

/// A resource whose responsiveness can be probed by acquiring its lock.
#[async_trait]
pub trait Lockable: Send + Sync {
    /// Acquire and immediately release the lock, giving up after `bound`.
    ///
    /// Returns `true` if the lock was obtained in time.
    async fn try_lock_within(&self, bound: Duration) -> bool;
}
