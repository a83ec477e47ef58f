//! In-process lease lock
//!
//! Used when a single monitor instance runs without a platform lock service,
//! and by tests. Handles created with [`InMemoryLeaseLock::handle_for`] share
//! the same lease table, which models several schedulers competing for it.

use super::LeaseLock;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Lease lock backed by a shared in-memory table
#[derive(Clone)]
pub struct InMemoryLeaseLock {
    owner: String,
    leases: Arc<DashMap<String, Lease>>,
}

impl InMemoryLeaseLock {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            leases: Arc::new(DashMap::new()),
        }
    }

    /// Another holder identity over the same lease table
    pub fn handle_for(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            leases: Arc::clone(&self.leases),
        }
    }

    /// Drop a lease regardless of owner, as if it had expired
    pub fn expire(&self, name: &str) {
        self.leases.remove(name);
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self.leases.entry(name.to_string()).or_insert_with(|| Lease {
            owner: self.owner.clone(),
            expires_at: now,
        });

        let lease_entry = entry.value_mut();
        if lease_entry.owner != self.owner && lease_entry.expires_at > now {
            debug!(lock = %name, holder = %lease_entry.owner, "Lease held by another instance");
            return Ok(false);
        }

        lease_entry.owner = self.owner.clone();
        lease_entry.expires_at = now + lease;
        Ok(true)
    }

    async fn is_held(&self, name: &str) -> Result<bool> {
        Ok(self
            .leases
            .get(name)
            .map(|l| l.owner == self.owner && l.expires_at > Instant::now())
            .unwrap_or(false))
    }

    async fn release(&self, name: &str) -> Result<()> {
        self.leases.remove_if(name, |_, l| l.owner == self.owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn test_second_owner_blocked_until_release() {
        let first = InMemoryLeaseLock::new("a");
        let second = first.handle_for("b");

        assert!(first.try_acquire("monitor", LEASE).await.unwrap());
        assert!(!second.try_acquire("monitor", LEASE).await.unwrap());
        assert!(first.is_held("monitor").await.unwrap());
        assert!(!second.is_held("monitor").await.unwrap());

        first.release("monitor").await.unwrap();
        assert!(second.try_acquire("monitor", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let first = InMemoryLeaseLock::new("a");
        let second = first.handle_for("b");

        assert!(first
            .try_acquire("monitor", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!first.is_held("monitor").await.unwrap());
        assert!(second.try_acquire("monitor", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_ignored() {
        let first = InMemoryLeaseLock::new("a");
        let second = first.handle_for("b");

        assert!(first.try_acquire("monitor", LEASE).await.unwrap());
        second.release("monitor").await.unwrap();
        assert!(first.is_held("monitor").await.unwrap());
    }
}
