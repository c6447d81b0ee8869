//! Temporary garbage-collection leases.
//!
//! A lease is advisory: it never blocks readers, it only keeps the
//! garbage collector away from content a resolution is still touching.
//! Every resolution acquires one short-lived lease up front, registers
//! each blob it writes or depends on, and releases it when the chain is
//! materialized or the attempt fails. Leases expire on their own, so a
//! crashed resolution cannot pin content forever.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A time-bounded protection token covering content digests.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Lease identifier.
    pub id: String,
}

/// Creates, extends, and releases garbage-collection leases.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Creates a temporary lease with the given expiration.
    async fn create(&self, ttl: Duration) -> Result<Lease>;

    /// Registers a digest as protected by a lease. Registering the same
    /// digest twice against the same lease is a no-op.
    async fn add_resource(&self, lease_id: &str, digest: &str) -> Result<()>;

    /// Releases a lease, unprotecting its resources.
    async fn release(&self, lease_id: &str) -> Result<()>;
}

/// Scoped handle over one temporary lease.
///
/// Release is idempotent and best-effort: a second call is a no-op, and
/// a manager failure is logged rather than surfaced, so cleanup never
/// masks the error that triggered it.
pub struct LeaseGuard {
    manager: Arc<dyn LeaseManager>,
    lease: Lease,
    released: AtomicBool,
}

impl LeaseGuard {
    /// Acquires a temporary lease with the given expiration.
    pub async fn acquire(manager: &Arc<dyn LeaseManager>, ttl: Duration) -> Result<Self> {
        let lease = manager.create(ttl).await?;
        debug!("acquired temporary lease {}", lease.id);
        Ok(Self {
            manager: Arc::clone(manager),
            lease,
            released: AtomicBool::new(false),
        })
    }

    /// The underlying lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Registers a digest against this lease.
    pub async fn add_resource(&self, digest: &str) -> Result<()> {
        self.manager.add_resource(&self.lease.id, digest).await
    }

    /// Releases the lease. Safe to call more than once.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.manager.release(&self.lease.id).await {
            warn!("failed to release lease {}: {}", self.lease.id, e);
        } else {
            debug!("released temporary lease {}", self.lease.id);
        }
    }
}

struct LeaseRecord {
    expires_at: Instant,
    resources: HashSet<String>,
}

/// In-memory lease manager with TTL expiry.
///
/// Suitable for embedding alongside [`crate::content::BlobStore`]: feed
/// [`MemoryLeaseManager::protected`] into [`crate::content::BlobStore::gc`]
/// as the referenced set.
#[derive(Default)]
pub struct MemoryLeaseManager {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lease with a caller-chosen id, such as one owned by a
    /// cache ref whose lease id equals the ref id.
    pub fn create_with_id(&self, id: &str, ttl: Duration) -> Lease {
        let record = LeaseRecord {
            expires_at: Instant::now() + ttl,
            resources: HashSet::new(),
        };
        self.leases
            .lock()
            .expect("lease table poisoned")
            .insert(id.to_string(), record);
        Lease { id: id.to_string() }
    }

    /// Digests currently protected by unexpired leases.
    pub fn protected(&self) -> Vec<String> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        let now = Instant::now();
        leases.retain(|_, record| record.expires_at > now);

        let mut out: HashSet<String> = HashSet::new();
        for record in leases.values() {
            out.extend(record.resources.iter().cloned());
        }
        out.into_iter().collect()
    }
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn create(&self, ttl: Duration) -> Result<Lease> {
        let id = format!("lease-{}", uuid::Uuid::now_v7());
        let record = LeaseRecord {
            expires_at: Instant::now() + ttl,
            resources: HashSet::new(),
        };
        self.leases
            .lock()
            .expect("lease table poisoned")
            .insert(id.clone(), record);
        Ok(Lease { id })
    }

    async fn add_resource(&self, lease_id: &str, digest: &str) -> Result<()> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        let record = leases
            .get_mut(lease_id)
            .ok_or_else(|| Error::LeaseFailed(format!("no such lease: {}", lease_id)))?;
        record.resources.insert(digest.to_string());
        Ok(())
    }

    async fn release(&self, lease_id: &str) -> Result<()> {
        self.leases
            .lock()
            .expect("lease table poisoned")
            .remove(lease_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn protected_tracks_registered_resources() {
        let manager = MemoryLeaseManager::new();
        let lease = manager.create(Duration::from_secs(60)).await.unwrap();

        manager.add_resource(&lease.id, "sha256:aa").await.unwrap();
        manager.add_resource(&lease.id, "sha256:bb").await.unwrap();
        // Duplicate registration is a no-op.
        manager.add_resource(&lease.id, "sha256:aa").await.unwrap();

        let mut protected = manager.protected();
        protected.sort();
        assert_eq!(protected, vec!["sha256:aa", "sha256:bb"]);
    }

    #[tokio::test]
    async fn expired_lease_protects_nothing() {
        let manager = MemoryLeaseManager::new();
        let lease = manager.create(Duration::from_secs(0)).await.unwrap();
        manager.add_resource(&lease.id, "sha256:aa").await.unwrap();

        assert!(manager.protected().is_empty());
    }

    #[tokio::test]
    async fn add_resource_to_unknown_lease_fails() {
        let manager = MemoryLeaseManager::new();
        assert!(manager.add_resource("lease-nope", "sha256:aa").await.is_err());
    }

    #[tokio::test]
    async fn guard_release_is_idempotent() {
        let manager: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());
        let guard = LeaseGuard::acquire(&manager, Duration::from_secs(60))
            .await
            .unwrap();
        guard.add_resource("sha256:aa").await.unwrap();

        guard.release().await;
        guard.release().await;

        // The lease is gone; registering against it now fails.
        assert!(manager
            .add_resource(guard.lease().id.as_str(), "sha256:bb")
            .await
            .is_err());
    }
}
