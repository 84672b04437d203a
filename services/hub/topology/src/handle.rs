//! Shared ownership of the live network with change notification.

use crate::network::Network;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Receives the network after every notified change
pub trait NetworkObserver: Send + Sync {
    /// Called with a read view of the updated network
    fn network_changed(&self, network: &Network);
}

impl<F> NetworkObserver for F
where
    F: Fn(&Network) + Send + Sync,
{
    fn network_changed(&self, network: &Network) {
        self(network)
    }
}

/// Token returned by [`NetworkHandle::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Cloneable handle to the live network
#[derive(Clone)]
pub struct NetworkHandle {
    network: Arc<RwLock<Network>>,
    observers: Arc<DashMap<SubscriptionId, Arc<dyn NetworkObserver>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl NetworkHandle {
    /// Take ownership of a network
    pub fn new(network: Network) -> Self {
        Self {
            network: Arc::new(RwLock::new(network)),
            observers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Shared read access
    pub async fn read(&self) -> RwLockReadGuard<'_, Network> {
        self.network.read().await
    }

    /// Exclusive write access. Call [`NetworkHandle::notify_changed`] afterwards.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Network> {
        self.network.write().await
    }

    /// Independent copy of the current network
    pub async fn copy(&self) -> Network {
        self.network.read().await.clone()
    }

    /// Mutate under the exclusive lock and notify observers
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Network) -> R,
    {
        let result = {
            let mut guard = self.network.write().await;
            f(&mut guard)
        };
        self.notify_changed().await;
        result
    }

    /// Swap in a whole new network and notify observers
    pub async fn replace(&self, network: Network) {
        *self.network.write().await = network;
        self.notify_changed().await;
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn NetworkObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.insert(id, observer);
        debug!("Network observer {:?} subscribed", id);
        id
    }

    /// Remove an observer; false when it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.remove(&id).is_some()
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver the current network to every observer
    pub async fn notify_changed(&self) {
        let observers: Vec<Arc<dyn NetworkObserver>> =
            self.observers.iter().map(|e| e.value().clone()).collect();
        if observers.is_empty() {
            return;
        }
        let guard = self.network.read().await;
        for observer in observers {
            observer.network_changed(&guard);
        }
    }
}
