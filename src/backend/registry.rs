//! Set of gateways that should be subscribed for downlink delivery
//!
//! The registry records intent, not broker state: a gateway is added after
//! the broker acknowledged its subscription and removed after it
//! acknowledged the unsubscribe, and connectivity never changes it.

use crate::protocol::Eui64;
use std::collections::BTreeSet;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    gateways: RwLock<BTreeSet<Eui64>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the gateway was not registered yet
    pub async fn add(&self, gateway: Eui64) -> bool {
        self.gateways.write().await.insert(gateway)
    }

    /// Returns true if the gateway was registered
    pub async fn remove(&self, gateway: &Eui64) -> bool {
        self.gateways.write().await.remove(gateway)
    }

    /// Point-in-time copy, safe to iterate while the registry changes
    pub async fn snapshot(&self) -> BTreeSet<Eui64> {
        self.gateways.read().await.clone()
    }

    pub async fn contains(&self, gateway: &Eui64) -> bool {
        self.gateways.read().await.contains(gateway)
    }

    pub async fn len(&self) -> usize {
        self.gateways.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.gateways.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_remove() {
        let registry = SubscriptionRegistry::new();
        let gateway = Eui64::from(0x0102030405060708u64);

        assert!(registry.is_empty().await);
        assert!(registry.add(gateway).await);
        assert!(!registry.add(gateway).await);
        assert!(registry.contains(&gateway).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(&gateway).await);
        assert!(!registry.remove(&gateway).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let registry = SubscriptionRegistry::new();
        registry.add(Eui64::from(1u64)).await;

        let snapshot = registry.snapshot().await;
        registry.add(Eui64::from(2u64)).await;
        registry.remove(&Eui64::from(1u64)).await;

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&Eui64::from(1u64)));
        assert_eq!(
            registry.snapshot().await.into_iter().collect::<Vec<_>>(),
            vec![Eui64::from(2u64)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_mutation() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let tasks: Vec<_> = (0..64u64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.add(Eui64::from(i)).await;
                    if i % 2 == 1 {
                        registry.remove(&Eui64::from(i)).await;
                    }
                    registry.snapshot().await.len()
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap() <= 64);
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 32);
        assert!(snapshot.iter().all(|gateway| gateway.as_bytes()[7] % 2 == 0));
    }
}
