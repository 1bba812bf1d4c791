use std::collections::HashSet;

use murmur_shared::UserId;
use tokio::sync::RwLock;

/// Process-wide set of connected identities.
///
/// Set semantics: two sockets of the same user collapse into one entry, and
/// whichever disconnects first removes it.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: RwLock<HashSet<UserId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the identity was not present before.
    pub async fn add(&self, user: UserId) -> bool {
        self.users.write().await.insert(user)
    }

    /// Removing an absent identity is a no-op.
    pub async fn remove(&self, user: UserId) -> bool {
        self.users.write().await.remove(&user)
    }

    /// Current members, sorted for stable output.
    pub async fn snapshot(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.read().await.iter().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn contains(&self, user: UserId) -> bool {
        self.users.read().await.contains(&user)
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn add_is_idempotent() {
        let registry = PresenceRegistry::new();
        assert!(registry.add(UserId(1)).await);
        assert!(!registry.add(UserId(1)).await);
        assert_eq!(registry.snapshot().await, vec![UserId(1)]);
    }

    #[tokio::test]
    async fn removing_absent_identity_is_harmless() {
        let registry = PresenceRegistry::new();
        registry.add(UserId(2)).await;

        assert!(!registry.remove(UserId(9)).await);
        assert_eq!(registry.snapshot().await, vec![UserId(2)]);

        assert!(registry.remove(UserId(2)).await);
        assert!(!registry.remove(UserId(2)).await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn first_disconnect_removes_shared_identity() {
        let registry = PresenceRegistry::new();
        registry.add(UserId(5)).await;
        registry.add(UserId(5)).await;

        registry.remove(UserId(5)).await;
        assert!(!registry.contains(UserId(5)).await);
    }

    #[tokio::test]
    async fn concurrent_mutation_converges() {
        let registry = Arc::new(PresenceRegistry::new());

        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.add(UserId(i)).await;
                if i % 2 == 0 {
                    registry.remove(UserId(i)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 32);
        assert!(snapshot.iter().all(|u| u.0 % 2 == 1));
        assert_eq!(registry.len().await, 32);
    }
}
