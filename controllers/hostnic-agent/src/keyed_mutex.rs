//! Per-key async lock
//!
//! CNI calls for one container are serialized while calls for different
//! containers run in parallel. Entries are dropped once nobody holds or
//! waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock on one key
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // only the map itself still refers to the lock
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serialized() {
        let locks = Arc::new(KeyedMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = locks.lock("c1").await;
        let waiter = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("c1").await;
                order.lock().unwrap().push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().unwrap().push("first");
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let locks = KeyedMutex::new();
        let a = locks.lock("c1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("c2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        drop(b);
        drop(a);
        assert!(locks.is_empty());
    }
}
