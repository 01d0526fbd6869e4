//! Per-location async locks.
//!
//! Locations are independent packages, so coordination never crosses a
//! location boundary: each id gets its own mutex, created on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::LocationId;

/// Lazily-created mutex per location
#[derive(Debug, Default, Clone)]
pub struct LocationLocks {
    inner: Arc<Mutex<HashMap<LocationId, Arc<AsyncMutex<()>>>>>,
}

impl LocationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, location_id: &LocationId) -> Arc<AsyncMutex<()>> {
        // Poisoning only happens if a holder panicked mid-insert; the map is still usable
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(location_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the lock for a location
    pub async fn lock(&self, location_id: &LocationId) -> OwnedMutexGuard<()> {
        self.handle(location_id).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_location_is_exclusive() {
        let locks = LocationLocks::new();
        let id = LocationId::derive("Mill", None);

        let guard = locks.lock(&id).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(&id)).await;
        assert!(second.is_err());

        drop(guard);
        let third = tokio::time::timeout(Duration::from_millis(50), locks.lock(&id)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_different_locations_do_not_block() {
        let locks = LocationLocks::new();
        let _a = locks.lock(&LocationId::derive("A", None)).await;
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(&LocationId::derive("B", None)),
        )
        .await;
        assert!(b.is_ok());
    }
}
