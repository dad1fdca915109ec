//! Single-flight coordination.
//!
//! A [`FlightGroup`] tracks at most one in-flight fetch per key. The first
//! caller for a key becomes the [`Leader`]; later callers get a [`Waiter`]
//! on the same watch channel and receive whatever the leader publishes. A
//! leader dropped without publishing (its task panicked or was aborted)
//! publishes an error so no waiter hangs.

use crate::error::{FalconError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Slot<T> = watch::Receiver<Option<Result<T>>>;

/// Outcome of [`FlightGroup::join`].
pub enum Flight<T> {
    /// `lookup` found a value; nothing is in flight.
    Ready(T),
    /// Another caller is fetching; await its result.
    Wait(Waiter<T>),
    /// This caller must fetch and publish.
    Lead(Leader<T>),
}

/// Shared table of in-flight fetches. Clones share the table.
pub struct FlightGroup<T> {
    inflight: Arc<Mutex<HashMap<String, Slot<T>>>>,
}

impl<T> Clone for FlightGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<T> Default for FlightGroup<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone> FlightGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`.
    ///
    /// Runs under the group lock: an existing flight is joined first;
    /// otherwise `lookup` is consulted, and only on a miss is a new flight
    /// started. A leader publishes before its key is released, so a value
    /// stored by a finished flight is always visible to `lookup`. `lookup`
    /// must stay cheap; a store that blocks should be read before joining,
    /// with the leader re-checking it before fetching.
    pub fn join(&self, key: &str, lookup: impl FnOnce() -> Result<Option<T>>) -> Result<Flight<T>> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| FalconError::Other("flight lock poisoned".to_string()))?;

        if let Some(slot) = inflight.get(key) {
            return Ok(Flight::Wait(Waiter { rx: slot.clone() }));
        }

        if let Some(value) = lookup()? {
            return Ok(Flight::Ready(value));
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx.clone());
        Ok(Flight::Lead(Leader {
            key: key.to_string(),
            inflight: self.inflight.clone(),
            tx: Some(tx),
            rx,
        }))
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to await another caller's fetch.
pub struct Waiter<T> {
    rx: Slot<T>,
}

impl<T: Clone> Waiter<T> {
    /// Wait for the published result. Dropping this future only abandons
    /// this caller's wait.
    pub async fn wait(mut self) -> Result<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(published) => published
                .clone()
                .unwrap_or_else(|| Err(FalconError::Other("flight closed without result".to_string()))),
            Err(_) => Err(FalconError::Other("flight abandoned".to_string())),
        }
    }
}

/// Obligation to fetch a key and publish the result.
pub struct Leader<T> {
    key: String,
    inflight: Arc<Mutex<HashMap<String, Slot<T>>>>,
    tx: Option<watch::Sender<Option<Result<T>>>>,
    rx: Slot<T>,
}

impl<T: Clone> Leader<T> {
    /// A waiter for this flight's own result.
    pub fn waiter(&self) -> Waiter<T> {
        Waiter { rx: self.rx.clone() }
    }

    /// Publish `result` to every waiter and release the key.
    pub fn complete(mut self, result: Result<T>) {
        self.publish(result);
    }

    fn publish(&mut self, result: Result<T>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Publish and release under the group lock so a new caller either
        // joins this flight and sees the result, or misses it entirely.
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.send_replace(Some(result));
        inflight.remove(&self.key);
    }
}

impl<T> Drop for Leader<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let mut inflight = match self.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tx.send_replace(Some(Err(FalconError::Other(format!(
                "fetch for {} ended without a result",
                self.key
            )))));
            inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_share_leader_result() {
        let group: FlightGroup<u32> = FlightGroup::new();

        let Flight::Lead(leader) = group.join("k", || Ok(None)).unwrap() else {
            panic!("first caller must lead");
        };
        let Flight::Wait(waiter) = group.join("k", || Ok(None)).unwrap() else {
            panic!("second caller must wait");
        };
        let own = leader.waiter();

        leader.complete(Ok(42));
        assert_eq!(waiter.wait().await.unwrap(), 42);
        assert_eq!(own.wait().await.unwrap(), 42);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_hit_skips_flight() {
        let group: FlightGroup<u32> = FlightGroup::new();
        assert!(matches!(group.join("k", || Ok(Some(1))).unwrap(), Flight::Ready(1)));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_fails_waiters() {
        let group: FlightGroup<u32> = FlightGroup::new();
        let Flight::Lead(leader) = group.join("k", || Ok(None)).unwrap() else {
            panic!("expected leader");
        };
        let waiter = leader.waiter();

        let task = tokio::spawn(async move {
            let _leader = leader;
            panic!("fetch task blew up");
        });
        assert!(task.await.is_err());

        let result = tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .unwrap();
        assert!(result.is_err());
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_failure_allows_retry() {
        let group: FlightGroup<u32> = FlightGroup::new();
        let Flight::Lead(leader) = group.join("k", || Ok(None)).unwrap() else {
            panic!("expected leader");
        };
        leader.complete(Err(FalconError::Timeout(Duration::from_secs(1))));
        assert!(matches!(group.join("k", || Ok(None)).unwrap(), Flight::Lead(_)));
    }
}
