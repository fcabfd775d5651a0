//! In-process single-flight.
//!
//! Concurrent requests for the same key share one running future. The
//! future is driven by whichever caller is polling it; when the last caller
//! goes away the future is dropped, which in turn drops anything it owns
//! (a held [`LockGuard`](crate::lock::LockGuard) included).

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

use crate::error::LumenError;

/// Shared handle to a running flight. Every clone resolves to the same output.
pub type Flight<T> = Shared<BoxFuture<'static, Result<T, LumenError>>>;

type FlightMap<K, T> = DashMap<K, (u64, WeakShared<BoxFuture<'static, Result<T, LumenError>>>)>;

pub struct SingleFlight<K, T>
where
    K: Eq + Hash,
{
    flights: Arc<FlightMap<K, T>>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, starting one with `start` if none is live.
    ///
    /// Returns the shared flight and whether this call started it.
    pub fn join<F, Fut>(&self, key: K, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LumenError>> + Send + 'static,
    {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if let Some(flight) = slot.get().1.upgrade() {
                    return (flight, false);
                }
                let (id, flight) = self.launch(key, start());
                if let Some(weak) = flight.downgrade() {
                    slot.insert((id, weak));
                }
                (flight, true)
            }
            Entry::Vacant(slot) => {
                let (id, flight) = self.launch(key, start());
                if let Some(weak) = flight.downgrade() {
                    slot.insert((id, weak));
                }
                (flight, true)
            }
        }
    }

    fn launch<Fut>(&self, key: K, fut: Fut) -> (u64, Flight<T>)
    where
        Fut: Future<Output = Result<T, LumenError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deregister = Deregister {
            flights: Arc::clone(&self.flights),
            key: Some(key),
            id,
        };
        let flight = async move {
            let _deregister = deregister;
            fut.await
        }
        .boxed()
        .shared();
        (id, flight)
    }
}

/// Removes the map entry once the flight finishes or is abandoned.
///
/// Matches on the flight id so a newer flight for the same key is left alone.
struct Deregister<K: Eq + Hash, T> {
    flights: Arc<FlightMap<K, T>>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash, T> Drop for Deregister<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let id = self.id;
            self.flights.remove_if(&key, |_, (current, _)| *current == id);
        }
    }
}
