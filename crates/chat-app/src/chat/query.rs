use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parley_storage::{StorageError, StorageResult};

pub type QueryResult<T> = Result<T, Arc<StorageError>>;

type SharedFetch<T> = Shared<BoxFuture<'static, QueryResult<T>>>;

struct InFlight<T> {
    epoch: u64,
    fetch: SharedFetch<T>,
}

struct QueryState<T> {
    value: Option<T>,
    stale: bool,
    // Bumped by every invalidation; a fetch only publishes if its epoch is still current.
    epoch: u64,
    in_flight: Option<InFlight<T>>,
}

/// A lazily refreshed cache slot whose concurrent readers share one fetch.
///
/// Reads are served from the cached value until it is invalidated. The first reader of a
/// stale slot starts a fetch; everyone else arriving before it resolves awaits the same
/// future. A fetch that started before an invalidation still answers its own waiters but
/// never marks the slot fresh, so the next read goes back to the source.
pub struct CoalescedQuery<T> {
    label: &'static str,
    state: Mutex<QueryState<T>>,
}

impl<T> Default for CoalescedQuery<T> {
    fn default() -> Self {
        Self::labeled("query")
    }
}

impl<T> CoalescedQuery<T> {
    /// `label` names the cache in debug logs.
    pub fn labeled(label: &'static str) -> Self {
        Self {
            label,
            state: Mutex::new(QueryState {
                value: None,
                stale: true,
                epoch: 0,
                in_flight: None,
            }),
        }
    }
}

impl<T> CoalescedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last known value, fresh or not. Never fetches.
    pub fn peek(&self) -> Option<T> {
        self.lock().value.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.stale = true;
        state.epoch = state.epoch.wrapping_add(1);
        let dropped_fetch = state.in_flight.take().is_some();
        tracing::debug!(
            query = self.label,
            epoch = state.epoch,
            dropped_fetch,
            "cache invalidated"
        );
    }

    /// Applies a local edit to the cached value, if there is one. Staleness is unchanged.
    pub fn update(&self, edit: impl FnOnce(&mut T)) {
        if let Some(value) = self.lock().value.as_mut() {
            edit(value);
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> QueryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let (epoch, shared) = {
            let mut state = self.lock();
            if !state.stale
                && let Some(value) = &state.value
            {
                return Ok(value.clone());
            }

            match &state.in_flight {
                Some(in_flight) => {
                    tracing::debug!(
                        query = self.label,
                        epoch = in_flight.epoch,
                        "joining in-flight fetch"
                    );
                    (in_flight.epoch, in_flight.fetch.clone())
                }
                None => {
                    tracing::debug!(
                        query = self.label,
                        epoch = state.epoch,
                        has_value = state.value.is_some(),
                        "cache miss, starting fetch"
                    );
                    let pending = fetch();
                    let shared = async move { pending.await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    state.in_flight = Some(InFlight {
                        epoch: state.epoch,
                        fetch: shared.clone(),
                    });
                    (state.epoch, shared)
                }
            }
        };

        let result = shared.await;

        let mut state = self.lock();
        // Only the first waiter to wake publishes; later waiters find the slot already cleared.
        let owns_slot = state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.epoch == epoch);
        if owns_slot {
            state.in_flight = None;
            match &result {
                Ok(value) => {
                    state.value = Some(value.clone());
                    state.stale = false;
                }
                Err(error) => {
                    tracing::debug!(
                        query = self.label,
                        epoch,
                        error = %error,
                        "fetch failed, keeping previous value"
                    );
                }
            }
        } else if state.epoch != epoch {
            tracing::debug!(
                query = self.label,
                epoch,
                current_epoch = state.epoch,
                "fetch finished after invalidation, not publishing"
            );
        }

        result
    }
}
