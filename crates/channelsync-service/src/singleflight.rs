//! Deduplication of concurrent computations per key.
use std::future::Future;
use std::hash::Hash;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::utils::defer::defer;

type Flight<T> = Shared<oneshot::Receiver<T>>;

/// Runs at most one computation per key at a time, sharing its result with every caller that
/// asks for the same key while it is running.
///
/// Only running computations are tracked. Once a computation finishes, its key is free again
/// and the next caller starts a fresh one, so failures are never cached.
///
/// Registration is an atomic insert-if-absent on the key. Contention only ever happens between
/// callers of the same key.
pub struct SingleFlight<K, T> {
    name: &'static str,
    flights: moka::sync::Cache<K, Flight<T>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            flights: self.flights.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a coordinator. The `name` is used to tag metrics and logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flights: moka::sync::Cache::builder().name(name).build(),
        }
    }

    /// Runs `computation` unless a computation for `key` is already in flight, in which case
    /// the running one is joined and `computation` is dropped without being polled.
    ///
    /// The computation is spawned on the current runtime right away and runs to completion
    /// even if every caller stops waiting. The returned future fails only if the computation
    /// panicked.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation, even if you don't explicitly `await` its result.
    pub fn run_once<F>(
        &self,
        key: K,
        computation: F,
    ) -> BoxFuture<'static, Result<T, oneshot::Canceled>>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.run_or_join(key, computation).1
    }

    /// Same as [`run_once`](Self::run_once), but also tells whether this call started the
    /// computation (`true`) or joined one that was already running (`false`).
    pub fn run_or_join<F>(
        &self,
        key: K,
        computation: F,
    ) -> (bool, BoxFuture<'static, Result<T, oneshot::Canceled>>)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut sender = None;
        let flight = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = oneshot::channel();
                sender = Some(tx);
                rx.shared()
            })
            .into_value();

        let started = sender.is_some();
        match sender {
            Some(sender) => {
                metric!(counter("flights.started") += 1, "flight" => self.name);

                let flights = self.flights.clone();
                let remove_flight = defer(move || flights.invalidate(&key));

                let computation = async move {
                    let result = computation.await;
                    // Remove the flight before publishing the result. Callers either join a
                    // flight that will still deliver, or start a new one.
                    remove_flight.run();
                    sender.send(result).ok();
                }
                .bind_hub(Hub::new_from_top(Hub::current()));

                tokio::spawn(computation);
            }
            None => {
                metric!(counter("flights.joined") += 1, "flight" => self.name);
                tracing::trace!(flight = self.name, "Joined running computation");
            }
        }

        (started, flight.boxed())
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }
}
