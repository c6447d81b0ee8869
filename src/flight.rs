//! Request collapsing.
//!
//! Deduplicates concurrent identical operations: callers with the same
//! key while a flight is active attach to it and observe its result
//! instead of re-issuing the work. The entry is dropped from the table
//! when the flight completes, so a finished (possibly failed) flight
//! never poisons the next request with the same key.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type FlightCell<T> = Arc<OnceCell<std::result::Result<T, Arc<Error>>>>;

/// Collapses concurrent operations by string key.
pub struct FlightGroup<T> {
    inflight: Mutex<HashMap<String, FlightCell<T>>>,
}

impl<T> Default for FlightGroup<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` under `key`, or joins the in-flight run for that key.
    ///
    /// Exactly one caller executes `op`; every caller sharing the flight
    /// observes the same value or the same error (replayed as
    /// [`Error::Shared`] so the original is preserved).
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().expect("flight table poisoned");
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let outcome = cell
            .get_or_init(|| async { op().await.map_err(Arc::new) })
            .await
            .clone();

        // Retire this flight. The pointer check keeps a racing newer
        // flight under the same key alive.
        {
            let mut inflight = self.inflight.lock().expect("flight table poisoned");
            if let Some(current) = inflight.get(key) {
                if Arc::ptr_eq(current, &cell) {
                    inflight.remove(key);
                }
            }
        }

        outcome.map_err(Error::Shared)
    }
}
