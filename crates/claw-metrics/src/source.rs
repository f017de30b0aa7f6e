//! Metric source abstraction.
//!
//! A [`MetricSource`] answers range queries for a [`Selector`] with raw series
//! of `(labels, observations)`. The query language of the backend is a
//! configuration detail; selectors are rendered to text only at the edge.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::selector::Selector;
use crate::storage::MetricStore;
use crate::types::{LabelSet, Observation, TimeRange};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One series returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    /// Full label set of the series.
    pub labels: LabelSet,
    /// Observations in timestamp order.
    pub observations: Vec<Observation>,
}

/// A time-series backend that can be queried over a range.
pub trait MetricSource: Send + Sync {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Returns all series matching `selector` with observations inside `range`.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::MetricSource` on transport, authentication or
    /// decoding failures.
    fn query_range<'a>(
        &'a self,
        selector: &'a Selector,
        range: TimeRange,
    ) -> BoxFuture<'a, Result<Vec<RawSeries>>>;
}

/// Source backed by a local [`MetricStore`].
///
/// Used for tests and dry runs. Failures and latency can be injected to
/// exercise timeout and backoff behaviour.
#[derive(Debug, Default)]
pub struct InMemorySource {
    store: MetricStore,
    failure: Mutex<Option<MetricsError>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemorySource {
    /// Creates a source over an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source over an existing store handle.
    #[must_use]
    pub fn with_store(store: MetricStore) -> Self {
        Self {
            store,
            failure: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Returns the backing store.
    #[must_use]
    pub const fn store(&self) -> &MetricStore {
        &self.store
    }

    /// Makes every following query fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<MetricsError>) {
        *self.failure.lock() = error;
    }

    /// Delays every following query by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }
}

impl MetricSource for InMemorySource {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn query_range<'a>(
        &'a self,
        selector: &'a Selector,
        range: TimeRange,
    ) -> BoxFuture<'a, Result<Vec<RawSeries>>> {
        Box::pin(async move {
            let latency = *self.latency.lock();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let failure = self.failure.lock().clone();
            if let Some(err) = failure {
                return Err(err);
            }
            self.store.query(selector, range)
        })
    }
}
