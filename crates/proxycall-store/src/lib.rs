//! Store adapter for the proxycall system.
//!
//! The backing store is row-oriented and deliberately weak: it offers no
//! transactions and no compare-and-swap, may serve slightly stale reads
//! after a write, and enforces a request-rate ceiling. This crate models
//! that contract as a capability interface and wraps it in a service that
//! handles throttling and bounded transient-failure retry, so the
//! allocation protocol above it never sees a silent miss.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
	/// The addressed row does not exist.
	#[error("Not found")]
	NotFound,
	/// Transient backend failure; retried internally and surfaced only
	/// after retries are exhausted.
	#[error("Store unavailable: {0}")]
	Unavailable(String),
	/// A row exists but its cells cannot be decoded.
	#[error("Corrupt row: {0}")]
	Corrupt(String),
}

/// One row of a table: a key plus named string cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
	pub key: String,
	cells: BTreeMap<String, String>,
}

impl Row {
	pub fn new(key: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			cells: BTreeMap::new(),
		}
	}

	pub fn with_cell(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
		self.cells.insert(column.into(), value.into());
		self
	}

	pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
		self.cells.insert(column.into(), value.into());
	}

	/// Returns the cell value, with empty cells treated as absent.
	pub fn get(&self, column: &str) -> Option<&str> {
		self.cells
			.get(column)
			.map(String::as_str)
			.filter(|v| !v.is_empty())
	}

	/// Like [`Row::get`] but surfaces a typed decode error for columns a
	/// record cannot exist without.
	pub fn require(&self, column: &str) -> Result<&str, StoreError> {
		self.get(column)
			.ok_or_else(|| StoreError::Corrupt(format!("missing column '{}' in row '{}'", column, self.key)))
	}
}

/// Trait defining the low-level interface for store backends.
///
/// Backends are expected to be shared across service instances, so no
/// in-process locking on top of this interface may be relied on for
/// correctness; all cross-request coordination happens through the
/// write-then-re-read protocol built on these primitives.
#[async_trait]
pub trait StoreInterface: Send + Sync {
	/// Reads every row of a table, in stable row order.
	async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StoreError>;

	/// Overwrites a single cell. Last write wins; there is no
	/// compare-and-swap.
	async fn write_cell(
		&self,
		table: &str,
		row_key: &str,
		column: &str,
		value: &str,
	) -> Result<(), StoreError>;

	/// Appends a row at the end of the table.
	async fn append_row(&self, table: &str, row: Row) -> Result<(), StoreError>;
}

/// Tuning for the store service.
#[derive(Debug, Clone)]
pub struct StoreConfig {
	/// Minimum spacing between backend requests (the store's rate ceiling).
	pub min_request_interval: Duration,
	/// Bound on a single backend call. A call that stalls past this is cut
	/// off and treated as a transient failure.
	pub call_timeout: Duration,
	/// Total time budget for retrying one transient-failing call.
	pub max_retry_elapsed: Duration,
	/// First retry delay; grows exponentially with jitter.
	pub retry_initial_interval: Duration,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			min_request_interval: Duration::from_millis(100),
			call_timeout: Duration::from_secs(5),
			max_retry_elapsed: Duration::from_secs(10),
			retry_initial_interval: Duration::from_millis(100),
		}
	}
}

/// Store service wrapping a backend with throttling and bounded retry.
///
/// Every transient backend failure is retried with exponential backoff for
/// the specific call that failed; once the budget is exhausted the call
/// fails with [`StoreError::Unavailable`] rather than returning a stale or
/// empty result.
pub struct StoreService {
	backend: Box<dyn StoreInterface>,
	config: StoreConfig,
	last_request: Mutex<Option<Instant>>,
}

impl StoreService {
	pub fn new(backend: Box<dyn StoreInterface>) -> Self {
		Self::with_config(backend, StoreConfig::default())
	}

	pub fn with_config(backend: Box<dyn StoreInterface>, config: StoreConfig) -> Self {
		Self {
			backend,
			config,
			last_request: Mutex::new(None),
		}
	}

	/// Spaces backend requests out to the configured minimum interval.
	/// Callers queue on the lock, which is exactly the rate ceiling the
	/// store demands.
	async fn throttle(&self) {
		let mut last = self.last_request.lock().await;
		if let Some(prev) = *last {
			let elapsed = prev.elapsed();
			if elapsed < self.config.min_request_interval {
				tokio::time::sleep(self.config.min_request_interval - elapsed).await;
			}
		}
		*last = Some(Instant::now());
	}

	fn retry_policy(&self) -> backoff::ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.retry_initial_interval)
			.with_max_elapsed_time(Some(self.config.max_retry_elapsed))
			.build()
	}

	/// Bounds a single backend call to the per-call timeout. A stalled
	/// call surfaces as [`StoreError::Unavailable`] so it re-enters the
	/// retry loop instead of hanging its caller.
	async fn bounded<T>(
		&self,
		call: impl std::future::Future<Output = Result<T, StoreError>>,
	) -> Result<T, StoreError> {
		match tokio::time::timeout(self.config.call_timeout, call).await {
			Ok(result) => result,
			Err(_) => Err(StoreError::Unavailable(format!(
				"backend call exceeded {:?}",
				self.config.call_timeout
			))),
		}
	}

	pub async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
		backoff::future::retry(self.retry_policy(), || async {
			self.throttle().await;
			self.bounded(self.backend.read_all_rows(table))
				.await
				.map_err(classify_for_retry)
		})
		.await
		.map_err(|e| log_exhausted("read_all_rows", table, e))
	}

	pub async fn write_cell(
		&self,
		table: &str,
		row_key: &str,
		column: &str,
		value: &str,
	) -> Result<(), StoreError> {
		backoff::future::retry(self.retry_policy(), || async {
			self.throttle().await;
			self.bounded(self.backend.write_cell(table, row_key, column, value))
				.await
				.map_err(classify_for_retry)
		})
		.await
		.map_err(|e| log_exhausted("write_cell", table, e))
	}

	pub async fn append_row(&self, table: &str, row: Row) -> Result<(), StoreError> {
		backoff::future::retry(self.retry_policy(), || {
			let row = row.clone();
			async move {
				self.throttle().await;
				self.bounded(self.backend.append_row(table, row))
					.await
					.map_err(classify_for_retry)
			}
		})
		.await
		.map_err(|e| log_exhausted("append_row", table, e))
	}
}

fn classify_for_retry(err: StoreError) -> backoff::Error<StoreError> {
	match err {
		StoreError::Unavailable(_) => backoff::Error::transient(err),
		other => backoff::Error::permanent(other),
	}
}

fn log_exhausted(op: &str, table: &str, err: StoreError) -> StoreError {
	if matches!(err, StoreError::Unavailable(_)) {
		warn!("store {} on table '{}' failed after retries: {}", op, table, err);
	}
	err
}
