//! Confirmation (OTP) engine for the proxycall system.
//!
//! Matches inbound SMS bodies against the code an awaiting order expects.
//! Extraction is deliberately conservative: only a digit run of exactly the
//! expected length, bounded by non-digits, counts as a candidate code.
//! Digits embedded in longer runs (a phone number in free text, say) must
//! never produce a derived guess, so there is no fallback that strips
//! non-digits from the body.

use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use proxycall_orders::{ClientDirectory, OrderRepository};
use proxycall_pool::{PoolError, PoolService};
use proxycall_store::{Row, StoreError, StoreService};
use proxycall_types::{AttemptResult, ConfirmationAttempt, Order, OrderStatus, PhoneNumber};

pub const ATTEMPTS_TABLE: &str = "confirmation_attempts";

const COL_ORDER_ID: &str = "order_id";
const COL_EXPECTED: &str = "expected_code";
const COL_BODY: &str = "received_body";
const COL_EXTRACTED: &str = "extracted_code";
const COL_RESULT: &str = "result";
const COL_TIMESTAMP: &str = "timestamp";

/// Errors that can occur during confirmation operations.
#[derive(Debug, Error)]
pub enum ConfirmationError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Pool(#[from] PoolError),
}

/// Outcome of one code submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
	/// The code matched; the order is confirmed.
	Matched,
	/// A code was extracted but did not match.
	Mismatched,
	/// No candidate code could be extracted from the body.
	Unparseable,
	/// No order is awaiting confirmation on this proxy.
	NoPendingOrder,
}

/// Tuning for the confirmation engine.
#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
	/// Mismatches allowed before the order fails.
	pub max_attempts: u32,
}

impl Default for ConfirmationConfig {
	fn default() -> Self {
		Self { max_attempts: 3 }
	}
}

/// The confirmation engine.
pub struct ConfirmationEngine {
	store: Arc<StoreService>,
	orders: OrderRepository,
	clients: Arc<ClientDirectory>,
	pool: Arc<PoolService>,
	config: ConfirmationConfig,
}

impl ConfirmationEngine {
	pub fn new(
		store: Arc<StoreService>,
		clients: Arc<ClientDirectory>,
		pool: Arc<PoolService>,
		config: ConfirmationConfig,
	) -> Self {
		Self {
			orders: OrderRepository::new(store.clone()),
			store,
			clients,
			pool,
			config,
		}
	}

	/// Matches an inbound body against the order awaiting confirmation on
	/// `proxy`. Every submission against a pending order is recorded as an
	/// attempt, whatever its outcome.
	pub async fn submit_code(
		&self,
		proxy: &PhoneNumber,
		raw_body: &str,
	) -> Result<SubmissionOutcome, ConfirmationError> {
		let Some(order) = self.orders.find_awaiting_by_proxy(proxy).await? else {
			return Ok(SubmissionOutcome::NoPendingOrder);
		};
		let Some(expected) = order.expected_code.clone() else {
			warn!("order {} awaits confirmation without a code", order.order_id);
			return Ok(SubmissionOutcome::NoPendingOrder);
		};

		let extracted = extract_code(raw_body, expected.len());
		let result = match extracted.as_deref() {
			None => AttemptResult::Unparseable,
			Some(code) if code == expected.trim() => AttemptResult::Matched,
			Some(_) => AttemptResult::Mismatched,
		};

		self.record_attempt(&order, &expected, raw_body, extracted, result)
			.await?;

		match result {
			AttemptResult::Matched => {
				self.orders
					.set_status(&order.order_id, OrderStatus::Confirmed)
					.await?;
				self.clients.attach_proxy(&order.client_id, proxy).await?;
				info!("order {} confirmed on {}", order.order_id, proxy.masked());
				Ok(SubmissionOutcome::Matched)
			}
			AttemptResult::Mismatched => {
				let attempts = order.attempt_count + 1;
				self.orders
					.set_attempt_count(&order.order_id, attempts)
					.await?;
				if attempts >= self.config.max_attempts {
					warn!(
						"order {} failed after {} bad codes",
						order.order_id, attempts
					);
					self.release_best_effort(&order).await;
					self.orders
						.set_status(&order.order_id, OrderStatus::Failed)
						.await?;
				}
				Ok(SubmissionOutcome::Mismatched)
			}
			// An unrelated message must not burn confirmation attempts.
			AttemptResult::Unparseable => Ok(SubmissionOutcome::Unparseable),
		}
	}

	/// Audit trail for an order, in submission order.
	pub async fn attempts_for(
		&self,
		order_id: &str,
	) -> Result<Vec<ConfirmationAttempt>, ConfirmationError> {
		let rows = self.store.read_all_rows(ATTEMPTS_TABLE).await?;
		let mut attempts = Vec::new();
		for row in &rows {
			match decode_attempt(row) {
				Ok(attempt) if attempt.order_id == order_id => attempts.push(attempt),
				Ok(_) => {}
				Err(e) => warn!("skipping corrupt attempt row '{}': {}", row.key, e),
			}
		}
		Ok(attempts)
	}

	async fn record_attempt(
		&self,
		order: &Order,
		expected: &str,
		body: &str,
		extracted: Option<String>,
		result: AttemptResult,
	) -> Result<(), ConfirmationError> {
		let attempt = ConfirmationAttempt {
			order_id: order.order_id.clone(),
			expected_code: expected.to_string(),
			received_body: body.to_string(),
			extracted_code: extracted,
			result,
			timestamp: Utc::now(),
		};
		self.store
			.append_row(ATTEMPTS_TABLE, encode_attempt(&attempt))
			.await?;
		Ok(())
	}

	async fn release_best_effort(&self, order: &Order) {
		let Some(token) = &order.reservation_token else {
			return;
		};
		match self.pool.release(token).await {
			Ok(()) | Err(PoolError::NotFound) => {}
			Err(e) => warn!("release failed for order {}: {}", order.order_id, e),
		}
	}
}

/// Extracts a candidate code: the first digit run of exactly `length`
/// digits bounded by non-digits. Returns `None` when no such run exists.
fn extract_code(body: &str, length: usize) -> Option<String> {
	let pattern = format!(r"\b\d{{{}}}\b", length);
	let re = Regex::new(&pattern).ok()?;
	re.find(body.trim()).map(|m| m.as_str().to_string())
}

fn encode_attempt(attempt: &ConfirmationAttempt) -> Row {
	let mut row = Row::new(Uuid::new_v4().to_string())
		.with_cell(COL_ORDER_ID, attempt.order_id.as_str())
		.with_cell(COL_EXPECTED, attempt.expected_code.as_str())
		.with_cell(COL_BODY, attempt.received_body.as_str())
		.with_cell(COL_RESULT, attempt.result.as_str())
		.with_cell(COL_TIMESTAMP, attempt.timestamp.to_rfc3339());
	if let Some(code) = &attempt.extracted_code {
		row.set(COL_EXTRACTED, code.as_str());
	}
	row
}

fn decode_attempt(row: &Row) -> Result<ConfirmationAttempt, StoreError> {
	let result = row
		.require(COL_RESULT)
		.ok()
		.and_then(AttemptResult::parse)
		.ok_or_else(|| StoreError::Corrupt(format!("bad result in row '{}'", row.key)))?;
	let timestamp = chrono::DateTime::parse_from_rfc3339(row.require(COL_TIMESTAMP)?.trim())
		.map_err(|e| StoreError::Corrupt(e.to_string()))?
		.with_timezone(&Utc);

	Ok(ConfirmationAttempt {
		order_id: row.require(COL_ORDER_ID)?.to_string(),
		expected_code: row.require(COL_EXPECTED)?.to_string(),
		received_body: row.get(COL_BODY).unwrap_or_default().to_string(),
		extracted_code: row.get(COL_EXTRACTED).map(str::to_string),
		result,
		timestamp,
	})
}
