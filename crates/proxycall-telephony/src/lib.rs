//! Telephony provider integration for the proxycall system.
//!
//! The provider purchases and configures numbers, sends SMS and produces
//! call-bridging directives. It can fail or time out independently of the
//! store, so the service wrapper bounds every call with its own timeout
//! (distinct from the pool reservation TTL and the workflow expiry) and
//! retries only transient provider faults.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use proxycall_types::{CountryIso, NumberClass, PhoneNumber};

/// Re-export implementations
pub mod implementations {
	pub mod http;
}

/// Errors that can occur during provider operations.
#[derive(Debug, Error)]
pub enum TelephonyError {
	/// No purchasable number matched the request.
	#[error("No number available: {0}")]
	Unavailable(String),
	/// Transient provider fault; retried, then surfaced.
	#[error("Provider error: {0}")]
	Provider(String),
	/// Permanent rejection; never retried.
	#[error("Provider rejected request: {0}")]
	Rejected(String),
	/// The per-call timeout elapsed.
	#[error("Provider call timed out after {0:?}")]
	Timeout(Duration),
}

/// Receipt for an accepted outbound SMS.
#[derive(Debug, Clone)]
pub struct MessageReceipt {
	pub message_id: String,
	pub accepted_at: DateTime<Utc>,
}

/// Directive returned to the provider from a voice webhook, instructing it
/// how to handle a call in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallDirective {
	/// Bridge the call to `connect_to`, presenting `caller_id`.
	Bridge {
		caller_id: PhoneNumber,
		connect_to: PhoneNumber,
	},
	/// Play an announcement and hang up.
	Announce { message: String },
}

/// Trait defining the interface to a telephony provider.
#[async_trait]
pub trait TelephonyInterface: Send + Sync {
	/// Buys a brand-new number of the requested class, used to stock the
	/// pool. Returns [`TelephonyError::Unavailable`] when the provider has
	/// no inventory for the country/class.
	async fn purchase_number(
		&self,
		country: &CountryIso,
		class: NumberClass,
	) -> Result<PhoneNumber, TelephonyError>;

	/// Acquires a reserved pool number for live use: enables it and points
	/// its voice/SMS webhooks at this service.
	async fn activate_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError>;

	/// Returns a number to the provider.
	async fn release_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError>;

	/// Sends an SMS from a proxy number.
	async fn send_sms(
		&self,
		from: &PhoneNumber,
		to: &PhoneNumber,
		body: &str,
	) -> Result<MessageReceipt, TelephonyError>;

	/// Builds the directive bridging an inbound call to a real number.
	fn bridge_call(&self, caller_id: &PhoneNumber, connect_to: &PhoneNumber) -> CallDirective;
}

/// Tuning for the telephony service.
#[derive(Debug, Clone)]
pub struct TelephonyConfig {
	/// Upper bound on any single provider call.
	pub call_timeout: Duration,
	/// Total retry budget for transient provider faults.
	pub max_retry_elapsed: Duration,
	pub retry_initial_interval: Duration,
}

impl Default for TelephonyConfig {
	fn default() -> Self {
		Self {
			call_timeout: Duration::from_secs(10),
			max_retry_elapsed: Duration::from_secs(30),
			retry_initial_interval: Duration::from_millis(250),
		}
	}
}

/// Telephony service wrapping a provider with timeouts and bounded retry.
///
/// Only [`TelephonyError::Provider`] is retried; `Unavailable` and
/// `Rejected` are definitive answers and surface immediately.
pub struct TelephonyService {
	provider: Box<dyn TelephonyInterface>,
	config: TelephonyConfig,
}

impl TelephonyService {
	pub fn new(provider: Box<dyn TelephonyInterface>) -> Self {
		Self::with_config(provider, TelephonyConfig::default())
	}

	pub fn with_config(provider: Box<dyn TelephonyInterface>, config: TelephonyConfig) -> Self {
		Self { provider, config }
	}

	async fn bounded<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, TelephonyError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, TelephonyError>>,
	{
		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.retry_initial_interval)
			.with_max_elapsed_time(Some(self.config.max_retry_elapsed))
			.build();

		backoff::future::retry(policy, || async {
			let outcome = tokio::time::timeout(self.config.call_timeout, op())
				.await
				.map_err(|_| TelephonyError::Timeout(self.config.call_timeout))
				.and_then(|r| r);

			outcome.map_err(|e| match e {
				TelephonyError::Provider(_) | TelephonyError::Timeout(_) => {
					warn!("telephony {} transient failure: {}", op_name, e);
					backoff::Error::transient(e)
				}
				definitive => backoff::Error::permanent(definitive),
			})
		})
		.await
	}

	pub async fn purchase_number(
		&self,
		country: &CountryIso,
		class: NumberClass,
	) -> Result<PhoneNumber, TelephonyError> {
		self.bounded("purchase_number", || {
			self.provider.purchase_number(country, class)
		})
		.await
	}

	pub async fn activate_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError> {
		self.bounded("activate_number", || self.provider.activate_number(number))
			.await
	}

	pub async fn release_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError> {
		self.bounded("release_number", || self.provider.release_number(number))
			.await
	}

	pub async fn send_sms(
		&self,
		from: &PhoneNumber,
		to: &PhoneNumber,
		body: &str,
	) -> Result<MessageReceipt, TelephonyError> {
		self.bounded("send_sms", || self.provider.send_sms(from, to, body))
			.await
	}

	pub fn bridge_call(&self, caller_id: &PhoneNumber, connect_to: &PhoneNumber) -> CallDirective {
		self.provider.bridge_call(caller_id, connect_to)
	}
}
