//! Configuration structures for the proxycall service.

use serde::{Deserialize, Serialize};

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxycallConfig {
	#[serde(default)]
	pub service: ServiceConfig,
	#[serde(default)]
	pub store: StoreSection,
	#[serde(default)]
	pub telephony: TelephonySection,
	#[serde(default)]
	pub pool: PoolSection,
	#[serde(default)]
	pub orders: OrdersSection,
	#[serde(default)]
	pub confirmation: ConfirmationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
	pub name: String,
	pub http_port: u16,
	pub log_level: String,
	/// Interval of the background sweep that expires overdue orders.
	pub sweep_interval_secs: u64,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			name: "proxycall".to_string(),
			http_port: 8080,
			log_level: "info".to_string(),
			sweep_interval_secs: 60,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
	/// Minimum spacing between backend requests (the store rate ceiling).
	pub min_request_interval_ms: u64,
	/// Cutoff for a single backend call.
	pub call_timeout_secs: u64,
	pub max_retry_elapsed_secs: u64,
	pub retry_initial_interval_ms: u64,
}

impl Default for StoreSection {
	fn default() -> Self {
		Self {
			min_request_interval_ms: 100,
			call_timeout_secs: 5,
			max_retry_elapsed_secs: 10,
			retry_initial_interval_ms: 100,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonySection {
	pub base_url: String,
	pub account_id: String,
	pub auth_token: String,
	/// Webhook URLs registered on every activated number.
	pub voice_webhook_url: String,
	pub sms_webhook_url: String,
	/// Shared secret for inbound webhook signatures.
	pub webhook_secret: String,
	pub call_timeout_secs: u64,
	pub max_retry_elapsed_secs: u64,
	pub retry_initial_interval_ms: u64,
}

impl Default for TelephonySection {
	fn default() -> Self {
		Self {
			base_url: String::new(),
			account_id: String::new(),
			auth_token: String::new(),
			voice_webhook_url: String::new(),
			sms_webhook_url: String::new(),
			webhook_secret: String::new(),
			call_timeout_secs: 10,
			max_retry_elapsed_secs: 30,
			retry_initial_interval_ms: 250,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
	pub max_reserve_attempts: u32,
	pub reservation_ttl_secs: u64,
	pub retry_base_delay_ms: u64,
}

impl Default for PoolSection {
	fn default() -> Self {
		Self {
			max_reserve_attempts: 5,
			reservation_ttl_secs: 120,
			retry_base_delay_ms: 50,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdersSection {
	pub otp_length: usize,
	/// Age past which the sweep expires a non-terminal order. Must exceed
	/// the pool reservation TTL.
	pub max_order_age_secs: u64,
}

impl Default for OrdersSection {
	fn default() -> Self {
		Self {
			otp_length: 6,
			max_order_age_secs: 600,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationSection {
	pub max_attempts: u32,
}

impl Default for ConfirmationSection {
	fn default() -> Self {
		Self { max_attempts: 3 }
	}
}
