//! Component wiring.
//!
//! Builds the component graph from configuration: one shared store service
//! at the bottom, the pool/orders/confirmation/routing services above it,
//! and the telephony provider at the edge.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use proxycall_config::ProxycallConfig;
use proxycall_confirmation::{ConfirmationConfig, ConfirmationEngine};
use proxycall_orders::{ClientDirectory, OrderWorkflow, OrdersConfig};
use proxycall_pool::{PoolConfig, PoolService};
use proxycall_routing::RoutingService;
use proxycall_store::implementations::memory::MemoryStore;
use proxycall_store::{StoreConfig, StoreService};
use proxycall_telephony::implementations::http::{HttpProvider, HttpProviderConfig};
use proxycall_telephony::{TelephonyConfig, TelephonyInterface, TelephonyService};

/// The assembled proxycall service.
pub struct ProxycallService {
	pub pool: Arc<PoolService>,
	pub clients: Arc<ClientDirectory>,
	pub orders: Arc<OrderWorkflow>,
	pub confirmation: Arc<ConfirmationEngine>,
	pub routing: Arc<RoutingService>,
	pub telephony: Arc<TelephonyService>,
}

impl ProxycallService {
	/// Assembles the service from configuration, with the HTTP telephony
	/// provider at the edge.
	pub fn from_config(config: &ProxycallConfig) -> Self {
		let provider = HttpProvider::new(HttpProviderConfig {
			base_url: config.telephony.base_url.clone(),
			account_id: config.telephony.account_id.clone(),
			auth_token: config.telephony.auth_token.clone(),
			voice_webhook_url: config.telephony.voice_webhook_url.clone(),
			sms_webhook_url: config.telephony.sms_webhook_url.clone(),
		});
		Self::assemble(config, Box::new(provider))
	}

	/// Assembles the service around an arbitrary provider implementation.
	pub fn assemble(config: &ProxycallConfig, provider: Box<dyn TelephonyInterface>) -> Self {
		let store = Arc::new(StoreService::with_config(
			Box::new(MemoryStore::new()),
			StoreConfig {
				min_request_interval: Duration::from_millis(config.store.min_request_interval_ms),
				call_timeout: Duration::from_secs(config.store.call_timeout_secs),
				max_retry_elapsed: Duration::from_secs(config.store.max_retry_elapsed_secs),
				retry_initial_interval: Duration::from_millis(
					config.store.retry_initial_interval_ms,
				),
			},
		));

		let telephony = Arc::new(TelephonyService::with_config(
			provider,
			TelephonyConfig {
				call_timeout: Duration::from_secs(config.telephony.call_timeout_secs),
				max_retry_elapsed: Duration::from_secs(config.telephony.max_retry_elapsed_secs),
				retry_initial_interval: Duration::from_millis(
					config.telephony.retry_initial_interval_ms,
				),
			},
		));

		let pool = Arc::new(PoolService::with_config(
			store.clone(),
			PoolConfig {
				max_reserve_attempts: config.pool.max_reserve_attempts,
				reservation_ttl: Duration::from_secs(config.pool.reservation_ttl_secs),
				retry_base_delay: Duration::from_millis(config.pool.retry_base_delay_ms),
			},
		));

		let clients = Arc::new(ClientDirectory::new(store.clone()));

		let orders = Arc::new(OrderWorkflow::new(
			store.clone(),
			clients.clone(),
			pool.clone(),
			telephony.clone(),
			OrdersConfig {
				otp_length: config.orders.otp_length,
				max_order_age: Duration::from_secs(config.orders.max_order_age_secs),
			},
		));

		let confirmation = Arc::new(ConfirmationEngine::new(
			store,
			clients.clone(),
			pool.clone(),
			ConfirmationConfig {
				max_attempts: config.confirmation.max_attempts,
			},
		));

		let routing = Arc::new(RoutingService::new(clients.clone(), telephony.clone()));

		Self {
			pool,
			clients,
			orders,
			confirmation,
			routing,
			telephony,
		}
	}

	/// Runs the order expiry sweep forever at the configured interval.
	pub async fn run_expiry_sweeper(self: Arc<Self>, interval: Duration) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;
			match self.orders.expire_stale().await {
				Ok(0) => {}
				Ok(expired) => tracing::info!("expiry sweep closed {} orders", expired),
				Err(e) => warn!("expiry sweep failed: {}", e),
			}
		}
	}
}
