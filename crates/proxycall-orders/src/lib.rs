//! Order workflow for the proxycall system.
//!
//! Drives one allocation attempt per client through the state machine
//! `created → reserving → purchased → awaiting_confirmation → confirmed`,
//! with `failed` and `expired` terminal from any non-terminal state.
//! Business-rule failures (empty pool, provider refusal, lost reservation)
//! terminate the order in a typed `failed` status; only infrastructure
//! faults surface as errors. Any failure after a reservation was granted
//! releases it before the order is marked failed.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use proxycall_pool::{PoolError, PoolService};
use proxycall_store::{StoreError, StoreService};
use proxycall_telephony::{TelephonyError, TelephonyService};
use proxycall_types::{CountryIso, NumberClass, Order, OrderStatus, PoolEntry};

mod clients;
mod repository;

pub use clients::{ClientDirectory, NewClient, CLIENTS_TABLE};
pub use repository::{OrderRepository, ORDERS_TABLE};

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
	#[error("Order not found: {0}")]
	NotFound(String),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Pool(#[from] PoolError),
}

/// Tuning for the order workflow.
#[derive(Debug, Clone)]
pub struct OrdersConfig {
	/// Digits in the confirmation code.
	pub otp_length: usize,
	/// Age past which a non-terminal order is expired by the sweep. Must be
	/// longer than the pool reservation TTL so the sweep, not the pool,
	/// decides the order's fate.
	pub max_order_age: Duration,
}

impl Default for OrdersConfig {
	fn default() -> Self {
		Self {
			otp_length: 6,
			max_order_age: Duration::from_secs(600),
		}
	}
}

/// A validated order request: the client (created on first contact) and the
/// number class they asked for.
#[derive(Debug, Clone)]
pub struct OrderRequest {
	pub client: NewClient,
	pub preferred_class: NumberClass,
}

/// The order workflow engine.
pub struct OrderWorkflow {
	orders: OrderRepository,
	clients: Arc<ClientDirectory>,
	pool: Arc<PoolService>,
	telephony: Arc<TelephonyService>,
	config: OrdersConfig,
}

impl OrderWorkflow {
	pub fn new(
		store: Arc<StoreService>,
		clients: Arc<ClientDirectory>,
		pool: Arc<PoolService>,
		telephony: Arc<TelephonyService>,
		config: OrdersConfig,
	) -> Self {
		Self {
			orders: OrderRepository::new(store),
			clients,
			pool,
			telephony,
			config,
		}
	}

	/// Creates an order for the client and drives it to
	/// `awaiting_confirmation`, or to a terminal failure.
	///
	/// Idempotent per client: while a non-terminal order exists, the same
	/// order is returned and no new allocation is started. That rule is what
	/// sequences workflow steps per client without a lock.
	pub async fn create_order(&self, request: OrderRequest) -> Result<Order, OrderError> {
		let client = self.clients.get_or_create(request.client).await?;

		if let Some(existing) = self.orders.find_active_by_client(&client.client_id).await? {
			info!(
				"returning in-flight order {} for client {}",
				existing.order_id, client.client_id
			);
			return Ok(existing);
		}

		let mut order = Order {
			order_id: Uuid::new_v4().to_string(),
			client_id: client.client_id.clone(),
			status: OrderStatus::Created,
			reservation_token: None,
			proxy_number: None,
			expected_code: None,
			attempt_count: 0,
			created_at: Utc::now(),
		};
		self.orders.append(&order).await?;
		self.advance(&mut order, OrderStatus::Reserving).await?;

		let (entry, token) = match self
			.pool
			.reserve_first_available(&client.residency, request.preferred_class)
			.await
		{
			Ok(reserved) => reserved,
			Err(PoolError::Exhausted) => {
				return self.fail(order, "no number available").await;
			}
			Err(e) => {
				self.mark_failed_best_effort(&order).await;
				return Err(e.into());
			}
		};
		self.orders
			.set_reservation(&order.order_id, &token, &entry.number)
			.await?;
		order.reservation_token = Some(token.clone());
		order.proxy_number = Some(entry.number.clone());

		if let Err(e) = self.telephony.activate_number(&entry.number).await {
			self.release_best_effort(&order).await;
			return self.fail(order, &format!("provider activation: {}", e)).await;
		}
		self.advance(&mut order, OrderStatus::Purchased).await?;

		match self.pool.confirm_assignment(&token, &client.client_id).await {
			Ok(_) => {}
			Err(PoolError::ReservationExpired | PoolError::ReservationStolen) => {
				self.release_best_effort(&order).await;
				return self.fail(order, "reservation lost before assignment").await;
			}
			Err(e) => {
				self.mark_failed_best_effort(&order).await;
				return Err(e.into());
			}
		}

		let code = generate_otp(self.config.otp_length);
		let body = format!(
			"Your confirmation code is {}. Reply with this code to activate your number.",
			code
		);
		if let Err(e) = self
			.telephony
			.send_sms(&entry.number, &client.real_phone, &body)
			.await
		{
			self.release_best_effort(&order).await;
			return self.fail(order, &format!("confirmation sms: {}", e)).await;
		}

		self.orders.set_expected_code(&order.order_id, &code).await?;
		self.advance(&mut order, OrderStatus::AwaitingConfirmation)
			.await?;
		order.expected_code = Some(code);

		info!(
			"order {} awaiting confirmation on {} for client {}",
			order.order_id,
			entry.number.masked(),
			client.client_id
		);
		Ok(order)
	}

	pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderError> {
		self.orders
			.get(order_id)
			.await?
			.ok_or_else(|| OrderError::NotFound(order_id.to_string()))
	}

	/// Expires overdue non-terminal orders and releases their reservations.
	/// Returns how many orders were expired.
	pub async fn expire_stale(&self) -> Result<usize, OrderError> {
		let overdue = self.orders.find_overdue(self.config.max_order_age).await?;
		for order in &overdue {
			warn!(
				"expiring order {} (status {}, created {})",
				order.order_id, order.status, order.created_at
			);
			self.orders
				.set_status(&order.order_id, OrderStatus::Expired)
				.await?;
			self.release_best_effort(order).await;
		}
		Ok(overdue.len())
	}

	/// Buys up to `count` numbers from the provider into the pool. Stops
	/// early when provider inventory runs out; returns how many landed.
	pub async fn stock_pool(
		&self,
		country: &CountryIso,
		class: NumberClass,
		count: u32,
	) -> Result<u32, OrderError> {
		let mut stocked = 0;
		for _ in 0..count {
			let number = match self.telephony.purchase_number(country, class).await {
				Ok(number) => number,
				Err(TelephonyError::Unavailable(reason)) => {
					info!("provider out of {} inventory for {}: {}", class, country, reason);
					break;
				}
				Err(e) => {
					warn!("pool stocking stopped: {}", e);
					break;
				}
			};

			match self
				.pool
				.add_number(PoolEntry::available(number, class, country.clone()))
				.await
			{
				Ok(()) => stocked += 1,
				Err(PoolError::Duplicate(number)) => {
					warn!("provider sold an already-pooled number {}", number);
				}
				Err(e) => return Err(e.into()),
			}
		}
		info!("stocked {} {} numbers for {}", stocked, class, country);
		Ok(stocked)
	}

	async fn advance(&self, order: &mut Order, status: OrderStatus) -> Result<(), OrderError> {
		self.orders.set_status(&order.order_id, status).await?;
		order.status = status;
		Ok(())
	}

	async fn fail(&self, mut order: Order, reason: &str) -> Result<Order, OrderError> {
		warn!("order {} failed: {}", order.order_id, reason);
		self.orders
			.set_status(&order.order_id, OrderStatus::Failed)
			.await?;
		order.status = OrderStatus::Failed;
		Ok(order)
	}

	async fn mark_failed_best_effort(&self, order: &Order) {
		if let Err(e) = self
			.orders
			.set_status(&order.order_id, OrderStatus::Failed)
			.await
		{
			warn!("could not mark order {} failed: {}", order.order_id, e);
		}
	}

	/// Compensating release of the order's reservation. `NotFound` means
	/// someone already reclaimed the row, which is the state we wanted.
	async fn release_best_effort(&self, order: &Order) {
		let Some(token) = &order.reservation_token else {
			return;
		};
		match self.pool.release(token).await {
			Ok(()) | Err(PoolError::NotFound) => {}
			Err(e) => warn!(
				"compensating release failed for order {}: {}",
				order.order_id, e
			),
		}
	}
}

/// Fixed-length numeric confirmation code, zero-padded.
pub(crate) fn generate_otp(length: usize) -> String {
	let max = 10u32.saturating_pow(length as u32);
	let code = rand::thread_rng().gen_range(0..max);
	format!("{:0width$}", code, width = length)
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::Mutex;

	use proxycall_pool::{PoolConfig, PoolFilter};
	use proxycall_store::implementations::memory::MemoryStore;
	use proxycall_store::StoreConfig;
	use proxycall_telephony::{
		CallDirective, MessageReceipt, TelephonyConfig, TelephonyInterface,
	};
	use proxycall_types::{PhoneNumber, PoolStatus};

	type SentLog = Arc<Mutex<Vec<(String, String, String)>>>;

	/// Provider with a fixed inventory, recording sent SMS. Activation can
	/// be scripted to fail.
	struct ScriptedProvider {
		inventory: Mutex<Vec<&'static str>>,
		sent: SentLog,
		fail_activation: bool,
	}

	impl ScriptedProvider {
		fn new(inventory: Vec<&'static str>) -> Self {
			Self {
				inventory: Mutex::new(inventory),
				sent: Arc::new(Mutex::new(Vec::new())),
				fail_activation: false,
			}
		}
	}

	#[async_trait]
	impl TelephonyInterface for ScriptedProvider {
		async fn purchase_number(
			&self,
			_country: &CountryIso,
			class: NumberClass,
		) -> Result<PhoneNumber, TelephonyError> {
			let mut inventory = self.inventory.lock().unwrap();
			match inventory.pop() {
				Some(raw) => Ok(PhoneNumber::parse(raw, "phone").unwrap()),
				None => Err(TelephonyError::Unavailable(format!("no {} left", class))),
			}
		}

		async fn activate_number(&self, _number: &PhoneNumber) -> Result<(), TelephonyError> {
			if self.fail_activation {
				return Err(TelephonyError::Rejected("activation refused".into()));
			}
			Ok(())
		}

		async fn release_number(&self, _number: &PhoneNumber) -> Result<(), TelephonyError> {
			Ok(())
		}

		async fn send_sms(
			&self,
			from: &PhoneNumber,
			to: &PhoneNumber,
			body: &str,
		) -> Result<MessageReceipt, TelephonyError> {
			self.sent.lock().unwrap().push((
				from.as_str().to_string(),
				to.as_str().to_string(),
				body.to_string(),
			));
			Ok(MessageReceipt {
				message_id: "m1".into(),
				accepted_at: Utc::now(),
			})
		}

		fn bridge_call(&self, caller_id: &PhoneNumber, connect_to: &PhoneNumber) -> CallDirective {
			CallDirective::Bridge {
				caller_id: caller_id.clone(),
				connect_to: connect_to.clone(),
			}
		}
	}

	struct Fixture {
		workflow: OrderWorkflow,
		pool: Arc<PoolService>,
		clients: Arc<ClientDirectory>,
		sent: SentLog,
	}

	fn fixture_with(provider: ScriptedProvider, config: OrdersConfig) -> Fixture {
		let store = Arc::new(StoreService::with_config(
			Box::new(MemoryStore::new()),
			StoreConfig {
				min_request_interval: Duration::from_millis(1),
				call_timeout: Duration::from_millis(200),
				max_retry_elapsed: Duration::from_millis(200),
				retry_initial_interval: Duration::from_millis(1),
			},
		));
		let pool = Arc::new(PoolService::with_config(
			store.clone(),
			PoolConfig {
				max_reserve_attempts: 3,
				reservation_ttl: Duration::from_secs(60),
				retry_base_delay: Duration::from_millis(1),
			},
		));
		let clients = Arc::new(ClientDirectory::new(store.clone()));
		let sent = provider.sent.clone();

		let telephony = Arc::new(TelephonyService::with_config(
			Box::new(provider),
			TelephonyConfig {
				call_timeout: Duration::from_millis(200),
				max_retry_elapsed: Duration::from_millis(200),
				retry_initial_interval: Duration::from_millis(1),
			},
		));

		let workflow = OrderWorkflow::new(
			store.clone(),
			clients.clone(),
			pool.clone(),
			telephony,
			config,
		);
		Fixture {
			workflow,
			pool,
			clients,
			sent,
		}
	}

	fn fixture() -> Fixture {
		fixture_with(ScriptedProvider::new(vec![]), OrdersConfig::default())
	}

	fn fr() -> CountryIso {
		CountryIso::parse("FR", "country").unwrap()
	}

	fn request(client_id: &str) -> OrderRequest {
		OrderRequest {
			client: NewClient {
				client_id: client_id.to_string(),
				name: "Ada".to_string(),
				email: "ada@example.com".to_string(),
				real_phone: PhoneNumber::parse("+33601020304", "phone").unwrap(),
				residency: fr(),
			},
			preferred_class: NumberClass::Mobile,
		}
	}

	async fn seed_pool(pool: &PoolService, numbers: &[&str]) {
		for number in numbers {
			pool.add_number(PoolEntry::available(
				PhoneNumber::parse(number, "number").unwrap(),
				NumberClass::Mobile,
				fr(),
			))
			.await
			.unwrap();
		}
	}

	#[tokio::test]
	async fn test_create_order_reaches_awaiting_confirmation() {
		let f = fixture();
		seed_pool(&f.pool, &["+33700000001"]).await;

		let order = f.workflow.create_order(request("c1")).await.unwrap();
		assert_eq!(order.status, OrderStatus::AwaitingConfirmation);
		assert_eq!(order.proxy_number.as_ref().unwrap().as_str(), "+33700000001");

		let code = order.expected_code.unwrap();
		assert_eq!(code.len(), 6);
		assert!(code.chars().all(|c| c.is_ascii_digit()));

		// The OTP went from the proxy to the client's real phone.
		let sent = f.sent.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, "+33700000001");
		assert_eq!(sent[0].1, "+33601020304");
		assert!(sent[0].2.contains(&code));
	}

	#[tokio::test]
	async fn test_create_order_is_idempotent_while_in_flight() {
		let f = fixture();
		seed_pool(&f.pool, &["+33700000001", "+33700000002"]).await;

		let first = f.workflow.create_order(request("c1")).await.unwrap();
		let second = f.workflow.create_order(request("c1")).await.unwrap();
		assert_eq!(first.order_id, second.order_id);

		// Only one number left the pool.
		let assigned = f
			.pool
			.list_pool(&PoolFilter {
				status: Some(PoolStatus::Assigned),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(assigned.len(), 1);
	}

	#[tokio::test]
	async fn test_empty_pool_fails_the_order() {
		let f = fixture();

		let order = f.workflow.create_order(request("c1")).await.unwrap();
		assert_eq!(order.status, OrderStatus::Failed);
	}

	#[tokio::test]
	async fn test_activation_failure_releases_the_reservation() {
		let mut provider = ScriptedProvider::new(vec![]);
		provider.fail_activation = true;
		let f = fixture_with(provider, OrdersConfig::default());
		seed_pool(&f.pool, &["+33700000001"]).await;

		let order = f.workflow.create_order(request("c1")).await.unwrap();
		assert_eq!(order.status, OrderStatus::Failed);

		// Compensation returned the number to the pool.
		let entry = f
			.pool
			.find_by_number(&PhoneNumber::parse("+33700000001", "number").unwrap())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(entry.status, PoolStatus::Available);
		assert!(entry.reservation_token.is_none());
	}

	#[tokio::test]
	async fn test_expire_stale_releases_and_terminates() {
		let f = fixture_with(
			ScriptedProvider::new(vec![]),
			OrdersConfig {
				otp_length: 6,
				max_order_age: Duration::from_millis(0),
			},
		);
		seed_pool(&f.pool, &["+33700000001"]).await;

		let order = f.workflow.create_order(request("c1")).await.unwrap();
		assert_eq!(order.status, OrderStatus::AwaitingConfirmation);

		let expired = f.workflow.expire_stale().await.unwrap();
		assert_eq!(expired, 1);

		let reread = f.workflow.get_order(&order.order_id).await.unwrap();
		assert_eq!(reread.status, OrderStatus::Expired);

		let entry = f
			.pool
			.find_by_number(&PhoneNumber::parse("+33700000001", "number").unwrap())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(entry.status, PoolStatus::Available);
	}

	#[tokio::test]
	async fn test_stock_pool_stops_at_provider_inventory() {
		let f = fixture_with(
			ScriptedProvider::new(vec!["+33700000001", "+33700000002"]),
			OrdersConfig::default(),
		);

		let stocked = f
			.workflow
			.stock_pool(&fr(), NumberClass::Mobile, 5)
			.await
			.unwrap();
		assert_eq!(stocked, 2);

		let available = f.pool.list_pool(&PoolFilter::default()).await.unwrap();
		assert_eq!(available.len(), 2);
	}

	#[tokio::test]
	async fn test_get_order_unknown_id() {
		let f = fixture();
		let err = f.workflow.get_order("nope").await.unwrap_err();
		assert!(matches!(err, OrderError::NotFound(_)));
	}

	#[test]
	fn test_otp_is_zero_padded() {
		for _ in 0..50 {
			let code = generate_otp(6);
			assert_eq!(code.len(), 6);
			assert!(code.chars().all(|c| c.is_ascii_digit()));
		}
		assert_eq!(generate_otp(4).len(), 4);
	}

	#[tokio::test]
	async fn test_clients_reachable_through_directory() {
		let f = fixture();
		seed_pool(&f.pool, &["+33700000001"]).await;
		f.workflow.create_order(request("c1")).await.unwrap();

		let client = f.clients.find_by_id("c1").await.unwrap().unwrap();
		assert_eq!(client.country_code, "+33");
	}
}
