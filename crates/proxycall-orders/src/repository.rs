//! Order persistence over the row store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use proxycall_store::{Row, StoreError, StoreService};
use proxycall_types::{Order, OrderStatus, PhoneNumber, ReservationToken};

pub const ORDERS_TABLE: &str = "orders";

const COL_ORDER_ID: &str = "order_id";
const COL_CLIENT_ID: &str = "client_id";
const COL_STATUS: &str = "status";
const COL_TOKEN: &str = "reservation_token";
const COL_PROXY_NUMBER: &str = "proxy_number";
const COL_EXPECTED_CODE: &str = "expected_code";
const COL_ATTEMPT_COUNT: &str = "attempt_count";
const COL_CREATED_AT: &str = "created_at";

/// Typed access to the orders table.
pub struct OrderRepository {
	store: Arc<StoreService>,
}

impl OrderRepository {
	pub fn new(store: Arc<StoreService>) -> Self {
		Self { store }
	}

	pub async fn append(&self, order: &Order) -> Result<(), StoreError> {
		self.store.append_row(ORDERS_TABLE, encode(order)).await
	}

	pub async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
		Ok(self
			.read_orders()
			.await?
			.into_iter()
			.find(|o| o.order_id == order_id))
	}

	pub async fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
		self.store
			.write_cell(ORDERS_TABLE, order_id, COL_STATUS, status.as_str())
			.await
	}

	pub async fn set_reservation(
		&self,
		order_id: &str,
		token: &ReservationToken,
		proxy: &PhoneNumber,
	) -> Result<(), StoreError> {
		self.store
			.write_cell(ORDERS_TABLE, order_id, COL_TOKEN, &token.to_string())
			.await?;
		self.store
			.write_cell(ORDERS_TABLE, order_id, COL_PROXY_NUMBER, proxy.as_str())
			.await
	}

	pub async fn set_expected_code(&self, order_id: &str, code: &str) -> Result<(), StoreError> {
		self.store
			.write_cell(ORDERS_TABLE, order_id, COL_EXPECTED_CODE, code)
			.await
	}

	pub async fn set_attempt_count(&self, order_id: &str, count: u32) -> Result<(), StoreError> {
		self.store
			.write_cell(ORDERS_TABLE, order_id, COL_ATTEMPT_COUNT, &count.to_string())
			.await
	}

	/// The client's in-flight order, if any. At most one exists; orders are
	/// appended only after this check comes back empty.
	pub async fn find_active_by_client(&self, client_id: &str) -> Result<Option<Order>, StoreError> {
		Ok(self
			.read_orders()
			.await?
			.into_iter()
			.find(|o| o.client_id == client_id && !o.status.is_terminal()))
	}

	/// The order waiting on a code from this proxy number, if any.
	pub async fn find_awaiting_by_proxy(
		&self,
		proxy: &PhoneNumber,
	) -> Result<Option<Order>, StoreError> {
		Ok(self.read_orders().await?.into_iter().find(|o| {
			o.status == OrderStatus::AwaitingConfirmation && o.proxy_number.as_ref() == Some(proxy)
		}))
	}

	/// Non-terminal orders older than `max_age`.
	pub async fn find_overdue(&self, max_age: Duration) -> Result<Vec<Order>, StoreError> {
		let cutoff = Utc::now()
			- chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(600));
		Ok(self
			.read_orders()
			.await?
			.into_iter()
			.filter(|o| !o.status.is_terminal() && o.created_at < cutoff)
			.collect())
	}

	async fn read_orders(&self) -> Result<Vec<Order>, StoreError> {
		let rows = self.store.read_all_rows(ORDERS_TABLE).await?;
		let mut orders = Vec::with_capacity(rows.len());
		for row in &rows {
			match decode(row) {
				Ok(order) => orders.push(order),
				Err(e) => warn!("skipping corrupt order row '{}': {}", row.key, e),
			}
		}
		Ok(orders)
	}
}

fn encode(order: &Order) -> Row {
	let mut row = Row::new(order.order_id.as_str())
		.with_cell(COL_ORDER_ID, order.order_id.as_str())
		.with_cell(COL_CLIENT_ID, order.client_id.as_str())
		.with_cell(COL_STATUS, order.status.as_str())
		.with_cell(COL_ATTEMPT_COUNT, order.attempt_count.to_string())
		.with_cell(COL_CREATED_AT, order.created_at.to_rfc3339());
	if let Some(token) = &order.reservation_token {
		row.set(COL_TOKEN, token.to_string());
	}
	if let Some(proxy) = &order.proxy_number {
		row.set(COL_PROXY_NUMBER, proxy.as_str());
	}
	if let Some(code) = &order.expected_code {
		row.set(COL_EXPECTED_CODE, code.as_str());
	}
	row
}

fn decode(row: &Row) -> Result<Order, StoreError> {
	let status = OrderStatus::parse(row.require(COL_STATUS)?)
		.ok_or_else(|| StoreError::Corrupt(format!("bad status in row '{}'", row.key)))?;
	let created_at = parse_timestamp(row.require(COL_CREATED_AT)?)
		.ok_or_else(|| StoreError::Corrupt(format!("bad created_at in row '{}'", row.key)))?;
	let attempt_count = row
		.get(COL_ATTEMPT_COUNT)
		.and_then(|v| v.trim().parse().ok())
		.unwrap_or(0);

	Ok(Order {
		order_id: row.require(COL_ORDER_ID)?.to_string(),
		client_id: row.require(COL_CLIENT_ID)?.to_string(),
		status,
		reservation_token: row.get(COL_TOKEN).and_then(ReservationToken::parse),
		proxy_number: row
			.get(COL_PROXY_NUMBER)
			.and_then(|v| PhoneNumber::parse(v, "proxy_number").ok()),
		expected_code: row.get(COL_EXPECTED_CODE).map(str::to_string),
		attempt_count,
		created_at,
	})
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(raw.trim())
		.ok()
		.map(|t| t.with_timezone(&Utc))
}
