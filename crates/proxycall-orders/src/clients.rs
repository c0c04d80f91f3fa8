//! Client directory over the row store.
//!
//! `client_id` is the caller-supplied idempotency key; creating an existing
//! client returns the stored record unchanged rather than overwriting it.

use std::sync::Arc;
use tracing::{info, warn};

use proxycall_store::{Row, StoreError, StoreService};
use proxycall_types::{Client, CountryIso, PhoneNumber};

pub const CLIENTS_TABLE: &str = "clients";

const COL_CLIENT_ID: &str = "client_id";
const COL_NAME: &str = "name";
const COL_EMAIL: &str = "email";
const COL_REAL_PHONE: &str = "real_phone";
const COL_PROXY_NUMBER: &str = "proxy_number";
const COL_RESIDENCY: &str = "residency";
const COL_COUNTRY_CODE: &str = "country_code";
const COL_LAST_CALLER: &str = "last_caller";

/// Validated input for client creation.
#[derive(Debug, Clone)]
pub struct NewClient {
	pub client_id: String,
	pub name: String,
	pub email: String,
	pub real_phone: PhoneNumber,
	pub residency: CountryIso,
}

/// Client lookup and upsert over the store.
pub struct ClientDirectory {
	store: Arc<StoreService>,
}

impl ClientDirectory {
	pub fn new(store: Arc<StoreService>) -> Self {
		Self { store }
	}

	/// Returns the stored client for `client_id`, creating it from `new`
	/// when absent. An existing record wins over the submitted attributes.
	pub async fn get_or_create(&self, new: NewClient) -> Result<Client, StoreError> {
		if let Some(existing) = self.find_by_id(&new.client_id).await? {
			return Ok(existing);
		}

		let client = Client {
			country_code: new.real_phone.country_code().to_string(),
			client_id: new.client_id,
			name: new.name,
			email: new.email,
			real_phone: new.real_phone,
			proxy_number: None,
			residency: new.residency,
			last_caller: None,
		};
		self.store.append_row(CLIENTS_TABLE, encode(&client)).await?;
		info!("created client {}", client.client_id);
		Ok(client)
	}

	pub async fn find_by_id(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
		Ok(self
			.read_clients()
			.await?
			.into_iter()
			.find(|c| c.client_id == client_id))
	}

	/// Looks up the client a proxy number is attached to.
	pub async fn find_by_proxy(&self, proxy: &PhoneNumber) -> Result<Option<Client>, StoreError> {
		Ok(self
			.read_clients()
			.await?
			.into_iter()
			.find(|c| c.proxy_number.as_ref() == Some(proxy)))
	}

	/// Attaches a confirmed proxy number to the client.
	pub async fn attach_proxy(
		&self,
		client_id: &str,
		proxy: &PhoneNumber,
	) -> Result<(), StoreError> {
		self.store
			.write_cell(CLIENTS_TABLE, client_id, COL_PROXY_NUMBER, proxy.as_str())
			.await?;
		info!("attached proxy {} to client {}", proxy.masked(), client_id);
		Ok(())
	}

	/// Records the last correspondent seen on the client's proxy.
	pub async fn record_last_caller(
		&self,
		client_id: &str,
		caller: &PhoneNumber,
	) -> Result<(), StoreError> {
		self.store
			.write_cell(CLIENTS_TABLE, client_id, COL_LAST_CALLER, caller.as_str())
			.await
	}

	async fn read_clients(&self) -> Result<Vec<Client>, StoreError> {
		let rows = self.store.read_all_rows(CLIENTS_TABLE).await?;
		let mut clients = Vec::with_capacity(rows.len());
		for row in &rows {
			match decode(row) {
				Ok(client) => clients.push(client),
				Err(e) => warn!("skipping corrupt client row '{}': {}", row.key, e),
			}
		}
		Ok(clients)
	}
}

fn encode(client: &Client) -> Row {
	let mut row = Row::new(client.client_id.as_str())
		.with_cell(COL_CLIENT_ID, client.client_id.as_str())
		.with_cell(COL_NAME, client.name.as_str())
		.with_cell(COL_EMAIL, client.email.as_str())
		.with_cell(COL_REAL_PHONE, client.real_phone.as_str())
		.with_cell(COL_RESIDENCY, client.residency.as_str())
		.with_cell(COL_COUNTRY_CODE, client.country_code.as_str());
	if let Some(proxy) = &client.proxy_number {
		row.set(COL_PROXY_NUMBER, proxy.as_str());
	}
	if let Some(caller) = &client.last_caller {
		row.set(COL_LAST_CALLER, caller.as_str());
	}
	row
}

fn decode(row: &Row) -> Result<Client, StoreError> {
	let real_phone = PhoneNumber::parse(row.require(COL_REAL_PHONE)?, "real_phone")
		.map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let residency = CountryIso::parse(row.require(COL_RESIDENCY)?, "residency")
		.map_err(|e| StoreError::Corrupt(e.to_string()))?;

	Ok(Client {
		client_id: row.require(COL_CLIENT_ID)?.to_string(),
		name: row.require(COL_NAME)?.to_string(),
		email: row.require(COL_EMAIL)?.to_string(),
		real_phone,
		proxy_number: row
			.get(COL_PROXY_NUMBER)
			.and_then(|v| PhoneNumber::parse(v, "proxy_number").ok()),
		residency,
		country_code: row.require(COL_COUNTRY_CODE)?.to_string(),
		last_caller: row
			.get(COL_LAST_CALLER)
			.and_then(|v| PhoneNumber::parse(v, "last_caller").ok()),
	})
}
