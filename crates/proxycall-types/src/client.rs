//! Client records.

use serde::{Deserialize, Serialize};

use crate::{CountryIso, PhoneNumber};

/// A client of the proxy service.
///
/// `client_id` is supplied by the caller and acts as the idempotency key
/// for client creation. `proxy_number`, once set, is unique across all
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
	pub client_id: String,
	pub name: String,
	pub email: String,
	pub real_phone: PhoneNumber,
	/// Pool number exposed publicly instead of `real_phone`; attached only
	/// once the order confirming this client completes.
	pub proxy_number: Option<PhoneNumber>,
	pub residency: CountryIso,
	/// Calling-code prefix used by the routing policy (e.g. `+33`).
	pub country_code: String,
	/// Last correspondent seen on the proxy, recorded best-effort by the
	/// routing side effect and used for SMS reply relay.
	pub last_caller: Option<PhoneNumber>,
}
