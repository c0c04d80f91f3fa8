//! Row codec for pool entries.
//!
//! The pool table is keyed by the phone number itself, which is exactly
//! the uniqueness invariant the data model demands.

use chrono::{DateTime, Utc};

use proxycall_store::{Row, StoreError};
use proxycall_types::{
	CountryIso, NumberClass, PhoneNumber, PoolEntry, PoolStatus, ReservationToken,
};

pub const POOL_TABLE: &str = "pool";

pub(crate) const COL_COUNTRY: &str = "country";
pub(crate) const COL_NUMBER: &str = "number";
pub(crate) const COL_STATUS: &str = "status";
pub(crate) const COL_CLASS: &str = "class";
pub(crate) const COL_PURCHASED_AT: &str = "purchased_at";
pub(crate) const COL_ASSIGNED_AT: &str = "assigned_at";
pub(crate) const COL_ASSIGNED_TO: &str = "assigned_to";
pub(crate) const COL_TOKEN: &str = "reservation_token";
pub(crate) const COL_RESERVED_AT: &str = "reserved_at";
pub(crate) const COL_RESERVED_CLIENT: &str = "reserved_client_id";

pub(crate) fn encode(entry: &PoolEntry) -> Row {
	let mut row = Row::new(entry.number.as_str())
		.with_cell(COL_COUNTRY, entry.country.as_str())
		.with_cell(COL_NUMBER, entry.number.as_str())
		.with_cell(COL_STATUS, entry.status.as_str())
		.with_cell(COL_CLASS, entry.class.as_str());

	if let Some(at) = entry.purchased_at {
		row.set(COL_PURCHASED_AT, at.to_rfc3339());
	}
	if let Some(token) = &entry.reservation_token {
		row.set(COL_TOKEN, token.to_string());
	}
	if let Some(at) = entry.reserved_at {
		row.set(COL_RESERVED_AT, at.to_rfc3339());
	}
	if let Some(client) = &entry.reserved_client_id {
		row.set(COL_RESERVED_CLIENT, client.as_str());
	}
	if let Some(name) = &entry.assigned_to {
		row.set(COL_ASSIGNED_TO, name.as_str());
	}
	row
}

pub(crate) fn decode(row: &Row) -> Result<PoolEntry, StoreError> {
	let number = PhoneNumber::parse(row.require(COL_NUMBER)?, "number")
		.map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let country = CountryIso::parse(row.require(COL_COUNTRY)?, "country")
		.map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let class = NumberClass::parse(row.require(COL_CLASS)?, "class")
		.map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let status = row
		.require(COL_STATUS)
		.ok()
		.and_then(PoolStatus::parse)
		.ok_or_else(|| StoreError::Corrupt(format!("bad status in row '{}'", row.key)))?;

	Ok(PoolEntry {
		number,
		class,
		country,
		status,
		reservation_token: row.get(COL_TOKEN).and_then(ReservationToken::parse),
		reserved_at: row.get(COL_RESERVED_AT).and_then(parse_timestamp),
		reserved_client_id: row.get(COL_RESERVED_CLIENT).map(str::to_string),
		purchased_at: row.get(COL_PURCHASED_AT).and_then(parse_timestamp),
		assigned_to: row.get(COL_ASSIGNED_TO).map(str::to_string),
	})
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(raw.trim())
		.ok()
		.map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_encode_decode_roundtrip() {
		let entry = PoolEntry::available(
			PhoneNumber::parse("+33900000001", "number").unwrap(),
			NumberClass::Mobile,
			CountryIso::parse("FR", "country").unwrap(),
		);

		let decoded = decode(&encode(&entry)).unwrap();
		assert_eq!(decoded.number, entry.number);
		assert_eq!(decoded.status, PoolStatus::Available);
		assert_eq!(decoded.class, NumberClass::Mobile);
		assert!(decoded.reservation_token.is_none());
	}

	#[test]
	fn test_decode_rejects_bad_rows() {
		let row = Row::new("+33900000001")
			.with_cell(COL_NUMBER, "+33900000001")
			.with_cell(COL_COUNTRY, "FR")
			.with_cell(COL_CLASS, "mobile")
			.with_cell(COL_STATUS, "garbage");
		assert!(matches!(decode(&row), Err(StoreError::Corrupt(_))));
	}
}
