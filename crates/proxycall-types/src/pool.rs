//! Pool entry types.
//!
//! A pool entry is one allocatable proxy number together with its
//! allocation status and, while a reservation is in flight, the token
//! proving temporary ownership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{CountryIso, PhoneNumber, ValidationError};

/// Class of a pool number. `national` parses as an alias of `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberClass {
	Mobile,
	Local,
}

impl NumberClass {
	pub fn parse(raw: &str, field: &'static str) -> Result<Self, ValidationError> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"mobile" => Ok(Self::Mobile),
			"local" | "national" => Ok(Self::Local),
			_ => Err(ValidationError::invalid(
				field,
				"invalid class (expected: mobile/local/national)",
				raw,
			)),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::Mobile => "mobile",
			Self::Local => "local",
		}
	}
}

impl fmt::Display for NumberClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Allocation status of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
	Available,
	Reserving,
	Reserved,
	Assigned,
	Releasing,
}

impl PoolStatus {
	pub fn parse(raw: &str) -> Option<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"available" => Some(Self::Available),
			"reserving" => Some(Self::Reserving),
			"reserved" => Some(Self::Reserved),
			"assigned" => Some(Self::Assigned),
			"releasing" => Some(Self::Releasing),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::Available => "available",
			Self::Reserving => "reserving",
			Self::Reserved => "reserved",
			Self::Assigned => "assigned",
			Self::Releasing => "releasing",
		}
	}
}

impl fmt::Display for PoolStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Opaque proof of temporary ownership of a pool entry. Globally unique;
/// valid only for the entry that issued it and only until its TTL elapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationToken(Uuid);

impl ReservationToken {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn parse(raw: &str) -> Option<Self> {
		Uuid::parse_str(raw.trim()).ok().map(Self)
	}
}

impl fmt::Display for ReservationToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One allocatable proxy number with its allocation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
	pub number: PhoneNumber,
	pub class: NumberClass,
	pub country: CountryIso,
	pub status: PoolStatus,
	/// Present only while a reservation or assignment holds the row.
	pub reservation_token: Option<ReservationToken>,
	pub reserved_at: Option<DateTime<Utc>>,
	/// Client the row is currently bound to, once assigned.
	pub reserved_client_id: Option<String>,
	pub purchased_at: Option<DateTime<Utc>>,
	/// Display label of the client the number was attributed to.
	pub assigned_to: Option<String>,
}

impl PoolEntry {
	/// A fresh, unreserved entry as appended when a number is purchased
	/// into the pool.
	pub fn available(number: PhoneNumber, class: NumberClass, country: CountryIso) -> Self {
		Self {
			number,
			class,
			country,
			status: PoolStatus::Available,
			reservation_token: None,
			reserved_at: None,
			reserved_client_id: None,
			purchased_at: Some(Utc::now()),
			assigned_to: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_number_class_aliases() {
		assert_eq!(
			NumberClass::parse("national", "class").unwrap(),
			NumberClass::Local
		);
		assert_eq!(
			NumberClass::parse("MOBILE", "class").unwrap(),
			NumberClass::Mobile
		);
		assert!(NumberClass::parse("satellite", "class").is_err());
	}

	#[test]
	fn test_reservation_token_roundtrip() {
		let token = ReservationToken::new();
		let other = ReservationToken::new();
		assert_ne!(token, other);
		assert_eq!(ReservationToken::parse(&token.to_string()), Some(token));
		assert_eq!(ReservationToken::parse("not-a-token"), None);
	}
}
