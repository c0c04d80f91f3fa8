//! Order workflow types.
//!
//! An order tracks one attempt to allocate a proxy number to a client,
//! from creation through reservation, provider acquisition and OTP
//! confirmation to a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PhoneNumber, ReservationToken};

/// Workflow state of an order.
///
/// `Confirmed` is the only terminal success; `Failed` and `Expired` are
/// terminal failures reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	Created,
	Reserving,
	Purchased,
	AwaitingConfirmation,
	Confirmed,
	Failed,
	Expired,
}

impl OrderStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Confirmed | Self::Failed | Self::Expired)
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"created" => Some(Self::Created),
			"reserving" => Some(Self::Reserving),
			"purchased" => Some(Self::Purchased),
			"awaiting_confirmation" => Some(Self::AwaitingConfirmation),
			"confirmed" => Some(Self::Confirmed),
			"failed" => Some(Self::Failed),
			"expired" => Some(Self::Expired),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Self::Created => "created",
			Self::Reserving => "reserving",
			Self::Purchased => "purchased",
			Self::AwaitingConfirmation => "awaiting_confirmation",
			Self::Confirmed => "confirmed",
			Self::Failed => "failed",
			Self::Expired => "expired",
		}
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One allocation order. At most one non-terminal order exists per client
/// at a time; that rule, not a lock, sequences workflow steps per client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
	pub order_id: String,
	pub client_id: String,
	pub status: OrderStatus,
	pub reservation_token: Option<ReservationToken>,
	/// The reserved proxy, once the pool granted one.
	pub proxy_number: Option<PhoneNumber>,
	/// The OTP the client must echo back, once sent.
	pub expected_code: Option<String>,
	pub attempt_count: u32,
	pub created_at: DateTime<Utc>,
}
