//! Confirmation attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of matching one inbound body against an order's expected code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptResult {
	Matched,
	Mismatched,
	Unparseable,
}

impl AttemptResult {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Matched => "matched",
			Self::Mismatched => "mismatched",
			Self::Unparseable => "unparseable",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"matched" => Some(Self::Matched),
			"mismatched" => Some(Self::Mismatched),
			"unparseable" => Some(Self::Unparseable),
			_ => None,
		}
	}
}

impl fmt::Display for AttemptResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Audit record of one code submission, appended regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationAttempt {
	pub order_id: String,
	pub expected_code: String,
	/// Raw inbound text as received from the provider.
	pub received_body: String,
	pub extracted_code: Option<String>,
	pub result: AttemptResult,
	pub timestamp: DateTime<Utc>,
}
