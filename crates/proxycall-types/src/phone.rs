//! Phone number and country validation.
//!
//! E.164 handling is strict on purpose: a number that reaches the pool or a
//! client record in a sloppy format will silently fail to match during
//! routing lookups, so everything is normalized at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while validating caller-supplied fields.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("{field}: value missing")]
	Missing { field: &'static str },
	#[error("{field}: {message} (value={value:?})")]
	Invalid {
		field: &'static str,
		message: String,
		value: String,
	},
}

impl ValidationError {
	pub fn invalid(
		field: &'static str,
		message: impl Into<String>,
		value: impl Into<String>,
	) -> Self {
		Self::Invalid {
			field,
			message: message.into(),
			value: value.into(),
		}
	}
}

/// A strict E.164 phone number: `+` followed by 8 to 15 digits, the first
/// of which is non-zero.
///
/// Parsing normalizes two common variants when the result is valid E.164:
/// a `00` international prefix and a bare digit string missing the `+`.
/// Separators (spaces, dashes, dots, parentheses) are rejected outright
/// rather than stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

const PHONE_SEPARATORS: &[char] = &[' ', '-', '(', ')', '.', '/', '\\'];

fn is_strict_e164(s: &str) -> bool {
	let Some(rest) = s.strip_prefix('+') else {
		return false;
	};
	(8..=15).contains(&rest.len())
		&& rest.chars().all(|c| c.is_ascii_digit())
		&& !rest.starts_with('0')
}

impl PhoneNumber {
	pub fn parse(raw: &str, field: &'static str) -> Result<Self, ValidationError> {
		let trimmed = raw.trim();
		if trimmed.is_empty() {
			return Err(ValidationError::Missing { field });
		}
		if trimmed.contains(PHONE_SEPARATORS) {
			return Err(ValidationError::invalid(
				field,
				"strict E.164 required, without separators (e.g. +33601020304)",
				raw,
			));
		}

		let mut normalized = trimmed.to_string();
		if let Some(rest) = trimmed.strip_prefix("00") {
			normalized = format!("+{}", rest);
		} else if !trimmed.starts_with('+') && trimmed.chars().all(|c| c.is_ascii_digit()) {
			normalized = format!("+{}", trimmed);
		}

		if !is_strict_e164(&normalized) {
			return Err(ValidationError::invalid(
				field,
				"strict E.164 required (e.g. +33601020304)",
				raw,
			));
		}
		Ok(Self(normalized))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The calling-code prefix used for routing policy: `+` plus the first
	/// two digits (`+33`, `+49`). Deliberately fixed-width; variable-length
	/// calling codes are out of scope for the routing policy.
	pub fn country_code(&self) -> &str {
		&self.0[..3]
	}

	/// Masked rendering for logs: only the last four digits survive.
	pub fn masked(&self) -> String {
		let digits = &self.0[1..];
		let tail = &digits[digits.len().saturating_sub(4)..];
		format!("****{}", tail)
	}
}

impl fmt::Display for PhoneNumber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Two-letter ISO country code, uppercased (`FR`, `US`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryIso(String);

impl CountryIso {
	pub fn parse(raw: &str, field: &'static str) -> Result<Self, ValidationError> {
		let trimmed = raw.trim();
		if trimmed.is_empty() {
			return Err(ValidationError::Missing { field });
		}
		let upper = trimmed.to_ascii_uppercase();
		if upper.len() != 2 || !upper.bytes().all(|b| b.is_ascii_uppercase()) {
			return Err(ValidationError::invalid(
				field,
				"invalid ISO country (e.g. FR, US)",
				raw,
			));
		}
		Ok(Self(upper))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CountryIso {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Strict email check: one `@`, no whitespace, dotted domain, bounded length.
pub fn email_strict(raw: &str, field: &'static str) -> Result<String, ValidationError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(ValidationError::Missing { field });
	}
	if trimmed.len() > 254 {
		return Err(ValidationError::invalid(field, "email too long", raw));
	}
	let mut parts = trimmed.splitn(2, '@');
	let local = parts.next().unwrap_or("");
	let domain = parts.next().unwrap_or("");
	let ok = !local.is_empty()
		&& !domain.is_empty()
		&& !domain.contains('@')
		&& domain.contains('.')
		&& !domain.starts_with('.')
		&& !domain.ends_with('.')
		&& !trimmed.chars().any(char::is_whitespace);
	if !ok {
		return Err(ValidationError::invalid(field, "invalid email", raw));
	}
	Ok(trimmed.to_ascii_lowercase())
}

/// Display-name check: non-empty, bounded, no control characters.
pub fn name_strict(raw: &str, field: &'static str) -> Result<String, ValidationError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(ValidationError::Missing { field });
	}
	if trimmed.len() > 120 {
		return Err(ValidationError::invalid(field, "too long (max 120)", raw));
	}
	if trimmed.chars().any(char::is_control) {
		return Err(ValidationError::invalid(
			field,
			"contains control characters",
			raw,
		));
	}
	Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_e164_accepts_and_normalizes() {
		let n = PhoneNumber::parse("+33601020304", "phone").unwrap();
		assert_eq!(n.as_str(), "+33601020304");
		assert_eq!(n.country_code(), "+33");

		// 00 prefix and bare digits normalize when the result is valid
		let n = PhoneNumber::parse("0033601020304", "phone").unwrap();
		assert_eq!(n.as_str(), "+33601020304");
		let n = PhoneNumber::parse("33601020304", "phone").unwrap();
		assert_eq!(n.as_str(), "+33601020304");
	}

	#[test]
	fn test_e164_rejects_separators_and_bad_shapes() {
		assert!(PhoneNumber::parse("+33 6 01 02 03 04", "phone").is_err());
		assert!(PhoneNumber::parse("+33-601020304", "phone").is_err());
		assert!(PhoneNumber::parse("+0601020304", "phone").is_err());
		assert!(PhoneNumber::parse("+336", "phone").is_err());
		assert!(PhoneNumber::parse("", "phone").is_err());
		assert!(PhoneNumber::parse("+3360102030412345", "phone").is_err());
	}

	#[test]
	fn test_masking_keeps_last_four() {
		let n = PhoneNumber::parse("+33601020304", "phone").unwrap();
		assert_eq!(n.masked(), "****0304");
	}

	#[test]
	fn test_country_iso() {
		assert_eq!(CountryIso::parse("fr", "country").unwrap().as_str(), "FR");
		assert!(CountryIso::parse("FRA", "country").is_err());
		assert!(CountryIso::parse("1X", "country").is_err());
	}

	#[test]
	fn test_email_strict() {
		assert_eq!(
			email_strict("User@Example.COM", "mail").unwrap(),
			"user@example.com"
		);
		assert!(email_strict("no-at-sign.example.com", "mail").is_err());
		assert!(email_strict("two@@example.com", "mail").is_err());
		assert!(email_strict("spaces in@example.com", "mail").is_err());
		assert!(email_strict("user@nodot", "mail").is_err());
	}
}
