//! HTTP provider implementation.
//!
//! Talks to the telephony provider's REST API. Endpoint shapes follow the
//! usual account-scoped layout: numbers are purchased and configured under
//! `/accounts/{account}/numbers`, messages under `/accounts/{account}/messages`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{CallDirective, MessageReceipt, TelephonyError, TelephonyInterface};
use proxycall_types::{CountryIso, NumberClass, PhoneNumber};

/// Configuration for the HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
	pub base_url: String,
	pub account_id: String,
	pub auth_token: String,
	/// Webhook URLs registered on every activated number.
	pub voice_webhook_url: String,
	pub sms_webhook_url: String,
}

/// Provider client over the vendor REST API.
pub struct HttpProvider {
	client: reqwest::Client,
	config: HttpProviderConfig,
}

#[derive(Deserialize)]
struct NumberResponse {
	phone_number: String,
}

#[derive(Deserialize)]
struct MessageResponse {
	message_id: String,
}

impl HttpProvider {
	pub fn new(config: HttpProviderConfig) -> Self {
		Self {
			client: reqwest::Client::new(),
			config,
		}
	}

	fn account_url(&self, path: &str) -> String {
		format!(
			"{}/accounts/{}/{}",
			self.config.base_url.trim_end_matches('/'),
			self.config.account_id,
			path
		)
	}

	/// Maps an HTTP outcome onto the provider error taxonomy: 4xx is a
	/// definitive rejection, everything else transient.
	async fn check(response: reqwest::Response) -> Result<reqwest::Response, TelephonyError> {
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		let body = response.text().await.unwrap_or_default();
		if status.is_client_error() {
			Err(TelephonyError::Rejected(format!("{}: {}", status, body)))
		} else {
			Err(TelephonyError::Provider(format!("{}: {}", status, body)))
		}
	}
}

#[async_trait]
impl TelephonyInterface for HttpProvider {
	async fn purchase_number(
		&self,
		country: &CountryIso,
		class: NumberClass,
	) -> Result<PhoneNumber, TelephonyError> {
		debug!("purchasing {} number for {}", class, country);

		let response = self
			.client
			.post(self.account_url("numbers"))
			.bearer_auth(&self.config.auth_token)
			.json(&serde_json::json!({
				"country": country.as_str(),
				"class": class.as_str(),
			}))
			.send()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(TelephonyError::Unavailable(format!(
				"no {} inventory for {}",
				class, country
			)));
		}

		let purchased: NumberResponse = Self::check(response)
			.await?
			.json()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		let number = PhoneNumber::parse(&purchased.phone_number, "phone_number")
			.map_err(|e| TelephonyError::Rejected(format!("provider returned bad number: {}", e)))?;
		info!("purchased number {}", number.masked());
		Ok(number)
	}

	async fn activate_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError> {
		debug!("activating number {}", number.masked());

		let response = self
			.client
			.post(self.account_url(&format!("numbers/{}/webhooks", number.as_str())))
			.bearer_auth(&self.config.auth_token)
			.json(&serde_json::json!({
				"voice_url": self.config.voice_webhook_url,
				"sms_url": self.config.sms_webhook_url,
			}))
			.send()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		Self::check(response).await?;
		Ok(())
	}

	async fn release_number(&self, number: &PhoneNumber) -> Result<(), TelephonyError> {
		let response = self
			.client
			.delete(self.account_url(&format!("numbers/{}", number.as_str())))
			.bearer_auth(&self.config.auth_token)
			.send()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		// Releasing an already-released number is fine.
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(());
		}
		Self::check(response).await?;
		info!("released number {}", number.masked());
		Ok(())
	}

	async fn send_sms(
		&self,
		from: &PhoneNumber,
		to: &PhoneNumber,
		body: &str,
	) -> Result<MessageReceipt, TelephonyError> {
		let response = self
			.client
			.post(self.account_url("messages"))
			.bearer_auth(&self.config.auth_token)
			.json(&serde_json::json!({
				"from": from.as_str(),
				"to": to.as_str(),
				"body": body,
			}))
			.send()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		let message: MessageResponse = Self::check(response)
			.await?
			.json()
			.await
			.map_err(|e| TelephonyError::Provider(e.to_string()))?;

		debug!("sms accepted for {}", to.masked());
		Ok(MessageReceipt {
			message_id: message.message_id,
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
