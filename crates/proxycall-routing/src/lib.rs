//! Routing decisions for inbound traffic on proxy numbers.
//!
//! A call or message arriving on a proxy is forwarded to the owning
//! client's real number only when the correspondent's calling-code prefix
//! matches the client's. Recording the last correspondent is a side effect
//! and must never delay or fail the verdict; the SMS reply relay reads it
//! back to let the client answer the last person who wrote in.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use proxycall_orders::ClientDirectory;
use proxycall_store::StoreError;
use proxycall_telephony::{TelephonyError, TelephonyService};
use proxycall_types::{Client, PhoneNumber};

/// Errors that can occur during routing operations.
#[derive(Debug, Error)]
pub enum RoutingError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Telephony(#[from] TelephonyError),
}

/// Why inbound traffic was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
	/// The dialed number is not attached to any client.
	UnknownProxy,
	/// The correspondent's calling code differs from the client's.
	CountryMismatch,
}

impl BlockReason {
	pub fn as_str(&self) -> &str {
		match self {
			Self::UnknownProxy => "unknown_proxy",
			Self::CountryMismatch => "country_mismatch",
		}
	}
}

/// Verdict for an inbound call on a proxy number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingVerdict {
	/// Bridge the caller through to the client's real number.
	Forward(PhoneNumber),
	Block(BlockReason),
}

/// Outcome of routing an inbound SMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsRouting {
	/// The message was relayed to `to`.
	Relayed { to: PhoneNumber },
	/// The client replied but nobody has written in yet.
	NoRecentCorrespondent,
	Blocked(BlockReason),
}

/// The routing decision service.
pub struct RoutingService {
	clients: Arc<ClientDirectory>,
	telephony: Arc<TelephonyService>,
}

impl RoutingService {
	pub fn new(clients: Arc<ClientDirectory>, telephony: Arc<TelephonyService>) -> Self {
		Self { clients, telephony }
	}

	/// Decides what to do with an inbound call from `caller` on `proxy`.
	///
	/// On a forward, the caller is recorded as the proxy's last
	/// correspondent on a spawned task; the verdict never waits for it.
	pub async fn decide(
		&self,
		proxy: &PhoneNumber,
		caller: &PhoneNumber,
	) -> Result<RoutingVerdict, RoutingError> {
		let Some(client) = self.clients.find_by_proxy(proxy).await? else {
			info!("blocking call on unattached proxy {}", proxy.masked());
			return Ok(RoutingVerdict::Block(BlockReason::UnknownProxy));
		};

		if caller.country_code() != client.country_code {
			info!(
				"blocking call from {} on {} (client prefix {})",
				caller.masked(),
				proxy.masked(),
				client.country_code
			);
			return Ok(RoutingVerdict::Block(BlockReason::CountryMismatch));
		}

		self.record_last_caller(&client, caller);
		debug!(
			"forwarding call from {} on {} to client {}",
			caller.masked(),
			proxy.masked(),
			client.client_id
		);
		Ok(RoutingVerdict::Forward(client.real_phone))
	}

	/// Routes an inbound SMS on `proxy`.
	///
	/// A message from the client is a reply: it is relayed to the last
	/// recorded correspondent. A message from anyone else passes the same
	/// country filter as calls, is relayed to the client, and its sender
	/// becomes the new last correspondent.
	pub async fn route_sms(
		&self,
		proxy: &PhoneNumber,
		sender: &PhoneNumber,
		body: &str,
	) -> Result<SmsRouting, RoutingError> {
		let Some(client) = self.clients.find_by_proxy(proxy).await? else {
			info!("dropping sms on unattached proxy {}", proxy.masked());
			return Ok(SmsRouting::Blocked(BlockReason::UnknownProxy));
		};

		if *sender == client.real_phone {
			let Some(correspondent) = client.last_caller.clone() else {
				info!(
					"client {} replied on {} with no recent correspondent",
					client.client_id,
					proxy.masked()
				);
				return Ok(SmsRouting::NoRecentCorrespondent);
			};
			self.telephony.send_sms(proxy, &correspondent, body).await?;
			debug!(
				"relayed client reply on {} to {}",
				proxy.masked(),
				correspondent.masked()
			);
			return Ok(SmsRouting::Relayed { to: correspondent });
		}

		if sender.country_code() != client.country_code {
			info!(
				"dropping sms from {} on {} (client prefix {})",
				sender.masked(),
				proxy.masked(),
				client.country_code
			);
			return Ok(SmsRouting::Blocked(BlockReason::CountryMismatch));
		}

		if let Err(e) = self
			.clients
			.record_last_caller(&client.client_id, sender)
			.await
		{
			warn!(
				"could not record correspondent for client {}: {}",
				client.client_id, e
			);
		}
		self.telephony.send_sms(proxy, &client.real_phone, body).await?;
		debug!(
			"relayed sms from {} on {} to client {}",
			sender.masked(),
			proxy.masked(),
			client.client_id
		);
		Ok(SmsRouting::Relayed {
			to: client.real_phone,
		})
	}

	fn record_last_caller(&self, client: &Client, caller: &PhoneNumber) {
		let clients = self.clients.clone();
		let client_id = client.client_id.clone();
		let caller = caller.clone();
		tokio::spawn(async move {
			if let Err(e) = clients.record_last_caller(&client_id, &caller).await {
				warn!("could not record caller for client {}: {}", client_id, e);
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use chrono::Utc;
	use std::sync::Mutex;
	use std::time::Duration;

	use proxycall_orders::NewClient;
	use proxycall_store::implementations::memory::MemoryStore;
	use proxycall_store::{StoreConfig, StoreService};
	use proxycall_telephony::{
		CallDirective, MessageReceipt, TelephonyConfig, TelephonyInterface,
	};
	use proxycall_types::{CountryIso, NumberClass};

	type SentLog = Arc<Mutex<Vec<(String, String, String)>>>;

	struct RecordingProvider {
		sent: SentLog,
	}

	#[async_trait]
	impl TelephonyInterface for RecordingProvider {
		async fn purchase_number(
			&self,
			_country: &CountryIso,
			_class: NumberClass,
		) -> Result<PhoneNumber, TelephonyError> {
			Err(TelephonyError::Unavailable("not in this test".into()))
		}

		async fn activate_number(&self, _number: &PhoneNumber) -> Result<(), TelephonyError> {
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
		routing: RoutingService,
		clients: Arc<ClientDirectory>,
		sent: SentLog,
	}

	fn fixture() -> Fixture {
		let store = Arc::new(StoreService::with_config(
			Box::new(MemoryStore::new()),
			StoreConfig {
				min_request_interval: Duration::from_millis(1),
				call_timeout: Duration::from_millis(200),
				max_retry_elapsed: Duration::from_millis(200),
				retry_initial_interval: Duration::from_millis(1),
			},
		));
		let clients = Arc::new(ClientDirectory::new(store));
		let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
		let telephony = Arc::new(TelephonyService::with_config(
			Box::new(RecordingProvider { sent: sent.clone() }),
			TelephonyConfig {
				call_timeout: Duration::from_millis(200),
				max_retry_elapsed: Duration::from_millis(200),
				retry_initial_interval: Duration::from_millis(1),
			},
		));
		Fixture {
			routing: RoutingService::new(clients.clone(), telephony),
			clients,
			sent,
		}
	}

	fn proxy() -> PhoneNumber {
		PhoneNumber::parse("+33700000001", "phone").unwrap()
	}

	fn real() -> PhoneNumber {
		PhoneNumber::parse("+33601020304", "phone").unwrap()
	}

	async fn seed_client(f: &Fixture) {
		f.clients
			.get_or_create(NewClient {
				client_id: "c1".to_string(),
				name: "Ada".to_string(),
				email: "ada@example.com".to_string(),
				real_phone: real(),
				residency: CountryIso::parse("FR", "country").unwrap(),
			})
			.await
			.unwrap();
		f.clients.attach_proxy("c1", &proxy()).await.unwrap();
	}

	#[tokio::test]
	async fn test_same_country_call_is_forwarded() {
		let f = fixture();
		seed_client(&f).await;

		let caller = PhoneNumber::parse("+33711223344", "phone").unwrap();
		let verdict = f.routing.decide(&proxy(), &caller).await.unwrap();
		assert_eq!(verdict, RoutingVerdict::Forward(real()));

		// The caller lands in last_caller off the verdict path.
		tokio::time::sleep(Duration::from_millis(100)).await;
		let client = f.clients.find_by_id("c1").await.unwrap().unwrap();
		assert_eq!(client.last_caller, Some(caller));
	}

	#[tokio::test]
	async fn test_foreign_call_is_blocked() {
		let f = fixture();
		seed_client(&f).await;

		let caller = PhoneNumber::parse("+447911123456", "phone").unwrap();
		let verdict = f.routing.decide(&proxy(), &caller).await.unwrap();
		assert_eq!(verdict, RoutingVerdict::Block(BlockReason::CountryMismatch));
	}

	#[tokio::test]
	async fn test_unknown_proxy_is_blocked() {
		let f = fixture();
		let caller = PhoneNumber::parse("+33711223344", "phone").unwrap();
		let verdict = f.routing.decide(&proxy(), &caller).await.unwrap();
		assert_eq!(verdict, RoutingVerdict::Block(BlockReason::UnknownProxy));
	}

	#[tokio::test]
	async fn test_inbound_sms_relays_to_client_and_records_sender() {
		let f = fixture();
		seed_client(&f).await;

		let sender = PhoneNumber::parse("+33711223344", "phone").unwrap();
		let outcome = f
			.routing
			.route_sms(&proxy(), &sender, "hello")
			.await
			.unwrap();
		assert_eq!(outcome, SmsRouting::Relayed { to: real() });

		let sent = f.sent.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, proxy().as_str());
		assert_eq!(sent[0].1, real().as_str());
		assert_eq!(sent[0].2, "hello");
		drop(sent);

		let client = f.clients.find_by_id("c1").await.unwrap().unwrap();
		assert_eq!(client.last_caller, Some(sender));
	}

	#[tokio::test]
	async fn test_client_reply_goes_to_last_correspondent() {
		let f = fixture();
		seed_client(&f).await;

		let sender = PhoneNumber::parse("+33711223344", "phone").unwrap();
		f.routing
			.route_sms(&proxy(), &sender, "hello")
			.await
			.unwrap();

		let outcome = f
			.routing
			.route_sms(&proxy(), &real(), "hi back")
			.await
			.unwrap();
		assert_eq!(
			outcome,
			SmsRouting::Relayed {
				to: sender.clone()
			}
		);

		let sent = f.sent.lock().unwrap();
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1].1, sender.as_str());
		assert_eq!(sent[1].2, "hi back");
	}

	#[tokio::test]
	async fn test_client_reply_without_correspondent() {
		let f = fixture();
		seed_client(&f).await;

		let outcome = f
			.routing
			.route_sms(&proxy(), &real(), "anyone there?")
			.await
			.unwrap();
		assert_eq!(outcome, SmsRouting::NoRecentCorrespondent);
		assert!(f.sent.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_foreign_sms_is_dropped() {
		let f = fixture();
		seed_client(&f).await;

		let sender = PhoneNumber::parse("+447911123456", "phone").unwrap();
		let outcome = f
			.routing
			.route_sms(&proxy(), &sender, "hello")
			.await
			.unwrap();
		assert_eq!(outcome, SmsRouting::Blocked(BlockReason::CountryMismatch));
		assert!(f.sent.lock().unwrap().is_empty());
	}
}
