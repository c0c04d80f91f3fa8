//! Pool allocation engine for the proxycall system.
//!
//! Owns the lifecycle of pool entries and the reservation protocol that
//! makes allocation safe over a store with no transactions and no
//! compare-and-swap: pick a candidate from a snapshot, write a fresh
//! token onto the row, then re-read the row and keep the reservation only
//! if the token survived. Lost races retry a bounded number of times with
//! jittered backoff; reservations that are never confirmed are reclaimed
//! after a TTL.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use proxycall_store::{StoreError, StoreService};
use proxycall_types::{
	CountryIso, NumberClass, PhoneNumber, PoolEntry, PoolStatus, ReservationToken,
};

mod codec;

pub use codec::POOL_TABLE;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
	/// No eligible number, either truly (nothing matched after the class
	/// fallback) or through sustained contention.
	#[error("Pool exhausted")]
	Exhausted,
	/// The reservation's TTL elapsed, or the token was already consumed.
	#[error("Reservation expired")]
	ReservationExpired,
	/// Another caller overwrote the reservation; the token no longer
	/// identifies any row.
	#[error("Reservation stolen")]
	ReservationStolen,
	/// No row carries the token (release only).
	#[error("Reservation not found")]
	NotFound,
	/// The number is already present in the pool.
	#[error("Number already pooled: {0}")]
	Duplicate(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Tuning for the allocation protocol.
#[derive(Debug, Clone)]
pub struct PoolConfig {
	/// Bound on full reserve attempts (snapshot, write, re-read).
	pub max_reserve_attempts: u32,
	/// Reservations older than this are reclaimable by any caller.
	pub reservation_ttl: Duration,
	/// Base delay between lost-race retries; grows exponentially and is
	/// jittered to decorrelate concurrent callers.
	pub retry_base_delay: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_reserve_attempts: 5,
			reservation_ttl: Duration::from_secs(120),
			retry_base_delay: Duration::from_millis(50),
		}
	}
}

/// Filter for pool listings.
#[derive(Debug, Clone, Default)]
pub struct PoolFilter {
	pub country: Option<CountryIso>,
	pub class: Option<NumberClass>,
	pub status: Option<PoolStatus>,
}

/// The pool allocation engine.
pub struct PoolService {
	store: Arc<StoreService>,
	config: PoolConfig,
}

impl PoolService {
	pub fn new(store: Arc<StoreService>) -> Self {
		Self::with_config(store, PoolConfig::default())
	}

	pub fn with_config(store: Arc<StoreService>, config: PoolConfig) -> Self {
		Self { store, config }
	}

	/// Reserves the first eligible number for `country`.
	///
	/// Class preference is a business policy, not an error path: when no
	/// entry of `preferred_class` is eligible, the other class is tried
	/// before the pool counts as exhausted. Candidates are taken in stable
	/// row order; the jittered retry delay is what keeps concurrent
	/// callers from starving on the same row.
	pub async fn reserve_first_available(
		&self,
		country: &CountryIso,
		preferred_class: NumberClass,
	) -> Result<(PoolEntry, ReservationToken), PoolError> {
		let mut contended = false;

		for attempt in 0..self.config.max_reserve_attempts {
			let entries = self.read_entries().await?;
			let now = Utc::now();

			let candidate = self.pick_candidate(&entries, country, preferred_class, now);
			let Some(entry) = candidate else {
				if contended {
					warn!(
						"pool reserve gave up after contention country={} attempts={}",
						country,
						attempt + 1
					);
				} else {
					warn!("pool empty for country={} (after class fallback)", country);
				}
				return Err(PoolError::Exhausted);
			};

			let token = ReservationToken::new();
			let key = entry.number.as_str().to_string();

			// Write order matters: a torn write that stops after the token
			// leaves reserved_at empty, which the stale check treats as
			// reclaimable.
			self.store
				.write_cell(POOL_TABLE, &key, codec::COL_STATUS, PoolStatus::Reserving.as_str())
				.await?;
			self.store
				.write_cell(POOL_TABLE, &key, codec::COL_TOKEN, &token.to_string())
				.await?;
			self.store
				.write_cell(POOL_TABLE, &key, codec::COL_RESERVED_AT, &now.to_rfc3339())
				.await?;

			// The store has no compare-and-swap, so only a post-write
			// re-read can tell whether a concurrent writer overwrote the
			// row between our snapshot and our writes.
			let current = self
				.read_entries()
				.await?
				.into_iter()
				.find(|e| e.number == entry.number);

			match current {
				Some(ref row) if row.reservation_token.as_ref() == Some(&token) => {
					self.store
						.write_cell(POOL_TABLE, &key, codec::COL_STATUS, PoolStatus::Reserved.as_str())
						.await?;
					info!(
						"reserved {} for country={} attempt={}",
						entry.number.masked(),
						country,
						attempt + 1
					);
					let mut reserved = entry.clone();
					reserved.status = PoolStatus::Reserved;
					reserved.reservation_token = Some(token.clone());
					reserved.reserved_at = Some(now);
					return Ok((reserved, token));
				}
				_ => {
					contended = true;
					debug!(
						"lost reservation race on {} attempt={}",
						entry.number.masked(),
						attempt + 1
					);
					tokio::time::sleep(self.retry_delay(attempt)).await;
				}
			}
		}

		// Rows may be nominally available; this signals contention, not
		// true exhaustion.
		warn!(
			"pool reserve exhausted {} attempts under contention country={}",
			self.config.max_reserve_attempts, country
		);
		Err(PoolError::Exhausted)
	}

	/// Binds a reserved number to a client. Single-shot: the token is
	/// consumed on success, and a token that no longer sits on a reserved,
	/// unexpired row is refused.
	pub async fn confirm_assignment(
		&self,
		token: &ReservationToken,
		client_id: &str,
	) -> Result<PoolEntry, PoolError> {
		let entries = self.read_entries().await?;
		let Some(entry) = entries
			.into_iter()
			.find(|e| e.reservation_token.as_ref() == Some(token))
		else {
			return Err(PoolError::ReservationStolen);
		};

		if entry.status != PoolStatus::Reserved {
			return Err(PoolError::ReservationExpired);
		}
		if self.reservation_elapsed(&entry, Utc::now()) {
			return Err(PoolError::ReservationExpired);
		}

		let key = entry.number.as_str();
		self.store
			.write_cell(POOL_TABLE, key, codec::COL_STATUS, PoolStatus::Assigned.as_str())
			.await?;
		self.store
			.write_cell(POOL_TABLE, key, codec::COL_RESERVED_CLIENT, client_id)
			.await?;
		self.store
			.write_cell(POOL_TABLE, key, codec::COL_ASSIGNED_AT, &Utc::now().to_rfc3339())
			.await?;

		info!("assigned {} to client {}", entry.number.masked(), client_id);
		let mut assigned = entry;
		assigned.status = PoolStatus::Assigned;
		assigned.reserved_client_id = Some(client_id.to_string());
		Ok(assigned)
	}

	/// Returns every row holding `token` to `available` and clears the
	/// reservation trace. Safe to repeat; a token with no rows left is
	/// reported as [`PoolError::NotFound`], which compensation paths
	/// treat as already done.
	pub async fn release(&self, token: &ReservationToken) -> Result<(), PoolError> {
		let entries = self.read_entries().await?;
		let held: Vec<_> = entries
			.into_iter()
			.filter(|e| {
				e.reservation_token.as_ref() == Some(token) && e.status != PoolStatus::Available
			})
			.collect();

		if held.is_empty() {
			return Err(PoolError::NotFound);
		}

		for entry in held {
			let key = entry.number.as_str();
			self.store
				.write_cell(POOL_TABLE, key, codec::COL_STATUS, PoolStatus::Releasing.as_str())
				.await?;
			for column in [
				codec::COL_TOKEN,
				codec::COL_RESERVED_AT,
				codec::COL_RESERVED_CLIENT,
				codec::COL_ASSIGNED_AT,
				codec::COL_ASSIGNED_TO,
			] {
				self.store.write_cell(POOL_TABLE, key, column, "").await?;
			}
			self.store
				.write_cell(POOL_TABLE, key, codec::COL_STATUS, PoolStatus::Available.as_str())
				.await?;
			info!("released {}", entry.number.masked());
		}
		Ok(())
	}

	/// Lists pool entries matching the filter, in stable row order.
	pub async fn list_pool(&self, filter: &PoolFilter) -> Result<Vec<PoolEntry>, PoolError> {
		let entries = self.read_entries().await?;
		Ok(entries
			.into_iter()
			.filter(|e| {
				filter.country.as_ref().is_none_or(|c| &e.country == c)
					&& filter.class.is_none_or(|cl| e.class == cl)
					&& filter.status.is_none_or(|s| e.status == s)
			})
			.collect())
	}

	/// Appends a freshly purchased number to the pool. Numbers are unique
	/// per row; re-adding an existing one is refused.
	pub async fn add_number(&self, entry: PoolEntry) -> Result<(), PoolError> {
		let existing = self.read_entries().await?;
		if existing.iter().any(|e| e.number == entry.number) {
			return Err(PoolError::Duplicate(entry.number.to_string()));
		}
		let number = entry.number.masked();
		self.store.append_row(POOL_TABLE, codec::encode(&entry)).await?;
		info!("added {} to pool", number);
		Ok(())
	}

	/// Looks a pool entry up by number.
	pub async fn find_by_number(&self, number: &PhoneNumber) -> Result<Option<PoolEntry>, PoolError> {
		let entries = self.read_entries().await?;
		Ok(entries.into_iter().find(|e| &e.number == number))
	}

	async fn read_entries(&self) -> Result<Vec<PoolEntry>, PoolError> {
		let rows = self.store.read_all_rows(POOL_TABLE).await?;
		let mut entries = Vec::with_capacity(rows.len());
		for row in &rows {
			match codec::decode(row) {
				Ok(entry) => entries.push(entry),
				// One corrupt row must not brick the whole pool; it is
				// skipped for allocation and surfaced in logs.
				Err(e) => warn!("skipping corrupt pool row '{}': {}", row.key, e),
			}
		}
		Ok(entries)
	}

	fn pick_candidate(
		&self,
		entries: &[PoolEntry],
		country: &CountryIso,
		preferred_class: NumberClass,
		now: DateTime<Utc>,
	) -> Option<PoolEntry> {
		let eligible = |e: &&PoolEntry| &e.country == country && self.is_reclaimable(e, now);

		let fallback_class = match preferred_class {
			NumberClass::Mobile => NumberClass::Local,
			NumberClass::Local => NumberClass::Mobile,
		};

		entries
			.iter()
			.filter(eligible)
			.find(|e| e.class == preferred_class)
			.or_else(|| {
				entries
					.iter()
					.filter(eligible)
					.find(|e| e.class == fallback_class)
			})
			.cloned()
	}

	/// Available rows, plus reserving/reserved rows whose TTL elapsed.
	fn is_reclaimable(&self, entry: &PoolEntry, now: DateTime<Utc>) -> bool {
		match entry.status {
			PoolStatus::Available => true,
			PoolStatus::Reserving | PoolStatus::Reserved => self.reservation_elapsed(entry, now),
			PoolStatus::Assigned | PoolStatus::Releasing => false,
		}
	}

	fn reservation_elapsed(&self, entry: &PoolEntry, now: DateTime<Utc>) -> bool {
		match entry.reserved_at {
			// A reservation with no timestamp is a torn write; reclaim it.
			None => true,
			Some(at) => {
				let ttl = chrono::Duration::from_std(self.config.reservation_ttl)
					.unwrap_or_else(|_| chrono::Duration::seconds(120));
				at + ttl < now
			}
		}
	}

	fn retry_delay(&self, attempt: u32) -> Duration {
		let base = self.config.retry_base_delay.as_millis().max(1) as u64;
		let exp = base.saturating_mul(1 << attempt.min(6));
		let jittered = rand::thread_rng().gen_range(exp / 2..=exp + exp / 2);
		Duration::from_millis(jittered)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use proxycall_store::implementations::memory::MemoryStore;
	use proxycall_store::{Row, StoreConfig, StoreInterface};

	fn fast_store() -> Arc<StoreService> {
		Arc::new(StoreService::with_config(
			Box::new(MemoryStore::new()),
			fast_store_config(),
		))
	}

	fn fast_store_config() -> StoreConfig {
		StoreConfig {
			min_request_interval: Duration::from_millis(1),
			call_timeout: Duration::from_millis(200),
			max_retry_elapsed: Duration::from_millis(200),
			retry_initial_interval: Duration::from_millis(1),
		}
	}

	fn fast_pool_config() -> PoolConfig {
		PoolConfig {
			max_reserve_attempts: 3,
			reservation_ttl: Duration::from_secs(60),
			retry_base_delay: Duration::from_millis(1),
		}
	}

	fn fr() -> CountryIso {
		CountryIso::parse("FR", "country").unwrap()
	}

	fn entry(number: &str, class: NumberClass) -> PoolEntry {
		PoolEntry::available(PhoneNumber::parse(number, "number").unwrap(), class, fr())
	}

	async fn seed(pool: &PoolService, entries: Vec<PoolEntry>) {
		for e in entries {
			pool.add_number(e).await.unwrap();
		}
	}

	#[tokio::test]
	async fn test_reserve_prefers_requested_class() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(
			&pool,
			vec![
				entry("+33100000001", NumberClass::Local),
				entry("+33600000001", NumberClass::Mobile),
			],
		)
		.await;

		let (reserved, _) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();
		assert_eq!(reserved.class, NumberClass::Mobile);
		assert_eq!(reserved.status, PoolStatus::Reserved);
	}

	#[tokio::test]
	async fn test_reserve_falls_back_to_other_class() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33100000001", NumberClass::Local)]).await;

		let (reserved, _) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();
		assert_eq!(reserved.class, NumberClass::Local);
	}

	#[tokio::test]
	async fn test_reserve_empty_country_is_exhausted() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let de = CountryIso::parse("DE", "country").unwrap();
		let err = pool
			.reserve_first_available(&de, NumberClass::Mobile)
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::Exhausted));
	}

	#[tokio::test]
	async fn test_second_reserve_on_single_row_is_exhausted() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		pool.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();
		let err = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::Exhausted));
	}

	#[tokio::test]
	async fn test_concurrent_reserves_grant_each_row_at_most_once() {
		let pool = Arc::new(PoolService::with_config(
			fast_store(),
			PoolConfig {
				max_reserve_attempts: 10,
				reservation_ttl: Duration::from_secs(60),
				retry_base_delay: Duration::from_millis(1),
			},
		));
		seed(
			&pool,
			vec![
				entry("+33600000001", NumberClass::Mobile),
				entry("+33600000002", NumberClass::Mobile),
			],
		)
		.await;

		let mut handles = Vec::new();
		for _ in 0..8 {
			let pool = pool.clone();
			handles.push(tokio::spawn(async move {
				pool.reserve_first_available(&fr(), NumberClass::Mobile).await
			}));
		}

		let mut granted = Vec::new();
		for handle in handles {
			match handle.await.unwrap() {
				Ok((reserved, _)) => granted.push(reserved.number.as_str().to_string()),
				Err(PoolError::Exhausted) => {}
				Err(e) => panic!("unexpected reserve failure: {}", e),
			}
		}

		let mut distinct = granted.clone();
		distinct.sort();
		distinct.dedup();
		assert_eq!(distinct.len(), granted.len(), "a row was granted twice");
		assert_eq!(granted.len(), 2);
	}

	#[tokio::test]
	async fn test_confirm_assignment_consumes_the_token() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let (_, token) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();

		let assigned = pool.confirm_assignment(&token, "client-1").await.unwrap();
		assert_eq!(assigned.status, PoolStatus::Assigned);
		assert_eq!(assigned.reserved_client_id.as_deref(), Some("client-1"));

		// The row is no longer reserved, so the same token is refused.
		let err = pool.confirm_assignment(&token, "client-1").await.unwrap_err();
		assert!(matches!(err, PoolError::ReservationExpired));
	}

	#[tokio::test]
	async fn test_confirm_with_unknown_token_is_stolen() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let err = pool
			.confirm_assignment(&ReservationToken::new(), "client-1")
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::ReservationStolen));
	}

	#[tokio::test]
	async fn test_stale_reservation_is_reclaimed() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		let old_token = ReservationToken::new();
		let mut stale = entry("+33600000001", NumberClass::Mobile);
		stale.status = PoolStatus::Reserved;
		stale.reservation_token = Some(old_token.clone());
		stale.reserved_at = Some(Utc::now() - chrono::Duration::seconds(600));
		seed(&pool, vec![stale]).await;

		let (reserved, new_token) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();
		assert_eq!(reserved.number.as_str(), "+33600000001");
		assert_ne!(new_token, old_token);

		// The reclaimed row now carries the new token; the old one is dead.
		let err = pool
			.confirm_assignment(&old_token, "client-1")
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::ReservationStolen));
	}

	#[tokio::test]
	async fn test_torn_reservation_without_timestamp_is_reclaimed() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		let mut torn = entry("+33600000001", NumberClass::Mobile);
		torn.status = PoolStatus::Reserving;
		torn.reservation_token = Some(ReservationToken::new());
		torn.reserved_at = None;
		seed(&pool, vec![torn]).await;

		let (reserved, _) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();
		assert_eq!(reserved.status, PoolStatus::Reserved);
	}

	#[tokio::test]
	async fn test_release_restores_the_row_and_is_single_shot() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let (reserved, token) = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap();

		pool.release(&token).await.unwrap();

		let restored = pool.find_by_number(&reserved.number).await.unwrap().unwrap();
		assert_eq!(restored.status, PoolStatus::Available);
		assert!(restored.reservation_token.is_none());
		assert!(restored.reserved_at.is_none());

		let err = pool.release(&token).await.unwrap_err();
		assert!(matches!(err, PoolError::NotFound));
	}

	#[tokio::test]
	async fn test_add_number_rejects_duplicates() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let err = pool
			.add_number(entry("+33600000001", NumberClass::Local))
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::Duplicate(_)));
	}

	#[tokio::test]
	async fn test_list_pool_filters() {
		let pool = PoolService::with_config(fast_store(), fast_pool_config());
		seed(
			&pool,
			vec![
				entry("+33100000001", NumberClass::Local),
				entry("+33600000001", NumberClass::Mobile),
			],
		)
		.await;

		let mobiles = pool
			.list_pool(&PoolFilter {
				class: Some(NumberClass::Mobile),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(mobiles.len(), 1);
		assert_eq!(mobiles[0].class, NumberClass::Mobile);

		let all = pool.list_pool(&PoolFilter::default()).await.unwrap();
		assert_eq!(all.len(), 2);
	}

	/// Backend that steals every reservation by overwriting the token right
	/// after it lands, forcing the post-write re-read to mismatch.
	struct ThiefStore {
		inner: MemoryStore,
		thief_token: String,
	}

	#[async_trait]
	impl StoreInterface for ThiefStore {
		async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
			self.inner.read_all_rows(table).await
		}

		async fn write_cell(
			&self,
			table: &str,
			row_key: &str,
			column: &str,
			value: &str,
		) -> Result<(), StoreError> {
			self.inner.write_cell(table, row_key, column, value).await?;
			if column == "reservation_token" && !value.is_empty() && value != self.thief_token {
				self.inner
					.write_cell(table, row_key, column, &self.thief_token)
					.await?;
			}
			Ok(())
		}

		async fn append_row(&self, table: &str, row: Row) -> Result<(), StoreError> {
			self.inner.append_row(table, row).await
		}
	}

	#[tokio::test]
	async fn test_sustained_lost_races_give_up_bounded() {
		let store = Arc::new(StoreService::with_config(
			Box::new(ThiefStore {
				inner: MemoryStore::new(),
				thief_token: ReservationToken::new().to_string(),
			}),
			fast_store_config(),
		));
		let pool = PoolService::with_config(store, fast_pool_config());
		seed(&pool, vec![entry("+33600000001", NumberClass::Mobile)]).await;

		let err = pool
			.reserve_first_available(&fr(), NumberClass::Mobile)
			.await
			.unwrap_err();
		assert!(matches!(err, PoolError::Exhausted));
	}
}
