//! In-memory store backend.
//!
//! Keeps the same weak contract the production backend has: rows are held
//! in stable insertion order, `write_cell` is last-write-wins with no
//! compare-and-swap, and nothing here may be used as an in-process lock
//! by callers.

use crate::{Row, StoreError, StoreInterface};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory, table-per-name store.
#[derive(Default)]
pub struct MemoryStore {
	tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StoreInterface for MemoryStore {
	async fn read_all_rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
		let tables = self.tables.read().await;
		Ok(tables.get(table).cloned().unwrap_or_default())
	}

	async fn write_cell(
		&self,
		table: &str,
		row_key: &str,
		column: &str,
		value: &str,
	) -> Result<(), StoreError> {
		let mut tables = self.tables.write().await;
		let rows = tables.get_mut(table).ok_or(StoreError::NotFound)?;
		let row = rows
			.iter_mut()
			.find(|r| r.key == row_key)
			.ok_or(StoreError::NotFound)?;
		row.set(column, value);
		Ok(())
	}

	async fn append_row(&self, table: &str, row: Row) -> Result<(), StoreError> {
		let mut tables = self.tables.write().await;
		tables.entry(table.to_string()).or_default().push(row);
		Ok(())
	}
}
