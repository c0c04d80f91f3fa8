//! Shared data model for the proxycall system.
//!
//! This crate defines the domain types used across the workspace: validated
//! phone numbers and country codes, pool entries with their allocation
//! status, clients, orders, and confirmation attempts.

pub mod client;
pub mod confirmation;
pub mod order;
pub mod phone;
pub mod pool;

pub use client::*;
pub use confirmation::*;
pub use order::*;
pub use phone::*;
pub use pool::*;
