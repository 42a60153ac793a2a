//! # Relay Database Crate
//!
//! Persistence for users, positions, the execution audit trail and settlements.
//!
//! ## Architectural Principles
//!
//! - **Behind a trait:** the engine only sees `TradingStore`. `DbRepository`
//!   implements it on PostgreSQL; `InMemoryStore` implements it for paper
//!   trading and tests.
//! - **Primary for writes, replicas for reads:** `DbRouter` spreads reads over
//!   healthy replicas and falls back to the primary when one fails. Reads that
//!   admission depends on always go to the primary.
//! - **Atomic settlement:** closing a position, writing its distributions and
//!   crediting balances happen in a single transaction, and only once.
//!
//! ## Public API
//!
//! - `DbRouter`, `connect`, `run_migrations`: pool setup and schema migrations.
//! - `TradingStore`: the storage contract used by the engine.
//! - `DbRepository`, `InMemoryStore`: its two implementations.
//! - `DbError`: the errors returned from this crate.

pub mod connection;
pub mod error;
pub mod memory;
pub mod repository;
pub mod store;

pub use connection::{DbRouter, connect, primary_url, run_migrations};
pub use error::DbError;
pub use memory::InMemoryStore;
pub use repository::DbRepository;
pub use store::TradingStore;
