//! # Executor Crate
//!
//! Turns an approved trade into exchange orders and verified fills.
//!
//! ## Architectural Principles
//!
//! - **Calculation vs. State:** the orchestrator sizes, normalises, submits and
//!   verifies, and hands back `ExecutionAttempt` records plus fills. It never
//!   writes to the store; the engine persists attempts and registers positions.
//! - **Leg Isolation:** every (user, exchange) leg runs on its own. A timeout,
//!   rejection or undersized quantity fails that leg only.
//!
//! ## Public API
//!
//! - `ExecutionOrchestrator`: opens positions across a user's exchanges and closes them.
//! - `normalize_quantity` / `InstrumentCache`: notional to exchange-valid quantity.
//! - `FillVerifier`: polls an order until it fills or the window closes.
//! - `ExecutorError`: leg failure reasons with stable codes.

pub mod error;
pub mod fill;
pub mod orchestrator;
pub mod quantity;

pub use error::ExecutorError;
pub use fill::{FillVerifier, VerifiedFill};
pub use orchestrator::{
    ExecutionOrchestrator, FilledLeg, LegOutcome, OpenRequest, signed_slippage, summarize_legs,
};
pub use quantity::{InstrumentCache, normalize_quantity, round_quantity_to_step};
