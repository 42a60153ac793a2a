//! # Relay Events
//!
//! This crate defines the events the engine emits after each state transition
//! (positions opened and closed, failed legs, suspended users, failed settlements)
//! and the `Notifier` port those events are published through.
//!
//! As a Layer 0 crate, it depends only on `core-types`. Concrete transports
//! (WebSocket, SMS, chat) live outside the engine and subscribe to a notifier.

// Declare the modules that make up this crate.
pub mod error;
pub mod messages;
pub mod notifier;

// Re-export the core types to provide a clean public API.
pub use error::EventsError;
pub use messages::{
    EngineEvent, ExecutionFailed, LogLevel, LogMessage, PositionClosed, SettlementFailed,
    SignalProcessed, UserSuspended,
};
pub use notifier::{BroadcastNotifier, FanoutNotifier, LogNotifier, Notifier};

/// Serialises an event into the JSON shape subscribers receive.
pub fn to_json(event: &EngineEvent) -> Result<String, EventsError> {
    Ok(serde_json::to_string(event)?)
}
