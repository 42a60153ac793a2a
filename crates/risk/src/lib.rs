//! Admission and risk control.
//!
//! `RiskProfile` derives a user's limits from tier and risk tolerance,
//! `AdmissionController` runs the ordered checks for one candidate trade, and
//! `UserLocks` serialises work per user and counts risk violations.

pub mod admission;
pub mod error;
pub mod locks;
pub mod profile;

pub use admission::{AdmissionController, AdmissionState, Approval, Candidate};
pub use error::AdmissionRejection;
pub use locks::UserLocks;
pub use profile::{ExitLevels, RiskProfile};
