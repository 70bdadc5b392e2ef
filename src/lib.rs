//! Operational ledger and stock reconciliation engine for hotel operations.
//!
//! Every operator action is an append-only [`record::OperationalRecord`];
//! edits are new versions on a chain, approvals are guarded state
//! transitions, and stock balances and revenue are replayed from the
//! approved history rather than read from counters.

pub mod actor;
pub mod booking;
pub mod error;
pub mod reconcile;
pub mod record;
pub mod service;
pub mod store;
pub mod utils;

pub use error::LedgerError;
pub use service::{LedgerService, RecordDraft, Session, StaticSession};
