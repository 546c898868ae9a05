//! # ledger-core
//! Block store engine: value types, the backend trait, secondary indexes,
//! fork choice and reorganization, and change notification.

pub mod chain_state;
pub mod checksum;
pub mod error;
pub mod genesis;
pub mod history;
pub mod index;
pub mod organizer;
pub mod query;
pub mod stealth;
pub mod subscription;
pub mod traits;
pub mod types;
