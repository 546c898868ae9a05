//! End-to-end test suite for the ledger block store.
//!
//! The tests drive the service through the public [`Blockchain`] surface
//! over both backends and check chain selection, index consistency and
//! notification delivery.
//!
//! [`Blockchain`]: ledger_core::traits::Blockchain

pub mod helpers;
