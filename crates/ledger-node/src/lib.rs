//! # ledger-node: persistent block store service.
//!
//! - [`storage::RocksStore`]: RocksDB backend for the block store
//! - [`service::ChainService`]: async single-writer service implementing
//!   [`ledger_core::traits::Blockchain`]
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod service;
pub mod storage;

pub use config::NodeConfig;
pub use service::ChainService;
pub use storage::RocksStore;
