//! ChainDB Core - chain-replicated in-memory table store
//!
//! This crate provides the building blocks of a ChainDB node:
//! - Hash table of sorted bucket lists, with timing and statistics
//! - Write forwarding to the next node in the chain
//! - Table client and server over a framed TCP protocol
//! - Chain membership on top of a coordination service

pub mod backoff;
pub mod chain_client;
pub mod client;
pub mod config;
pub mod coord;
pub mod database;
pub mod dispatch;
pub mod distributed;
pub mod error;
pub mod kv;
pub mod logging;
pub mod membership;
pub mod protocol;
pub mod server;
pub mod stats;

pub use chain_client::ChainClient;
pub use client::RemoteTable;
pub use config::{ConfigManager, ServerConfig};
pub use coord::{connect_coordinator, Coordinator, MemoryCoordinator};
pub use database::Database;
pub use dispatch::Dispatcher;
pub use distributed::DistributedDatabase;
pub use error::{ClientError, CoordError, DbError, DbResult, KvError};
pub use kv::{Entry, Table};
pub use membership::{ChainMembership, MembershipState};
pub use protocol::{Request, Response};
pub use server::TableServer;
pub use stats::StatsSnapshot;
