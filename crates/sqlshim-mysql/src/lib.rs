//! MySQL wire protocol for the SQL shim.
//!
//! This crate implements both halves of a policy-enforcing MySQL proxy over
//! blocking `std::net` sockets:
//!
//! - A protocol server that accepts MySQL clients: handshake, TLS upgrade,
//!   native/sha256/caching_sha2 authentication, command dispatch and the
//!   prepared statement lifecycle
//! - A backend driver that logs in to the real database and relays queries
//! - [`ProxyHandler`], which consults an [`Observer`](sqlshim_core::Observer)
//!   for every query and filters result rows on its behalf
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlshim_core::PassthroughObserver;
//! use sqlshim_mysql::{ProxyConfig, run_proxy};
//!
//! let config = ProxyConfig::from_file("shim.json")?;
//! run_proxy(&config, Arc::new(PassthroughObserver))?;
//! ```

pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod protocol;
pub mod server;
pub mod shim;
pub mod tls;
pub mod types;

pub use backend::{
    Backend, BackendConnector, BackendStmt, MySqlBackend, MySqlConnector, QueryResult, ResultSet,
};
pub use cache::Sha2PasswordCache;
pub use config::{
    BackendConfig, ClientAuth, ClientTlsConfig, FailurePolicy, ProxyConfig, ServerConfig, SslMode,
    TlsConfig,
};
pub use server::{Conn, Handler, ReplicationHandler, Response, Server, serve_connection};
pub use shim::{ProxyHandler, run_proxy};
pub use types::{ColumnDef, FieldType};
