//! MySQL server side: handshake, command dispatch and response encoding.
//!
//! [`Server`] accepts TCP clients and runs each on its own thread. Each
//! thread owns one [`Conn`] and one handler instance made by the server's
//! factory; the only state shared between connections is the
//! [`ServerConfig`] (including its password cache).

mod auth;
mod command;
mod conn;
mod handler;
mod response;
mod stmt;

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;

use sqlshim_core::{CredentialProvider, Result};

use crate::config::ServerConfig;

pub use auth::{HandshakeResponse, initial_handshake_payload, parse_handshake_response};
pub use command::{parse_binlog_dump, parse_binlog_dump_gtid};
pub use conn::{Conn, next_connection_id};
pub use handler::{
    BinlogDumpGtidRequest, BinlogDumpRequest, BinlogStream, Handler, ReplicationHandler,
    unsupported_command,
};
pub use response::{Response, eof_payload, err_payload, error_payload, ok_payload};
pub use stmt::Stmt;

/// Accepts client connections and serves each on a dedicated thread.
pub struct Server<F> {
    config: Arc<ServerConfig>,
    factory: Arc<F>,
}

impl<F> Clone for Server<F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<F, H> Server<F>
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler + CredentialProvider + 'static,
{
    /// `factory` builds one handler per accepted connection.
    pub fn new(config: Arc<ServerConfig>, factory: F) -> Self {
        Self {
            config,
            factory: Arc::new(factory),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Bind `addr` and serve until the listener fails.
    pub fn listen(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve(&listener)
    }

    /// Accept connections from `listener` forever.
    pub fn serve(&self, listener: &TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "accepting MySQL clients");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    self.spawn(stream);
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
        Ok(())
    }

    /// Serve one client on a new thread.
    pub fn spawn(&self, stream: TcpStream) -> JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let factory = Arc::clone(&self.factory);
        std::thread::spawn(move || {
            if let Err(e) = serve_connection(stream, config, factory()) {
                tracing::debug!(error = %e, "connection ended");
            }
        })
    }
}

/// Handshake and command loop for one TCP client, on the calling thread.
pub fn serve_connection<H>(stream: TcpStream, config: Arc<ServerConfig>, handler: H) -> Result<()>
where
    H: Handler + CredentialProvider,
{
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    tracing::info!(peer = %peer, "client connected");
    Conn::from_tcp(stream, config, handler)?.run()
}
