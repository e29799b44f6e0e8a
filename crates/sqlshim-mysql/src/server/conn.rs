//! Client connection state.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use sqlshim_core::{CredentialProvider, Result};

use super::auth::read_handshake_response;
use super::handler::Handler;
use super::response::error_payload;
use super::stmt::Stmt;
use crate::auth::{SALT_LEN, generate_salt};
use crate::config::ServerConfig;
use crate::protocol::{PacketStream, server_status};
use crate::tls::MaybeTlsStream;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(10_000);

/// Process-wide monotonic connection id.
pub fn next_connection_id() -> u32 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One authenticated client connection.
///
/// Created by [`Conn::accept`], which runs the whole handshake; afterwards
/// [`run`](Conn::run) serves commands until COM_QUIT or an I/O error.
pub struct Conn<S, H: Handler> {
    pub(super) stream: PacketStream<MaybeTlsStream<S>>,
    pub(super) config: Arc<ServerConfig>,
    pub(super) handler: H,
    pub(super) connection_id: u32,
    pub(super) local_addr: String,
    pub(super) remote_addr: String,
    pub(super) salt: [u8; SALT_LEN],
    pub(super) user: String,
    pub(super) auth_plugin: String,
    /// Client capabilities the server also supports
    pub(super) capability: u32,
    pub(super) charset: u8,
    pub(super) current_db: String,
    pub(super) attributes: Vec<(String, String)>,
    pub(super) status: u16,
    pub(super) stmts: HashMap<u32, Stmt<H::StmtContext>>,
    pub(super) last_stmt_id: u32,
    pub(super) has_replication: bool,
    pub(super) closed: bool,
}

impl<H> Conn<TcpStream, H>
where
    H: Handler + CredentialProvider,
{
    /// Handshake with a freshly accepted TCP client.
    pub fn from_tcp(stream: TcpStream, config: Arc<ServerConfig>, handler: H) -> Result<Self> {
        let local_addr = stream.local_addr()?.to_string();
        let remote_addr = stream.peer_addr()?.to_string();
        stream.set_nodelay(true).ok();
        Self::accept(stream, local_addr, remote_addr, config, handler)
    }
}

impl<S, H> Conn<S, H>
where
    S: Read + Write,
    H: Handler + CredentialProvider,
{
    /// Run the server side of the handshake over `stream`.
    ///
    /// Returns once the client is authenticated and the handler's
    /// [`authenticated`](Handler::authenticated) hook has run. A client that
    /// fails authentication receives an ERR packet and gets an error back.
    #[tracing::instrument(level = "debug", skip_all, fields(remote = %remote_addr))]
    pub fn accept(
        stream: S,
        local_addr: String,
        remote_addr: String,
        config: Arc<ServerConfig>,
        mut handler: H,
    ) -> Result<Self> {
        let connection_id = next_connection_id();
        let salt = generate_salt();

        let mut stream = PacketStream::new(MaybeTlsStream::Plain(stream));
        stream.write_packet(&super::auth::initial_handshake_payload(
            &config,
            connection_id,
            &salt,
        ))?;

        let (mut stream, response) = read_handshake_response(stream, &config)?;

        let mut current_db = String::new();
        if let Some(db) = &response.database {
            if let Err(e) = handler.use_db(db) {
                tracing::debug!(connection_id, db = %db, error = %e, "initial database rejected");
                let _ = stream.write_packet(&error_payload(&e));
                return Err(e);
            }
            current_db.clone_from(db);
        }
        let has_replication = handler.replication().is_some();

        let mut conn = Self {
            stream,
            capability: response.capability & config.capability,
            config,
            handler,
            connection_id,
            local_addr,
            remote_addr,
            salt,
            user: response.user,
            auth_plugin: response.auth_plugin,
            charset: response.charset,
            current_db,
            attributes: response.attributes,
            status: server_status::SERVER_STATUS_AUTOCOMMIT,
            stmts: HashMap::new(),
            last_stmt_id: 0,
            has_replication,
            closed: false,
        };

        conn.authenticate(response.auth_data)?;
        conn.handler.authenticated(conn.capability)?;
        Ok(conn)
    }

    /// Serve commands until the client quits or the connection breaks.
    pub fn run(mut self) -> Result<()> {
        while !self.closed {
            self.handle_command()?;
        }
        tracing::info!(connection_id = self.connection_id, "client disconnected");
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }
}

impl<S, H: Handler> Conn<S, H> {
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn current_db(&self) -> &str {
        &self.current_db
    }

    pub fn auth_plugin(&self) -> &str {
        &self.auth_plugin
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capability & flag != 0
    }

    pub fn charset(&self) -> u8 {
        self.charset
    }

    /// Connection attributes sent by the client.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of open prepared statements.
    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    /// Release every open statement's backend context.
    fn release_statements(&mut self) {
        for (id, stmt) in self.stmts.drain() {
            if let Err(e) = self.handler.handle_stmt_close(stmt.context) {
                tracing::debug!(
                    connection_id = self.connection_id,
                    statement_id = id,
                    error = %e,
                    "failed to release statement"
                );
            }
        }
    }
}

impl<S, H: Handler> Drop for Conn<S, H> {
    fn drop(&mut self) {
        self.release_statements();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_monotonic() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(a >= 10_000);
        assert!(b > a);
    }
}
