//! Backend MySQL client.
//!
//! The shim owns one backend connection per client connection. [`Backend`]
//! is the seam the interception pipeline talks to; [`MySqlBackend`] is the
//! wire-protocol implementation and [`MySqlConnector`] creates them.
//!
//! Result sets are kept as raw row payloads so they can be relayed to the
//! client byte-for-byte. Only the transform path decodes text rows.

// MySQL protocol uses well-defined packet sizes that fit in u32 (max 16MB)
#![allow(clippy::cast_possible_truncation)]

use std::net::{TcpStream, ToSocketAddrs};

use sqlshim_core::error::{ConnectionError, ConnectionErrorKind, QueryError, codes};
use sqlshim_core::{Error, FieldValue, Result, Value};

use crate::auth::{self, caching_sha2, plugins};
use crate::config::BackendConfig;
use crate::protocol::{
    Command, EOF_HEADER, ERR_HEADER, MORE_DATA_HEADER, NULL_MARKER, OK_HEADER, OkPacket,
    PacketReader, PacketStream, PacketWriter, StmtPrepareOk, build_stmt_close_packet,
    build_stmt_execute_packet, build_stmt_prepare_packet, build_stmt_reset_packet, capabilities,
    parse_stmt_prepare_ok,
};
use crate::tls::{self, MaybeTlsStream};
use crate::types::{ColumnDef, decode_text_row};

/// Column definitions and raw rows of one result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnDef>,
    /// Row payloads exactly as they travel on the wire
    pub rows: Vec<Vec<u8>>,
    /// Rows use the binary protocol (COM_STMT_EXECUTE)
    pub binary: bool,
    /// The last row payload is the stream terminator; no EOF is appended
    pub streaming: bool,
    pub status_flags: u16,
    pub warnings: u16,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(ColumnDef::name_str).collect()
    }

    /// Decode every text-protocol row into typed fields.
    pub fn text_rows(&self) -> Result<Vec<Vec<FieldValue>>> {
        if self.binary {
            return Err(Error::protocol("cannot decode binary rows as text"));
        }
        self.rows
            .iter()
            .map(|row| decode_text_row(row, &self.columns))
            .collect()
    }
}

/// Outcome of a statement: an OK summary, optionally with a result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub result_set: Option<ResultSet>,
}

impl QueryResult {
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status_flags: ok.status_flags,
            warnings: ok.warnings,
            info: ok.info,
            result_set: None,
        }
    }

    pub fn with_result_set(result_set: ResultSet) -> Self {
        Self {
            status_flags: result_set.status_flags,
            warnings: result_set.warnings,
            result_set: Some(result_set),
            ..Self::default()
        }
    }
}

/// A statement prepared on the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStmt {
    pub statement_id: u32,
    pub params: Vec<ColumnDef>,
    pub columns: Vec<ColumnDef>,
}

impl BackendStmt {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Operations the shim forwards to the real database.
pub trait Backend: Send {
    /// Run `sql` as sent by the client; the bytes are not re-encoded.
    fn query(&mut self, sql: &[u8]) -> Result<QueryResult>;

    fn use_db(&mut self, db: &str) -> Result<()>;

    fn field_list(&mut self, table: &str, wildcard: &str) -> Result<Vec<ColumnDef>>;

    fn prepare(&mut self, sql: &[u8]) -> Result<BackendStmt>;

    fn execute(&mut self, stmt: &BackendStmt, args: &[Value]) -> Result<QueryResult>;

    /// Release a prepared statement. Takes ownership so it cannot be closed twice.
    fn close_stmt(&mut self, stmt: BackendStmt) -> Result<()>;

    fn ping(&mut self) -> Result<()>;
}

/// Opens backend connections.
pub trait BackendConnector: Send {
    type Backend: Backend;

    fn connect(&self, config: &BackendConfig) -> Result<Self::Backend>;
}

/// Connects [`MySqlBackend`]s over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl BackendConnector for MySqlConnector {
    type Backend = MySqlBackend;

    fn connect(&self, config: &BackendConfig) -> Result<MySqlBackend> {
        MySqlBackend::connect(config.clone())
    }
}

/// Server greeting received during the handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble, without its trailing NUL
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

/// Parse an initial handshake (protocol 10) packet.
pub fn parse_handshake(payload: &[u8]) -> Result<ServerHandshake> {
    let mut reader = PacketReader::new(payload);

    if reader.peek() == Some(ERR_HEADER) {
        return Err(err_packet_error(payload));
    }

    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| Error::protocol("Missing protocol version"))?;
    if protocol_version != crate::protocol::PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "Unsupported protocol version: {}",
            protocol_version
        )));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| Error::protocol("Missing server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| Error::protocol("Missing connection ID"))?;
    let auth_data_1 = reader
        .read_bytes(8)
        .ok_or_else(|| Error::protocol("Missing auth data"))?;

    // Filler
    reader.skip(1);

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| Error::protocol("Missing capability flags"))?;
    let charset = reader.read_u8().unwrap_or(0);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_u8().unwrap_or(0) as usize
    } else {
        0
    };

    // Reserved
    reader.skip(10);

    let mut auth_data = auth_data_1.to_vec();
    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = if auth_data_len > 8 {
            (auth_data_len - 8).max(13)
        } else {
            13
        };
        let len2 = len2.min(reader.remaining());
        if let Some(data2) = reader.read_bytes(len2) {
            auth_data.extend_from_slice(data2.strip_suffix(&[0]).unwrap_or(data2));
        }
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().unwrap_or_default()
    } else {
        plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(ServerHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_data,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Blocking MySQL client connection.
pub struct MySqlBackend {
    stream: PacketStream<MaybeTlsStream<TcpStream>>,
    config: BackendConfig,
    server: ServerHandshake,
    /// Capabilities in effect after negotiation
    capabilities: u32,
    /// Plugin and scramble of the current auth exchange
    auth_plugin: String,
    auth_data: Vec<u8>,
    awaiting_public_key: bool,
    status_flags: u16,
    closed: bool,
}

impl std::fmt::Debug for MySqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlBackend")
            .field("connection_id", &self.server.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("database", &self.config.database)
            .field("tls", &self.is_tls())
            .finish_non_exhaustive()
    }
}

impl MySqlBackend {
    /// Establish a new connection to the MySQL server.
    ///
    /// This performs the complete connection handshake:
    /// 1. TCP connection
    /// 2. Receive server handshake
    /// 3. Optional TLS upgrade
    /// 4. Send handshake response with authentication
    /// 5. Handle auth result (auth switch, full auth)
    #[tracing::instrument(
        level = "debug",
        skip(config),
        fields(host = %config.host, port = config.port, user = %config.user)
    )]
    pub fn connect(config: BackendConfig) -> Result<Self> {
        let tcp = open_tcp(&config)?;

        let mut stream = PacketStream::new(MaybeTlsStream::Plain(tcp));
        let payload = stream.read_packet()?;
        let server = parse_handshake(&payload)?;

        if tls::validate_ssl_mode(config.ssl_mode, server.capabilities)? {
            tls::validate_tls_config(config.ssl_mode, &config.tls)?;
            let caps = (config.capability_flags() & server.capabilities) | capabilities::CLIENT_SSL;
            let request =
                tls::build_ssl_request_packet(caps, config.max_packet_size, config.charset);
            stream.write_packet(&request)?;
            stream = stream.map_stream(|s| s.connect(&config.tls, &config.host, config.ssl_mode))?;
        }

        let mut conn = Self {
            stream,
            capabilities: 0,
            auth_plugin: server.auth_plugin.clone(),
            auth_data: server.auth_data.clone(),
            awaiting_public_key: false,
            status_flags: server.status_flags,
            server,
            config,
            closed: false,
        };

        conn.send_handshake_response()?;
        conn.handle_auth_result()?;

        // Handshake timeouts do not apply to queries
        let tcp = conn.stream.get_ref().get_ref();
        tcp.set_read_timeout(None).ok();
        tcp.set_write_timeout(None).ok();

        tracing::debug!(
            connection_id = conn.server.connection_id,
            plugin = %conn.auth_plugin,
            tls = conn.is_tls(),
            "backend connection established"
        );
        Ok(conn)
    }

    /// Connection ID assigned by the server.
    pub fn connection_id(&self) -> u32 {
        self.server.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server.server_version
    }

    /// Capabilities negotiated with the server.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Plugin that completed authentication.
    pub fn auth_plugin(&self) -> &str {
        &self.auth_plugin
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }

    fn client_capabilities(&self) -> u32 {
        let mut caps = self.config.capability_flags() & self.server.capabilities;
        if !self.is_tls() {
            caps &= !capabilities::CLIENT_SSL;
        }
        caps
    }

    fn send_handshake_response(&mut self) -> Result<()> {
        let client_caps = self.client_capabilities();
        self.capabilities = client_caps;

        let plugin = self.auth_plugin.clone();
        let auth_response = self.compute_auth_response(&plugin);

        let mut writer = PacketWriter::new();
        writer.write_u32_le(client_caps);
        writer.write_u32_le(self.config.max_packet_size);
        writer.write_u8(self.config.charset);
        writer.write_zeros(23);
        writer.write_null_string(&self.config.user);

        if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(&auth_response);
        } else if client_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            // Auth responses are always < 256 bytes
            writer.write_u8(auth_response.len() as u8);
            writer.write_bytes(&auth_response);
        } else {
            writer.write_bytes(&auth_response);
            writer.write_u8(0);
        }

        if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.config.database.as_deref().unwrap_or(""));
        }

        if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(&plugin);
        }

        if client_caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in &self.config.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        self.stream.write_packet(writer.as_bytes())
    }

    /// First auth payload for `plugin` against the current scramble.
    fn compute_auth_response(&mut self, plugin: &str) -> Vec<u8> {
        let password = self.config.password.clone().unwrap_or_default();
        self.awaiting_public_key = false;

        match plugin {
            plugins::CACHING_SHA2_PASSWORD => {
                auth::caching_sha2_password(&password, &self.auth_data)
            }
            plugins::SHA256_PASSWORD => {
                if password.is_empty() {
                    Vec::new()
                } else if self.is_tls() {
                    cleartext(&password)
                } else {
                    self.awaiting_public_key = true;
                    vec![auth::SHA256_REQUEST_PUBLIC_KEY]
                }
            }
            _ => auth::mysql_native_password(&password, &self.auth_data),
        }
    }

    fn handle_auth_result(&mut self) -> Result<()> {
        loop {
            let payload = self.stream.read_packet()?;
            match payload.first().copied() {
                Some(OK_HEADER) => {
                    if let Some(ok) = PacketReader::new(&payload).parse_ok_packet() {
                        self.status_flags = ok.status_flags;
                    }
                    return Ok(());
                }
                Some(ERR_HEADER) => return Err(err_packet_error(&payload)),
                Some(EOF_HEADER) => self.handle_auth_switch(&payload[1..])?,
                Some(MORE_DATA_HEADER) => self.handle_additional_auth(&payload[1..])?,
                Some(other) => {
                    return Err(Error::protocol(format!(
                        "Unknown auth response: {:02X}",
                        other
                    )));
                }
                None => return Err(Error::protocol("Empty authentication response")),
            }
        }
    }

    fn handle_auth_switch(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = PacketReader::new(data);
        let plugin = reader
            .read_null_string()
            .ok_or_else(|| Error::protocol("Missing plugin name in auth switch"))?;
        let salt = reader.read_rest();

        tracing::debug!(plugin = %plugin, "auth switch requested");
        self.auth_data = salt.strip_suffix(&[0]).unwrap_or(salt).to_vec();
        self.auth_plugin = plugin.clone();

        let response = self.compute_auth_response(&plugin);
        self.stream.write_packet(&response)
    }

    fn handle_additional_auth(&mut self, data: &[u8]) -> Result<()> {
        if self.awaiting_public_key {
            self.awaiting_public_key = false;
            let password = self.config.password.clone().unwrap_or_default();
            let encrypted = auth::sha256_password_rsa(&password, &self.auth_data, data, true)
                .map_err(auth_error)?;
            return self.stream.write_packet(&encrypted);
        }

        match data.first().copied() {
            // OK follows
            Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(()),
            Some(caching_sha2::PERFORM_FULL_AUTH) => {
                let password = self.config.password.clone().unwrap_or_default();
                if self.is_tls() {
                    self.stream.write_packet(&cleartext(&password))
                } else {
                    self.awaiting_public_key = true;
                    self.stream
                        .write_packet(&[caching_sha2::REQUEST_PUBLIC_KEY])
                }
            }
            other => Err(Error::protocol(format!(
                "Unexpected auth data: {:02X?}",
                other
            ))),
        }
    }

    /// Send a command payload and read a bare OK or ERR answer.
    pub fn simple_command(&mut self, payload: &[u8]) -> Result<OkPacket> {
        self.stream.reset_sequence();
        self.stream.write_packet(payload)?;
        let reply = self.stream.read_packet()?;
        self.expect_ok(&reply)
    }

    /// Send a command that has no server reply.
    pub fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.reset_sequence();
        self.stream.write_packet(payload)
    }

    /// Send a command and return the raw first packet of the reply.
    pub fn raw_command(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.stream.reset_sequence();
        self.stream.write_packet(payload)?;
        self.stream.read_packet()
    }

    fn expect_ok(&mut self, reply: &[u8]) -> Result<OkPacket> {
        match reply.first().copied() {
            Some(OK_HEADER) => {
                let ok = PacketReader::new(reply)
                    .parse_ok_packet()
                    .ok_or_else(|| Error::protocol("Invalid OK packet"))?;
                self.status_flags = ok.status_flags;
                Ok(ok)
            }
            Some(ERR_HEADER) => Err(err_packet_error(reply)),
            _ => Err(Error::protocol("Expected OK packet")),
        }
    }

    /// Read a response that may carry a result set.
    fn read_query_response(&mut self, binary: bool) -> Result<QueryResult> {
        let payload = self.stream.read_packet()?;

        match payload.first().copied() {
            Some(OK_HEADER) => self.expect_ok(&payload).map(QueryResult::from_ok),
            Some(ERR_HEADER) => Err(err_packet_error(&payload)),
            Some(NULL_MARKER) => {
                // Decline LOCAL INFILE with an empty packet, then drain the reply
                self.stream.write_packet(&[])?;
                let reply = self.stream.read_packet()?;
                if reply.first() == Some(&ERR_HEADER) {
                    return Err(err_packet_error(&reply));
                }
                Err(Error::Query(QueryError::with_default_state(
                    codes::ER_UNKNOWN_ERROR,
                    "LOCAL INFILE is not supported",
                )))
            }
            Some(_) => {
                let mut reader = PacketReader::new(&payload);
                let column_count = reader
                    .read_lenenc_int()
                    .ok_or_else(|| Error::protocol("Invalid column count"))?
                    as usize;
                let columns = self.read_column_defs(column_count)?;
                let mut result_set = ResultSet::new(columns);
                result_set.binary = binary;
                self.read_rows(&mut result_set)?;
                Ok(QueryResult::with_result_set(result_set))
            }
            None => Err(Error::protocol("Empty query response")),
        }
    }

    fn read_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.stream.read_packet()?;
            columns.push(ColumnDef::parse(&payload)?);
        }
        if count > 0 {
            self.read_eof()?;
        }
        Ok(columns)
    }

    fn read_eof(&mut self) -> Result<()> {
        let payload = self.stream.read_packet()?;
        if is_eof(&payload) {
            Ok(())
        } else if payload.first() == Some(&ERR_HEADER) {
            Err(err_packet_error(&payload))
        } else {
            Err(Error::protocol("Expected EOF packet"))
        }
    }

    fn read_rows(&mut self, result_set: &mut ResultSet) -> Result<()> {
        loop {
            let payload = self.stream.read_packet()?;
            if is_eof(&payload) {
                if let Some(eof) = PacketReader::new(&payload).parse_eof_packet() {
                    result_set.status_flags = eof.status_flags;
                    result_set.warnings = eof.warnings;
                    self.status_flags = eof.status_flags;
                }
                return Ok(());
            }
            if payload.first() == Some(&ERR_HEADER) {
                return Err(err_packet_error(&payload));
            }
            result_set.rows.push(payload);
        }
    }

    /// Reset a prepared statement's long data on the server.
    pub fn reset_stmt(&mut self, stmt: &BackendStmt) -> Result<()> {
        self.simple_command(&build_stmt_reset_packet(stmt.statement_id))
            .map(|_| ())
    }

    /// Stream a chunk of a parameter value (COM_STMT_SEND_LONG_DATA).
    pub fn send_long_data(&mut self, statement_id: u32, param_id: u16, data: &[u8]) -> Result<()> {
        let mut writer = PacketWriter::with_capacity(7 + data.len());
        writer.write_u8(Command::StmtSendLongData as u8);
        writer.write_u32_le(statement_id);
        writer.write_u16_le(param_id);
        writer.write_bytes(data);
        self.send_command(writer.as_bytes())
    }

    /// Close the connection gracefully.
    pub fn close(mut self) -> Result<()> {
        self.quit();
        Ok(())
    }

    fn quit(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Best effort
        let _ = self.send_command(&[Command::Quit as u8]);
    }
}

impl Drop for MySqlBackend {
    fn drop(&mut self) {
        self.quit();
    }
}

impl Backend for MySqlBackend {
    #[tracing::instrument(level = "debug", skip(self, sql), fields(connection_id = self.server.connection_id))]
    fn query(&mut self, sql: &[u8]) -> Result<QueryResult> {
        let mut writer = PacketWriter::with_capacity(1 + sql.len());
        writer.write_u8(Command::Query as u8);
        writer.write_bytes(sql);

        self.stream.reset_sequence();
        self.stream.write_packet(writer.as_bytes())?;
        self.read_query_response(false)
    }

    fn use_db(&mut self, db: &str) -> Result<()> {
        let mut writer = PacketWriter::with_capacity(1 + db.len());
        writer.write_u8(Command::InitDb as u8);
        writer.write_bytes(db.as_bytes());
        self.simple_command(writer.as_bytes()).map(|_| ())
    }

    fn field_list(&mut self, table: &str, wildcard: &str) -> Result<Vec<ColumnDef>> {
        let mut writer = PacketWriter::with_capacity(2 + table.len() + wildcard.len());
        writer.write_u8(Command::FieldList as u8);
        writer.write_null_string(table);
        writer.write_bytes(wildcard.as_bytes());

        self.stream.reset_sequence();
        self.stream.write_packet(writer.as_bytes())?;

        let mut columns = Vec::new();
        loop {
            let payload = self.stream.read_packet()?;
            if is_eof(&payload) {
                return Ok(columns);
            }
            if payload.first() == Some(&ERR_HEADER) {
                return Err(err_packet_error(&payload));
            }
            columns.push(ColumnDef::parse(&payload)?);
        }
    }

    fn prepare(&mut self, sql: &[u8]) -> Result<BackendStmt> {
        self.stream.reset_sequence();
        self.stream.write_packet(&build_stmt_prepare_packet(sql))?;

        let payload = self.stream.read_packet()?;
        if payload.first() == Some(&ERR_HEADER) {
            return Err(err_packet_error(&payload));
        }
        let ok: StmtPrepareOk = parse_stmt_prepare_ok(&payload)
            .ok_or_else(|| Error::protocol("Invalid COM_STMT_PREPARE response"))?;

        let params = self.read_column_defs(usize::from(ok.num_params))?;
        let columns = self.read_column_defs(usize::from(ok.num_columns))?;

        Ok(BackendStmt {
            statement_id: ok.statement_id,
            params,
            columns,
        })
    }

    fn execute(&mut self, stmt: &BackendStmt, args: &[Value]) -> Result<QueryResult> {
        if args.len() != stmt.param_count() {
            return Err(Error::Query(QueryError::with_default_state(
                codes::ER_UNKNOWN_ERROR,
                format!(
                    "statement expects {} arguments, got {}",
                    stmt.param_count(),
                    args.len()
                ),
            )));
        }

        self.stream.reset_sequence();
        self.stream
            .write_packet(&build_stmt_execute_packet(stmt.statement_id, args))?;
        self.read_query_response(true)
    }

    fn close_stmt(&mut self, stmt: BackendStmt) -> Result<()> {
        self.send_command(&build_stmt_close_packet(stmt.statement_id))
    }

    fn ping(&mut self) -> Result<()> {
        self.simple_command(&[Command::Ping as u8]).map(|_| ())
    }
}

fn open_tcp(config: &BackendConfig) -> Result<TcpStream> {
    let connect_error = |kind, message: String, source: Option<std::io::Error>| {
        Error::Connection(ConnectionError {
            kind,
            message,
            source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        })
    };

    let addrs = config.socket_addr().to_socket_addrs().map_err(|e| {
        connect_error(
            ConnectionErrorKind::Connect,
            format!("Invalid socket address {}: {}", config.socket_addr(), e),
            Some(e),
        )
    })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                stream.set_read_timeout(Some(config.connect_timeout)).ok();
                stream.set_write_timeout(Some(config.connect_timeout)).ok();
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            connect_error(
                kind,
                format!("Failed to connect to {}: {}", config.socket_addr(), e),
                Some(e),
            )
        }
        None => connect_error(
            ConnectionErrorKind::Connect,
            format!("No address found for {}", config.socket_addr()),
            None,
        ),
    })
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

fn cleartext(password: &str) -> Vec<u8> {
    let mut data = password.as_bytes().to_vec();
    data.push(0);
    data
}

fn err_packet_error(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => Error::Query(err.into_query_error()),
        None => Error::protocol("Invalid error packet"),
    }
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}
