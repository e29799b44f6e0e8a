//! Loopback fixtures shared by the integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sqlshim_core::error::QueryError;
use sqlshim_core::{CredentialProvider, InMemoryCredentialProvider, Result, Value};
use sqlshim_mysql::auth::{self, plugins};
use sqlshim_mysql::backend::parse_handshake;
use sqlshim_mysql::config::load_rsa_private_key;
use sqlshim_mysql::protocol::{PacketStream, PacketWriter, capabilities};
use sqlshim_mysql::server::{BinlogDumpGtidRequest, BinlogDumpRequest, BinlogStream};
use sqlshim_mysql::types::encode_text_row;
use sqlshim_mysql::{
    BackendConfig, ColumnDef, FieldType, Handler, QueryResult, ReplicationHandler, ResultSet,
    Server, ServerConfig, SslMode, TlsConfig,
};

pub const USER: &str = "root";
pub const PASSWORD: &str = "secret123";

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn server_config(plugin: &str) -> ServerConfig {
    ServerConfig::new("8.0.36-sqlshim")
        .default_auth_plugin(plugin)
        .unwrap()
}

pub fn with_rsa(config: ServerConfig) -> ServerConfig {
    config
        .rsa_key(load_rsa_private_key(fixture("server-key.pem")).unwrap())
        .unwrap()
}

pub fn with_tls(config: ServerConfig) -> ServerConfig {
    let tls = TlsConfig::new(fixture("server-cert.pem"), fixture("server-key.pem"))
        .build()
        .unwrap();
    config.tls(tls)
}

/// Serve `factory`'s handlers on an ephemeral loopback port.
pub fn start<F, H>(config: ServerConfig, factory: F) -> SocketAddr
where
    F: Fn() -> H + Send + Sync + 'static,
    H: Handler + CredentialProvider + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(Arc::new(config), factory);
    thread::spawn(move || {
        let _ = server.serve(&listener);
    });
    addr
}

pub fn client_config(addr: SocketAddr, user: &str, password: &str) -> BackendConfig {
    BackendConfig::new()
        .host("127.0.0.1")
        .port(addr.port())
        .user(user)
        .password(password)
        .connect_timeout(Duration::from_secs(5))
        .ssl_mode(SslMode::Disable)
}

/// What a [`TestHandler`] saw.
#[derive(Debug, Default)]
pub struct Recorder {
    pub queries: Vec<String>,
    /// COM_QUERY payloads byte for byte
    pub raw_queries: Vec<Vec<u8>>,
    pub prepared: Vec<String>,
    pub executions: Vec<(String, Vec<Value>)>,
    pub closed: Vec<String>,
    pub databases: Vec<String>,
}

/// Small in-memory database: a `users` table, `SELECT 1`, `SELECT
/// DATABASE()` and row-count answers for writes.
pub struct TestHandler {
    credentials: InMemoryCredentialProvider,
    recorder: Arc<Mutex<Recorder>>,
    current_db: String,
    binlog: Option<BinlogSource>,
}

impl TestHandler {
    pub fn new(recorder: Arc<Mutex<Recorder>>) -> Self {
        Self {
            credentials: InMemoryCredentialProvider::new()
                .user(USER, PASSWORD)
                .user("alice", "alicepw"),
            recorder,
            current_db: String::new(),
            binlog: None,
        }
    }

    pub fn with_binlog(mut self, events: Vec<Vec<u8>>) -> Self {
        self.binlog = Some(BinlogSource {
            events,
            replicas: Vec::new(),
        });
        self
    }

    pub fn factory(recorder: &Arc<Mutex<Recorder>>) -> impl Fn() -> TestHandler + Send + Sync + 'static {
        let recorder = Arc::clone(recorder);
        move || TestHandler::new(Arc::clone(&recorder))
    }
}

pub fn users_result() -> QueryResult {
    let mut rs = ResultSet::new(vec![
        ColumnDef::new("id", FieldType::LongLong),
        ColumnDef::new("email", FieldType::VarString),
    ]);
    for (id, email) in [("1", Some("a@example.com")), ("2", Some("b@example.com")), ("3", None)] {
        rs.rows.push(encode_text_row(&[
            Some(id.as_bytes().to_vec()),
            email.map(|e| e.as_bytes().to_vec()),
        ]));
    }
    QueryResult::with_result_set(rs)
}

fn single_value(name: &str, value: &str) -> QueryResult {
    let mut rs = ResultSet::new(vec![ColumnDef::new(name, FieldType::VarString)]);
    rs.rows.push(encode_text_row(&[Some(value.as_bytes().to_vec())]));
    QueryResult::with_result_set(rs)
}

impl Handler for TestHandler {
    type StmtContext = String;

    fn use_db(&mut self, db: &str) -> Result<()> {
        if db == "missing" {
            return Err(QueryError::new(1049, "42000", format!("Unknown database '{}'", db)).into());
        }
        self.current_db = db.to_string();
        self.recorder.lock().unwrap().databases.push(db.to_string());
        Ok(())
    }

    fn handle_query(&mut self, query: &[u8], _current_db: &str, _connection_id: u32) -> Result<QueryResult> {
        let mut recorder = self.recorder.lock().unwrap();
        recorder.raw_queries.push(query.to_vec());
        let Ok(query) = std::str::from_utf8(query) else {
            // latin1 literals and the like: acknowledge without parsing
            return Ok(QueryResult::default());
        };
        recorder.queries.push(query.to_string());
        drop(recorder);
        match query {
            "SELECT 1" => Ok(single_value("1", "1")),
            "SELECT DATABASE()" => Ok(single_value("DATABASE()", &self.current_db)),
            q if q.starts_with("SELECT id, email FROM users") => Ok(users_result()),
            q if q.starts_with("UPDATE") || q.starts_with("DELETE") => Ok(QueryResult {
                affected_rows: 2,
                ..QueryResult::default()
            }),
            _ => Err(QueryError::new(
                1064,
                "42000",
                "You have an error in your SQL syntax",
            )
            .into()),
        }
    }

    fn handle_field_list(&mut self, table: &str, _wildcard: &str) -> Result<Vec<ColumnDef>> {
        if table != "users" {
            return Err(QueryError::new(1146, "42S02", format!("Table '{}' doesn't exist", table)).into());
        }
        Ok(vec![
            ColumnDef::new("id", FieldType::LongLong),
            ColumnDef::new("email", FieldType::VarString),
        ])
    }

    fn handle_stmt_prepare(&mut self, query: &[u8]) -> Result<(u16, u16, String)> {
        let params = query.iter().filter(|&&b| b == b'?').count() as u16;
        let text = String::from_utf8_lossy(query).into_owned();
        self.recorder.lock().unwrap().prepared.push(text.clone());
        Ok((params, 0, text))
    }

    fn handle_stmt_execute(&mut self, context: &mut String, _query: &[u8], args: &[Value]) -> Result<QueryResult> {
        self.recorder
            .lock()
            .unwrap()
            .executions
            .push((context.clone(), args.to_vec()));
        Ok(QueryResult {
            affected_rows: 1,
            ..QueryResult::default()
        })
    }

    fn handle_stmt_close(&mut self, context: String) -> Result<()> {
        self.recorder.lock().unwrap().closed.push(context);
        Ok(())
    }

    fn replication(&mut self) -> Option<&mut dyn ReplicationHandler> {
        self.binlog.as_mut().map(|b| b as &mut dyn ReplicationHandler)
    }
}

impl CredentialProvider for TestHandler {
    fn get_credential(&mut self, username: &str) -> Result<Option<String>> {
        self.credentials.get_credential(username)
    }

    fn check_password(&mut self, username: &str, password: &str, capability: u32) -> Result<bool> {
        self.credentials.check_password(username, password, capability)
    }
}

/// Fixed list of binlog events served to every replica.
pub struct BinlogSource {
    events: Vec<Vec<u8>>,
    replicas: Vec<Vec<u8>>,
}

impl ReplicationHandler for BinlogSource {
    fn register_slave(&mut self, data: &[u8]) -> Result<()> {
        self.replicas.push(data.to_vec());
        Ok(())
    }

    fn binlog_dump(&mut self, request: BinlogDumpRequest) -> Result<BinlogStream> {
        let skip = request.position.saturating_sub(4) as usize;
        let events: Vec<_> = self.events.iter().skip(skip).cloned().map(Ok).collect();
        Ok(Box::new(events.into_iter()))
    }

    fn binlog_dump_gtid(&mut self, _request: BinlogDumpGtidRequest) -> Result<BinlogStream> {
        let events: Vec<_> = self.events.iter().cloned().map(Ok).collect();
        Ok(Box::new(events.into_iter()))
    }
}

/// Hand-rolled client login that announces `plugin` with `auth_response`
/// and answers whatever auth switch the server asks for with a native
/// scramble of `password`.
pub fn raw_login(
    addr: SocketAddr,
    user: &str,
    password: &str,
    plugin: &str,
    auth_response: &[u8],
) -> (PacketStream<TcpStream>, Vec<u8>) {
    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut stream = PacketStream::new(tcp);

    let handshake = parse_handshake(&stream.read_packet().unwrap()).unwrap();
    assert_eq!(handshake.auth_data.len(), auth::SALT_LEN);

    let caps = capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_LONG_PASSWORD
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_PLUGIN_AUTH
        | capabilities::CLIENT_TRANSACTIONS;
    let mut w = PacketWriter::new();
    w.write_u32_le(caps);
    w.write_u32_le(16_777_216);
    w.write_u8(33);
    w.write_zeros(23);
    w.write_null_string(user);
    w.write_u8(auth_response.len() as u8);
    w.write_bytes(auth_response);
    w.write_null_string(plugin);
    stream.write_packet(w.as_bytes()).unwrap();

    let mut reply = stream.read_packet().unwrap();
    if reply.first() == Some(&0xFE) {
        let body = &reply[1..];
        let nul = body.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&body[..nul], plugins::MYSQL_NATIVE_PASSWORD.as_bytes());
        let salt = body[nul + 1..].strip_suffix(&[0]).unwrap();
        assert_eq!(salt.len(), auth::SALT_LEN);
        assert_ne!(salt, handshake.auth_data.as_slice());
        stream
            .write_packet(&auth::mysql_native_password(password, salt))
            .unwrap();
        reply = stream.read_packet().unwrap();
    }
    (stream, reply)
}
