//! The policy-enforcing proxy handler.
//!
//! [`ProxyHandler`] sits between a client [`Conn`](crate::server::Conn) and
//! one dedicated backend connection. Every COM_QUERY is first shown to the
//! [`Observer`], which decides whether the statement runs untouched, runs
//! with its rows filtered and rewritten, or is refused outright.
//!
//! Authentication is passed through: clients that present a cleartext
//! password (sha256_password, caching_sha2_password) are checked by logging
//! in to the backend with their own credentials, and that login becomes the
//! connection's backend session.

// Statement counts originate from u16 wire fields
#![allow(clippy::cast_possible_truncation)]

use std::net::TcpListener;
use std::sync::Arc;

use sqlshim_core::error::{ConnectionError, ConnectionErrorKind, QueryError, codes};
use sqlshim_core::{
    CredentialProvider, DatabaseType, Disposition, Error, FieldValue, Observer, Result,
    TransformSummary, Value,
};

use crate::backend::{Backend, BackendConnector, BackendStmt, MySqlConnector, QueryResult};
use crate::config::{BackendConfig, FailurePolicy, ProxyConfig};
use crate::protocol::capabilities;
use crate::server::{Handler, Server};
use crate::types::{ColumnDef, encode_text_row};

/// Query handler and credential provider for one proxied client.
pub struct ProxyHandler<O: Observer, C: BackendConnector = MySqlConnector> {
    observer: Arc<O>,
    connector: C,
    /// Backend address plus the default credentials
    backend_config: BackendConfig,
    failure_policy: FailurePolicy,
    backend: Option<C::Backend>,
    /// Database named by the client before the backend was connected
    startup_db: String,
    current_db: String,
}

impl<O: Observer> ProxyHandler<O, MySqlConnector> {
    pub fn new(observer: Arc<O>, backend_config: BackendConfig) -> Self {
        Self::with_connector(observer, MySqlConnector, backend_config)
    }
}

impl<O: Observer, C: BackendConnector> ProxyHandler<O, C> {
    pub fn with_connector(observer: Arc<O>, connector: C, backend_config: BackendConfig) -> Self {
        Self {
            observer,
            connector,
            backend_config,
            failure_policy: FailurePolicy::default(),
            backend: None,
            startup_db: String::new(),
            current_db: String::new(),
        }
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn current_db(&self) -> &str {
        &self.current_db
    }

    /// Health check against the backend; OK when none is connected yet.
    pub fn ping_backend(&mut self) -> Result<()> {
        match self.backend.as_mut() {
            Some(backend) => backend.ping(),
            None => Ok(()),
        }
    }

    fn backend(&mut self) -> Result<&mut C::Backend> {
        self.backend.as_mut().ok_or_else(|| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "backend connection is not established".to_string(),
                source: None,
            })
        })
    }

    /// Connect to the backend as `user`, selecting the startup database.
    fn connect_backend(&self, user: &str, password: &str, capability: u32) -> Result<C::Backend> {
        let mut config = self
            .backend_config
            .clone()
            .user(user)
            .password(password)
            .database(self.startup_db.as_str());
        if capability & capabilities::CLIENT_FOUND_ROWS != 0 {
            config = config.capability(capabilities::CLIENT_FOUND_ROWS);
        }
        self.connector.connect(&config)
    }

    fn execute_and_transform(
        &mut self,
        query: &[u8],
        execution: &Execution<'_, O>,
    ) -> Result<QueryResult> {
        let mut result = self.backend()?.query(query)?;
        let Some(rs) = result.result_set.as_mut() else {
            execution.summary(TransformSummary::default());
            return Ok(result);
        };

        let names = rs.column_names();
        let rows = rs.text_rows()?;

        let mut summary = TransformSummary::default();
        let mut admitted = Vec::with_capacity(rows.len());
        for row in rows {
            summary.selector_rows += 1;
            let mut values: Vec<Option<Vec<u8>>> = row.iter().map(FieldValue::to_text).collect();
            if !execution.admit(&names, &mut values, summary.returned_rows)? {
                summary.denied_rows += 1;
                continue;
            }
            summary.returned_rows += 1;
            admitted.push(encode_text_row(&values));
        }
        rs.rows = admitted;

        tracing::debug!(
            rows = summary.selector_rows,
            returned = summary.returned_rows,
            denied = summary.denied_rows,
            "transformed result"
        );
        execution.summary(summary);
        Ok(result)
    }
}

/// One observed query's transform context. Cleanup runs exactly once, when
/// this is dropped, on every exit path including unwinding.
struct Execution<'a, O: Observer> {
    observer: &'a O,
    transform: Option<O::Transform>,
}

impl<'a, O: Observer> Execution<'a, O> {
    fn new(observer: &'a O, transform: O::Transform) -> Self {
        Self {
            observer,
            transform: Some(transform),
        }
    }

    fn admit(
        &self,
        names: &[String],
        values: &mut [Option<Vec<u8>>],
        returned_so_far: u64,
    ) -> Result<bool> {
        match &self.transform {
            Some(t) => self
                .observer
                .transform_data_row(names, values, t, returned_so_far),
            None => Ok(false),
        }
    }

    fn summary(&self, summary: TransformSummary) {
        if let Some(t) = &self.transform {
            self.observer.transform_summary(t, summary);
        }
    }
}

impl<O: Observer> Drop for Execution<'_, O> {
    fn drop(&mut self) {
        if let Some(t) = self.transform.take() {
            self.observer.cleanup_transformer_execution(t);
        }
    }
}

fn access_denied() -> Error {
    Error::Query(QueryError::with_default_state(
        codes::ER_UNKNOWN_ERROR,
        "ACCESS DENIED",
    ))
}

impl<O: Observer, C: BackendConnector> Handler for ProxyHandler<O, C> {
    type StmtContext = BackendStmt;

    fn use_db(&mut self, db: &str) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            self.startup_db = db.to_string();
            return Ok(());
        };
        backend.use_db(db)?;
        if self.current_db != db {
            self.current_db = db.to_string();
            self.observer.notify_schema_selected(db);
        }
        Ok(())
    }

    /// The observer judges a UTF-8 view of the statement; the backend always
    /// receives the client's original bytes.
    #[tracing::instrument(level = "debug", skip(self, query))]
    fn handle_query(
        &mut self,
        query: &[u8],
        current_db: &str,
        connection_id: u32,
    ) -> Result<QueryResult> {
        let observer = Arc::clone(&self.observer);
        let decision = observer.handle_query(
            DatabaseType::MySql,
            &format!("{};", String::from_utf8_lossy(query)),
            current_db,
            connection_id,
        );

        let (disposition, transform) = match decision {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(connection_id, error = %e, "observer failed to handle query");
                return match self.failure_policy {
                    FailurePolicy::Open => self.backend()?.query(query),
                    FailurePolicy::Closed => Err(access_denied()),
                };
            }
        };
        let execution = Execution::new(&*observer, transform);

        match disposition {
            Disposition::Passthrough => {
                tracing::debug!(connection_id, "passthrough query");
                self.backend()?.query(query)
            }
            Disposition::AccessDenied => {
                tracing::warn!(connection_id, "query denied");
                execution.summary(TransformSummary::default());
                Err(access_denied())
            }
            Disposition::TransformResponse => {
                tracing::debug!(connection_id, "transforming query result");
                self.execute_and_transform(query, &execution)
            }
        }
    }

    fn handle_field_list(&mut self, table: &str, wildcard: &str) -> Result<Vec<ColumnDef>> {
        self.backend()?.field_list(table, wildcard)
    }

    fn handle_stmt_prepare(&mut self, query: &[u8]) -> Result<(u16, u16, BackendStmt)> {
        let stmt = self.backend()?.prepare(query)?;
        Ok((
            stmt.param_count() as u16,
            stmt.column_count() as u16,
            stmt,
        ))
    }

    fn handle_stmt_execute(
        &mut self,
        context: &mut BackendStmt,
        _query: &[u8],
        args: &[Value],
    ) -> Result<QueryResult> {
        self.backend()?.execute(context, args)
    }

    fn handle_stmt_close(&mut self, context: BackendStmt) -> Result<()> {
        self.backend()?.close_stmt(context)
    }

    fn handle_ping(&mut self) -> Result<()> {
        self.ping_backend()
    }

    /// Clients that logged in with the default credentials get a backend
    /// session now; then the observer learns the selected schema.
    fn authenticated(&mut self, capability: u32) -> Result<()> {
        if self.backend.is_none() {
            let user = self.backend_config.user.clone();
            let password = self.backend_config.password.clone().unwrap_or_default();
            self.backend = Some(self.connect_backend(&user, &password, capability)?);
            self.current_db.clone_from(&self.startup_db);
        }
        self.observer.notify_schema_selected(&self.current_db);
        Ok(())
    }
}

impl<O: Observer, C: BackendConnector> CredentialProvider for ProxyHandler<O, C> {
    /// Only the configured default user has a locally known password.
    fn get_credential(&mut self, username: &str) -> Result<Option<String>> {
        if !self.backend_config.user.is_empty() && username == self.backend_config.user {
            Ok(Some(
                self.backend_config.password.clone().unwrap_or_default(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Log in to the backend with the client's own credentials.
    fn check_password(&mut self, username: &str, password: &str, capability: u32) -> Result<bool> {
        match self.connect_backend(username, password, capability) {
            Ok(backend) => {
                self.backend = Some(backend);
                self.current_db.clone_from(&self.startup_db);
                Ok(true)
            }
            Err(e) if e.is_access_denied() => {
                tracing::debug!(user = username, "backend rejected credentials");
                Ok(false)
            }
            Err(e) => Err(Error::Custom(format!(
                "failed to authenticate with target DB: {}",
                e
            ))),
        }
    }
}

/// Serve the proxy described by `config` until the listener fails.
pub fn run_proxy<O: Observer + 'static>(config: &ProxyConfig, observer: Arc<O>) -> Result<()> {
    let server_config = Arc::new(config.server_config()?);
    let backend_config = config.backend_config();
    let backend_addr = backend_config.socket_addr();
    let policy = config.failure_policy;

    let server = Server::new(server_config, move || {
        ProxyHandler::new(Arc::clone(&observer), backend_config.clone()).failure_policy(policy)
    });

    let listener = TcpListener::bind(&config.listen_addr)?;
    tracing::info!(
        listen = %config.listen_addr,
        backend = %backend_addr,
        "sql shim listening"
    );
    server.serve(&listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResultSet;
    use crate::types::FieldType;
    use sqlshim_core::error::AccessDeniedError;
    use std::sync::Mutex;

    /// Backend double that records every query.
    #[derive(Debug, Default)]
    struct FakeBackend {
        log: Arc<Mutex<Vec<String>>>,
        raw: Arc<Mutex<Vec<Vec<u8>>>>,
        rows: Vec<Vec<Option<&'static str>>>,
    }

    impl Backend for FakeBackend {
        fn query(&mut self, sql: &[u8]) -> Result<QueryResult> {
            self.log
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(sql).into_owned());
            self.raw.lock().unwrap().push(sql.to_vec());
            if sql.starts_with(b"UPDATE") {
                return Ok(QueryResult {
                    affected_rows: 2,
                    ..QueryResult::default()
                });
            }
            let mut rs = ResultSet::new(vec![
                ColumnDef::new("id", FieldType::LongLong),
                ColumnDef::new("email", FieldType::VarString),
            ]);
            for row in &self.rows {
                let values: Vec<_> = row.iter().map(|v| v.map(|s| s.as_bytes().to_vec())).collect();
                rs.rows.push(encode_text_row(&values));
            }
            Ok(QueryResult::with_result_set(rs))
        }

        fn use_db(&mut self, db: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("USE {}", db));
            Ok(())
        }

        fn field_list(&mut self, _table: &str, _wildcard: &str) -> Result<Vec<ColumnDef>> {
            Ok(Vec::new())
        }

        fn prepare(&mut self, _sql: &[u8]) -> Result<BackendStmt> {
            Ok(BackendStmt {
                statement_id: 1,
                params: vec![ColumnDef::new("?", FieldType::VarString)],
                columns: Vec::new(),
            })
        }

        fn execute(&mut self, _stmt: &BackendStmt, _args: &[Value]) -> Result<QueryResult> {
            Ok(QueryResult::default())
        }

        fn close_stmt(&mut self, _stmt: BackendStmt) -> Result<()> {
            Ok(())
        }

        fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default)]
    struct FakeConnector {
        log: Arc<Mutex<Vec<String>>>,
        raw: Arc<Mutex<Vec<Vec<u8>>>>,
        password: &'static str,
        unreachable: bool,
    }

    impl BackendConnector for FakeConnector {
        type Backend = FakeBackend;

        fn connect(&self, config: &BackendConfig) -> Result<FakeBackend> {
            self.log.lock().unwrap().push(format!(
                "CONNECT {} db={:?} found_rows={}",
                config.user,
                config.database,
                config.extra_capabilities & capabilities::CLIENT_FOUND_ROWS != 0
            ));
            if self.unreachable {
                return Err(Error::Custom("connection refused".to_string()));
            }
            if config.password.as_deref() != Some(self.password) {
                return Err(Error::AccessDenied(AccessDeniedError {
                    user: config.user.clone(),
                    host: "backend".to_string(),
                    using_password: true,
                }));
            }
            Ok(FakeBackend {
                log: Arc::clone(&self.log),
                raw: Arc::clone(&self.raw),
                rows: vec![
                    vec![Some("1"), Some("a@example.com")],
                    vec![Some("2"), Some("b@example.com")],
                    vec![Some("3"), None],
                ],
            })
        }
    }

    #[derive(Debug, Default)]
    struct RecordingObserver {
        disposition: Option<Disposition>,
        fail: bool,
        events: Mutex<Vec<String>>,
        summaries: Mutex<Vec<TransformSummary>>,
    }

    impl RecordingObserver {
        fn with(disposition: Disposition) -> Self {
            Self {
                disposition: Some(disposition),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Observer for RecordingObserver {
        type Transform = u32;

        fn handle_query(
            &self,
            _db_type: DatabaseType,
            query: &str,
            _current_db: &str,
            _connection_id: u32,
        ) -> Result<(Disposition, u32)> {
            self.events.lock().unwrap().push(format!("query {}", query));
            if self.fail {
                return Err(Error::Observer(sqlshim_core::error::ObserverError::new(
                    "policy store unavailable",
                )));
            }
            Ok((self.disposition.unwrap_or(Disposition::Passthrough), 7))
        }

        fn transform_data_row(
            &self,
            _column_names: &[String],
            values: &mut [Option<Vec<u8>>],
            _transform: &u32,
            _returned_so_far: u64,
        ) -> Result<bool> {
            if values[0].as_deref() == Some(b"2") {
                return Ok(false);
            }
            if values[1].is_some() {
                values[1] = Some(b"<redacted>".to_vec());
            }
            Ok(true)
        }

        fn transform_summary(&self, _transform: &u32, summary: TransformSummary) {
            self.summaries.lock().unwrap().push(summary);
        }

        fn cleanup_transformer_execution(&self, transform: u32) {
            self.events
                .lock()
                .unwrap()
                .push(format!("cleanup {}", transform));
        }

        fn notify_schema_selected(&self, db_name: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("schema {}", db_name));
        }
    }

    fn handler(
        observer: &Arc<RecordingObserver>,
    ) -> (ProxyHandler<RecordingObserver, FakeConnector>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = FakeConnector {
            log: Arc::clone(&log),
            password: "secret123",
            ..FakeConnector::default()
        };
        let config = BackendConfig::new().user("shim").password("secret123");
        let mut handler = ProxyHandler::with_connector(Arc::clone(observer), connector, config);
        handler.authenticated(0).unwrap();
        (handler, log)
    }

    #[test]
    fn test_passthrough_runs_query_and_cleans_up() {
        let observer = Arc::new(RecordingObserver::with(Disposition::Passthrough));
        let (mut handler, log) = handler(&observer);

        let result = handler.handle_query(b"SELECT * FROM users", "", 10_000).unwrap();
        assert_eq!(result.result_set.unwrap().rows.len(), 3);
        assert!(log.lock().unwrap().contains(&"SELECT * FROM users".to_string()));
        assert_eq!(
            observer.events(),
            vec!["schema ", "query SELECT * FROM users;", "cleanup 7"]
        );
    }

    #[test]
    fn test_query_bytes_reach_backend_unchanged() {
        let observer = Arc::new(RecordingObserver::with(Disposition::Passthrough));
        let connector = FakeConnector {
            password: "secret123",
            ..FakeConnector::default()
        };
        let raw = Arc::clone(&connector.raw);
        let config = BackendConfig::new().user("shim").password("secret123");
        let mut handler = ProxyHandler::with_connector(Arc::clone(&observer), connector, config);
        handler.authenticated(0).unwrap();

        handler.handle_query(b"SELECT 'caf\xE9'", "", 1).unwrap();
        assert_eq!(*raw.lock().unwrap(), vec![b"SELECT 'caf\xE9'".to_vec()]);
        assert_eq!(observer.events()[1], "query SELECT 'caf\u{FFFD}';");
    }

    #[test]
    fn test_access_denied_skips_backend() {
        let observer = Arc::new(RecordingObserver::with(Disposition::AccessDenied));
        let (mut handler, log) = handler(&observer);

        let err = handler.handle_query(b"SELECT ssn FROM users", "", 1).unwrap_err();
        assert_eq!(err.mysql_code(), Some(1105));
        assert_eq!(err.to_string(), "ERROR 1105 (HY000): ACCESS DENIED");
        assert!(log.lock().unwrap().iter().all(|q| !q.starts_with("SELECT")));
        assert_eq!(
            *observer.summaries.lock().unwrap(),
            vec![TransformSummary::default()]
        );
        assert_eq!(observer.events().last().unwrap(), "cleanup 7");
    }

    #[test]
    fn test_transform_filters_and_rewrites_rows() {
        let observer = Arc::new(RecordingObserver::with(Disposition::TransformResponse));
        let (mut handler, _log) = handler(&observer);

        let result = handler.handle_query(b"SELECT id, email FROM users", "", 1).unwrap();
        let rs = result.result_set.unwrap();
        assert_eq!(
            rs.rows,
            vec![
                encode_text_row(&[Some(b"1".to_vec()), Some(b"<redacted>".to_vec())]),
                encode_text_row(&[Some(b"3".to_vec()), None]),
            ]
        );
        assert_eq!(
            *observer.summaries.lock().unwrap(),
            vec![TransformSummary {
                selector_rows: 3,
                returned_rows: 2,
                denied_rows: 1,
            }]
        );
        assert_eq!(
            observer
                .events()
                .iter()
                .filter(|e| e.starts_with("cleanup"))
                .count(),
            1
        );
    }

    #[test]
    fn test_transform_without_rows_reports_empty_summary() {
        let observer = Arc::new(RecordingObserver::with(Disposition::TransformResponse));
        let (mut handler, _log) = handler(&observer);

        let result = handler.handle_query(b"UPDATE users SET x = 1", "", 1).unwrap();
        assert_eq!(result.affected_rows, 2);
        assert_eq!(
            *observer.summaries.lock().unwrap(),
            vec![TransformSummary::default()]
        );
    }

    #[test]
    fn test_observer_failure_policy() {
        let observer = Arc::new(RecordingObserver {
            fail: true,
            ..RecordingObserver::default()
        });
        let (mut open, log) = handler(&observer);
        assert!(open.handle_query(b"SELECT 1", "", 1).is_ok());
        assert!(log.lock().unwrap().contains(&"SELECT 1".to_string()));

        let (closed, log) = handler(&observer);
        let mut closed = closed.failure_policy(FailurePolicy::Closed);
        assert!(closed.handle_query(b"SELECT 2", "", 1).is_err());
        assert!(!log.lock().unwrap().contains(&"SELECT 2".to_string()));
        // no transform context was handed out, so nothing to clean up
        assert!(observer.events().iter().all(|e| !e.starts_with("cleanup")));
    }

    #[test]
    fn test_pass_through_authentication() {
        let observer = Arc::new(RecordingObserver::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = FakeConnector {
            log: Arc::clone(&log),
            password: "hunter2",
            ..FakeConnector::default()
        };
        let config = BackendConfig::new().user("shim").password("default");
        let mut handler = ProxyHandler::with_connector(Arc::clone(&observer), connector, config);

        handler.use_db("shop").unwrap();
        assert!(!handler.has_backend());

        assert!(!handler.check_password("alice", "wrong", 0).unwrap());
        assert!(!handler.has_backend());

        assert!(
            handler
                .check_password("alice", "hunter2", capabilities::CLIENT_FOUND_ROWS)
                .unwrap()
        );
        assert!(handler.has_backend());
        assert_eq!(handler.current_db(), "shop");
        assert_eq!(
            log.lock().unwrap().last().unwrap(),
            "CONNECT alice db=Some(\"shop\") found_rows=true"
        );

        // backend already connected: no default-credential login
        handler.authenticated(0).unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(observer.events(), vec!["schema shop"]);
    }

    #[test]
    fn test_check_password_reports_backend_errors() {
        let observer = Arc::new(RecordingObserver::default());
        let connector = FakeConnector {
            unreachable: true,
            ..FakeConnector::default()
        };
        let mut handler =
            ProxyHandler::with_connector(observer, connector, BackendConfig::new());
        let err = handler.check_password("alice", "pw", 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to authenticate with target DB: connection refused"
        );
    }

    #[test]
    fn test_get_credential_only_for_default_user() {
        let observer = Arc::new(RecordingObserver::default());
        let config = BackendConfig::new().user("shim").password("secret123");
        let mut handler =
            ProxyHandler::with_connector(observer, FakeConnector::default(), config);
        assert_eq!(
            handler.get_credential("shim").unwrap().as_deref(),
            Some("secret123")
        );
        assert_eq!(handler.get_credential("alice").unwrap(), None);
    }

    #[test]
    fn test_use_db_notifies_on_change() {
        let observer = Arc::new(RecordingObserver::default());
        let (mut handler, log) = handler(&observer);
        handler.use_db("crm").unwrap();
        handler.use_db("crm").unwrap();
        assert_eq!(observer.events(), vec!["schema ", "schema crm"]);
        assert_eq!(
            log.lock()
                .unwrap()
                .iter()
                .filter(|q| q.as_str() == "USE crm")
                .count(),
            2
        );
    }
}
