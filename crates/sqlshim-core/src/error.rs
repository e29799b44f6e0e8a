//! Error types for shim operations.

use std::fmt;

/// MySQL server error numbers used by the shim, with their default SQLSTATE.
pub mod codes {
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
    pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;
    pub const ER_MALFORMED_PACKET: u16 = 1835;

    /// Default SQLSTATE for an error number.
    pub fn default_sqlstate(code: u16) -> &'static str {
        match code {
            ER_ACCESS_DENIED_ERROR => "28000",
            ER_UNKNOWN_COM_ERROR => "08S01",
            ER_NOT_SUPPORTED_AUTH_MODE => "08004",
            _ => "HY000",
        }
    }
}

/// The primary error type for all shim operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, TLS)
    Connection(ConnectionError),
    /// MySQL-numbered errors, reported by the backend or raised for the client
    Query(QueryError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Client authentication was rejected
    AccessDenied(AccessDeniedError),
    /// Configuration errors
    Config(ConfigError),
    /// Errors raised by the query observer
    Observer(ObserverError),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication against the backend failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Connection refused
    Refused,
}

/// An error carrying a MySQL error number.
#[derive(Debug)]
pub struct QueryError {
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Rejected client login. Never carries the attempted password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDeniedError {
    pub user: String,
    pub host: String,
    pub using_password: bool,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ObserverError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Build an error with an explicit number and state.
    pub fn new(code: u16, sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            sqlstate: Some(sqlstate.into()),
            message: message.into(),
            source: None,
        }
    }

    /// Build an error using the default SQLSTATE for `code`.
    pub fn with_default_state(code: u16, message: impl Into<String>) -> Self {
        Self::new(code, codes::default_sqlstate(code), message)
    }

    pub fn is_access_denied(&self) -> bool {
        self.code == codes::ER_ACCESS_DENIED_ERROR
    }
}

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Shorthand for a protocol error without raw data.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a connection error that means the peer is gone or unusable?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Did a MySQL server reject the credentials?
    pub fn is_access_denied(&self) -> bool {
        match self {
            Error::Query(q) => q.is_access_denied(),
            Error::AccessDenied(_) => true,
            _ => false,
        }
    }

    /// MySQL error number if this error carries one.
    pub fn mysql_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            Error::AccessDenied(_) => Some(codes::ER_ACCESS_DENIED_ERROR),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "28000" for access denied)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::AccessDenied(_) => Some("28000"),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "{}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::AccessDenied(e) => write!(f, "{}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Observer(e) => write!(f, "Observer error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Observer(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "ERROR {} ({}): {}", self.code, state, self.message),
            None => write!(f, "ERROR {}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AccessDeniedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Access denied for user '{}'@'{}' (using password: {})",
            self.user,
            self.host,
            if self.using_password { "YES" } else { "NO" }
        )
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AccessDeniedError> for Error {
    fn from(err: AccessDeniedError) -> Self {
        Error::AccessDenied(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ObserverError> for Error {
    fn from(err: ObserverError) -> Self {
        Error::Observer(err)
    }
}

/// Result type alias for shim operations.
pub type Result<T> = std::result::Result<T, Error>;
