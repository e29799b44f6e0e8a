//! Shim configuration.
//!
//! - [`ServerConfig`]: what the shim announces to and requires of clients
//! - [`BackendConfig`]: how the shim reaches the real MySQL server
//! - [`TlsConfig`] / [`ClientTlsConfig`]: certificate material for each side
//! - [`ProxyConfig`]: a JSON document that produces both of the above

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use serde::Deserialize;
use sqlshim_core::{Error, Result};

use crate::auth::{self, plugins};
use crate::cache::Sha2PasswordCache;
use crate::protocol::{PROTOCOL_VERSION, capabilities, charset};

/// SSL mode for backend connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Prefer SSL if available, fall back to non-SSL
    Preferred,
    /// Require SSL connection
    Required,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Client certificate policy for TLS connections accepted by the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// Never ask for a client certificate
    #[default]
    None,
    /// Verify a certificate if the client offers one
    Optional,
    /// Refuse clients without a valid certificate
    Required,
}

/// Certificate material for TLS connections accepted by the shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub key_path: PathBuf,
    /// PEM CA bundle used to verify client certificates
    pub ca_path: Option<PathBuf>,
    pub client_auth: ClientAuth,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
            client_auth: ClientAuth::None,
        }
    }

    /// Set the CA bundle for client certificate verification.
    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn client_auth(mut self, policy: ClientAuth) -> Self {
        self.client_auth = policy;
        self
    }

    /// Load the certificates and build a rustls server configuration.
    pub fn build(&self) -> Result<Arc<rustls::ServerConfig>> {
        crate::tls::build_server_config(self)
    }
}

/// TLS options for the backend connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientTlsConfig {
    /// CA bundle for server verification; the webpki roots otherwise
    pub ca_cert_path: Option<PathBuf>,
    /// SNI override; defaults to the backend host
    pub server_name: Option<String>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
}

impl ClientTlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Skip server certificate verification. Test setups only.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// Server-side settings shared by every accepted connection.
///
/// Built once with [`ServerConfig::new`] and handed to connections as
/// `Arc<ServerConfig>`.
#[derive(Clone)]
pub struct ServerConfig {
    pub protocol_version: u8,
    pub server_version: String,
    /// Capabilities announced in the initial handshake
    pub capability: u32,
    pub collation: u8,
    pub default_auth_plugin: String,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Key used to decrypt RSA protected sha256/caching_sha2 passwords
    pub rsa_key: Option<Arc<RsaPrivateKey>>,
    /// PEM public key served to clients that request it
    pub public_key_pem: Option<String>,
    pub password_cache: Arc<Sha2PasswordCache>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("protocol_version", &self.protocol_version)
            .field("server_version", &self.server_version)
            .field("capability", &format_args!("{:#010x}", self.capability))
            .field("collation", &self.collation)
            .field("default_auth_plugin", &self.default_auth_plugin)
            .field("tls", &self.tls.is_some())
            .field("rsa_key", &self.rsa_key.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Server announcing `server_version`, caching_sha2_password by default,
    /// without TLS or an RSA key.
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_version: server_version.into(),
            capability: capabilities::DEFAULT_SERVER_FLAGS,
            collation: charset::UTF8_GENERAL_CI,
            default_auth_plugin: plugins::CACHING_SHA2_PASSWORD.to_string(),
            tls: None,
            rsa_key: None,
            public_key_pem: None,
            password_cache: Arc::new(Sha2PasswordCache::new()),
        }
    }

    /// Set the plugin offered in the initial handshake.
    pub fn default_auth_plugin(mut self, plugin: impl Into<String>) -> Result<Self> {
        let plugin = plugin.into();
        if !plugins::is_supported(&plugin) {
            return Err(Error::config(format!(
                "unsupported default auth plugin: {}",
                plugin
            )));
        }
        self.default_auth_plugin = plugin;
        Ok(self)
    }

    /// Enable TLS upgrades; announces `CLIENT_SSL`.
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self.capability |= capabilities::CLIENT_SSL;
        self
    }

    /// Install the RSA key pair used by sha256_password and
    /// caching_sha2_password on plaintext connections.
    pub fn rsa_key(mut self, key: RsaPrivateKey) -> Result<Self> {
        self.public_key_pem = Some(auth::public_key_pem(&key)?);
        self.rsa_key = Some(Arc::new(key));
        Ok(self)
    }

    pub fn collation(mut self, collation: u8) -> Self {
        self.collation = collation;
        self
    }

    /// Replace the announced capability flags. `CLIENT_SSL` is kept in sync
    /// with the TLS setting.
    pub fn capability(mut self, capability: u32) -> Self {
        self.capability = if self.tls.is_some() {
            capability | capabilities::CLIENT_SSL
        } else {
            capability & !capabilities::CLIENT_SSL
        };
        self
    }

    /// Share a password cache between several configs.
    pub fn password_cache(mut self, cache: Arc<Sha2PasswordCache>) -> Self {
        self.password_cache = cache;
        self
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capability & flag != 0
    }
}

/// Backend MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name to connect to (optional at connect time)
    pub database: Option<String>,
    /// Character set (default: utf8mb4)
    pub charset: u8,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// SSL mode
    pub ssl_mode: SslMode,
    pub tls: ClientTlsConfig,
    /// Capability flags requested on top of the driver defaults
    pub extra_capabilities: u32,
    /// Additional connection attributes
    pub attributes: HashMap<String, String>,
    /// Max allowed packet size (default: 64MB)
    pub max_packet_size: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::UTF8MB4_0900_AI_CI,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            tls: ClientTlsConfig::default(),
            extra_capabilities: 0,
            attributes: HashMap::new(),
            max_packet_size: 64 * 1024 * 1024,
        }
    }
}

impl BackendConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database; an empty name means none.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        let database = database.into();
        self.database = if database.is_empty() {
            None
        } else {
            Some(database)
        };
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Request an additional capability, e.g. `CLIENT_FOUND_ROWS`.
    pub fn capability(mut self, flag: u32) -> Self {
        self.extra_capabilities |= flag;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build capability flags based on configuration.
    pub fn capability_flags(&self) -> u32 {
        use crate::protocol::capabilities::{
            CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_SSL, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS | self.extra_capabilities;

        if self.database.is_none() {
            flags &= !CLIENT_CONNECT_WITH_DB;
        }

        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }

        if !self.attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }

        flags
    }
}

/// What happens to a query when the observer itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the error and run the query unmodified
    #[default]
    Open,
    /// Refuse the query
    Closed,
}

/// Proxy deployment settings, loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// Credentials clients may use instead of real backend accounts
    #[serde(default)]
    pub default_username: String,
    #[serde(default)]
    pub default_password: String,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default = "default_auth_plugin")]
    pub auth_plugin: String,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    #[serde(default)]
    pub client_auth: ClientAuth,
    /// PEM RSA private key for sha256/caching_sha2 over plaintext
    #[serde(default)]
    pub rsa_key: Option<PathBuf>,
    #[serde(default)]
    pub backend_ssl_mode: SslMode,
    /// CA bundle for verifying the backend's certificate
    #[serde(default)]
    pub backend_tls_ca: Option<PathBuf>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3307".to_string()
}

fn default_backend_port() -> u16 {
    3306
}

fn default_server_version() -> String {
    "5.7.0".to_string()
}

fn default_auth_plugin() -> String {
    plugins::CACHING_SHA2_PASSWORD.to_string()
}

impl ProxyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid proxy config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Build the server-side configuration, loading TLS and RSA material.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config =
            ServerConfig::new(&self.server_version).default_auth_plugin(&self.auth_plugin)?;

        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => {
                let mut tls = TlsConfig::new(cert, key).client_auth(self.client_auth);
                if let Some(ca) = &self.tls_ca {
                    tls = tls.ca_cert(ca);
                }
                config = config.tls(tls.build()?);
            }
            (None, None) => {}
            _ => {
                return Err(Error::config(
                    "tls_cert and tls_key must be set together",
                ));
            }
        }

        if let Some(path) = &self.rsa_key {
            config = config.rsa_key(load_rsa_private_key(path)?)?;
        }

        Ok(config)
    }

    /// Backend connection settings carrying the default credentials.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new()
            .host(&self.backend_host)
            .port(self.backend_port)
            .user(&self.default_username)
            .password(&self.default_password)
            .ssl_mode(self.backend_ssl_mode)
            .tls_config(ClientTlsConfig {
                ca_cert_path: self.backend_tls_ca.clone(),
                ..ClientTlsConfig::default()
            })
    }
}

/// Read an RSA private key in PKCS#8 or PKCS#1 PEM form.
pub fn load_rsa_private_key(path: impl AsRef<Path>) -> Result<RsaPrivateKey> {
    let path = path.as_ref();
    let pem = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::config(format!("invalid RSA key {}: {}", path.display(), e)))
}
