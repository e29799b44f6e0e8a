//! TLS support for both ends of the shim.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends initial handshake with `CLIENT_SSL` capability
//! 2. If SSL is requested, client sends short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client performs TLS handshake
//! 4. Client sends full handshake response over TLS
//! 5. Server sends auth result over TLS
//!
//! The shim plays the server role towards its clients
//! ([`TlsStream::accept`]) and the client role towards the backend
//! ([`TlsStream::connect`]). Both use rustls with the ring provider.

#![allow(clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use sqlshim_core::Error;
use sqlshim_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{ClientAuth, ClientTlsConfig, SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};

/// Length of an SSL request payload.
pub const SSL_REQUEST_LEN: usize = 32;

/// Build an SSL request payload.
///
/// # Format
///
/// - capability_flags (4 bytes): Client capabilities with CLIENT_SSL set
/// - max_packet_size (4 bytes): Maximum packet size
/// - character_set (1 byte): Character set code
/// - reserved (23 bytes): All zeros
pub fn build_ssl_request_packet(client_caps: u32, max_packet_size: u32, character_set: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(SSL_REQUEST_LEN);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Check if the server supports SSL/TLS.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade a backend connection.
///
/// - `Ok(true)` if SSL should be used
/// - `Ok(false)` if SSL should not be used
/// - `Err(_)` if SSL is required but not supported by server
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);
    if ssl_mode.is_required() && !server_supports {
        return Err(tls_error("SSL required but server does not support it"));
    }
    Ok(ssl_mode.should_try_ssl() && server_supports)
}

/// Validate backend TLS options for the given SSL mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &ClientTlsConfig) -> Result<(), Error> {
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls_config.ca_cert_path.is_none()
        && !tls_config.danger_skip_verify
    {
        return Err(tls_error(
            "CA certificate required for VerifyCa/VerifyIdentity mode. \
             Set ca_cert_path or danger_skip_verify.",
        ));
    }

    Ok(())
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// A byte stream encrypted with rustls, in either role.
pub struct TlsStream<S> {
    conn: rustls::Connection,
    stream: S,
}

impl<S> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write> TlsStream<S> {
    /// Complete a server-side handshake on an accepted connection.
    pub fn accept(stream: S, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| tls_error(format!("Failed to create TLS connection: {}", e)))?;
        Self::handshake(rustls::Connection::Server(conn), stream)
    }

    /// Complete a client-side handshake towards a backend.
    pub fn connect(
        stream: S,
        tls_config: &ClientTlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        let config = build_client_config(tls_config, ssl_mode)?;

        let sni_name = tls_config.server_name.as_deref().unwrap_or(server_name);
        let server_name = sni_name
            .to_string()
            .try_into()
            .map_err(|e| tls_error(format!("Invalid server name '{}': {}", sni_name, e)))?;

        let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("Failed to create TLS connection: {}", e)))?;
        Self::handshake(rustls::Connection::Client(conn), stream)
    }

    fn handshake(mut conn: rustls::Connection, mut stream: S) -> Result<Self, Error> {
        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake write error: {}", e)))?;
            }
            stream
                .flush()
                .map_err(|e| tls_error(format!("TLS handshake write error: {}", e)))?;

            if conn.is_handshaking() && conn.wants_read() {
                let n = conn
                    .read_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake read error: {}", e)))?;
                if n == 0 {
                    return Err(tls_error("TLS handshake aborted by peer"));
                }
                if let Err(e) = conn.process_new_packets() {
                    // Deliver the alert before giving up
                    let _ = conn.write_tls(&mut stream);
                    return Err(tls_error(format!("TLS handshake error: {}", e)));
                }
            }
        }

        // Flush any trailing handshake records
        while conn.wants_write() {
            conn.write_tls(&mut stream)
                .map_err(|e| tls_error(format!("TLS handshake write error: {}", e)))?;
        }

        Ok(TlsStream { conn, stream })
    }

    /// Get the negotiated protocol version.
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    /// Certificates presented by the peer, if any.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            let n = self.conn.read_tls(&mut self.stream)?;
            if n == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| std::io::Error::other(format!("TLS error: {}", e)))?;
        }
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

/// A transport that may have been upgraded to TLS mid-handshake.
#[derive(Debug)]
pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> MaybeTlsStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    /// The transport underneath any TLS layer.
    pub fn get_ref(&self) -> &S {
        match self {
            MaybeTlsStream::Plain(s) => s,
            MaybeTlsStream::Tls(tls) => &tls.stream,
        }
    }
}

impl<S: Read + Write> MaybeTlsStream<S> {
    /// Server-side upgrade of a plain stream.
    pub fn accept(self, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        match self {
            MaybeTlsStream::Plain(s) => Ok(MaybeTlsStream::Tls(Box::new(TlsStream::accept(s, config)?))),
            MaybeTlsStream::Tls(_) => Err(tls_error("connection is already encrypted")),
        }
    }

    /// Client-side upgrade of a plain stream.
    pub fn connect(
        self,
        tls_config: &ClientTlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        match self {
            MaybeTlsStream::Plain(s) => Ok(MaybeTlsStream::Tls(Box::new(TlsStream::connect(
                s,
                tls_config,
                server_name,
                ssl_mode,
            )?))),
            MaybeTlsStream::Tls(_) => Err(tls_error("connection is already encrypted")),
        }
    }
}

impl<S: Read + Write> Read for MaybeTlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(s) => s.read(buf),
            MaybeTlsStream::Tls(s) => s.read(buf),
        }
    }
}

impl<S: Read + Write> Write for MaybeTlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(s) => s.write(buf),
            MaybeTlsStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            MaybeTlsStream::Plain(s) => s.flush(),
            MaybeTlsStream::Tls(s) => s.flush(),
        }
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

const PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];

/// Build the rustls server configuration for client connections.
pub fn build_server_config(tls_config: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, Error> {
    let provider = crypto_provider();
    let certs = load_certs(&tls_config.cert_path)?;
    let key = load_private_key(&tls_config.key_path)?;

    let verifier = match tls_config.client_auth {
        ClientAuth::None => WebPkiClientVerifier::no_client_auth(),
        policy => {
            let ca_path = tls_config.ca_path.as_ref().ok_or_else(|| {
                Error::config("client certificate verification needs a CA bundle")
            })?;
            let roots = Arc::new(load_root_store(ca_path)?);
            let builder = WebPkiClientVerifier::builder_with_provider(roots, provider.clone());
            let builder = if policy == ClientAuth::Optional {
                builder.allow_unauthenticated()
            } else {
                builder
            };
            builder
                .build()
                .map_err(|e| Error::config(format!("invalid client verifier: {}", e)))?
        }
    };

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("invalid server certificate: {}", e)))?;

    Ok(Arc::new(config))
}

/// Build a rustls ClientConfig based on TLS configuration and SSL mode.
fn build_client_config(
    tls_config: &ClientTlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    let provider = crypto_provider();

    if ssl_mode == SslMode::Disable {
        return Err(tls_error("TlsStream created with SslMode::Disable"));
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?;

    let builder = if tls_config.danger_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let roots = match &tls_config.ca_cert_path {
            Some(ca_path) => load_root_store(ca_path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        builder.with_root_certificates(roots)
    };

    Ok(builder.with_no_client_auth())
}

/// A certificate verifier that accepts any certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>, Error> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::config(format!("Failed to open {} '{}': {}", what, path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = open_pem(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("Failed to parse certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = open_pem(path, "private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::config(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::config(format!("No private key found in '{}'", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::config(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::thread;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_build_ssl_request_packet() {
        let payload = build_ssl_request_packet(
            capabilities::DEFAULT_CLIENT_FLAGS,
            16 * 1024 * 1024,
            charset::UTF8MB4_0900_AI_CI,
        );
        assert_eq!(payload.len(), SSL_REQUEST_LEN);

        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::CLIENT_SSL != 0);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::Required, 0).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyCa, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, 0).is_err());
    }

    #[test]
    fn test_validate_tls_config() {
        let config = ClientTlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyCa, &config.clone().skip_verify(true)).is_ok());

        let config = ClientTlsConfig::new().ca_cert("/path/to/ca.pem");
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_ok());
    }

    #[test]
    fn test_build_server_config() {
        let tls = TlsConfig::new(fixture("server-cert.pem"), fixture("server-key.pem"));
        assert!(build_server_config(&tls).is_ok());

        // client verification without a CA bundle
        let needs_ca = tls.clone().client_auth(ClientAuth::Required);
        assert!(build_server_config(&needs_ca).is_err());
        let with_ca = needs_ca.ca_cert(fixture("server-cert.pem"));
        assert!(build_server_config(&with_ca).is_ok());

        let swapped = TlsConfig::new(fixture("server-key.pem"), fixture("server-cert.pem"));
        assert!(build_server_config(&swapped).is_err());
    }

    #[test]
    fn test_tls_roundtrip_over_loopback() {
        let server_config =
            build_server_config(&TlsConfig::new(fixture("server-cert.pem"), fixture("server-key.pem")))
                .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut tls = TlsStream::accept(stream, server_config).unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).unwrap();
            tls.write_all(&buf).unwrap();
            tls.flush().unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).unwrap();
        let client_tls = ClientTlsConfig::new().skip_verify(true);
        let mut tls = TlsStream::connect(stream, &client_tls, "localhost", SslMode::Required).unwrap();
        assert!(tls.protocol_version().is_some());
        tls.write_all(b"hello").unwrap();
        tls.flush().unwrap();
        let mut echo = [0u8; 5];
        tls.read_exact(&mut echo).unwrap();

        assert_eq!(&echo, b"hello");
        assert_eq!(&server.join().unwrap(), b"hello");
    }
}
