//! Server-side handshake and authentication.
//!
//! Flow for one client:
//! 1. Send the initial handshake (protocol 10) with a fresh 20-byte salt
//! 2. Read the handshake response, upgrading to TLS first if the client sent
//!    an SSL request
//! 3. Switch the client to the server's default plugin when it proposed a
//!    different one (new salt)
//! 4. Run the plugin exchange, then answer with OK or ERR
//!
//! `caching_sha2_password` never takes the fast path: every login is asked
//! for full authentication, which carries the cleartext password (over TLS
//! or RSA encrypted) to the credential provider.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use sqlshim_core::error::{AccessDeniedError, QueryError, codes};
use sqlshim_core::{CredentialProvider, Error, Result};

use super::conn::Conn;
use super::handler::Handler;
use super::response::{auth_more_data_payload, auth_switch_payload, error_payload, ok_payload};
use crate::auth::{self, caching_sha2, plugins};
use crate::cache::Sha2PasswordCache;
use crate::config::ServerConfig;
use crate::protocol::{
    OkPacket, PacketReader, PacketStream, PacketWriter, capabilities, malformed_packet,
    server_status,
};
use crate::tls::{MaybeTlsStream, SSL_REQUEST_LEN};

/// Parsed HandshakeResponse41.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: String,
    pub auth_data: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: String,
    pub attributes: Vec<(String, String)>,
}

/// Initial handshake (protocol 10) payload.
pub fn initial_handshake_payload(config: &ServerConfig, connection_id: u32, salt: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64 + config.server_version.len());
    writer.write_u8(config.protocol_version);
    writer.write_null_string(&config.server_version);
    writer.write_u32_le(connection_id);

    writer.write_bytes(&salt[..8]);
    // Filler
    writer.write_u8(0);

    writer.write_u16_le(config.capability as u16);
    writer.write_u8(config.collation);
    writer.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
    writer.write_u16_le((config.capability >> 16) as u16);

    if config.has_capability(capabilities::CLIENT_PLUGIN_AUTH) {
        writer.write_u8(salt.len() as u8 + 1);
    } else {
        writer.write_u8(0);
    }
    writer.write_zeros(10);

    writer.write_null_bytes(&salt[8..]);
    if config.has_capability(capabilities::CLIENT_PLUGIN_AUTH) {
        writer.write_null_string(&config.default_auth_plugin);
    }
    writer.into_bytes()
}

/// Parse a full HandshakeResponse41 payload.
pub fn parse_handshake_response(data: &[u8]) -> Result<HandshakeResponse> {
    let mut reader = PacketReader::new(data);

    let capability = reader.read_u32_le().ok_or_else(malformed_packet)?;
    if capability & capabilities::CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::protocol(
            "CLIENT_PROTOCOL_41 compatible client is required",
        ));
    }
    let max_packet_size = reader.read_u32_le().ok_or_else(malformed_packet)?;
    let charset = reader.read_u8().ok_or_else(malformed_packet)?;
    if !reader.skip(23) {
        return Err(malformed_packet());
    }

    let user = reader
        .read_null_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(malformed_packet)?;

    let auth_data = if capability & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        reader.read_lenenc_slice()
    } else if capability & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        reader
            .read_u8()
            .and_then(|len| reader.read_bytes(usize::from(len)))
    } else {
        reader.read_null_bytes()
    };
    let auth_data = auth_data.ok_or_else(malformed_packet)?.to_vec();

    let database = if capability & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        reader.read_null_string().filter(|db| !db.is_empty())
    } else {
        None
    };

    let auth_plugin = if capability & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().filter(|p| !p.is_empty())
    } else {
        None
    };
    let auth_plugin =
        auth_plugin.unwrap_or_else(|| plugins::MYSQL_NATIVE_PASSWORD.to_string());

    let attributes = if capability & capabilities::CLIENT_CONNECT_ATTRS != 0 && !reader.is_empty() {
        parse_attributes(&mut reader)?
    } else {
        Vec::new()
    };

    Ok(HandshakeResponse {
        capability,
        max_packet_size,
        charset,
        user,
        auth_data,
        database,
        auth_plugin,
        attributes,
    })
}

fn parse_attributes(reader: &mut PacketReader<'_>) -> Result<Vec<(String, String)>> {
    let block = reader.read_lenenc_slice().ok_or_else(malformed_packet)?;
    let mut attrs = PacketReader::new(block);
    let mut out = Vec::new();
    while !attrs.is_empty() {
        let key = attrs.read_lenenc_string().ok_or_else(malformed_packet)?;
        let value = attrs.read_lenenc_string().ok_or_else(malformed_packet)?;
        out.push((key, value));
    }
    Ok(out)
}

/// Read the handshake response, performing the TLS upgrade when the client
/// asks for it. The stream is returned since the upgrade replaces it.
pub(super) fn read_handshake_response<S: Read + Write>(
    mut stream: PacketStream<MaybeTlsStream<S>>,
    config: &ServerConfig,
) -> Result<(PacketStream<MaybeTlsStream<S>>, HandshakeResponse)> {
    let mut data = stream.read_packet()?;

    let requested_ssl = data.len() >= 4
        && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & capabilities::CLIENT_SSL != 0;
    if data.len() == SSL_REQUEST_LEN && requested_ssl {
        let Some(tls) = config.tls.clone() else {
            let err = Error::protocol("server does not support SSL: CLIENT_SSL not enabled");
            let _ = stream.write_packet(&error_payload(&err));
            return Err(err);
        };
        tracing::debug!("upgrading client connection to TLS");
        stream = stream.map_stream(|s| s.accept(tls))?;
        data = stream.read_packet()?;
    }

    let response = match parse_handshake_response(&data) {
        Ok(response) => response,
        Err(e) => {
            let _ = stream.write_packet(&error_payload(&e));
            return Err(e);
        }
    };
    Ok((stream, response))
}

impl<S, H> Conn<S, H>
where
    S: Read + Write,
    H: Handler + CredentialProvider,
{
    /// Run the plugin exchange and answer with OK or ERR. On failure the
    /// connection is closed.
    pub(super) fn authenticate(&mut self, auth_data: Vec<u8>) -> Result<()> {
        match self.negotiate(auth_data) {
            Ok(()) => {
                let ok = OkPacket {
                    affected_rows: 0,
                    last_insert_id: 0,
                    status_flags: self.status,
                    warnings: 0,
                    info: String::new(),
                };
                self.stream.write_packet(&ok_payload(&ok))?;
                self.stream.reset_sequence();
                tracing::info!(
                    connection_id = self.connection_id,
                    user = %self.user,
                    plugin = %self.auth_plugin,
                    tls = self.is_tls(),
                    "client authenticated"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    user = %self.user,
                    plugin = %self.auth_plugin,
                    error = %e,
                    "client authentication failed"
                );
                let _ = self.stream.write_packet(&error_payload(&e));
                self.closed = true;
                Err(e)
            }
        }
    }

    fn negotiate(&mut self, mut auth_data: Vec<u8>) -> Result<()> {
        if self.auth_plugin != self.config.default_auth_plugin {
            let plugin = self.config.default_auth_plugin.clone();
            auth_data = self.switch_auth_plugin(&plugin)?;
        }

        match self.auth_plugin.as_str() {
            plugins::MYSQL_NATIVE_PASSWORD => self.verify_native_password(&auth_data),
            plugins::SHA256_PASSWORD => {
                let password =
                    self.read_cleartext_password(auth_data, auth::SHA256_REQUEST_PUBLIC_KEY)?;
                self.check_cleartext_password(&password)
            }
            plugins::CACHING_SHA2_PASSWORD => self.verify_caching_sha2_password(auth_data),
            other => Err(Error::Query(QueryError::with_default_state(
                codes::ER_NOT_SUPPORTED_AUTH_MODE,
                format!("authentication plugin {} is not supported", other),
            ))),
        }
    }

    /// Send an AuthSwitchRequest with a fresh salt and read the answer.
    fn switch_auth_plugin(&mut self, plugin: &str) -> Result<Vec<u8>> {
        tracing::debug!(
            connection_id = self.connection_id,
            from = %self.auth_plugin,
            to = plugin,
            "switching auth plugin"
        );
        self.salt = auth::generate_salt();
        self.auth_plugin = plugin.to_string();
        self.stream
            .write_packet(&auth_switch_payload(plugin, &self.salt))?;

        let data = self.stream.read_packet()?;
        // A lone NUL is an empty response
        Ok(if data == [0] { Vec::new() } else { data })
    }

    fn verify_native_password(&mut self, auth_data: &[u8]) -> Result<()> {
        let using_password = !auth_data.is_empty();
        let Some(password) = self.handler.get_credential(&self.user)? else {
            return Err(self.access_denied(using_password));
        };
        if auth::verify_native_password(&self.salt, &password, auth_data) {
            Ok(())
        } else {
            Err(self.access_denied(using_password))
        }
    }

    fn verify_caching_sha2_password(&mut self, auth_data: Vec<u8>) -> Result<()> {
        if auth_data.is_empty() {
            return self.check_cleartext_password("");
        }

        self.stream
            .write_packet(&auth_more_data_payload(&[caching_sha2::PERFORM_FULL_AUTH]))?;
        let data = self.stream.read_packet()?;

        let password = self.read_cleartext_password(data, caching_sha2::REQUEST_PUBLIC_KEY)?;
        self.check_cleartext_password(&password)?;

        let key = Sha2PasswordCache::key(&self.user, &self.local_addr);
        self.config
            .password_cache
            .insert(key, auth::double_sha256(&password));
        Ok(())
    }

    /// Recover the cleartext password from a sha256-style response: empty,
    /// plaintext over TLS, or RSA encrypted (serving the public key first if
    /// the client sends `request_byte`).
    fn read_cleartext_password(&mut self, auth_data: Vec<u8>, request_byte: u8) -> Result<String> {
        if auth_data.is_empty() {
            return Ok(String::new());
        }
        if self.is_tls() {
            return Ok(auth::cleartext_password(&auth_data));
        }

        let encrypted = if auth_data == [request_byte] {
            let pem = self.config.public_key_pem.clone().ok_or_else(no_rsa_key)?;
            self.stream
                .write_packet(&auth_more_data_payload(pem.as_bytes()))?;
            self.stream.read_packet()?
        } else {
            auth_data
        };

        let key = self.config.rsa_key.clone().ok_or_else(no_rsa_key)?;
        auth::decrypt_sha256_password(&key, &self.salt, &encrypted).map_err(|e| {
            tracing::debug!(connection_id = self.connection_id, error = %e, "password decryption failed");
            self.access_denied(true)
        })
    }

    fn check_cleartext_password(&mut self, password: &str) -> Result<()> {
        if self
            .handler
            .check_password(&self.user, password, self.capability)?
        {
            Ok(())
        } else {
            Err(self.access_denied(!password.is_empty()))
        }
    }

    fn access_denied(&self, using_password: bool) -> Error {
        Error::AccessDenied(AccessDeniedError {
            user: self.user.clone(),
            host: self.remote_addr.clone(),
            using_password,
        })
    }
}

fn no_rsa_key() -> Error {
    Error::Query(QueryError::with_default_state(
        codes::ER_NOT_SUPPORTED_AUTH_MODE,
        "RSA key pair is not configured on this server",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_payload(caps: u32, user: &str, auth: &[u8], db: &str, plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u32_le(caps);
        w.write_u32_le(16 * 1024 * 1024);
        w.write_u8(33);
        w.write_zeros(23);
        w.write_null_string(user);
        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(auth);
        } else {
            w.write_u8(auth.len() as u8);
            w.write_bytes(auth);
        }
        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(db);
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(plugin);
        }
        w.into_bytes()
    }

    #[test]
    fn test_initial_handshake_layout() {
        let config = ServerConfig::new("5.7.0");
        let salt: Vec<u8> = (40..60).collect();
        let payload = initial_handshake_payload(&config, 10_001, &salt);

        let hs = crate::backend::parse_handshake(&payload).unwrap();
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.server_version, "5.7.0");
        assert_eq!(hs.connection_id, 10_001);
        assert_eq!(hs.auth_data, salt);
        assert_eq!(hs.capabilities, config.capability);
        assert_eq!(hs.charset, 33);
        assert_eq!(hs.status_flags, server_status::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(hs.auth_plugin, "caching_sha2_password");
        // salt length byte sits after the upper capability bits
        assert_eq!(payload[1 + 6 + 4 + 8 + 1 + 2 + 1 + 2 + 2], 21);
    }

    #[test]
    fn test_parse_handshake_response() {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS;
        let data = response_payload(caps, "alice", &[1, 2, 3], "shop", "mysql_native_password");
        let resp = parse_handshake_response(&data).unwrap();
        assert_eq!(resp.user, "alice");
        assert_eq!(resp.auth_data, vec![1, 2, 3]);
        assert_eq!(resp.database.as_deref(), Some("shop"));
        assert_eq!(resp.auth_plugin, "mysql_native_password");
        assert_eq!(resp.charset, 33);
        assert!(resp.attributes.is_empty());
    }

    #[test]
    fn test_parse_handshake_response_defaults() {
        let caps = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SECURE_CONNECTION;
        let data = response_payload(caps, "bob", &[], "", "");
        let resp = parse_handshake_response(&data).unwrap();
        assert_eq!(resp.auth_plugin, "mysql_native_password");
        assert_eq!(resp.database, None);
        assert!(resp.auth_data.is_empty());
    }

    #[test]
    fn test_parse_handshake_response_attributes() {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_ATTRS;
        let mut data = response_payload(caps, "carol", &[9], "", "caching_sha2_password");
        let mut attrs = PacketWriter::new();
        attrs.write_lenenc_string("_client_name");
        attrs.write_lenenc_string("libmysql");
        attrs.write_lenenc_string("_pid");
        attrs.write_lenenc_string("42");
        let mut block = PacketWriter::new();
        block.write_lenenc_bytes(attrs.as_bytes());
        data.extend_from_slice(block.as_bytes());

        let resp = parse_handshake_response(&data).unwrap();
        assert_eq!(
            resp.attributes,
            vec![
                ("_client_name".to_string(), "libmysql".to_string()),
                ("_pid".to_string(), "42".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_handshake_response_rejects_old_clients() {
        let data = response_payload(capabilities::CLIENT_SECURE_CONNECTION, "x", &[], "", "");
        assert!(matches!(
            parse_handshake_response(&data),
            Err(Error::Protocol(_))
        ));
        let err = parse_handshake_response(&[0x00, 0x02]).unwrap_err();
        assert_eq!(err.mysql_code(), Some(codes::ER_MALFORMED_PACKET));
    }
}
