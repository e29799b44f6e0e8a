//! MySQL authentication implementations.
//!
//! This module implements both ends of the MySQL authentication plugins:
//! - `mysql_native_password`: SHA1-based (legacy, MySQL < 8.0 default)
//! - `caching_sha2_password`: SHA256-based (MySQL 8.0+ default)
//! - `sha256_password`: RSA or TLS protected cleartext
//!
//! The backend driver scrambles passwords with the client-side functions;
//! the server side verifies scrambles, generates salts and decrypts RSA
//! protected passwords sent by connecting clients.
//!
//! # mysql_native_password
//!
//! Password scramble algorithm:
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth requires TLS or RSA public key encryption.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::Rng;
use rand::rngs::OsRng;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use sqlshim_core::Error;

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";

    /// Plugins the server side can negotiate.
    pub fn is_supported(name: &str) -> bool {
        matches!(
            name,
            MYSQL_NATIVE_PASSWORD | CACHING_SHA2_PASSWORD | SHA256_PASSWORD
        )
    }
}

/// Response codes for caching_sha2_password protocol.
pub mod caching_sha2 {
    /// Request for public key (client should send 0x02)
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (switch to secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password client request for the server's public key.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// Length of the server scramble.
pub const SALT_LEN: usize = 20;

/// Compute mysql_native_password authentication response.
///
/// Algorithm: `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
///
/// Returns the 20-byte authentication response, or an empty vec if the
/// password is empty.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // Ensure we only use first 20 bytes of auth_data
    let seed = if auth_data.len() > SALT_LEN {
        &auth_data[..SALT_LEN]
    } else {
        auth_data
    };

    // Stage 1: SHA1(password)
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();

    // Stage 2: SHA1(SHA1(password))
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    // Stage 3: SHA1(seed + stage2)
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    // Final: stage1 XOR stage3
    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Check a client's mysql_native_password scramble against the stored
/// password.
pub fn verify_native_password(salt: &[u8], password: &str, client_data: &[u8]) -> bool {
    let expected = mysql_native_password(password, salt);
    // Fold over every byte rather than stopping at the first mismatch
    expected.len() == client_data.len()
        && expected
            .iter()
            .zip(client_data)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Compute caching_sha2_password fast authentication response.
///
/// Algorithm: `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // MySQL sends a 20-byte scramble + NUL; strip only that exact shape
    let seed = if auth_data.len() == SALT_LEN + 1 && auth_data.last() == Some(&0) {
        &auth_data[..SALT_LEN]
    } else {
        auth_data
    };

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `SHA256(SHA256(password))`, the value a caching_sha2 server keeps per
/// user.
pub fn double_sha256(password: &str) -> [u8; 32] {
    let once: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    Sha256::digest(once).into()
}

/// Generate a 20-byte scramble of printable bytes in `30..127`.
///
/// Uses `OsRng` for cryptographically secure random generation.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut rng = OsRng;
    let mut salt = [0u8; SALT_LEN];
    for byte in &mut salt {
        *byte = rng.gen_range(30..127);
    }
    salt
}

/// Scramble password for sha256_password plugin using RSA encryption.
///
/// This is used for full authentication for `caching_sha2_password`/`sha256_password`
/// when the connection is not secured by TLS.
pub fn sha256_password_rsa(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>, String> {
    // MySQL expects: RSA_encrypt(password_with_nul XOR seed_rotation)
    let mut pw = password.as_bytes().to_vec();
    pw.push(0);

    if seed.is_empty() {
        return Err("Seed is empty".to_string());
    }

    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| format!("Public key is not valid UTF-8 PEM: {e}"))?;

    // Try both common encodings.
    let pub_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| format!("Failed to parse RSA public key PEM: {e}"))?;

    let encrypted = if use_oaep {
        // MySQL 8.0.5+ uses OAEP padding for caching_sha2_password.
        let padding = rsa::Oaep::new::<Sha1>();
        pub_key
            .encrypt(&mut OsRng, padding, &pw)
            .map_err(|e| format!("RSA OAEP encryption failed: {e}"))?
    } else {
        pub_key
            .encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &pw)
            .map_err(|e| format!("RSA PKCS1v1.5 encryption failed: {e}"))?
    };

    Ok(encrypted)
}

/// Recover a cleartext password a client encrypted with
/// [`sha256_password_rsa`] (OAEP padding).
pub fn decrypt_sha256_password(
    key: &RsaPrivateKey,
    salt: &[u8],
    data: &[u8],
) -> Result<String, Error> {
    if salt.is_empty() {
        return Err(Error::Custom("empty scramble".to_string()));
    }

    let mut plain = key
        .decrypt(rsa::Oaep::new::<Sha1>(), data)
        .map_err(|e| Error::Custom(format!("RSA OAEP decryption failed: {e}")))?;

    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= salt[i % salt.len()];
    }

    Ok(cleartext_password(&plain))
}

/// Cleartext password sent over TLS, minus its NUL terminator.
pub fn cleartext_password(data: &[u8]) -> String {
    let trimmed = data.strip_suffix(&[0]).unwrap_or(data);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// PEM (SubjectPublicKeyInfo) encoding of the public half of `key`.
pub fn public_key_pem(key: &RsaPrivateKey) -> Result<String, Error> {
    RsaPublicKey::from(key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::config(format!("failed to encode RSA public key: {e}")))
}
