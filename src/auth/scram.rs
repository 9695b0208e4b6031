//! SCRAM-SHA-256 client flow (RFC 5802 / RFC 7677).
//!
//! Channel binding is not used: the GS2 header is the `n,,` placeholder
//! and the mechanism advertised is plain `SCRAM-SHA-256`. PostgreSQL
//! ignores the SCRAM username (it authenticates the startup-packet user),
//! so the client-first message carries an empty `n=`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::messages::backend::ServerFirst;

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism this engine speaks.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header: no channel binding, no authzid.
const GS2_HEADER: &str = "n,,";

/// Client side of one SCRAM-SHA-256 exchange.
///
/// Holds the verbatim client-first message between the initial response
/// and the server challenge, and the expected server signature between
/// the client-final message and the server's verification.
pub struct ScramClient {
    password: String,
    nonce: String,
    client_first: String,
    expected_server_signature: Option<String>,
}

impl ScramClient {
    /// Creates a client with a fresh nonce: 18 bytes drawn from
    /// `[A-Za-z0-9]` by a cryptographically secure generator, then
    /// base64-encoded.
    pub fn new(password: &str) -> Self {
        let nonce_bytes: Vec<u8> = thread_rng().sample_iter(&Alphanumeric).take(18).collect();
        Self::with_nonce(password, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, nonce: &str) -> Self {
        ScramClient {
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first: format!("{GS2_HEADER}n=,r={nonce}"),
            expected_server_signature: None,
        }
    }

    /// The stored client-first message, sent in `SASLInitialResponse`.
    pub fn client_first(&self) -> &str {
        &self.client_first
    }

    fn client_nonce(&self) -> &str {
        &self.nonce
    }

    /// Consumes the server-first challenge and produces the client-final
    /// message, remembering the server signature to expect.
    pub fn client_final(&mut self, server_first: &ServerFirst) -> Result<String> {
        if server_first.rounds < 1 {
            return Err(Error::ScramBadIterationCount(server_first.rounds));
        }
        if !server_first.nonce.starts_with(self.client_nonce()) {
            return Err(Error::Protocol(
                "SCRAM server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = BASE64
            .decode(&server_first.salt)
            .map_err(|e| Error::Protocol(format!("invalid base64 SCRAM salt: {e}")))?;

        let salted_password = hi(self.password.as_bytes(), &salt, server_first.rounds)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key")?;

        let client_first_bare = &self.client_first[GS2_HEADER.len()..];
        let without_proof = format!(
            "c={},r={}",
            BASE64.encode(GS2_HEADER),
            server_first.nonce
        );
        let auth_message = format!(
            "{client_first_bare},{},{without_proof}",
            server_first.message
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;
        self.expected_server_signature = Some(BASE64.encode(server_signature));

        Ok(format!("{without_proof},p={}", BASE64.encode(&client_proof)))
    }

    /// Checks the `v=` value of the server-final message against the
    /// stored expectation.
    pub fn verify_server_signature(&self, signature: &str) -> Result<()> {
        match self.expected_server_signature.as_deref() {
            Some(expected) if expected == signature => Ok(()),
            Some(_) => Err(Error::ScramServerSignatureMismatch),
            None => Err(Error::Protocol(
                "SCRAM server-final arrived before the challenge was answered".into(),
            )),
        }
    }
}

/// `Hi(str, salt, i)` from RFC 5802: PBKDF2 with HMAC-SHA-256, block
/// index `INT(1)`, XOR accumulation over `i` rounds.
fn hi(password: &[u8], salt: &[u8], rounds: u32) -> Result<[u8; 32]> {
    let mut message = Vec::with_capacity(salt.len() + 4);
    message.extend_from_slice(salt);
    message.extend_from_slice(&1u32.to_be_bytes());

    let mut current = hmac_sha256(password, &message)?;
    let mut output = current;
    for _ in 1..rounds {
        current = hmac_sha256(password, &current)?;
        for (acc, byte) in output.iter_mut().zip(current.iter()) {
            *acc ^= byte;
        }
    }
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Protocol(format!("HMAC init failed: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
