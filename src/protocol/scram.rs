//! SCRAM-SHA-256 client authentication (RFC 5802, RFC 7677).
//!
//! The password never travels over the wire; the server proves it knows the
//! stored verifier too. Channel binding is not negotiated (`n,,` gs2
//! header), which is what PostgreSQL's `SCRAM-SHA-256` mechanism expects on
//! a plain connection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScramError {
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),
    #[error("server nonce doesn't start with client nonce")]
    InvalidNonce,
    #[error("server signature verification failed")]
    ServerVerificationFailed,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid iteration count: {0}")]
    InvalidIterations(String),
    #[error("scram error from server: {0}")]
    ServerError(String),
}

type Result<T> = std::result::Result<T, ScramError>;
type HmacSha256 = Hmac<Sha256>;

/// SCRAM-SHA-256 client state machine.
///
/// PostgreSQL ignores the SCRAM username (it authenticated the startup-time
/// user), so the client-first message carries an empty `n=`.
pub struct ScramSha256 {
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramSha256 {
    pub const MECHANISM: &'static str = "SCRAM-SHA-256";

    pub fn new(password: &str) -> Self {
        use rand::RngCore;
        let mut nonce = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self::with_nonce(password, &BASE64.encode(nonce))
    }

    /// Fixed-nonce constructor for deterministic tests.
    fn with_nonce(password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `n,,n=,r=<nonce>`
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// Consumes the server-first message and produces the client-final one.
    pub fn client_final_message(&mut self, server_first: &str) -> Result<String> {
        let attrs = parse_attrs(server_first)?;
        let server_nonce = attrs
            .iter()
            .find(|(k, _)| *k == "r")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| ScramError::InvalidServerMessage("missing r=".into()))?;
        let salt = attrs
            .iter()
            .find(|(k, _)| *k == "s")
            .map(|(_, v)| BASE64.decode(v))
            .ok_or_else(|| ScramError::InvalidServerMessage("missing s=".into()))??;
        let iterations: u32 = attrs
            .iter()
            .find(|(k, _)| *k == "i")
            .map(|(_, v)| v.parse())
            .ok_or_else(|| ScramError::InvalidServerMessage("missing i=".into()))?
            .map_err(|_| ScramError::InvalidIterations(server_first.to_string()))?;

        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::InvalidNonce);
        }

        let salted = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c=biws,r={}", server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );
        let client_signature = hmac(&stored_key, auth_message.as_bytes());

        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Verifies the server-final signature, proving mutual authentication.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| ScramError::InvalidServerMessage("missing v=".into()))?;
        let verifier = BASE64.decode(verifier)?;

        let (salted, auth_message) = match (&self.salted_password, &self.auth_message) {
            (Some(s), Some(a)) => (s, a),
            _ => return Err(ScramError::InvalidServerMessage("out of order".into())),
        };
        let server_key = hmac(salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        if server_signature.as_slice() != verifier.as_slice() {
            return Err(ScramError::ServerVerificationFailed);
        }
        Ok(())
    }
}

fn parse_attrs(msg: &str) -> Result<Vec<(&str, &str)>> {
    msg.split(',')
        .map(|part| {
            part.split_once('=')
                .ok_or_else(|| ScramError::InvalidServerMessage(msg.to_string()))
        })
        .collect()
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The `Hi` PBKDF2 function: iterated HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}
