//! Ed25519 request authentication for inbound interactions.
//!
//! The signed message is the timestamp header followed directly by the raw
//! body bytes. The public key is read lazily from the secret provider so a
//! gateway started before the key was provisioned picks it up on the next
//! request.

use std::sync::Arc;

use axum::http::HeaderMap;
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::secrets::{SecretCache, SecretError};

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("{0} is not valid hex")]
    InvalidHex(&'static str),
    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("timestamp header is not a decimal unix time")]
    InvalidTimestamp,
    #[error("configured public key is not a valid ed25519 point")]
    InvalidPublicKey,
    #[error("public key secret {0} is not configured")]
    KeyNotConfigured(String),
    #[error("public key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("signature does not match")]
    Mismatch,
}

pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = decode_fixed::<PUBLIC_KEY_LENGTH>("public key", public_key_hex)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::InvalidPublicKey)
}

/// Checks the two signature headers against `body` with `key`.
pub fn verify_request(
    key: &VerifyingKey,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), SignatureError> {
    let signature_hex = header_value(headers, SIGNATURE_HEADER)?;
    let timestamp = header_value(headers, TIMESTAMP_HEADER)?;
    verify_parts(key, signature_hex, timestamp, body)
}

pub fn verify_parts(
    key: &VerifyingKey,
    signature_hex: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<(), SignatureError> {
    if !timestamp.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(SignatureError::InvalidTimestamp);
    }
    let signature_bytes = decode_fixed::<SIGNATURE_LENGTH>("signature", signature_hex)?;
    let signature = Signature::from_bytes(&signature_bytes);

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);

    key.verify(&message, &signature)
        .map_err(|_| SignatureError::Mismatch)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::MissingHeader(name))
}

fn decode_fixed<const N: usize>(
    field: &'static str,
    raw: &str,
) -> Result<[u8; N], SignatureError> {
    let bytes = hex::decode(raw.trim()).map_err(|_| SignatureError::InvalidHex(field))?;
    let actual = bytes.len();
    <[u8; N]>::try_from(bytes).map_err(|_| SignatureError::InvalidLength {
        field,
        expected: N,
        actual,
    })
}

/// Resolves the public key through the secret cache and verifies requests.
#[derive(Clone)]
pub struct SignatureVerifier {
    secrets: Arc<SecretCache>,
    secret_name: String,
    allow_unverified: bool,
}

impl SignatureVerifier {
    pub fn new(secrets: Arc<SecretCache>, secret_name: impl Into<String>, allow_unverified: bool) -> Self {
        let verifier = Self {
            secrets,
            secret_name: secret_name.into(),
            allow_unverified,
        };
        if allow_unverified {
            tracing::warn!(
                secret = %verifier.secret_name,
                "GATEWAY_ALLOW_UNVERIFIED_REQUESTS is set: requests are accepted without a signature while the public key is unconfigured"
            );
        }
        verifier
    }

    pub async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let public_key_hex = match self.secrets.get(&self.secret_name).await {
            Ok(value) => value,
            Err(SecretError::NotFound(_)) if self.allow_unverified => {
                tracing::warn!(
                    secret = %self.secret_name,
                    "accepting unverified interaction request"
                );
                return Ok(());
            }
            Err(SecretError::NotFound(name)) => {
                return Err(SignatureError::KeyNotConfigured(name));
            }
            Err(SecretError::Unavailable(reason)) => {
                return Err(SignatureError::KeyUnavailable(reason));
            }
        };
        let key = parse_public_key(&public_key_hex)?;
        verify_request(&key, headers, body)
    }
}
