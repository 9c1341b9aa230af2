//! Handshake token verification.
//!
//! A client proves membership of a room with an HMAC-SHA256 signature over
//! `"{decision_id}:{vertical_key}:{identity}"`, minted by an external issuer
//! that shares the server's secret. The token travels as the first entry of
//! the `Sec-WebSocket-Protocol` list, base64-encoded as
//! `"{decision_id}:{vertical_key}:{identity}:{signature_hex}"`, so admission
//! is settled before the socket carries a single application frame.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::debug;

use crate::errors::{HandshakeError, SigningError};
use crate::ids::RoomScope;

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(
    secret: &[u8],
    decision_id: &str,
    vertical_key: &str,
    identity: &str,
) -> Result<HmacSha256, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(format!("{decision_id}:{vertical_key}:{identity}").as_bytes());
    Ok(mac)
}

/// Compute the hex signature for a decision/vertical/identity triple.
pub fn sign(
    decision_id: &str,
    vertical_key: &str,
    identity: &str,
    secret: &[u8],
) -> Result<String, SigningError> {
    let mac = keyed_mac(secret, decision_id, vertical_key, identity)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature_hex` against the expected HMAC in constant time.
///
/// Malformed hex, or a secret the MAC refuses, yields `false`.
pub fn verify(
    decision_id: &str,
    vertical_key: &str,
    identity: &str,
    signature_hex: &str,
    secret: &[u8],
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mac) = keyed_mac(secret, decision_id, vertical_key, identity) else {
        return false;
    };
    mac.verify_slice(&signature).is_ok()
}

/// The four fields carried in the handshake blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    /// Decision identifier.
    pub decision_id: String,
    /// Vertical key.
    pub vertical_key: String,
    /// Identity the token is bound to.
    pub identity: String,
    /// Hex HMAC signature.
    pub signature: String,
}

impl AuthToken {
    /// Decode one base64 sub-protocol entry.
    ///
    /// Accepts the standard and URL-safe alphabets, with or without padding.
    pub fn decode(entry: &str) -> Result<Self, HandshakeError> {
        let unpadded = entry.trim().trim_end_matches('=');
        let bytes = STANDARD_NO_PAD
            .decode(unpadded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(unpadded))
            .map_err(|e| HandshakeError::Malformed(format!("token is not base64: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| HandshakeError::Malformed("token is not UTF-8".into()))?;

        let fields: Vec<&str> = text.split(':').collect();
        let [decision_id, vertical_key, identity, signature] = fields.as_slice() else {
            return Err(HandshakeError::Malformed(format!(
                "expected 4 fields, found {}",
                fields.len()
            )));
        };
        if fields.iter().any(|f| f.is_empty()) {
            return Err(HandshakeError::Malformed("token has an empty field".into()));
        }
        Ok(Self {
            decision_id: (*decision_id).to_owned(),
            vertical_key: (*vertical_key).to_owned(),
            identity: (*identity).to_owned(),
            signature: (*signature).to_owned(),
        })
    }

    /// Encode as an unpadded URL-safe base64 sub-protocol entry.
    ///
    /// The URL-safe alphabet keeps the entry a valid HTTP token.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{}:{}:{}:{}",
            self.decision_id, self.vertical_key, self.identity, self.signature
        ))
    }
}

/// Pull the token entry (first element) out of a `Sec-WebSocket-Protocol` value.
pub fn token_entry(header: Option<&str>) -> Result<&str, HandshakeError> {
    let header =
        header.ok_or_else(|| HandshakeError::Malformed("missing sub-protocol header".into()))?;
    header
        .split(',')
        .map(str::trim)
        .next()
        .filter(|entry| !entry.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty sub-protocol list".into()))
}

/// A handshake that passed verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    /// Room the connection is admitted to.
    pub scope: RoomScope,
    /// Verified principal.
    pub identity: String,
}

/// Verifies handshake tokens against the process-wide secret.
pub struct TokenVerifier {
    secret: SecretString,
}

impl TokenVerifier {
    /// Create a verifier for `secret`.
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn key(&self) -> &[u8] {
        self.secret.expose_secret().as_bytes()
    }

    /// Mint a token (used by the developer `sign` command and tests).
    pub fn issue(
        &self,
        decision_id: &str,
        vertical_key: &str,
        identity: &str,
    ) -> Result<AuthToken, SigningError> {
        Ok(AuthToken {
            decision_id: decision_id.to_owned(),
            vertical_key: vertical_key.to_owned(),
            identity: identity.to_owned(),
            signature: sign(decision_id, vertical_key, identity, self.key())?,
        })
    }

    /// Check a decoded token's signature.
    pub fn verify_token(&self, token: &AuthToken) -> bool {
        verify(
            &token.decision_id,
            &token.vertical_key,
            &token.identity,
            &token.signature,
            self.key(),
        )
    }

    /// Resolve a raw `Sec-WebSocket-Protocol` header into a verified admission.
    ///
    /// The room key is derived only once the signature has checked out.
    pub fn admit(&self, header: Option<&str>) -> Result<VerifiedToken, HandshakeError> {
        let token = AuthToken::decode(token_entry(header)?)?;
        if !self.verify_token(&token) {
            debug!(identity = %token.identity, "handshake signature mismatch");
            return Err(HandshakeError::Unauthorized);
        }
        let scope = RoomScope::new(&token.decision_id, &token.vertical_key)?;
        Ok(VerifiedToken {
            scope,
            identity: token.identity,
        })
    }
}
