//! Accepted token renderings.
//!
//! Terminals deployed before the compact format emitted either a
//! `qr1.`-prefixed token or a JSON envelope. Each format either recognizes
//! the shape of a token or passes; a recognized token whose segments fail
//! to decode is malformed, not handed to the next format.

use base64::Engine;
use serde::Deserialize;

use crate::codec::{B64, SignedToken};
use crate::error::CryptoError;

/// Outcome of offering a raw token to one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Recognized(SignedToken),
    Unrecognized,
}

/// One accepted token shape.
pub trait TokenFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, raw: &str) -> Result<Decoded, CryptoError>;
}

/// Formats tried by [`crate::codec::split`], in order.
pub const DEFAULT_FORMATS: &[&dyn TokenFormat] =
    &[&CompactFormat, &VersionPrefixedFormat, &JsonEnvelopeFormat];

fn is_b64_segment(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(segment)
        .map_err(|e| CryptoError::Malformed(format!("invalid {what} encoding: {e}")))
}

fn decode_pair(payload: &str, signature: &str) -> Result<Decoded, CryptoError> {
    Ok(Decoded::Recognized(SignedToken {
        payload: decode_segment(payload, "payload")?,
        signature: decode_segment(signature, "signature")?,
    }))
}

/// `payload.signature`, the current format.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactFormat;

impl TokenFormat for CompactFormat {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn decode(&self, raw: &str) -> Result<Decoded, CryptoError> {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(payload), Some(signature), None)
                if is_b64_segment(payload) && is_b64_segment(signature) =>
            {
                decode_pair(payload, signature)
            }
            _ => Ok(Decoded::Unrecognized),
        }
    }
}

/// `qr1.payload.signature`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionPrefixedFormat;

const VERSION_PREFIX: &str = "qr1";

impl TokenFormat for VersionPrefixedFormat {
    fn name(&self) -> &'static str {
        "version-prefixed"
    }

    fn decode(&self, raw: &str) -> Result<Decoded, CryptoError> {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(VERSION_PREFIX), Some(payload), Some(signature), None)
                if is_b64_segment(payload) && is_b64_segment(signature) =>
            {
                decode_pair(payload, signature)
            }
            _ => Ok(Decoded::Unrecognized),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    payload: String,
    signature: String,
}

/// `{"payload": "<b64>", "signature": "<b64>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeFormat;

impl TokenFormat for JsonEnvelopeFormat {
    fn name(&self) -> &'static str {
        "json-envelope"
    }

    fn decode(&self, raw: &str) -> Result<Decoded, CryptoError> {
        if !raw.starts_with('{') {
            return Ok(Decoded::Unrecognized);
        }
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| CryptoError::Malformed(format!("invalid token envelope: {e}")))?;
        if envelope.payload.is_empty() || envelope.signature.is_empty() {
            return Err(CryptoError::Malformed("empty envelope segment".into()));
        }
        decode_pair(&envelope.payload, &envelope.signature)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::codec::{self, TokenPayload};
    use crate::key::SigningKey;

    fn key() -> SigningKey {
        SigningKey::new(&[3u8; 32]).unwrap()
    }

    fn compact() -> (TokenPayload, String) {
        let payload = TokenPayload::new("term-9", 1_700_000_000, 60);
        let (token, _) = codec::encode(&payload, &key()).unwrap();
        (payload, token)
    }

    #[test]
    fn compact_is_not_claimed_by_other_formats() {
        let (_, token) = compact();
        assert_eq!(VersionPrefixedFormat.decode(&token).unwrap(), Decoded::Unrecognized);
        assert_eq!(JsonEnvelopeFormat.decode(&token).unwrap(), Decoded::Unrecognized);
        assert!(matches!(
            CompactFormat.decode(&token).unwrap(),
            Decoded::Recognized(_)
        ));
    }

    #[test]
    fn version_prefixed_token_verifies() {
        let (payload, token) = compact();
        let legacy = format!("qr1.{token}");
        assert_eq!(codec::decode(&legacy, &key()).unwrap(), payload);
    }

    #[test]
    fn json_envelope_token_verifies() {
        let (payload, token) = compact();
        let (p, s) = token.split_once('.').unwrap();
        let legacy = serde_json::json!({ "payload": p, "signature": s }).to_string();
        assert_eq!(codec::decode(&legacy, &key()).unwrap(), payload);
    }

    #[test]
    fn broken_envelope_is_malformed() {
        let err = codec::split(r#"{"payload": "abc""#).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
        let err = codec::split(r#"{"payload": "", "signature": "abc"}"#).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn recognized_shape_with_bad_base64_is_malformed() {
        // A single base64 character cannot encode a whole byte.
        let err = codec::split("a.abcd").unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn custom_format_list_limits_what_is_accepted() {
        let (_, token) = compact();
        let legacy = format!("qr1.{token}");
        let only_compact: &[&dyn TokenFormat] = &[&CompactFormat];
        assert!(codec::split_with(&token, only_compact).is_ok());
        assert!(matches!(
            codec::split_with(&legacy, only_compact),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn format_names_are_distinct() {
        let names: Vec<_> = DEFAULT_FORMATS.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["compact", "version-prefixed", "json-envelope"]);
    }
}
