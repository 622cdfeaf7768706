//! HMAC-SHA256 message signing.
//!
//! Signing is optional and enabled by configuring a non-empty salt on the
//! connection. The digest covers `{t, c, s, p, u}` where `p` is the
//! annotated JSON text of the payload and `u` is a per-message random
//! nonce; the signature field `z` itself is never part of the digest. The
//! digest input is canonical JSON with sorted keys so both ends compute
//! the same bytes regardless of field order.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::Message;

type HmacSha256 = Hmac<Sha256>;

/// Nonce length in bytes (hex-encoded to 32 chars on the wire).
pub const NONCE_LEN: usize = 16;

/// Signature verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("message {c} is not signed")]
    Missing { c: u64 },
    #[error("message {c} has a malformed signature")]
    Malformed { c: u64 },
    #[error("signature mismatch on message {c}")]
    Mismatch { c: u64 },
    #[error("HMAC key init failed: {0}")]
    Key(String),
}

/// Sign a message in place, setting its `z` field.
pub fn sign(msg: &mut Message, salt: &str) -> Result<(), SignatureError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);

    let hash = digest(msg, &nonce, salt)?;
    msg.z = Some(format!("{nonce}:{hash}"));
    Ok(())
}

/// Verify a message's `z` field against the salt.
///
/// Fails when the signature is absent, malformed, or does not match the
/// recomputed digest. Comparison is constant time.
pub fn verify(msg: &Message, salt: &str) -> Result<(), SignatureError> {
    let z = msg.z.as_deref().ok_or(SignatureError::Missing { c: msg.c })?;
    let (nonce, hash) = z
        .split_once(':')
        .ok_or(SignatureError::Malformed { c: msg.c })?;
    let expected = hex::decode(hash).map_err(|_| SignatureError::Malformed { c: msg.c })?;

    let mut mac = keyed_mac(salt)?;
    mac.update(digest_input(msg, nonce).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch { c: msg.c })
}

fn keyed_mac(salt: &str) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(salt.as_bytes()).map_err(|e| SignatureError::Key(e.to_string()))
}

fn digest(msg: &Message, nonce: &str, salt: &str) -> Result<String, SignatureError> {
    let mut mac = keyed_mac(salt)?;
    mac.update(digest_input(msg, nonce).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Canonical digest input: JSON of `{c, p, s, t, u}` with sorted keys.
fn digest_input(msg: &Message, nonce: &str) -> String {
    let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    fields.insert("t", serde_json::Value::String(msg.t.as_str().to_owned()));
    fields.insert("c", serde_json::Value::Number(msg.c.into()));
    fields.insert("s", serde_json::Value::String(msg.s.clone()));
    fields.insert("p", serde_json::Value::String(msg.p.to_wire_text()));
    fields.insert("u", serde_json::Value::String(nonce.to_owned()));
    serde_json::to_string(&fields).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageType, Value};

    fn sample() -> Message {
        Message::request(7, "source-a", Value::from("hello"))
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let mut msg = sample();
        sign(&mut msg, "salt").unwrap();
        let z = msg.z.clone().unwrap();
        let (nonce, hash) = z.split_once(':').unwrap();
        assert_eq!(nonce.len(), NONCE_LEN * 2);
        assert_eq!(hash.len(), 64);
        verify(&msg, "salt").unwrap();
    }

    #[test]
    fn unsigned_message_fails_verification() {
        let msg = sample();
        assert_eq!(
            verify(&msg, "salt"),
            Err(SignatureError::Missing { c: 7 })
        );
    }

    #[test]
    fn malformed_signature_fails_verification() {
        let mut msg = sample();
        msg.z = Some("no-separator".into());
        assert_eq!(
            verify(&msg, "salt"),
            Err(SignatureError::Malformed { c: 7 })
        );
    }

    #[test]
    fn wrong_salt_fails_verification() {
        let mut msg = sample();
        sign(&mut msg, "salt").unwrap();
        assert_eq!(
            verify(&msg, "other"),
            Err(SignatureError::Mismatch { c: 7 })
        );
    }

    #[test]
    fn any_field_mutation_fails_verification() {
        let mut signed = sample();
        sign(&mut signed, "salt").unwrap();

        let mut t_mutated = signed.clone();
        t_mutated.t = MessageType::Response;
        assert!(verify(&t_mutated, "salt").is_err());

        let mut c_mutated = signed.clone();
        c_mutated.c += 1;
        assert!(verify(&c_mutated, "salt").is_err());

        let mut s_mutated = signed.clone();
        s_mutated.s = "source-b".into();
        assert!(verify(&s_mutated, "salt").is_err());

        let mut p_mutated = signed.clone();
        p_mutated.p = Value::from("hellp");
        assert!(verify(&p_mutated, "salt").is_err());

        let mut z_mutated = signed.clone();
        let mut z = z_mutated.z.take().unwrap();
        let flipped = if z.ends_with('0') { "1" } else { "0" };
        z.replace_range(z.len() - 1.., flipped);
        z_mutated.z = Some(z);
        assert!(verify(&z_mutated, "salt").is_err());
    }

    #[test]
    fn signature_survives_wire_round_trip() {
        let mut msg = Message::request(
            9,
            "source-a",
            Value::from(chrono::Utc::now()),
        );
        sign(&mut msg, "s3cret").unwrap();
        let text = msg.to_wire_text().unwrap();
        let back = Message::from_wire_text(&text).unwrap();
        verify(&back, "s3cret").unwrap();
    }

    #[test]
    fn nonces_differ_between_signings() {
        let mut a = sample();
        let mut b = sample();
        sign(&mut a, "salt").unwrap();
        sign(&mut b, "salt").unwrap();
        assert_ne!(a.z, b.z);
    }
}
