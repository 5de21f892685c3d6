//! Hybrid unlock protocol for miner payloads.
//!
//! Two wire formats share the pending queue:
//!
//! * **V1** — plain time-lock: `{ "round": u64, "ciphertext": hex }`,
//!   decrypting to `<submission-json>:::<hotkey>`.
//! * **V2** — owner + time-lock hybrid: the 64-byte secret
//!   `ske ‖ contentKey` is time-locked to a round, `contentKey` is
//!   additionally wrapped under an ECDH key derived from the validator's
//!   owner key, and a SHA-256 binding commits the hotkey context, round,
//!   owner key and ephemeral key together so components from different
//!   payloads cannot be mixed.
//!
//! Every check fails closed: the only failure signal is `None`, which the
//! caller turns into all-zero vectors. Cryptographic failures are never
//! surfaced as errors.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use serde_json::Value;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::timelock::TimelockDecryptor;

/// HKDF info string for the owner-wrap key derivation. Fixed by the wire
/// protocol; miners derive the same key when encrypting.
pub const OWNER_WRAP_INFO: &[u8] = b"mantis-owner-wrap";

const AEAD_NONCE_LEN: usize = 12;

/// How a stored raw payload should be treated by the decrypt pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Plain time-lock envelope
    V1 { round: u64 },
    /// Owner + time-lock hybrid envelope
    V2 { round: u64 },
    /// Placeholder or unrecognized shape; decrypts to zeros
    Opaque,
}

impl PayloadKind {
    pub fn round(&self) -> u64 {
        match self {
            PayloadKind::V1 { round } | PayloadKind::V2 { round } => *round,
            PayloadKind::Opaque => 0,
        }
    }
}

/// Classify a stored payload by its wire tags. A `v: 2` tag wins over the
/// V1 `ciphertext` field; anything else is opaque.
pub fn classify(data: &Value) -> PayloadKind {
    let Some(obj) = data.as_object() else {
        return PayloadKind::Opaque;
    };
    if obj.get("v").and_then(Value::as_u64) == Some(2) {
        PayloadKind::V2 {
            round: round_of(data),
        }
    } else if obj.contains_key("ciphertext") {
        PayloadKind::V1 {
            round: round_of(data),
        }
    } else {
        PayloadKind::Opaque
    }
}

/// Round number from a payload; tolerates both integer and decimal-string
/// encodings, defaulting to 0 (= unresolvable) otherwise.
fn round_of(data: &Value) -> u64 {
    match data.get("round") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Open a V1 payload and return the embedded submission for `hotkey`.
///
/// The plaintext is `<submission-json>:::<hotkey>`, split on the *last*
/// separator occurrence. A trailing hotkey that differs from the expected
/// submitter rejects the payload (anti-replay across submitters). The
/// submission blob tolerates single-quoted JSON.
pub fn open_v1(
    data: &Value,
    signature: &[u8],
    hotkey: &str,
    tlock: &dyn TimelockDecryptor,
) -> Option<Value> {
    let ct = hex::decode(data.get("ciphertext")?.as_str()?).ok()?;
    let plaintext = tlock.locked_decrypt(&ct, signature).ok()?;
    let text = String::from_utf8(plaintext).ok()?;
    let (blob, submitted_by) = text.rsplit_once(":::")?;
    if submitted_by != hotkey {
        return None;
    }
    serde_json::from_str(&blob.replace('\'', "\"")).ok()
}

/// Decrypt a V2 payload to its content plaintext.
///
/// Returns `None` unless every protocol check holds:
/// owner key configured and matching the payload's claim, binding
/// commitment intact, time-locked secret exactly 64 bytes, ephemeral key
/// derived from `ske` equal to the committed one, and both AEAD layers
/// authenticating with the binding as associated data. The owner-wrapped
/// copy of the content key must equal the time-locked half exactly.
pub fn decrypt_v2_payload(
    data: &Value,
    signature: &[u8],
    owner_pk: Option<[u8; 32]>,
    tlock: &dyn TimelockDecryptor,
) -> Option<Vec<u8>> {
    if signature.is_empty() {
        return None;
    }
    // Unconfigured owner key skips V2 decryption entirely (fail-safe-closed)
    let owner_pk = owner_pk?;

    if let Some(claimed) = data.get("owner_pk").and_then(Value::as_str) {
        if !claimed.trim().eq_ignore_ascii_case(&hex::encode(owner_pk)) {
            return None;
        }
    }

    let hk = data.get("hk")?.as_str()?;
    let round = round_of(data);
    let pke = hex_field(data, "/W_owner/pke")?;
    let pke: [u8; 32] = pke.try_into().ok()?;

    let binding = binding(hk, round, &owner_pk, &pke);
    let declared = hex_field(data, "/binding")?;
    if declared.len() != 32 || declared != binding {
        return None;
    }

    let w_time_ct = hex_field(data, "/W_time/ct")?;
    let ske_and_key = normalize_locked_secret(tlock.locked_decrypt(&w_time_ct, signature).ok()?)?;
    let ske: [u8; 32] = ske_and_key[..32].try_into().ok()?;
    let content_key: [u8; 32] = ske_and_key[32..].try_into().ok()?;

    let ske = StaticSecret::from(ske);
    if PublicKey::from(&ske).to_bytes() != pke {
        return None;
    }

    let shared = ske.diffie_hellman(&PublicKey::from(owner_pk));
    let k1 = owner_wrap_key(shared.as_bytes())?;

    // Cross-check: the owner-wrapped copy must agree with the time-locked half
    let w_owner_nonce = hex_field(data, "/W_owner/nonce")?;
    let w_owner_ct = hex_field(data, "/W_owner/ct")?;
    let unwrapped = aead_open(&k1, &w_owner_nonce, &w_owner_ct, &binding)?;
    if unwrapped != content_key {
        return None;
    }

    let c_nonce = hex_field(data, "/C/nonce")?;
    let c_ct = hex_field(data, "/C/ct")?;
    aead_open(&content_key, &c_nonce, &c_ct, &binding)
}

/// Commitment tying hotkey context, round, owner key and ephemeral key
/// together: `SHA256(hk ":" round ":" owner_pk ":" pke)` with the round in
/// decimal ASCII.
pub fn binding(hk: &str, round: u64, owner_pk: &[u8], pke: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(hk.as_bytes());
    hasher.update(b":");
    hasher.update(round.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(owner_pk);
    hasher.update(b":");
    hasher.update(pke);
    hasher.finalize().into()
}

/// The 64-byte `ske ‖ contentKey` secret arrives either as raw bytes or as
/// a 128-character ASCII-hex string; accept both.
fn normalize_locked_secret(raw: Vec<u8>) -> Option<[u8; 64]> {
    let bytes = if raw.len() == 128 {
        match std::str::from_utf8(&raw).ok().and_then(|s| hex::decode(s).ok()) {
            Some(decoded) => decoded,
            None => raw,
        }
    } else {
        raw
    };
    bytes.try_into().ok()
}

/// First 32 bytes of HKDF-SHA256(shared, info=`mantis-owner-wrap`, len=44).
/// The trailing 12 bytes are a nonce slot the wire format does not use;
/// nonces are random per payload.
fn owner_wrap_key(shared: &[u8]) -> Option<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 44];
    hkdf.expand(OWNER_WRAP_INFO, &mut okm).ok()?;
    okm[..32].try_into().ok()
}

fn aead_open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != AEAD_NONCE_LEN {
        return None;
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .ok()
}

fn hex_field(data: &Value, pointer: &str) -> Option<Vec<u8>> {
    hex::decode(data.pointer(pointer)?.as_str()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::json;

    /// Deterministic stand-in for the time-lock primitive: releases a fixed
    /// secret for the one signature it was locked to, errors otherwise.
    struct StubTimelock {
        signature: Vec<u8>,
        secret: Vec<u8>,
    }

    impl TimelockDecryptor for StubTimelock {
        fn locked_decrypt(&self, _ciphertext: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
            if signature == self.signature.as_slice() {
                Ok(self.secret.clone())
            } else {
                Err(anyhow!("signature does not open this ciphertext"))
            }
        }
    }

    fn aead_seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        ChaCha20Poly1305::new(Key::from_slice(key))
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .unwrap()
    }

    struct V2Fixture {
        payload: Value,
        owner_pk: [u8; 32],
        signature: Vec<u8>,
        tlock: StubTimelock,
        plaintext: Vec<u8>,
    }

    /// Build a fully valid V2 payload the way a miner would.
    fn make_v2_fixture(hotkey: &str, round: u64, hex_encode_secret: bool) -> V2Fixture {
        let owner_secret = StaticSecret::from([11u8; 32]);
        let owner_pk = PublicKey::from(&owner_secret).to_bytes();

        let ske_bytes = [22u8; 32];
        let content_key = [33u8; 32];
        let ske = StaticSecret::from(ske_bytes);
        let pke = PublicKey::from(&ske).to_bytes();

        let binding = binding(hotkey, round, &owner_pk, &pke);

        let shared = ske.diffie_hellman(&PublicKey::from(owner_pk));
        let k1 = owner_wrap_key(shared.as_bytes()).unwrap();

        let w_owner_nonce = [1u8; 12];
        let w_owner_ct = aead_seal(&k1, &w_owner_nonce, &content_key, &binding);

        let plaintext =
            serde_json::to_vec(&json!({ "hotkey": hotkey, "BTC": [0.5, -0.5] })).unwrap();
        let c_nonce = [2u8; 12];
        let c_ct = aead_seal(&content_key, &c_nonce, &plaintext, &binding);

        let mut secret = Vec::with_capacity(64);
        secret.extend_from_slice(&ske_bytes);
        secret.extend_from_slice(&content_key);
        let released = if hex_encode_secret {
            hex::encode(&secret).into_bytes()
        } else {
            secret
        };

        let signature = vec![0xAB; 48];
        let payload = json!({
            "v": 2,
            "hk": hotkey,
            "round": round,
            "owner_pk": hex::encode(owner_pk),
            "W_time": { "ct": hex::encode(b"locked-secret") },
            "W_owner": {
                "pke": hex::encode(pke),
                "ct": hex::encode(&w_owner_ct),
                "nonce": hex::encode(w_owner_nonce),
            },
            "C": {
                "ct": hex::encode(&c_ct),
                "nonce": hex::encode(c_nonce),
            },
            "binding": hex::encode(binding),
        });

        V2Fixture {
            payload,
            owner_pk,
            signature: signature.clone(),
            tlock: StubTimelock {
                signature,
                secret: released,
            },
            plaintext,
        }
    }

    #[test]
    fn test_classify_by_wire_tags() {
        assert_eq!(
            classify(&json!({ "v": 2, "round": 9 })),
            PayloadKind::V2 { round: 9 }
        );
        assert_eq!(
            classify(&json!({ "ciphertext": "aa", "round": "7" })),
            PayloadKind::V1 { round: 7 }
        );
        assert_eq!(classify(&json!({})), PayloadKind::Opaque);
        assert_eq!(classify(&json!([1, 2])), PayloadKind::Opaque);
        // a bogus round degrades to 0, not to a parse error
        assert_eq!(
            classify(&json!({ "ciphertext": "aa", "round": "x" })),
            PayloadKind::V1 { round: 0 }
        );
    }

    #[test]
    fn test_v2_round_trip() {
        let fx = make_v2_fixture("hk1", 4242, false);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, Some(fx.plaintext));
    }

    #[test]
    fn test_v2_accepts_hex_encoded_secret() {
        let fx = make_v2_fixture("hk1", 4242, true);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, Some(fx.plaintext));
    }

    #[test]
    fn test_v2_wrong_signature_fails_closed() {
        let fx = make_v2_fixture("hk1", 4242, false);
        let out = decrypt_v2_payload(&fx.payload, &[0xCD; 48], Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, None);
    }

    #[test]
    fn test_v2_binding_rejects_round_substitution() {
        let mut fx = make_v2_fixture("hk1", 4242, false);
        // same components, different declared round: binding must not match
        fx.payload["round"] = json!(4243);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, None);
    }

    #[test]
    fn test_v2_owner_key_mismatch_fails_closed() {
        let fx = make_v2_fixture("hk1", 4242, false);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some([99u8; 32]), &fx.tlock);
        assert_eq!(out, None);
    }

    #[test]
    fn test_v2_unconfigured_owner_key_skips_decryption() {
        let fx = make_v2_fixture("hk1", 4242, false);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, None, &fx.tlock);
        assert_eq!(out, None);
    }

    #[test]
    fn test_v2_tampered_owner_wrap_fails_auth() {
        let mut fx = make_v2_fixture("hk1", 4242, false);
        let mut ct = hex::decode(fx.payload["W_owner"]["ct"].as_str().unwrap()).unwrap();
        ct[0] ^= 1;
        fx.payload["W_owner"]["ct"] = json!(hex::encode(ct));
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, None);
    }

    #[test]
    fn test_v2_owner_pk_comparison_is_case_insensitive() {
        let mut fx = make_v2_fixture("hk1", 4242, false);
        let upper = fx.payload["owner_pk"].as_str().unwrap().to_uppercase();
        fx.payload["owner_pk"] = json!(upper);
        let out = decrypt_v2_payload(&fx.payload, &fx.signature, Some(fx.owner_pk), &fx.tlock);
        assert_eq!(out, Some(fx.plaintext));
    }

    #[test]
    fn test_open_v1_checks_trailing_hotkey() {
        let submission = "[[0.5, -0.25]]:::hk1";
        let tlock = StubTimelock {
            signature: vec![1; 48],
            secret: submission.as_bytes().to_vec(),
        };
        let payload = json!({ "round": 5, "ciphertext": hex::encode(b"ct") });

        let ok = open_v1(&payload, &[1; 48], "hk1", &tlock);
        assert_eq!(ok, Some(json!([[0.5, -0.25]])));

        // replayed under a different submitter
        assert_eq!(open_v1(&payload, &[1; 48], "hk2", &tlock), None);
        // wrong-round signature
        assert_eq!(open_v1(&payload, &[9; 48], "hk1", &tlock), None);
    }

    #[test]
    fn test_open_v1_tolerates_single_quoted_json() {
        let tlock = StubTimelock {
            signature: vec![1; 48],
            secret: b"{'BTC': [0.5, 0.5]}:::hk1".to_vec(),
        };
        let payload = json!({ "round": 5, "ciphertext": hex::encode(b"ct") });
        let out = open_v1(&payload, &[1; 48], "hk1", &tlock).unwrap();
        assert_eq!(out, json!({ "BTC": [0.5, 0.5] }));
    }

    #[test]
    fn test_normalize_locked_secret_lengths() {
        assert!(normalize_locked_secret(vec![0; 64]).is_some());
        assert!(normalize_locked_secret(vec![0; 63]).is_none());
        assert!(normalize_locked_secret(vec![0; 65]).is_none());
        let hexed = hex::encode([5u8; 64]).into_bytes();
        assert_eq!(normalize_locked_secret(hexed), Some([5u8; 64]));
        // 128 bytes of non-hex stays raw and is rejected for length
        assert!(normalize_locked_secret(vec![b'z'; 128]).is_none());
    }
}
