//! Time-lock decryption seam.
//!
//! The puzzle math lives in the `timelock` crate (identity-based encryption
//! to a future drand round); this module only pins down the integration
//! contract: the same `(ciphertext, signature)` pair always yields the same
//! plaintext, and a wrong-round signature fails deterministically instead
//! of producing garbage.

use anyhow::{anyhow, Result};

/// Opens a time-locked ciphertext with the beacon signature of the round it
/// was locked to.
pub trait TimelockDecryptor: Send + Sync {
    /// Decrypt `ciphertext` using `signature`. Errors on a malformed
    /// puzzle or a signature for the wrong round; never returns partial
    /// output.
    fn locked_decrypt(&self, ciphertext: &[u8], signature: &[u8]) -> Result<Vec<u8>>;
}

/// Production decryptor for drand quicknet ciphertexts (BLS12-381, G1
/// signatures, AES-GCM payload cipher).
#[derive(Debug, Default, Clone, Copy)]
pub struct DrandTimelock;

impl TimelockDecryptor for DrandTimelock {
    fn locked_decrypt(&self, ciphertext: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
        use ark_serialize::CanonicalDeserialize;
        use timelock::stream_ciphers::AESGCMStreamCipherProvider;
        use timelock::tlock::{tld, TLECiphertext};
        use w3f_bls::{EngineBLS, TinyBLS381};

        let ct = TLECiphertext::<TinyBLS381>::deserialize_compressed(ciphertext)
            .map_err(|e| anyhow!("malformed timelock ciphertext: {}", e))?;
        let sig = <TinyBLS381 as EngineBLS>::SignatureGroup::deserialize_compressed(signature)
            .map_err(|e| anyhow!("malformed beacon signature: {}", e))?;

        tld::<TinyBLS381, AESGCMStreamCipherProvider>(ct, sig)
            .map_err(|e| anyhow!("timelock decryption failed: {:?}", e))
    }
}
