//! Cryptographic unlock protocol: the time-lock decryption seam and the
//! V1/V2 payload formats built on top of it.

pub mod timelock;
pub mod unlock;

pub use timelock::{DrandTimelock, TimelockDecryptor};
pub use unlock::{classify, decrypt_v2_payload, open_v1, PayloadKind};
