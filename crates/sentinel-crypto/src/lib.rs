//! # sentinel-crypto
//!
//! Node identity cryptography for the Sentinel networking layer.
//!
//! - Keccak-256 and SHA-256 hashing
//! - ECDSA signing/verification (secp256k1)
//! - Compressed public key handling
//! - Node id derivation

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod hash;
mod signature;

pub use error::CryptoError;
pub use hash::{keccak256, sha256};
pub use signature::{
    compress_public_key, generate_private_key, private_key_from_hex, public_key_from_compressed,
    public_key_to_node_id, recover_public_key, sign, verify, PrivateKey, PublicKey, Signature,
    COMPRESSED_PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
