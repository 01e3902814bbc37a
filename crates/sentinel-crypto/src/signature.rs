//! ECDSA identity signatures using secp256k1

use std::cmp::Ordering;

use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::{keccak256, CryptoError};

/// Length of an encoded signature (r || s || v)
pub const SIGNATURE_LENGTH: usize = 65;

/// Length of a SEC1 compressed public key
pub const COMPRESSED_PUBLIC_KEY_LENGTH: usize = 33;

/// Half of the secp256k1 curve order (n/2)
const SECP256K1_N_DIV_2: [u8; 32] = [
    0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x5D, 0x57, 0x6E, 0x73, 0x57, 0xA4, 0x50, 0x1D,
    0xDF, 0xE9, 0x2F, 0x46, 0x68, 0x1B, 0x20, 0xA0,
];

/// Full secp256k1 curve order (n)
const SECP256K1_N: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B,
    0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

/// Recoverable ECDSA signature over a 32-byte digest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// r component
    pub r: [u8; 32],
    /// s component, always in the lower half of the curve order
    pub s: [u8; 32],
    /// recovery id (0 or 1)
    pub v: u8,
}

/// Public key
pub type PublicKey = VerifyingKey;

/// Private key
pub type PrivateKey = SigningKey;

impl Signature {
    /// Convert to 65-byte representation (r || s || v)
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    /// Parse from a 65-byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::InvalidSignature(format!(
                "expected {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Signature { r, s, v: bytes[64] })
    }

    /// Check if signature has a low-s value
    pub fn is_low_s(&self) -> bool {
        self.s.cmp(&SECP256K1_N_DIV_2) != Ordering::Greater
    }

    fn to_k256(&self) -> Result<K256Signature, CryptoError> {
        let r: k256::FieldBytes = self.r.into();
        let s: k256::FieldBytes = self.s.into();
        K256Signature::from_scalars(r, s).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}

/// n - s, big-endian with borrow
fn negate_scalar(s: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut diff = SECP256K1_N[i] as i16 - s[i] as i16 - borrow;
        borrow = 0;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        }
        out[i] = diff as u8;
    }
    out
}

/// Generate a fresh random private key
pub fn generate_private_key() -> PrivateKey {
    SigningKey::random(&mut OsRng)
}

/// Parse a hex private key, with or without a `0x` prefix
pub fn private_key_from_hex(input: &str) -> Result<PrivateKey, CryptoError> {
    let trimmed = input.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(raw).map_err(|_| CryptoError::InvalidPrivateKey)?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidPrivateKey);
    }
    SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)
}

/// Sign a 32-byte digest, normalizing to low-s
pub fn sign(digest: &[u8; 32], private_key: &PrivateKey) -> Result<Signature, CryptoError> {
    let (signature, mut recovery_id) = private_key
        .sign_prehash_recoverable(digest)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

    let r: [u8; 32] = signature.r().to_bytes().into();
    let mut s: [u8; 32] = signature.s().to_bytes().into();

    if s.cmp(&SECP256K1_N_DIV_2) == Ordering::Greater {
        s = negate_scalar(&s);
        recovery_id = RecoveryId::try_from(recovery_id.to_byte() ^ 1)
            .map_err(|_| CryptoError::SigningFailed("recovery id out of range".to_string()))?;
    }

    Ok(Signature {
        r,
        s,
        v: recovery_id.to_byte(),
    })
}

/// Verify a signature against a digest and public key
///
/// High-s signatures are rejected.
pub fn verify(
    digest: &[u8; 32],
    signature: &Signature,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    if !signature.is_low_s() {
        return Ok(false);
    }
    let k256_sig = signature.to_k256()?;

    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    Ok(public_key.verify_prehash(digest, &k256_sig).is_ok())
}

/// Recover the signer's public key from a signature and digest
pub fn recover_public_key(digest: &[u8; 32], signature: &Signature) -> Result<PublicKey, CryptoError> {
    let k256_sig = signature.to_k256()?;
    let recovery_id =
        RecoveryId::try_from(signature.v).map_err(|_| CryptoError::InvalidRecoveryId(signature.v))?;

    VerifyingKey::recover_from_prehash(digest, &k256_sig, recovery_id)
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))
}

/// Encode a public key in SEC1 compressed form
pub fn compress_public_key(public_key: &PublicKey) -> [u8; COMPRESSED_PUBLIC_KEY_LENGTH] {
    let encoded = public_key.to_encoded_point(true);
    let mut out = [0u8; COMPRESSED_PUBLIC_KEY_LENGTH];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Decode a SEC1 compressed public key
pub fn public_key_from_compressed(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    if bytes.len() != COMPRESSED_PUBLIC_KEY_LENGTH {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            COMPRESSED_PUBLIC_KEY_LENGTH,
            bytes.len()
        )));
    }
    VerifyingKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Derive a 32-byte node id: keccak256 of the uncompressed key without its 0x04 tag
pub fn public_key_to_node_id(public_key: &PublicKey) -> [u8; 32] {
    let encoded = public_key.to_encoded_point(false);
    keccak256(&encoded.as_bytes()[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let private_key = generate_private_key();
        let digest = keccak256(b"node record");

        let signature = sign(&digest, &private_key).unwrap();
        assert!(signature.is_low_s());
        assert!(verify(&digest, &signature, private_key.verifying_key()).unwrap());
    }

    #[test]
    fn test_verify_wrong_digest() {
        let private_key = generate_private_key();
        let signature = sign(&keccak256(b"a"), &private_key).unwrap();
        assert!(!verify(&keccak256(b"b"), &signature, private_key.verifying_key()).unwrap());
    }

    #[test]
    fn test_recover_public_key() {
        let private_key = generate_private_key();
        let digest = keccak256(b"recover me");
        let signature = sign(&digest, &private_key).unwrap();
        let recovered = recover_public_key(&digest, &signature).unwrap();
        assert_eq!(private_key.verifying_key(), &recovered);
    }

    #[test]
    fn test_reject_high_s_signature() {
        let private_key = generate_private_key();
        let digest = keccak256(b"test");
        let mut signature = sign(&digest, &private_key).unwrap();
        signature.s = [0xFF; 32];
        assert!(!verify(&digest, &signature, private_key.verifying_key()).unwrap());
    }

    #[test]
    fn test_negate_scalar() {
        let mut one = [0u8; 32];
        one[31] = 1;
        let mut expected = SECP256K1_N;
        expected[31] -= 1;
        assert_eq!(negate_scalar(&one), expected);
    }

    #[test]
    fn test_compressed_key_roundtrip() {
        let private_key = generate_private_key();
        let compressed = compress_public_key(private_key.verifying_key());
        assert!(compressed[0] == 0x02 || compressed[0] == 0x03);
        let decoded = public_key_from_compressed(&compressed).unwrap();
        assert_eq!(&decoded, private_key.verifying_key());
    }

    #[test]
    fn test_public_key_from_compressed_bad_length() {
        let err = public_key_from_compressed(&[0x02; 10]).unwrap_err();
        assert!(err.to_string().contains("expected 33 bytes"));
    }

    #[test]
    fn test_private_key_from_hex() {
        let key = private_key_from_hex(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap();
        let again = private_key_from_hex(
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap();
        assert_eq!(key.to_bytes(), again.to_bytes());
    }

    #[test]
    fn test_private_key_from_hex_invalid() {
        assert!(matches!(
            private_key_from_hex("zz"),
            Err(CryptoError::InvalidPrivateKey)
        ));
        assert!(matches!(
            private_key_from_hex("0x01"),
            Err(CryptoError::InvalidPrivateKey)
        ));
        assert!(private_key_from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_node_id_is_stable() {
        let private_key = generate_private_key();
        let a = public_key_to_node_id(private_key.verifying_key());
        let compressed = compress_public_key(private_key.verifying_key());
        let b = public_key_to_node_id(&public_key_from_compressed(&compressed).unwrap());
        assert_eq!(a, b);
    }
}
