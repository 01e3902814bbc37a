//! Node identity

use sentinel_crypto::{
    compress_public_key, generate_private_key, private_key_from_hex, public_key_to_node_id, sign,
    PrivateKey, PublicKey, Signature, COMPRESSED_PUBLIC_KEY_LENGTH,
};

use crate::error::DiscoveryResult;
use crate::types::NodeId;

/// Secp256k1 identity of the local node
///
/// Created once at startup and never mutated.
pub struct NodeIdentity {
    secret: PrivateKey,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_secret(generate_private_key())
    }

    /// Load from a hex private key
    pub fn from_hex(secret: &str) -> DiscoveryResult<Self> {
        Ok(Self::from_secret(private_key_from_hex(secret)?))
    }

    /// Wrap an existing private key
    pub fn from_secret(secret: PrivateKey) -> Self {
        let node_id = NodeId::from_bytes(public_key_to_node_id(secret.verifying_key()));
        Self { secret, node_id }
    }

    /// Node id derived from the public key
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Public key
    pub fn public_key(&self) -> &PublicKey {
        self.secret.verifying_key()
    }

    /// Compressed public key
    pub fn compressed_public_key(&self) -> [u8; COMPRESSED_PUBLIC_KEY_LENGTH] {
        compress_public_key(self.public_key())
    }

    /// Sign a 32-byte digest
    pub fn sign(&self, digest: &[u8; 32]) -> DiscoveryResult<Signature> {
        Ok(sign(digest, &self.secret)?)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
