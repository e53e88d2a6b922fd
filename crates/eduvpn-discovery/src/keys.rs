//! WireGuard key pairs.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use x25519_dalek::{PublicKey, StaticSecret};

/// An X25519 key pair generated per connection.
///
/// Only the public key is sent to the server; the private key is injected
/// into the returned configuration locally.
#[derive(Clone)]
pub struct WireGuardKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl WireGuardKeypair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        Self::from_bytes(rand::random::<[u8; 32]>())
    }

    /// Create from raw private key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key, base64 encoded.
    pub fn public_key(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Private key, base64 encoded.
    pub fn private_key(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for WireGuardKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireGuardKeypair")
            .field("public", &self.public_key())
            .field("secret", &"[redacted]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let a = WireGuardKeypair::generate();
        let b = WireGuardKeypair::generate();
        assert_ne!(a.private_key(), b.private_key());
        assert_eq!(BASE64.decode(a.public_key()).unwrap().len(), 32);
    }

    #[test]
    fn test_public_key_is_derived() {
        let a = WireGuardKeypair::from_bytes([1; 32]);
        let b = WireGuardKeypair::from_bytes([1; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert!(!format!("{:?}", a).contains(&a.private_key()));
    }
}
