//! Minisign signature verification for discovery documents.
//!
//! Public key: base64 of `"Ed" || key_id[8] || ed25519_public[32]`.
//!
//! Signature file:
//! ```text
//! untrusted comment: <free text>
//! base64("Ed" | "ED" || key_id[8] || signature[64])
//! trusted comment: <free text>
//! base64(global_signature[64])
//! ```
//!
//! `Ed` signs the document itself, `ED` signs its BLAKE2b-512 hash. The
//! global signature covers `signature || trusted_comment`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{DiscoveryError, Result};

const KEY_ALGORITHM: &[u8; 2] = b"Ed";
const PREHASHED_ALGORITHM: &[u8; 2] = b"ED";
const TRUSTED_COMMENT_PREFIX: &str = "trusted comment: ";
const UNTRUSTED_COMMENT_PREFIX: &str = "untrusted comment: ";

type KeyId = [u8; 8];

#[derive(Debug, Clone)]
struct TrustedKey {
    id: KeyId,
    key: VerifyingKey,
}

/// Verifies minisign signatures against a fixed set of trusted keys.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    keys: Vec<TrustedKey>,
}

impl SignatureVerifier {
    /// Decode the trusted public keys.
    pub fn new<S: AsRef<str>>(public_keys: &[S]) -> Result<Self> {
        let keys = public_keys
            .iter()
            .map(|k| decode_public_key(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(DiscoveryError::InvalidKey(
                "no trusted public keys configured".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    /// Verify `message` against the contents of a `.minisig` file.
    pub fn verify(&self, message: &[u8], signature_file: &str) -> Result<()> {
        let parsed = ParsedSignature::parse(signature_file)?;

        let trusted = self
            .keys
            .iter()
            .find(|k| k.id == parsed.key_id)
            .ok_or_else(|| signature_error("signed by an untrusted key"))?;

        let signed = if parsed.prehashed {
            Blake2b512::digest(message).to_vec()
        } else {
            message.to_vec()
        };
        trusted
            .key
            .verify(&signed, &parsed.signature)
            .map_err(|_| signature_error("document signature does not match"))?;

        let mut global = parsed.signature.to_bytes().to_vec();
        global.extend_from_slice(parsed.trusted_comment.as_bytes());
        trusted
            .key
            .verify(&global, &parsed.global_signature)
            .map_err(|_| signature_error("trusted comment signature does not match"))?;

        tracing::debug!(
            comment = %parsed.trusted_comment,
            prehashed = parsed.prehashed,
            "Verified signature"
        );
        Ok(())
    }
}

struct ParsedSignature {
    prehashed: bool,
    key_id: KeyId,
    signature: Signature,
    trusted_comment: String,
    global_signature: Signature,
}

impl ParsedSignature {
    fn parse(file: &str) -> Result<Self> {
        let mut lines = file.lines().map(str::trim_end);

        let untrusted = lines.next().unwrap_or_default();
        if !untrusted.starts_with(UNTRUSTED_COMMENT_PREFIX) {
            return Err(signature_error("missing untrusted comment"));
        }

        let sig_bytes = decode_base64(lines.next().unwrap_or_default())?;
        if sig_bytes.len() != 74 {
            return Err(signature_error("signature has the wrong length"));
        }
        let prehashed = match &sig_bytes[..2] {
            alg if alg == PREHASHED_ALGORITHM => true,
            alg if alg == KEY_ALGORITHM => false,
            _ => return Err(signature_error("unsupported signature algorithm")),
        };

        let trusted_comment = lines
            .next()
            .and_then(|l| l.strip_prefix(TRUSTED_COMMENT_PREFIX))
            .ok_or_else(|| signature_error("missing trusted comment"))?
            .to_string();

        let global_bytes = decode_base64(lines.next().unwrap_or_default())?;

        Ok(Self {
            prehashed,
            key_id: to_array(&sig_bytes[2..10])?,
            signature: Signature::from_bytes(&to_array(&sig_bytes[10..74])?),
            trusted_comment,
            global_signature: Signature::from_bytes(&to_array(&global_bytes)?),
        })
    }
}

fn decode_public_key(encoded: &str) -> Result<TrustedKey> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| DiscoveryError::InvalidKey(e.to_string()))?;
    if bytes.len() != 42 || &bytes[..2] != KEY_ALGORITHM {
        return Err(DiscoveryError::InvalidKey(format!(
            "not a minisign public key: {}",
            encoded
        )));
    }
    let id: KeyId = to_array(&bytes[2..10])?;
    let key = VerifyingKey::from_bytes(&to_array(&bytes[10..42])?)
        .map_err(|e| DiscoveryError::InvalidKey(e.to_string()))?;
    Ok(TrustedKey { id, key })
}

fn decode_base64(line: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(line.trim())
        .map_err(|e| signature_error(&format!("invalid base64: {}", e)))
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| signature_error("unexpected length"))
}

fn signature_error(reason: &str) -> DiscoveryError {
    DiscoveryError::Signature(reason.to_string())
}

/// Minisign test fixtures, shared with the discovery tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub const KEY_ID: KeyId = *b"testkey1";

    pub fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn public_key(key: &SigningKey) -> String {
        let mut bytes = KEY_ALGORITHM.to_vec();
        bytes.extend_from_slice(&KEY_ID);
        bytes.extend_from_slice(key.verifying_key().as_bytes());
        BASE64.encode(bytes)
    }

    pub fn sign(key: &SigningKey, message: &[u8], prehashed: bool) -> String {
        let (algorithm, signature) = if prehashed {
            (PREHASHED_ALGORITHM, key.sign(&Blake2b512::digest(message)))
        } else {
            (KEY_ALGORITHM, key.sign(message))
        };
        let trusted_comment = "timestamp:1700000000\tfile:test.json\thashed";

        let mut sig_bytes = algorithm.to_vec();
        sig_bytes.extend_from_slice(&KEY_ID);
        sig_bytes.extend_from_slice(&signature.to_bytes());

        let mut global = signature.to_bytes().to_vec();
        global.extend_from_slice(trusted_comment.as_bytes());
        let global_signature = key.sign(&global);

        format!(
            "untrusted comment: signature from minisign secret key\n{}\ntrusted comment: {}\n{}\n",
            BASE64.encode(sig_bytes),
            trusted_comment,
            BASE64.encode(global_signature.to_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const DOCUMENT: &[u8] = br#"{"v": 1, "server_list": []}"#;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(&[public_key(&signing_key(7))]).unwrap()
    }

    #[test]
    fn test_verifies_legacy_and_prehashed() {
        let key = signing_key(7);
        verifier().verify(DOCUMENT, &sign(&key, DOCUMENT, false)).unwrap();
        verifier().verify(DOCUMENT, &sign(&key, DOCUMENT, true)).unwrap();
    }

    #[test]
    fn test_rejects_modified_document() {
        let sig = sign(&signing_key(7), DOCUMENT, true);
        let err = verifier().verify(br#"{"v": 2, "server_list": []}"#, &sig).unwrap_err();
        assert!(err.is_signature_failure());
    }

    #[test]
    fn test_rejects_untrusted_key() {
        let other = signing_key(9);
        let verifier = SignatureVerifier::new(&[public_key(&other)]).unwrap();
        // Same key id, different key.
        let err = verifier
            .verify(DOCUMENT, &sign(&signing_key(7), DOCUMENT, false))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Signature(_)));
    }

    #[test]
    fn test_rejects_tampered_trusted_comment() {
        let sig = sign(&signing_key(7), DOCUMENT, true).replace("hashed", "hashes");
        assert!(verifier().verify(DOCUMENT, &sig).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(verifier().verify(DOCUMENT, "").is_err());
        assert!(verifier().verify(DOCUMENT, "untrusted comment: x\n!!!\n").is_err());
    }

    #[test]
    fn test_default_eduvpn_keys_decode() {
        let keys = [
            "RWRtBSX1alxyGX+Xn3LuZnWUT0w//B6EmTJvgaAxBMYzlQeI+jdrO6KF",
            "RWQKqtqvd0R7rUDp0rWzbtYPA3towPWcLDCl7eY9pBMMI/ohCmrS0WiM",
            "RWQ68Y5/b8DED0TJ41B1LE7yAvkmavZWjDwCBUuC+Z2pP9HaSawzpEDA",
        ];
        SignatureVerifier::new(&keys).unwrap();
    }

    #[test]
    fn test_rejects_malformed_key() {
        assert!(SignatureVerifier::new(&["not-a-key"]).is_err());
        assert!(SignatureVerifier::new::<&str>(&[]).is_err());
    }
}
