//! Pluggable message signing.

use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;

use crate::codec::ProtocolError;

/// Signs and verifies the payload documents of a message.
pub trait MessageSigner: Send + Sync {
    /// Compute the hex signature over the payload frames.
    fn sign(&self, parts: &[&[u8]]) -> String;

    /// Verify a received signature against the payload frames.
    fn verify(&self, parts: &[&[u8]], signature: &str) -> bool;
}

/// Signer used when no key is configured; produces empty signatures
/// and accepts everything.
pub struct NullSigner;

impl MessageSigner for NullSigner {
    fn sign(&self, _parts: &[&[u8]]) -> String {
        String::new()
    }

    fn verify(&self, _parts: &[&[u8]], _signature: &str) -> bool {
        true
    }
}

/// HMAC-SHA256 signer keyed from the connection file.
pub struct HmacSha256Signer {
    key: Vec<u8>,
}

impl HmacSha256Signer {
    /// Create a signer with the given key.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }
}

impl MessageSigner for HmacSha256Signer {
    fn sign(&self, parts: &[&[u8]]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, parts: &[&[u8]], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected).is_ok()
    }
}

/// Create a signer for the configured scheme and key.
///
/// An empty key disables signing entirely.
///
/// # Errors
/// Returns an error for an unsupported signature scheme.
pub fn create_signer(
    scheme: &str,
    key: &str,
) -> Result<Box<dyn MessageSigner>, ProtocolError> {
    if key.is_empty() {
        return Ok(Box::new(NullSigner));
    }
    match scheme {
        "" | "hmac-sha256" => Ok(Box::new(HmacSha256Signer::new(key))),
        other => Err(ProtocolError::UnsupportedScheme(other.to_string())),
    }
}
