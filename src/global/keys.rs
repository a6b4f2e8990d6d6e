use std::fmt;

use ed25519::signature::Signer;
use ed25519::Signature;
use ed25519_dalek::SignatureError;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde::Serialize;

use super::crypto::encode;

/// Public half of a [`KeyPair`]; owns repositories and signs heads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKey([u8; 32]);

impl PubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }

    /// Strict verification, rejecting small order keys and malleable
    /// signatures.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.verifying_key()?.verify_strict(message, signature)
    }
}

impl From<VerifyingKey> for PubKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn pub_key(&self) -> PubKey {
        self.signing_key.verifying_key().into()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.pub_key())
    }
}

/// A value together with the signature over its canonical encoding.
///
/// Ordered by value first, so sets of signed values iterate in value order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignedData<T> {
    value: T,
    signature_r: [u8; 32],
    signature_s: [u8; 32],
}

impl<T: Serialize> SignedData<T> {
    pub fn sign(value: T, keys: &KeyPair) -> Result<Self, postcard::Error> {
        let signature = keys.sign(&encode(&value)?);
        Ok(Self {
            value,
            signature_r: *signature.r_bytes(),
            signature_s: *signature.s_bytes(),
        })
    }

    pub fn verify(&self, key: &PubKey) -> bool {
        let Ok(bytes) = encode(&self.value) else {
            return false;
        };
        let signature = Signature::from_components(self.signature_r, self.signature_s);
        key.verify(&bytes, &signature).is_ok()
    }
}

impl<T> SignedData<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for SignedData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedData")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}
