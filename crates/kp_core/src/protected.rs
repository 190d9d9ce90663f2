use crate::app_error::AppResult;
use crate::random::fill_random;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

// Fixed stream position; uniqueness comes from the per-instance salt.
const MASK_NONCE: [u8; 12] = *b"kp.pv.mask.1";

/// A string whose in-memory representation is masked. The cleartext exists
/// only inside a [`Cleartext`] obtained through [`ProtectedValue::reveal`],
/// and that copy is zeroized on drop. `Debug` and the serialized form never
/// carry the cleartext.
#[derive(Clone)]
pub struct ProtectedValue {
    masked: Vec<u8>,
    salt: [u8; 32],
}

/// Scoped cleartext. Holds the only unmasked copy; wiped when dropped.
pub struct Cleartext(Zeroizing<String>);

impl Cleartext {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn apply_mask(salt: &[u8; 32], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(&(*salt).into(), &MASK_NONCE.into());
    cipher.apply_keystream(buf);
}

impl ProtectedValue {
    pub fn new(plaintext: &str) -> AppResult<Self> {
        let mut salt = [0u8; 32];
        fill_random(&mut salt)?;
        let mut masked = plaintext.as_bytes().to_vec();
        apply_mask(&salt, &mut masked);
        Ok(Self { masked, salt })
    }

    pub fn from_parts(masked: Vec<u8>, salt: [u8; 32]) -> Self {
        Self { masked, salt }
    }

    pub fn reveal(&self) -> Cleartext {
        let mut buf = Zeroizing::new(self.masked.clone());
        apply_mask(&self.salt, &mut buf);
        let text = String::from_utf8_lossy(&buf).into_owned();
        Cleartext(Zeroizing::new(text))
    }

}

impl PartialEq for ProtectedValue {
    fn eq(&self, other: &Self) -> bool {
        self.reveal().as_str() == other.reveal().as_str()
    }
}

impl Eq for ProtectedValue {}

impl fmt::Debug for ProtectedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProtectedValue(\u{2022}\u{2022}\u{2022})")
    }
}

#[derive(Serialize, Deserialize)]
struct ProtectedValueWire {
    data: String,
    salt: String,
}

impl Serialize for ProtectedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ProtectedValueWire {
            data: BASE64.encode(&self.masked),
            salt: BASE64.encode(self.salt),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProtectedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as DeError;
        let wire = ProtectedValueWire::deserialize(deserializer)?;
        let masked = BASE64
            .decode(&wire.data)
            .map_err(|e| D::Error::custom(format!("protected value data: {e}")))?;
        let salt_bytes = BASE64
            .decode(&wire.salt)
            .map_err(|e| D::Error::custom(format!("protected value salt: {e}")))?;
        let salt: [u8; 32] = salt_bytes
            .try_into()
            .map_err(|_| D::Error::custom("protected value salt must be 32 bytes"))?;
        Ok(Self { masked, salt })
    }
}
