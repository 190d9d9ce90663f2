use kp_core::app_error::AppResult;
use kp_core::vault::Argon2Variant;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

/// One Argon2 invocation. The codec never embeds a KDF implementation; the
/// caller supplies one behind [`Argon2Kdf`] and this request is the complete
/// contract between them. `passphrase` here is already the composite key
/// material, not the raw user passphrase.
#[derive(Debug)]
pub struct Argon2Request<'a> {
    pub passphrase: &'a [u8],
    pub salt: &'a [u8],
    pub memory_kib: u32,
    pub iterations: u32,
    pub hash_length: u32,
    pub parallelism: u32,
    pub variant: Argon2Variant,
    pub version: u32,
}

pub trait Argon2Kdf {
    fn derive(&self, request: &Argon2Request<'_>) -> AppResult<Vec<u8>>;
}

/// SHA-256(SHA-256(passphrase)): the KeePass composite key for a single
/// master-passphrase credential.
pub fn composite_key(passphrase: &str) -> Zeroizing<[u8; 32]> {
    let inner = Sha256::digest(passphrase.as_bytes());
    let outer = Sha256::digest(inner);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&outer);
    key
}

/// Content-cipher key: SHA-256(master_seed || transformed_key).
pub fn master_key(master_seed: &[u8; 32], transformed: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    key
}

/// HMAC base key: SHA-512(master_seed || transformed_key || 0x01).
pub fn hmac_base_key(master_seed: &[u8; 32], transformed: &[u8]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed);
    hasher.update([0x01u8]);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 64]);
    key.copy_from_slice(&digest);
    key
}

/// Per-block HMAC key: SHA-512(le_u64(block_index) || base_key). The header
/// uses block index `u64::MAX`.
pub fn hmac_block_key(base: &[u8; 64], block_index: u64) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(base);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 64]);
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_is_double_sha256() {
        let key = composite_key("abc");
        let expected = Sha256::digest(Sha256::digest(b"abc"));
        assert_eq!(&key[..], &expected[..]);
    }

    #[test]
    fn block_keys_differ_per_index() {
        let seed = [7u8; 32];
        let base = hmac_base_key(&seed, &[1u8; 32]);
        assert_ne!(
            &hmac_block_key(&base, 0)[..],
            &hmac_block_key(&base, 1)[..]
        );
        assert_ne!(
            &hmac_block_key(&base, 0)[..],
            &hmac_block_key(&base, u64::MAX)[..]
        );
    }
}
