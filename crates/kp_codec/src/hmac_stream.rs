use crate::kdf::hmac_block_key;
use hmac::{Hmac, Mac};
use kp_core::app_error::{AppError, AppResult};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const BLOCK_SIZE: usize = 1024 * 1024;

/// Header authentication uses the block key for index `u64::MAX` over the
/// raw header bytes.
pub fn header_mac(base: &[u8; 64], header_bytes: &[u8]) -> [u8; 32] {
    let key = hmac_block_key(base, u64::MAX);
    let mut mac = HmacSha256::new_from_slice(&key[..]).expect("hmac accepts any key length");
    mac.update(header_bytes);
    mac.finalize().into_bytes().into()
}

fn block_mac(base: &[u8; 64], index: u64, data: &[u8]) -> [u8; 32] {
    let key = hmac_block_key(base, index);
    let mut mac = HmacSha256::new_from_slice(&key[..]).expect("hmac accepts any key length");
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as u32).to_le_bytes());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Split `content` into authenticated blocks, terminated by an empty block.
pub fn write_blocks(content: &[u8], hmac_base: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 64);
    let mut index = 0u64;
    for chunk in content.chunks(BLOCK_SIZE) {
        out.extend_from_slice(&block_mac(hmac_base, index, chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&block_mac(hmac_base, index, &[]));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Read and verify the block stream. An HMAC mismatch surfaces as a wrong
/// key: with a bad passphrase every block key is wrong, which is exactly how
/// the failure presents.
pub fn read_blocks(bytes: &[u8], hmac_base: &[u8; 64]) -> AppResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    let mut index = 0u64;

    loop {
        if cursor + 36 > bytes.len() {
            return Err(AppError::new(
                "KP_BLOB_CORRUPT",
                "codec",
                "block stream truncated",
                false,
                serde_json::json!({ "block": index }),
            ));
        }
        let stored_mac = &bytes[cursor..cursor + 32];
        let len = u32::from_le_bytes(
            bytes[cursor + 32..cursor + 36]
                .try_into()
                .expect("len checked"),
        ) as usize;
        cursor += 36;
        if cursor + len > bytes.len() {
            return Err(AppError::new(
                "KP_BLOB_CORRUPT",
                "codec",
                "block data truncated",
                false,
                serde_json::json!({ "block": index, "declared_len": len }),
            ));
        }
        let data = &bytes[cursor..cursor + len];
        cursor += len;

        let expected = block_mac(hmac_base, index, data);
        if expected != *stored_mac {
            return Err(AppError::invalid_key());
        }

        if len == 0 {
            return Ok(out);
        }
        out.extend_from_slice(data);
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multi_block_content() {
        let base = [9u8; 64];
        let content = vec![0xABu8; BLOCK_SIZE + 100];
        let stream = write_blocks(&content, &base);
        assert_eq!(read_blocks(&stream, &base).expect("read"), content);
    }

    #[test]
    fn wrong_base_key_reads_as_invalid_key() {
        let stream = write_blocks(b"content", &[1u8; 64]);
        let err = read_blocks(&stream, &[2u8; 64]).expect_err("mismatch");
        assert_eq!(err.code, "KP_KEY_INVALID");
    }

    #[test]
    fn flipped_payload_bit_reads_as_invalid_key() {
        let base = [1u8; 64];
        let mut stream = write_blocks(b"content", &base);
        let last = stream.len() - 5;
        stream[last] ^= 0x01;
        let err = read_blocks(&stream, &base).expect_err("tamper");
        assert_eq!(err.code, "KP_KEY_INVALID");
    }

    #[test]
    fn truncation_is_corrupt() {
        let base = [1u8; 64];
        let stream = write_blocks(b"content", &base);
        let err = read_blocks(&stream[..10], &base).expect_err("truncated");
        assert_eq!(err.code, "KP_BLOB_CORRUPT");
    }
}
