use crate::app_error::{AppError, AppResult};
use sha2::{Digest, Sha256};

/// SHA-256 over arbitrary bytes, rendered as lowercase hex. This is the
/// checksum used everywhere a blob's integrity is recorded or compared.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn validate_sha256_hex(s: &str) -> AppResult<()> {
    if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(AppError::new(
            "KP_HASH_INVALID_FORMAT",
            "checksum",
            "invalid lowercase hex digest",
            false,
            serde_json::json!({ "value": s }),
        ));
    }
    Ok(())
}
