use crate::app_error::{AppError, AppResult};
use uuid::Uuid;

pub fn fill_random(buf: &mut [u8]) -> AppResult<()> {
    getrandom::getrandom(buf).map_err(|e| {
        AppError::new(
            "KP_INTERNAL_ERROR",
            "random",
            "failed gathering entropy from the operating system",
            true,
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

pub fn random_bytes(len: usize) -> AppResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Recovery codes are four hyphen-separated groups of eight hex digits.
/// Only a checksum of the code is ever persisted; the code itself is shown
/// to the user exactly once.
pub fn random_recovery_code() -> AppResult<String> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes)?;
    let hex = bytes_to_hex(&bytes);
    Ok(format!(
        "{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..16],
        &hex[16..24],
        &hex[24..32]
    ))
}
