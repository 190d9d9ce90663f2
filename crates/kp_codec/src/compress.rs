use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kp_core::app_error::{AppError, AppResult};
use std::io::{Read, Write};

pub fn gzip(bytes: &[u8]) -> AppResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| {
        AppError::new(
            "KP_IO",
            "codec",
            "failed compressing payload",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    encoder.finish().map_err(|e| {
        AppError::new(
            "KP_IO",
            "codec",
            "failed finishing gzip stream",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

pub fn gunzip(bytes: &[u8]) -> AppResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| {
        AppError::new(
            "KP_BLOB_CORRUPT",
            "codec",
            "payload gzip stream is malformed",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    Ok(out)
}
