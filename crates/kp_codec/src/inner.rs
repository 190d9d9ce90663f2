use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use kp_core::app_error::{AppError, AppResult};
use sha2::{Digest, Sha512};

const FIELD_END: u8 = 0;
const FIELD_STREAM_ID: u8 = 1;
const FIELD_STREAM_KEY: u8 = 2;
const FIELD_BINARY: u8 = 3;

pub const INNER_STREAM_CHACHA20: u32 = 3;

/// Inner header of the decrypted payload: the random-stream configuration
/// that protects individual field values inside the XML document.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerHeader {
    pub stream_key: Vec<u8>,
}

impl InnerHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut field = |id: u8, data: &[u8]| {
            out.push(id);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        };
        field(FIELD_STREAM_ID, &INNER_STREAM_CHACHA20.to_le_bytes());
        field(FIELD_STREAM_KEY, &self.stream_key);
        field(FIELD_END, &[]);
        out
    }

    /// Parse the inner header; returns it and the offset where the XML
    /// document begins. Binary attachments are skipped.
    pub fn parse(bytes: &[u8]) -> AppResult<(Self, usize)> {
        let mut cursor = 0usize;
        let mut stream_id: Option<u32> = None;
        let mut stream_key: Option<Vec<u8>> = None;

        loop {
            if cursor + 5 > bytes.len() {
                return Err(AppError::new(
                    "KP_BLOB_CORRUPT",
                    "codec",
                    "inner header truncated",
                    false,
                    serde_json::json!({}),
                ));
            }
            let id = bytes[cursor];
            let len = u32::from_le_bytes(
                bytes[cursor + 1..cursor + 5]
                    .try_into()
                    .expect("len checked"),
            ) as usize;
            cursor += 5;
            if cursor + len > bytes.len() {
                return Err(AppError::new(
                    "KP_BLOB_CORRUPT",
                    "codec",
                    "inner header field truncated",
                    false,
                    serde_json::json!({ "field": id }),
                ));
            }
            let data = &bytes[cursor..cursor + len];
            cursor += len;

            match id {
                FIELD_END => break,
                FIELD_STREAM_ID => {
                    let raw: [u8; 4] = data.try_into().map_err(|_| {
                        AppError::new(
                            "KP_BLOB_CORRUPT",
                            "codec",
                            "inner stream id must be 4 bytes",
                            false,
                            serde_json::json!({}),
                        )
                    })?;
                    stream_id = Some(u32::from_le_bytes(raw));
                }
                FIELD_STREAM_KEY => stream_key = Some(data.to_vec()),
                FIELD_BINARY => {}
                _ => {}
            }
        }

        match stream_id {
            Some(INNER_STREAM_CHACHA20) => {}
            Some(other) => {
                return Err(AppError::new(
                    "KP_UNSUPPORTED",
                    "codec",
                    "inner random stream cipher is not supported",
                    false,
                    serde_json::json!({ "stream_id": other }),
                ))
            }
            None => {
                return Err(AppError::new(
                    "KP_BLOB_CORRUPT",
                    "codec",
                    "inner header is missing the stream id",
                    false,
                    serde_json::json!({}),
                ))
            }
        }
        let stream_key = stream_key.ok_or_else(|| {
            AppError::new(
                "KP_BLOB_CORRUPT",
                "codec",
                "inner header is missing the stream key",
                false,
                serde_json::json!({}),
            )
        })?;

        Ok((Self { stream_key }, cursor))
    }
}

/// The inner random stream. Protected field values consume keystream in
/// document order, so one instance must be threaded through a full read or
/// write pass.
pub struct InnerStream {
    cipher: ChaCha20,
}

impl InnerStream {
    pub fn new(stream_key: &[u8]) -> Self {
        let digest = Sha512::digest(stream_key);
        let key: [u8; 32] = digest[0..32].try_into().expect("digest is 64 bytes");
        let nonce: [u8; 12] = digest[32..44].try_into().expect("digest is 64 bytes");
        Self {
            cipher: ChaCha20::new(&key.into(), &nonce.into()),
        }
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = InnerHeader {
            stream_key: vec![0x42; 64],
        };
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(b"<KeePassFile/>");
        let (parsed, offset) = InnerHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(&bytes[offset..], b"<KeePassFile/>");
    }

    #[test]
    fn stream_is_deterministic_and_ordered() {
        let mut first = InnerStream::new(&[1u8; 64]);
        let mut second = InnerStream::new(&[1u8; 64]);

        let mut a = *b"alpha";
        let mut b = *b"beta";
        first.apply(&mut a);
        first.apply(&mut b);

        // the same order reproduces the same masking
        let mut a2 = *b"alpha";
        let mut b2 = *b"beta";
        second.apply(&mut a2);
        second.apply(&mut b2);
        assert_eq!(a, a2);
        assert_eq!(b, b2);
    }

    #[test]
    fn unknown_stream_cipher_is_unsupported() {
        let mut out = Vec::new();
        out.push(FIELD_STREAM_ID);
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes()); // Salsa20
        out.push(FIELD_STREAM_KEY);
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.push(FIELD_END);
        out.extend_from_slice(&0u32.to_le_bytes());

        let err = InnerHeader::parse(&out).expect_err("salsa20");
        assert_eq!(err.code, "KP_UNSUPPORTED");
    }
}
