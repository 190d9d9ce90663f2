use crate::cipher::{decrypt_content, encrypt_content};
use crate::compress::{gunzip, gzip};
use crate::document::{parse_document, write_document};
use crate::header::{iv_len, OuterHeader};
use crate::hmac_stream::{header_mac, read_blocks, write_blocks};
use crate::inner::{InnerHeader, InnerStream};
use crate::kdf::{composite_key, hmac_base_key, master_key, Argon2Kdf, Argon2Request};
use kp_core::app_error::{AppError, AppResult};
use kp_core::random::{fill_random, random_bytes};
use kp_core::vault::Vault;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

fn corrupt(message: &str) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        message,
        false,
        serde_json::json!({}),
    )
}

/// Fresh empty vault with default metadata and a newly generated root group.
/// Credentials are not part of the vault; they accompany [`save`] and
/// [`load`] calls.
pub fn create(name: &str, now_ms: i64) -> Vault {
    Vault::new(name, now_ms)
}

struct Keys {
    master: Zeroizing<[u8; 32]>,
    hmac_base: Zeroizing<[u8; 64]>,
}

fn derive_keys(
    header: &OuterHeader,
    passphrase: &str,
    kdf: &dyn Argon2Kdf,
) -> AppResult<Keys> {
    let composite = composite_key(passphrase);
    let transformed = Zeroizing::new(kdf.derive(&Argon2Request {
        passphrase: &composite[..],
        salt: &header.kdf_salt,
        memory_kib: header.kdf.memory_kib,
        iterations: header.kdf.iterations,
        hash_length: 32,
        parallelism: header.kdf.parallelism,
        variant: header.kdf.variant,
        version: header.kdf.version,
    })?);
    if transformed.len() != 32 {
        return Err(AppError::new(
            "KP_INTERNAL_ERROR",
            "codec",
            "kdf callback returned an unexpected hash length",
            false,
            serde_json::json!({ "len": transformed.len() }),
        ));
    }
    Ok(Keys {
        master: master_key(&header.master_seed, &transformed),
        hmac_base: hmac_base_key(&header.master_seed, &transformed),
    })
}

/// Serialize the vault with the cipher and KDF parameters attached to it.
pub fn save(vault: &Vault, passphrase: &str, kdf: &dyn Argon2Kdf) -> AppResult<Vec<u8>> {
    let mut master_seed = [0u8; 32];
    fill_random(&mut master_seed)?;
    let kdf_salt = random_bytes(32)?;
    let encryption_iv = random_bytes(iv_len(vault.cipher))?;
    let stream_key = random_bytes(64)?;

    let header = OuterHeader {
        cipher: vault.cipher,
        compressed: true,
        master_seed,
        encryption_iv,
        kdf: vault.kdf,
        kdf_salt,
    };
    let header_bytes = header.to_bytes();
    let keys = derive_keys(&header, passphrase, kdf)?;

    let mut content = InnerHeader {
        stream_key: stream_key.clone(),
    }
    .to_bytes();
    let mut stream = InnerStream::new(&stream_key);
    content.extend_from_slice(write_document(vault, &mut stream).as_bytes());

    let packed = gzip(&content)?;
    let encrypted = encrypt_content(
        vault.cipher,
        &keys.master,
        &header.encryption_iv,
        &packed,
    )?;

    let mut out = header_bytes.clone();
    out.extend_from_slice(&Sha256::digest(&header_bytes));
    out.extend_from_slice(&header_mac(&keys.hmac_base, &header_bytes));
    out.extend_from_slice(&write_blocks(&encrypted, &keys.hmac_base));
    Ok(out)
}

/// Decrypt and parse a KDBX blob. Fails with `KP_KEY_INVALID` when the
/// passphrase does not authenticate, `KP_BLOB_CORRUPT` on structural damage
/// and `KP_UNSUPPORTED` for foreign versions, ciphers or KDFs.
pub fn load(bytes: &[u8], passphrase: &str, kdf: &dyn Argon2Kdf) -> AppResult<Vault> {
    let (header, header_len) = OuterHeader::parse(bytes)?;
    if bytes.len() < header_len + 64 {
        return Err(corrupt("container ends before header checksums"));
    }
    let header_bytes = &bytes[..header_len];
    let stored_sha = &bytes[header_len..header_len + 32];
    let stored_mac = &bytes[header_len + 32..header_len + 64];

    let computed_sha = Sha256::digest(header_bytes);
    if stored_sha != computed_sha.as_slice() {
        return Err(corrupt("header checksum mismatch"));
    }

    let keys = derive_keys(&header, passphrase, kdf)?;
    if header_mac(&keys.hmac_base, header_bytes).as_slice() != stored_mac {
        return Err(AppError::invalid_key());
    }

    let encrypted = read_blocks(&bytes[header_len + 64..], &keys.hmac_base)?;
    let packed = decrypt_content(
        header.cipher,
        &keys.master,
        &header.encryption_iv,
        &encrypted,
    )?;
    let content = if header.compressed {
        gunzip(&packed)?
    } else {
        packed
    };

    let (inner, xml_offset) = InnerHeader::parse(&content)?;
    let xml = std::str::from_utf8(&content[xml_offset..])
        .map_err(|_| corrupt("payload document is not utf8"))?;
    let mut stream = InnerStream::new(&inner.stream_key);
    parse_document(xml, &mut stream, header.cipher, header.kdf)
}
