use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20;
use kp_core::app_error::{AppError, AppResult};
use kp_core::vault::CipherKind;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn iv_error(cipher: CipherKind, iv: &[u8]) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        "encryption iv length does not match the cipher",
        false,
        serde_json::json!({ "cipher": format!("{cipher:?}"), "iv_len": iv.len() }),
    )
}

pub fn encrypt_content(
    cipher: CipherKind,
    key: &[u8; 32],
    iv: &[u8],
    plaintext: &[u8],
) -> AppResult<Vec<u8>> {
    match cipher {
        CipherKind::Aes256Cbc => {
            let iv: [u8; 16] = iv.try_into().map_err(|_| iv_error(cipher, iv))?;
            let enc = Aes256CbcEnc::new(key.into(), &iv.into());
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        CipherKind::ChaCha20 => {
            let nonce: [u8; 12] = iv.try_into().map_err(|_| iv_error(cipher, iv))?;
            let mut out = plaintext.to_vec();
            let mut stream = ChaCha20::new(key.into(), &nonce.into());
            stream.apply_keystream(&mut out);
            Ok(out)
        }
    }
}

pub fn decrypt_content(
    cipher: CipherKind,
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
) -> AppResult<Vec<u8>> {
    match cipher {
        CipherKind::Aes256Cbc => {
            let iv: [u8; 16] = iv.try_into().map_err(|_| iv_error(cipher, iv))?;
            let dec = Aes256CbcDec::new(key.into(), &iv.into());
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).map_err(|_| {
                // The block stream is authenticated before decryption, so a
                // padding failure means the ciphertext itself is malformed.
                AppError::new(
                    "KP_BLOB_CORRUPT",
                    "codec",
                    "content padding is invalid",
                    false,
                    serde_json::json!({}),
                )
            })
        }
        CipherKind::ChaCha20 => {
            let nonce: [u8; 12] = iv.try_into().map_err(|_| iv_error(cipher, iv))?;
            let mut out = ciphertext.to_vec();
            let mut stream = ChaCha20::new(key.into(), &nonce.into());
            stream.apply_keystream(&mut out);
            Ok(out)
        }
    }
}
