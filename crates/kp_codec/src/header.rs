use crate::variant::{VariantDictionary, VariantValue};
use kp_core::app_error::{AppError, AppResult};
use kp_core::vault::{Argon2Variant, CipherKind, KdfSettings};

/// KeePass 2.x file identifier.
pub const FILE_SIGNATURE: (u32, u32) = (0x9AA2_D903, 0xB54B_FB67);
/// KeePass 1.x signature, recognized only to reject it precisely.
pub const FILE_SIGNATURE_OLD: (u32, u32) = (0x9AA2_D903, 0xB54B_FB65);
pub const FILE_VERSION_4: u32 = 0x0004_0000;
pub const FILE_VERSION_CRITICAL_MASK: u32 = 0xFFFF_0000;

pub const CIPHER_AES256_CBC: [u8; 16] = [
    0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A,
    0xFF,
];
pub const CIPHER_CHACHA20: [u8; 16] = [
    0xD6, 0x03, 0x8A, 0x2B, 0x8B, 0x6F, 0x4C, 0xB5, 0xA5, 0x24, 0x33, 0x9A, 0x31, 0xDB, 0xB5,
    0x9A,
];

pub const KDF_ARGON2D: [u8; 16] = [
    0xEF, 0x63, 0x6D, 0xDF, 0x8C, 0x29, 0x44, 0x4B, 0x91, 0xF7, 0xA9, 0xA4, 0x03, 0xE3, 0x0A,
    0x0C,
];
pub const KDF_ARGON2ID: [u8; 16] = [
    0x9E, 0x29, 0x8B, 0x19, 0x56, 0xDB, 0x47, 0x73, 0xB2, 0x3D, 0xFC, 0x3E, 0xC6, 0xF0, 0xA1,
    0xE6,
];
pub const KDF_AES: [u8; 16] = [
    0xC9, 0xD9, 0xF3, 0x9A, 0x62, 0x8A, 0x44, 0x60, 0xBF, 0x74, 0x0D, 0x08, 0xC1, 0x8A, 0x4F,
    0xEA,
];

const FIELD_END_OF_HEADER: u8 = 0;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION_FLAGS: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_KDF_PARAMETERS: u8 = 11;

fn corrupt(message: &str) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        message,
        false,
        serde_json::json!({}),
    )
}

fn unsupported(message: &str, details: serde_json::Value) -> AppError {
    AppError::new("KP_UNSUPPORTED", "codec", message, false, details)
}

pub fn iv_len(cipher: CipherKind) -> usize {
    match cipher {
        CipherKind::Aes256Cbc => 16,
        CipherKind::ChaCha20 => 12,
    }
}

/// Parsed outer header of a KDBX 4 container.
#[derive(Debug, Clone, PartialEq)]
pub struct OuterHeader {
    pub cipher: CipherKind,
    pub compressed: bool,
    pub master_seed: [u8; 32],
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfSettings,
    pub kdf_salt: Vec<u8>,
}

impl OuterHeader {
    pub fn kdf_parameters(&self) -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        let uuid = match self.kdf.variant {
            Argon2Variant::Argon2d => KDF_ARGON2D,
            Argon2Variant::Argon2id => KDF_ARGON2ID,
        };
        dict.set("$UUID", VariantValue::Bytes(uuid.to_vec()));
        dict.set("S", VariantValue::Bytes(self.kdf_salt.clone()));
        dict.set(
            "M",
            VariantValue::U64(u64::from(self.kdf.memory_kib) * 1024),
        );
        dict.set("I", VariantValue::U64(u64::from(self.kdf.iterations)));
        dict.set("P", VariantValue::U32(self.kdf.parallelism));
        dict.set("V", VariantValue::U32(self.kdf.version));
        dict
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FILE_SIGNATURE.0.to_le_bytes());
        out.extend_from_slice(&FILE_SIGNATURE.1.to_le_bytes());
        out.extend_from_slice(&FILE_VERSION_4.to_le_bytes());

        let mut field = |id: u8, data: &[u8]| {
            out.push(id);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        };

        let cipher_id = match self.cipher {
            CipherKind::Aes256Cbc => CIPHER_AES256_CBC,
            CipherKind::ChaCha20 => CIPHER_CHACHA20,
        };
        field(FIELD_CIPHER_ID, &cipher_id);
        field(
            FIELD_COMPRESSION_FLAGS,
            &u32::from(self.compressed).to_le_bytes(),
        );
        field(FIELD_MASTER_SEED, &self.master_seed);
        field(FIELD_ENCRYPTION_IV, &self.encryption_iv);
        field(FIELD_KDF_PARAMETERS, &self.kdf_parameters().to_bytes());
        field(FIELD_END_OF_HEADER, b"\r\n\r\n");
        out
    }

    /// Parse the outer header; returns the header and the number of bytes it
    /// occupies (the authenticated span).
    pub fn parse(bytes: &[u8]) -> AppResult<(Self, usize)> {
        fn take<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> AppResult<&'a [u8]> {
            if *cursor + n > bytes.len() {
                return Err(corrupt("container header truncated"));
            }
            let slice = &bytes[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        }

        let mut cursor = 0usize;
        let sig1 =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"));
        let sig2 =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"));
        if (sig1, sig2) == FILE_SIGNATURE_OLD {
            return Err(unsupported(
                "KeePass 1.x databases are not supported",
                serde_json::json!({}),
            ));
        }
        if (sig1, sig2) != FILE_SIGNATURE {
            return Err(corrupt("file signature mismatch"));
        }

        let version =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"));
        if version & FILE_VERSION_CRITICAL_MASK != FILE_VERSION_4 {
            return Err(unsupported(
                "only KDBX 4 containers are supported",
                serde_json::json!({ "version": format!("{version:#010x}") }),
            ));
        }

        let mut cipher: Option<CipherKind> = None;
        let mut compressed = false;
        let mut master_seed: Option<[u8; 32]> = None;
        let mut encryption_iv: Option<Vec<u8>> = None;
        let mut kdf_params: Option<VariantDictionary> = None;

        loop {
            let id = take(bytes, &mut cursor, 1)?[0];
            let len =
                u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"))
                    as usize;
            let data = take(bytes, &mut cursor, len)?;

            match id {
                FIELD_END_OF_HEADER => break,
                FIELD_CIPHER_ID => {
                    let uuid: [u8; 16] = data
                        .try_into()
                        .map_err(|_| corrupt("cipher id must be 16 bytes"))?;
                    cipher = Some(match uuid {
                        CIPHER_AES256_CBC => CipherKind::Aes256Cbc,
                        CIPHER_CHACHA20 => CipherKind::ChaCha20,
                        _ => {
                            return Err(unsupported(
                                "content cipher is not supported",
                                serde_json::json!({ "cipher_id": data.to_vec() }),
                            ))
                        }
                    });
                }
                FIELD_COMPRESSION_FLAGS => {
                    let flags: [u8; 4] = data
                        .try_into()
                        .map_err(|_| corrupt("compression flags must be 4 bytes"))?;
                    compressed = match u32::from_le_bytes(flags) {
                        0 => false,
                        1 => true,
                        other => {
                            return Err(unsupported(
                                "compression algorithm is not supported",
                                serde_json::json!({ "flags": other }),
                            ))
                        }
                    };
                }
                FIELD_MASTER_SEED => {
                    master_seed = Some(
                        data.try_into()
                            .map_err(|_| corrupt("master seed must be 32 bytes"))?,
                    );
                }
                FIELD_ENCRYPTION_IV => encryption_iv = Some(data.to_vec()),
                FIELD_KDF_PARAMETERS => kdf_params = Some(VariantDictionary::parse(data)?),
                // Comment and public custom data carry no semantics here.
                _ => {}
            }
        }

        let cipher = cipher.ok_or_else(|| corrupt("header is missing the cipher id"))?;
        let master_seed = master_seed.ok_or_else(|| corrupt("header is missing the master seed"))?;
        let encryption_iv =
            encryption_iv.ok_or_else(|| corrupt("header is missing the encryption iv"))?;
        if encryption_iv.len() != iv_len(cipher) {
            return Err(corrupt("encryption iv length does not match the cipher"));
        }
        let params = kdf_params.ok_or_else(|| corrupt("header is missing kdf parameters"))?;
        let (kdf, kdf_salt) = parse_kdf(&params)?;

        Ok((
            Self {
                cipher,
                compressed,
                master_seed,
                encryption_iv,
                kdf,
                kdf_salt,
            },
            cursor,
        ))
    }
}

fn parse_kdf(params: &VariantDictionary) -> AppResult<(KdfSettings, Vec<u8>)> {
    let uuid: [u8; 16] = params
        .get_bytes("$UUID")?
        .try_into()
        .map_err(|_| corrupt("kdf uuid must be 16 bytes"))?;
    let variant = match uuid {
        KDF_ARGON2D => Argon2Variant::Argon2d,
        KDF_ARGON2ID => Argon2Variant::Argon2id,
        KDF_AES => {
            return Err(unsupported(
                "the AES key derivation function is not supported",
                serde_json::json!({}),
            ))
        }
        _ => {
            return Err(unsupported(
                "unknown key derivation function",
                serde_json::json!({ "kdf_uuid": uuid.to_vec() }),
            ))
        }
    };

    let salt = params.get_bytes("S")?.to_vec();
    let memory_bytes = params.get_u64("M")?;
    let iterations = params.get_u64("I")?;
    let parallelism = params.get_u32("P")?;
    let version = params.get_u32("V")?;

    let memory_kib = u32::try_from(memory_bytes / 1024)
        .map_err(|_| corrupt("argon2 memory parameter is out of range"))?;
    let iterations =
        u32::try_from(iterations).map_err(|_| corrupt("argon2 iterations are out of range"))?;

    Ok((
        KdfSettings {
            variant,
            memory_kib,
            iterations,
            parallelism,
            version,
        },
        salt,
    ))
}
