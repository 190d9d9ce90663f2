use kp_core::app_error::{AppError, AppResult};
use std::collections::BTreeMap;

const VARIANT_VERSION: u16 = 0x0100;
const VARIANT_VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq)]
pub enum VariantValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    String(String),
    Bytes(Vec<u8>),
}

fn corrupt(message: &str) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        message,
        false,
        serde_json::json!({}),
    )
}

/// The KDBX 4 typed dictionary carried in the KdfParameters header field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantDictionary {
    entries: BTreeMap<String, VariantValue>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: VariantValue) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.entries.get(key)
    }

    pub fn get_bytes(&self, key: &str) -> AppResult<&[u8]> {
        match self.entries.get(key) {
            Some(VariantValue::Bytes(bytes)) => Ok(bytes),
            _ => Err(corrupt("kdf parameter is missing or mistyped")),
        }
    }

    pub fn get_u64(&self, key: &str) -> AppResult<u64> {
        match self.entries.get(key) {
            Some(VariantValue::U64(v)) => Ok(*v),
            _ => Err(corrupt("kdf parameter is missing or mistyped")),
        }
    }

    pub fn get_u32(&self, key: &str) -> AppResult<u32> {
        match self.entries.get(key) {
            Some(VariantValue::U32(v)) => Ok(*v),
            _ => Err(corrupt("kdf parameter is missing or mistyped")),
        }
    }

    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        fn take<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> AppResult<&'a [u8]> {
            if *cursor + n > bytes.len() {
                return Err(corrupt("variant dictionary truncated"));
            }
            let slice = &bytes[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        }

        let mut cursor = 0usize;
        let version =
            u16::from_le_bytes(take(bytes, &mut cursor, 2)?.try_into().expect("len checked"));
        if version & VARIANT_VERSION_CRITICAL_MASK
            != VARIANT_VERSION & VARIANT_VERSION_CRITICAL_MASK
        {
            return Err(AppError::new(
                "KP_UNSUPPORTED",
                "codec",
                "variant dictionary version is not supported",
                false,
                serde_json::json!({ "version": version }),
            ));
        }

        let mut dict = Self::new();
        loop {
            let value_type = take(bytes, &mut cursor, 1)?[0];
            if value_type == 0 {
                break;
            }
            let name_len =
                u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"))
                    as usize;
            let name = String::from_utf8(take(bytes, &mut cursor, name_len)?.to_vec())
                .map_err(|_| corrupt("variant name is not utf8"))?;
            let value_len =
                u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("len checked"))
                    as usize;
            let raw = take(bytes, &mut cursor, value_len)?;

            let value = match value_type {
                TYPE_U32 if raw.len() == 4 => {
                    VariantValue::U32(u32::from_le_bytes(raw.try_into().expect("len checked")))
                }
                TYPE_U64 if raw.len() == 8 => {
                    VariantValue::U64(u64::from_le_bytes(raw.try_into().expect("len checked")))
                }
                TYPE_BOOL if raw.len() == 1 => VariantValue::Bool(raw[0] != 0),
                TYPE_I32 if raw.len() == 4 => {
                    VariantValue::I32(i32::from_le_bytes(raw.try_into().expect("len checked")))
                }
                TYPE_I64 if raw.len() == 8 => {
                    VariantValue::I64(i64::from_le_bytes(raw.try_into().expect("len checked")))
                }
                TYPE_STRING => VariantValue::String(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| corrupt("variant string is not utf8"))?,
                ),
                TYPE_BYTES => VariantValue::Bytes(raw.to_vec()),
                _ => return Err(corrupt("variant entry has an unknown type or bad length")),
            };
            dict.entries.insert(name, value);
        }
        Ok(dict)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&VARIANT_VERSION.to_le_bytes());
        for (name, value) in &self.entries {
            let (value_type, raw): (u8, Vec<u8>) = match value {
                VariantValue::U32(v) => (TYPE_U32, v.to_le_bytes().to_vec()),
                VariantValue::U64(v) => (TYPE_U64, v.to_le_bytes().to_vec()),
                VariantValue::Bool(v) => (TYPE_BOOL, vec![u8::from(*v)]),
                VariantValue::I32(v) => (TYPE_I32, v.to_le_bytes().to_vec()),
                VariantValue::I64(v) => (TYPE_I64, v.to_le_bytes().to_vec()),
                VariantValue::String(v) => (TYPE_STRING, v.as_bytes().to_vec()),
                VariantValue::Bytes(v) => (TYPE_BYTES, v.clone()),
            };
            out.push(value_type);
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            out.extend_from_slice(&raw);
        }
        out.push(0);
        out
    }
}
