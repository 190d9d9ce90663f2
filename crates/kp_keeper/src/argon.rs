use kp_codec::{Argon2Kdf, Argon2Request};
use kp_core::app_error::{AppError, AppResult};
use kp_core::vault::Argon2Variant;

/// Production adapter over the `argon2` crate. The codec only sees the
/// [`Argon2Kdf`] trait; hosts that ship their own hash library implement it
/// instead of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Engine;

impl Argon2Kdf for Argon2Engine {
    fn derive(&self, request: &Argon2Request<'_>) -> AppResult<Vec<u8>> {
        let algorithm = match request.variant {
            Argon2Variant::Argon2d => argon2::Algorithm::Argon2d,
            Argon2Variant::Argon2id => argon2::Algorithm::Argon2id,
        };
        let params = argon2::Params::new(
            request.memory_kib,
            request.iterations,
            request.parallelism,
            Some(request.hash_length as usize),
        )
        .map_err(|e| {
            AppError::new(
                "KP_UNSUPPORTED",
                "kdf",
                "key derivation parameters are out of range",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
        let version = argon2::Version::try_from(request.version).map_err(|e| {
            AppError::new(
                "KP_UNSUPPORTED",
                "kdf",
                "argon2 version is not supported",
                false,
                serde_json::json!({ "error": e.to_string(), "version": request.version }),
            )
        })?;

        let mut out = vec![0u8; request.hash_length as usize];
        argon2::Argon2::new(algorithm, version, params)
            .hash_password_into(request.passphrase, request.salt, &mut out)
            .map_err(|e| AppError::internal(&format!("argon2 derivation failed: {e}")))?;
        Ok(out)
    }
}
