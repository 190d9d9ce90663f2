pub mod cipher;
pub mod codec;
pub mod compress;
pub mod document;
pub mod header;
pub mod hmac_stream;
pub mod inner;
pub mod kdf;
pub mod variant;
pub mod xml;

pub use codec::{create, load, save};
pub use kdf::{Argon2Kdf, Argon2Request};
