pub mod app_error;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod passgen;
pub mod protected;
pub mod random;
pub mod timefmt;
pub mod vault;

pub use app_error::{AppError, AppResult};
