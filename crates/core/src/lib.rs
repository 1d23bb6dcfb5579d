pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use config::AppConfig;
pub use error::CoreError;
pub use fingerprint::{canonicalize_url, compute_fingerprint, normalize_text, FingerprintBundle};
pub use types::*;
