pub mod signature;

pub use signature::{constant_time_eq, hmac_sha256};
