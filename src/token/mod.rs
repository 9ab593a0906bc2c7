//! Shared access to keys and certificates on PKCS#11 tokens.

pub mod access;
pub mod cache;
pub mod credential;
#[cfg(feature = "hsm")]
pub mod cryptoki;
pub mod driver;
pub mod pin;
pub mod reference;
pub mod retry;

pub use self::access::TokenAccess;
