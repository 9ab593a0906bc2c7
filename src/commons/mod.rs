//! Shared infrastructure used by the daemon, the client and the token
//! access layer.

pub mod error;
pub mod ext_serde;
pub mod httpclient;
