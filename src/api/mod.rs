//! Data structures for the API, shared between client and server.

pub mod sign;
pub mod status;
pub mod token;
