//! The HTTP interface of the tokenkeeper daemon.

pub mod request;
pub mod response;
pub mod server;
