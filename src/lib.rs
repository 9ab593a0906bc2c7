//! The _Tokenkeeper_ library crate.
//!
//! Tokenkeeper gives several tenants shared, concurrent access to keys and
//! certificates held on PKCS#11 tokens. Private keys never leave the token:
//! callers ask for a certificate or a signature over a hash and get the
//! result back, either in-process or from a remote tokenkeeper daemon.

pub mod api;
pub mod cli;
pub mod client;
pub mod commons;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod token;
