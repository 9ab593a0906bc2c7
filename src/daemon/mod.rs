//! The tokenkeeper daemon.

use std::{fmt, io};
use std::net::SocketAddr;

pub mod http;
pub mod start;

//------------ DaemonError ---------------------------------------------------

/// The daemon could not start or had to stop serving.
#[derive(Debug)]
pub enum DaemonError {
    Bind(SocketAddr, io::Error),
    Accept(SocketAddr, io::Error),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DaemonError::Bind(addr, err) => {
                write!(f, "Could not bind to {addr}: {err}")
            }
            DaemonError::Accept(addr, err) => {
                write!(f, "Fatal error in HTTP server {addr}: {err}")
            }
        }
    }
}

impl std::error::Error for DaemonError {}
