//! The `tokenkeeperc` command line client.

use std::fmt;

use crate::commons::error::TokenError;
use crate::config::ConfigError;

pub mod options;
pub mod report;

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Token(TokenError),

    /// A command line argument could not be used.
    Input(String),
}

impl Error {
    pub fn input(msg: impl fmt::Display) -> Self {
        Error::Input(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Could not parse config: {e}"),
            Error::Token(e) => e.fmt(f),
            Error::Input(msg) => write!(f, "Invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        Error::Token(e)
    }
}
