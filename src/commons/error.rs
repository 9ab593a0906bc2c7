//! The errors surfaced by the token access layer.

use std::fmt;

use hyper::StatusCode;

use crate::api::status::ErrorResponse;
use crate::commons::httpclient;

//------------ TokenError ----------------------------------------------------

/// A failure of a token access operation.
///
/// The variant decides whether the retry pipeline may try the operation
/// again, see [`with_retry`][crate::token::retry::with_retry].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenError {
    /// No usable library path, or malformed options.
    Configuration(String),

    /// Unknown tenant, or no authorized token matches the client secret.
    Credential(String),

    /// No certificate with this identifier and a private key was found.
    CertificateNotFound(String),

    /// The token library reported a failure.
    Driver(String),

    /// A token reports PIN lockout or near-lockout.
    TokenHealth(String),

    /// The caller passed a malformed hash, algorithm or padding.
    InvalidInput(String),

    /// A remote tokenkeeper could not be reached or gave an unclassified
    /// answer.
    Remote(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::Configuration(msg) => {
                write!(f, "Configuration error: {msg}")
            }
            TokenError::Credential(msg) => {
                write!(f, "Credential rejected: {msg}")
            }
            TokenError::CertificateNotFound(id) => {
                write!(f, "Certificate with private key not found: {id}")
            }
            TokenError::Driver(msg) => {
                write!(f, "Token library error: {msg}")
            }
            TokenError::TokenHealth(msg) => {
                write!(f, "Token is not healthy: {msg}")
            }
            TokenError::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
            TokenError::Remote(msg) => {
                write!(f, "Remote tokenkeeper error: {msg}")
            }
        }
    }
}

impl std::error::Error for TokenError {}

impl TokenError {
    pub fn configuration(msg: impl fmt::Display) -> Self {
        TokenError::Configuration(msg.to_string())
    }

    pub fn credential(msg: impl fmt::Display) -> Self {
        TokenError::Credential(msg.to_string())
    }

    pub fn not_found(certificate_id: impl fmt::Display) -> Self {
        TokenError::CertificateNotFound(certificate_id.to_string())
    }

    pub fn driver(msg: impl fmt::Display) -> Self {
        TokenError::Driver(msg.to_string())
    }

    pub fn token_health(msg: impl fmt::Display) -> Self {
        TokenError::TokenHealth(msg.to_string())
    }

    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        TokenError::InvalidInput(msg.to_string())
    }

    pub fn remote(msg: impl fmt::Display) -> Self {
        TokenError::Remote(msg.to_string())
    }

    /// Returns the bare message without the category prefix.
    pub fn msg(&self) -> &str {
        match self {
            TokenError::Configuration(msg)
            | TokenError::Credential(msg)
            | TokenError::CertificateNotFound(msg)
            | TokenError::Driver(msg)
            | TokenError::TokenHealth(msg)
            | TokenError::InvalidInput(msg)
            | TokenError::Remote(msg) => msg,
        }
    }

    /// Returns the label used for this error in API responses.
    pub fn label(&self) -> &'static str {
        match self {
            TokenError::Configuration(_) => "config-error",
            TokenError::Credential(_) => "credential-error",
            TokenError::CertificateNotFound(_) => "certificate-not-found",
            TokenError::Driver(_) => "driver-error",
            TokenError::TokenHealth(_) => "token-health-error",
            TokenError::InvalidInput(_) => "invalid-input",
            TokenError::Remote(_) => "remote-error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TokenError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TokenError::Credential(_) => StatusCode::FORBIDDEN,
            TokenError::CertificateNotFound(_) => StatusCode::NOT_FOUND,
            TokenError::Driver(_) => StatusCode::SERVICE_UNAVAILABLE,
            TokenError::TokenHealth(_) => StatusCode::LOCKED,
            TokenError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TokenError::Remote(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.label(), self).with_arg("detail", self.msg())
    }

    /// Reconstructs the typed error from an API error response.
    ///
    /// Unknown labels become [`TokenError::Remote`] carrying the message.
    pub fn from_error_response(res: &ErrorResponse) -> Self {
        let msg = res.args.get("detail").cloned().unwrap_or_else(|| {
            res.msg.clone()
        });
        match res.label.as_str() {
            "config-error" => TokenError::Configuration(msg),
            "credential-error" => TokenError::Credential(msg),
            "certificate-not-found" => TokenError::CertificateNotFound(msg),
            "driver-error" => TokenError::Driver(msg),
            "token-health-error" => TokenError::TokenHealth(msg),
            "invalid-input" => TokenError::InvalidInput(msg),
            _ => TokenError::Remote(res.msg.clone()),
        }
    }
}

impl From<httpclient::Error> for TokenError {
    fn from(err: httpclient::Error) -> Self {
        match err {
            httpclient::Error::ErrorResponseWithJson(_, _, res) => {
                TokenError::from_error_response(&res)
            }
            other => TokenError::Remote(other.to_string()),
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_round_trips_variant() {
        let errors = [
            TokenError::configuration("No valid library path found"),
            TokenError::credential("unknown tenant 'acme'"),
            TokenError::not_found("ABCDEF"),
            TokenError::driver("CKR_DEVICE_ERROR"),
            TokenError::token_health("user PIN locked"),
            TokenError::invalid_input("hash length 3 does not match SHA256"),
        ];
        for err in errors {
            let res = err.to_error_response();
            assert_eq!(TokenError::from_error_response(&res), err);
        }
    }

    #[test]
    fn unknown_label_is_remote() {
        let res = ErrorResponse::new("something-else", "boom");
        assert_eq!(
            TokenError::from_error_response(&res),
            TokenError::Remote("boom".into())
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(TokenError::credential("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(TokenError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(TokenError::token_health("x").status(), StatusCode::LOCKED);
        assert_eq!(
            TokenError::driver("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
