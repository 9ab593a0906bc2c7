//! HTTP responses.

use bytes::Bytes;
use http_body_util::{Either, Empty, Full};
use hyper::StatusCode;
use serde::Serialize;

use crate::api::status::ErrorResponse;
use crate::commons::error::TokenError;

//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Cert,
    Json,
    Text,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Cert => "application/x-x509-ca-cert",
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
        }
    }
}

//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = Either<Empty<Bytes>, Full<Bytes>>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;

//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: ContentType,
    body: Bytes,
    cause: Option<TokenError>,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text,
            body: Bytes::default(),
            cause: None,
        }
    }

    fn finalize(self) -> HttpResponse {
        let body = if self.body.is_empty() {
            Either::Left(Empty::new())
        } else {
            Either::Right(Full::new(self.body))
        };
        let response = hyper::Response::builder()
            .status(self.status)
            .header("Content-Type", self.content_type.as_str())
            .body(body)
            .unwrap();

        HttpResponse {
            response,
            cause: self.cause,
        }
    }
}

//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    response: HyperResponse,
    cause: Option<TokenError>,
}

impl HttpResponse {
    pub fn into_hyper(self) -> HyperResponse {
        self.response
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Returns the error this response reports, if any.
    ///
    /// Logging the cause is more useful than logging the JSON body.
    pub fn cause(&self) -> Option<&TokenError> {
        self.cause.as_ref()
    }

    fn ok_response(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Response {
            status: StatusCode::OK,
            content_type,
            body: body.into(),
            cause: None,
        }
        .finalize()
    }

    pub fn json<O: Serialize>(object: &O) -> Self {
        match serde_json::to_string(object) {
            Ok(json) => Self::ok_response(ContentType::Json, json),
            Err(e) => Self::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("json-error", e),
            ),
        }
    }

    pub fn cert(body: Bytes) -> Self {
        Self::ok_response(ContentType::Cert, body)
    }

    pub fn error(status: StatusCode, error: ErrorResponse) -> Self {
        let body = serde_json::to_string(&error).unwrap_or_default();
        Response {
            status,
            content_type: ContentType::Json,
            body: body.into(),
            cause: None,
        }
        .finalize()
    }

    pub fn response_from_error(error: TokenError) -> Self {
        let status = error.status();
        let response = error.to_error_response();
        let body = serde_json::to_string(&response).unwrap_or_default();
        Response {
            status,
            content_type: ContentType::Json,
            body: body.into(),
            cause: Some(error),
        }
        .finalize()
    }

    pub fn ok() -> Self {
        Response::new(StatusCode::OK).finalize()
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }

    pub fn payload_too_large(limit: u64) -> Self {
        Self::error(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorResponse::new(
                "post-too-big",
                format!("request body exceeds {limit} bytes"),
            ),
        )
    }

    pub fn bad_request(label: &str, msg: impl std::fmt::Display) -> Self {
        Self::error(StatusCode::BAD_REQUEST, ErrorResponse::new(label, msg))
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_keeps_cause_and_status() {
        let res = HttpResponse::response_from_error(TokenError::credential(
            "client secret matches no token",
        ));
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert!(matches!(res.cause(), Some(TokenError::Credential(_))));

        let hyper = res.into_hyper();
        assert_eq!(
            hyper.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn empty_ok_response() {
        let res = HttpResponse::ok();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.cause().is_none());
        assert!(matches!(res.into_hyper().body(), Either::Left(_)));
    }
}
