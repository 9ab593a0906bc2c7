//! Some helper functions for HTTP calls
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::status::ErrorResponse;
use crate::constants::{HTTP_CLIENT_TIMEOUT_SECS, TOKENKEEPER_VERSION};

const JSON_CONTENT: &str = "application/json";

/// Default client for tokenkeeper use cases.
///
/// The client keeps a connection pool, so callers should build one and
/// share it rather than build one per request.
pub fn client(uri: &str) -> Result<reqwest::Client, Error> {
    client_with_timeout(uri, Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS))
}

pub fn client_with_timeout(
    uri: &str,
    timeout: Duration,
) -> Result<reqwest::Client, Error> {
    reqwest::ClientBuilder::new()
        .timeout(timeout)
        .default_headers(headers(uri)?)
        .build()
        .map_err(|e| Error::request_build(uri, e))
}

fn headers(uri: &str) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let ua_string = format!("tokenkeeper/{TOKENKEEPER_VERSION}");
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&ua_string)
            .map_err(|e| Error::request_build(uri, e))?,
    );
    Ok(headers)
}

/// Performs a GET request that expects a json response that can be
/// deserialized into an owned value of the expected type.
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    uri: &str,
) -> Result<T, Error> {
    let res = client
        .get(uri)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

/// Performs a GET request with query parameters and expects a binary
/// response.
pub async fn get_binary(
    client: &reqwest::Client,
    uri: &str,
    query: &[(&str, &str)],
) -> Result<Bytes, Error> {
    let res = client
        .get(uri)
        .query(query)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match res.status() {
        StatusCode::OK => res.bytes().await.map_err(|e| {
            Error::response(uri, format!("cannot get body: {e}"))
        }),
        _ => Err(Error::from_res(uri, res).await),
    }
}

/// Checks that there is a 200 OK response at the given URI. Discards the
/// response body.
pub async fn get_ok(client: &reqwest::Client, uri: &str) -> Result<(), Error> {
    let res = client
        .get(uri)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match res.status() {
        StatusCode::OK => Ok(()),
        _ => Err(Error::from_res(uri, res).await),
    }
}

/// Performs a POST of data that can be serialized into json, and expects
/// a json response that can be deserialized into an owned value of the
/// expected type.
pub async fn post_json_with_response<T: DeserializeOwned>(
    client: &reqwest::Client,
    uri: &str,
    data: impl Serialize,
) -> Result<T, Error> {
    let body = serde_json::to_string(&data)
        .map_err(|e| Error::request_build_json(uri, e))?;

    let res = client
        .post(uri)
        .header(CONTENT_TYPE, JSON_CONTENT)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

async fn process_json_response<T: DeserializeOwned>(
    uri: &str,
    res: Response,
) -> Result<T, Error> {
    match res.status() {
        StatusCode::OK => {
            let text = res.text().await.map_err(|e| {
                Error::response(uri, format!("cannot get body: {e}"))
            })?;
            if text.is_empty() {
                return Err(Error::response(uri, "got empty response body"));
            }
            serde_json::from_str(&text).map_err(|e| {
                Error::response(
                    uri,
                    format!("could not parse JSON response: {e}"),
                )
            })
        }
        _ => Err(Error::from_res(uri, res).await),
    }
}

//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type ErrorMessage = String;

#[derive(Debug)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),
    RequestExecute(ErrorUri, ErrorMessage),
    Response(ErrorUri, ErrorMessage),
    ErrorResponseWithBody(ErrorUri, StatusCode, String),
    ErrorResponseWithJson(ErrorUri, StatusCode, ErrorResponse),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => {
                write!(f, "Issue creating request for URI: {uri}, error: {msg}")
            }
            Error::RequestExecute(uri, msg) => {
                write!(f, "Issue accessing URI: {uri}, error: {msg}")
            }
            Error::Response(uri, msg) => write!(
                f,
                "Issue processing response from URI: {uri}, error: {msg}"
            ),
            Error::ErrorResponseWithBody(uri, code, e) => write!(
                f,
                "Error response from URI: {uri}, Status: {code}, Error: {e}"
            ),
            Error::ErrorResponseWithJson(uri, code, res) => write!(
                f,
                "Error response from URI: {uri}, Status: {code}, \
                 ErrorResponse: {res}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_json(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(
            uri.to_string(),
            format!("could not serialize type to JSON: {e}"),
        )
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    pub fn response_unexpected_status(uri: &str, status: StatusCode) -> Self {
        Error::Response(
            uri.to_string(),
            format!("unexpected status code {status}"),
        )
    }

    async fn from_res(uri: &str, res: Response) -> Error {
        let status = res.status();
        match res.text().await {
            Ok(body) => {
                if body.is_empty() {
                    Self::response_unexpected_status(uri, status)
                } else {
                    match serde_json::from_str::<ErrorResponse>(&body) {
                        Ok(res) => Error::ErrorResponseWithJson(
                            uri.to_string(),
                            status,
                            res,
                        ),
                        Err(_) => Error::ErrorResponseWithBody(
                            uri.to_string(),
                            status,
                            body,
                        ),
                    }
                }
            }
            _ => Self::response_unexpected_status(uri, status),
        }
    }
}
