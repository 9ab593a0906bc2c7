//! HTTP requests.

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::Method;
use hyper::body::Body;
use hyper::header::USER_AGENT;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::constants::HTTP_USER_AGENT_TRUNCATE;

use super::response::HttpResponse;

//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;

//------------ Request -------------------------------------------------------

/// A request together with the limits for reading its body.
pub struct Request {
    request: HyperRequest,
    limits: BodyLimits,
}

impl Request {
    pub fn new(request: HyperRequest, limits: BodyLimits) -> Self {
        Request { request, limits }
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Checks whether the request is a GET or returns an error response.
    pub fn check_get(&self) -> Result<(), HttpResponse> {
        match *self.request.method() {
            Method::GET => Ok(()),
            _ => Err(HttpResponse::method_not_allowed()),
        }
    }

    /// Checks whether the request is a POST or returns an error response.
    pub fn check_post(&self) -> Result<(), HttpResponse> {
        match *self.request.method() {
            Method::POST => Ok(()),
            _ => Err(HttpResponse::method_not_allowed()),
        }
    }

    /// Returns the path without query.
    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    /// Returns the decoded value of a query parameter.
    ///
    /// The first occurrence wins. A `+` is taken as a space.
    pub fn query_param(&self, name: &str) -> Option<String> {
        query_value(self.request.uri().query()?, name)
    }

    /// Returns the value of a required query parameter.
    pub fn required_query_param(&self, name: &str) -> Result<String, HttpResponse> {
        self.query_param(name).ok_or_else(|| {
            HttpResponse::bad_request(
                "missing-parameter",
                format!("missing query parameter '{name}'"),
            )
        })
    }

    /// Returns the user agent header if present.
    pub fn user_agent(&self) -> Option<String> {
        match self.request.headers().get(&USER_AGENT) {
            None => None,
            Some(value) => value.to_str().ok().map(|s| {
                // Note: HeaderValue.to_str() only returns ok in case the
                // value is plain ascii so it's safe to treat bytes as
                // characters here.
                if s.len() > HTTP_USER_AGENT_TRUNCATE {
                    s[..HTTP_USER_AGENT_TRUNCATE].to_string()
                } else {
                    s.to_string()
                }
            }),
        }
    }

    /// Reads the body, up to the configured limit.
    pub async fn read_bytes(self) -> Result<Bytes, HttpResponse> {
        let limit = self.limits.post_limit_api;

        // If the Content-Length header already tells us the body is too
        // big, say so. Otherwise Limited stops reading at the limit.
        if self.request.body().size_hint().lower() > limit {
            return Err(HttpResponse::payload_too_large(limit));
        }

        Limited::new(
            self.request.into_body(),
            limit.try_into().unwrap_or(usize::MAX),
        )
        .collect()
        .await
        .map(|body| body.to_bytes())
        .map_err(|err| {
            if err.is::<http_body_util::LengthLimitError>() {
                HttpResponse::payload_too_large(limit)
            } else {
                HttpResponse::bad_request("post-cannot-read", err)
            }
        })
    }

    /// Reads a JSON object from the body.
    pub async fn read_json<T: DeserializeOwned>(self) -> Result<T, HttpResponse> {
        let bytes = self.read_bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| HttpResponse::bad_request("invalid-json", err))
    }
}

fn query_value(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

//------------ PathIter ------------------------------------------------------

/// Iterates over the segments of a request path.
#[derive(Debug)]
pub struct PathIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> PathIter<'a> {
    pub fn new(path: &'a str) -> Self {
        PathIter {
            remaining: Some(path.strip_prefix('/').unwrap_or(path)),
        }
    }

    /// Checks that the path has been exhausted.
    ///
    /// Returns a 404 error response if it isn’t.
    pub fn check_exhausted(&self) -> Result<(), HttpResponse> {
        if self.remaining.is_some() {
            Err(HttpResponse::not_found())
        } else {
            Ok(())
        }
    }
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.find('/') {
            Some(slash) => {
                self.remaining = Some(&remaining[slash + 1..]);
                Some(&remaining[..slash])
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}

//------------ BodyLimits ----------------------------------------------------

/// The size limits of a request body.
#[derive(Clone, Copy, Debug)]
pub struct BodyLimits {
    /// The POST limit for API data.
    post_limit_api: u64,
}

impl BodyLimits {
    pub fn from_config(config: &Config) -> Self {
        BodyLimits {
            post_limit_api: config.post_limit_api,
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments() {
        let mut path = PathIter::new("/certificate");
        assert_eq!(path.next(), Some("certificate"));
        assert!(path.check_exhausted().is_ok());

        let mut path = PathIter::new("/sign/");
        assert_eq!(path.next(), Some("sign"));
        assert!(path.check_exhausted().is_err());
        assert_eq!(path.next(), Some(""));
        assert_eq!(path.next(), None);
    }

    #[test]
    fn query_values_are_decoded() {
        let query = "credential=acme%26co%26c1&x=a+b%2Bc&x=second&flag";
        assert_eq!(
            query_value(query, "credential").as_deref(),
            Some("acme&co&c1")
        );
        assert_eq!(query_value(query, "x").as_deref(), Some("a b+c"));
        assert_eq!(query_value(query, "flag").as_deref(), Some(""));
        assert_eq!(query_value(query, "certificateId"), None);
        assert_eq!(query_value("", "x"), None);
    }
}
