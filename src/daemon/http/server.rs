//! The HTTP server giving remote clients access to the tokens.

use std::convert::Infallible;

use log::{info, warn};

use crate::api::sign::{SignRequest, SignResponse, VerifyRequest, VerifyResponse};
use crate::client::TokenAccessClient;
use crate::config::Config;

use super::request::{BodyLimits, HyperRequest, PathIter, Request};
use super::response::{HttpResponse, HyperResponse};

//------------ HttpServer ----------------------------------------------------

pub struct HttpServer {
    access: TokenAccessClient,
    limits: BodyLimits,
}

impl HttpServer {
    pub fn new(access: TokenAccessClient, config: &Config) -> Self {
        HttpServer {
            access,
            limits: BodyLimits::from_config(config),
        }
    }

    pub fn access(&self) -> &TokenAccessClient {
        &self.access
    }

    pub async fn process_request(
        &self,
        req: HyperRequest,
    ) -> Result<HyperResponse, Infallible> {
        let request = Request::new(req, self.limits);
        let method = request.method().clone();
        let path = request.path().to_string();
        let user_agent = request.user_agent().unwrap_or_default();

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(response) => response,
        };

        match response.cause() {
            Some(err) => warn!(
                "{} {} {} (agent: '{}'): {}",
                method,
                path,
                response.status(),
                user_agent,
                err
            ),
            None => info!("{} {} {}", method, path, response.status()),
        }

        Ok(response.into_hyper())
    }

    async fn dispatch(&self, request: Request) -> Result<HttpResponse, HttpResponse> {
        // The path is copied so the request can be consumed below.
        let path = request.path().to_string();
        let mut segments = PathIter::new(&path);
        match segments.next() {
            Some("certificate") => {
                segments.check_exhausted()?;
                self.certificate(request).await
            }
            Some("sign") => {
                segments.check_exhausted()?;
                self.sign(request).await
            }
            Some("verify") => {
                segments.check_exhausted()?;
                self.verify(request).await
            }
            Some("tokens") => {
                segments.check_exhausted()?;
                self.tokens(request).await
            }
            Some("health") => {
                segments.check_exhausted()?;
                request.check_get()?;
                Ok(HttpResponse::ok())
            }
            _ => Err(HttpResponse::not_found()),
        }
    }

    /// `GET /certificate?credential=…&certificateId=…`
    async fn certificate(&self, request: Request) -> Result<HttpResponse, HttpResponse> {
        request.check_get()?;
        let credential = request.required_query_param("credential")?;
        let certificate_id = request.required_query_param("certificateId")?;
        let cert = self
            .access
            .get_certificate(&credential, &certificate_id)
            .await
            .map_err(HttpResponse::response_from_error)?;
        Ok(HttpResponse::cert(cert))
    }

    /// `POST /sign`
    async fn sign(&self, request: Request) -> Result<HttpResponse, HttpResponse> {
        request.check_post()?;
        let req: SignRequest = request.read_json().await?;
        let signature = self
            .access
            .rsa_sign_hash(
                &req.credential,
                &req.certificate_id,
                req.hash,
                req.hash_algorithm,
                req.padding,
            )
            .await
            .map_err(HttpResponse::response_from_error)?;
        Ok(HttpResponse::json(&SignResponse { signature }))
    }

    /// `POST /verify`
    async fn verify(&self, request: Request) -> Result<HttpResponse, HttpResponse> {
        request.check_post()?;
        let req: VerifyRequest = request.read_json().await?;
        let valid = self
            .access
            .rsa_verify_hash(
                &req.credential,
                &req.certificate_id,
                req.hash,
                req.signature,
                req.hash_algorithm,
                req.padding,
            )
            .await
            .map_err(HttpResponse::response_from_error)?;
        Ok(HttpResponse::json(&VerifyResponse { valid }))
    }

    /// `GET /tokens`
    async fn tokens(&self, request: Request) -> Result<HttpResponse, HttpResponse> {
        request.check_get()?;
        let infos = self
            .access
            .get_token_infos()
            .await
            .map_err(HttpResponse::response_from_error)?;
        Ok(HttpResponse::json(&infos))
    }
}
