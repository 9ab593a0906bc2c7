//! Token access through a remote tokenkeeper daemon.

use bytes::Bytes;
use log::debug;
use url::Url;

use crate::api::sign::{
    HashAlgorithm, SignRequest, SignResponse, SignaturePadding, VerifyRequest,
    VerifyResponse,
};
use crate::api::token::TokenInfos;
use crate::commons::error::TokenError;
use crate::commons::httpclient;

//------------ RemoteTokenAccess ---------------------------------------------

/// Sends token access calls to a tokenkeeper daemon.
///
/// Clones share the underlying HTTP client and its connection pool.
#[derive(Clone, Debug)]
pub struct RemoteTokenAccess {
    client: reqwest::Client,
    service_uri: Url,
}

impl RemoteTokenAccess {
    pub fn new(service_uri: &str) -> Result<Self, TokenError> {
        let mut service_uri = Url::parse(service_uri).map_err(|err| {
            TokenError::configuration(format!(
                "invalid service URI '{service_uri}': {err}"
            ))
        })?;
        if !service_uri.path().ends_with('/') {
            let path = format!("{}/", service_uri.path());
            service_uri.set_path(&path);
        }
        let client = httpclient::client(service_uri.as_str())?;
        Ok(RemoteTokenAccess { client, service_uri })
    }

    pub fn service_uri(&self) -> &Url {
        &self.service_uri
    }

    fn endpoint(&self, path: &str) -> Result<String, TokenError> {
        self.service_uri
            .join(path)
            .map(String::from)
            .map_err(|err| TokenError::configuration(err.to_string()))
    }

    pub async fn get_certificate(
        &self,
        credential: &str,
        certificate_id: &str,
    ) -> Result<Bytes, TokenError> {
        let uri = self.endpoint("certificate")?;
        debug!("Getting certificate {certificate_id} from {uri}");
        let cert = httpclient::get_binary(
            &self.client,
            &uri,
            &[("credential", credential), ("certificateId", certificate_id)],
        )
        .await?;
        Ok(cert)
    }

    pub async fn rsa_sign_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: Bytes,
        hash_algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<Bytes, TokenError> {
        let uri = self.endpoint("sign")?;
        let req = SignRequest {
            credential: credential.to_string(),
            certificate_id: certificate_id.to_string(),
            hash,
            hash_algorithm,
            padding,
        };
        let res: SignResponse =
            httpclient::post_json_with_response(&self.client, &uri, &req).await?;
        Ok(res.signature)
    }

    pub async fn rsa_verify_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: Bytes,
        signature: Bytes,
        hash_algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<bool, TokenError> {
        let uri = self.endpoint("verify")?;
        let req = VerifyRequest {
            credential: credential.to_string(),
            certificate_id: certificate_id.to_string(),
            hash,
            signature,
            hash_algorithm,
            padding,
        };
        let res: VerifyResponse =
            httpclient::post_json_with_response(&self.client, &uri, &req).await?;
        Ok(res.valid)
    }

    pub async fn get_token_infos(&self) -> Result<Vec<TokenInfos>, TokenError> {
        let uri = self.endpoint("tokens")?;
        Ok(httpclient::get_json(&self.client, &uri).await?)
    }

    /// Returns whether the daemon answers its health check.
    pub async fn is_healthy(&self) -> bool {
        match self.endpoint("health") {
            Ok(uri) => httpclient::get_ok(&self.client, &uri).await.is_ok(),
            Err(_) => false,
        }
    }
}


//============ Tests =========================================================
