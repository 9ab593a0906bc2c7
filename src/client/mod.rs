//! Token access for callers, either in-process or through a remote
//! tokenkeeper daemon.
//!
//! Which of the two is used is decided once, when the
//! [`TokenAccessClient`] is created. Callers see the same operations and
//! the same [`TokenError`] variants either way.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::api::token::TokenInfos;
use crate::commons::error::TokenError;
use crate::token::TokenAccess;

pub use self::key::TokenKey;
pub use self::remote::RemoteTokenAccess;

pub mod key;
pub mod remote;

//------------ TokenAccessClient ---------------------------------------------

#[derive(Clone)]
pub enum TokenAccessClient {
    /// Tokens attached to this machine.
    Local(Arc<TokenAccess>),

    /// Tokens attached to the machine running a tokenkeeper daemon.
    Remote(RemoteTokenAccess),
}

impl TokenAccessClient {
    pub fn local(access: Arc<TokenAccess>) -> Self {
        TokenAccessClient::Local(access)
    }

    pub fn remote(service_uri: &str) -> Result<Self, TokenError> {
        RemoteTokenAccess::new(service_uri).map(TokenAccessClient::Remote)
    }

    /// Returns the DER encoded certificate.
    pub async fn get_certificate(
        &self,
        credential: &str,
        certificate_id: &str,
    ) -> Result<Bytes, TokenError> {
        match self {
            TokenAccessClient::Local(access) => {
                let credential = credential.to_string();
                let certificate_id = certificate_id.to_string();
                blocking(access, move |access| {
                    access.get_certificate(&credential, &certificate_id)
                })
                .await
                .map(Bytes::from)
            }
            TokenAccessClient::Remote(remote) => {
                remote.get_certificate(credential, certificate_id).await
            }
        }
    }

    pub async fn rsa_sign_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: Bytes,
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<Bytes, TokenError> {
        match self {
            TokenAccessClient::Local(access) => {
                let credential = credential.to_string();
                let certificate_id = certificate_id.to_string();
                blocking(access, move |access| {
                    access.rsa_sign_hash(
                        &credential,
                        &certificate_id,
                        &hash,
                        algorithm,
                        padding,
                    )
                })
                .await
                .map(Bytes::from)
            }
            TokenAccessClient::Remote(remote) => {
                remote
                    .rsa_sign_hash(
                        credential,
                        certificate_id,
                        hash,
                        algorithm,
                        padding,
                    )
                    .await
            }
        }
    }

    pub async fn rsa_verify_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: Bytes,
        signature: Bytes,
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<bool, TokenError> {
        match self {
            TokenAccessClient::Local(access) => {
                let credential = credential.to_string();
                let certificate_id = certificate_id.to_string();
                blocking(access, move |access| {
                    access.rsa_verify_hash(
                        &credential,
                        &certificate_id,
                        &hash,
                        &signature,
                        algorithm,
                        padding,
                    )
                })
                .await
            }
            TokenAccessClient::Remote(remote) => {
                remote
                    .rsa_verify_hash(
                        credential,
                        certificate_id,
                        hash,
                        signature,
                        algorithm,
                        padding,
                    )
                    .await
            }
        }
    }

    pub async fn get_token_infos(&self) -> Result<Vec<TokenInfos>, TokenError> {
        match self {
            TokenAccessClient::Local(access) => {
                blocking(access, |access| access.get_token_infos()).await
            }
            TokenAccessClient::Remote(remote) => remote.get_token_infos().await,
        }
    }
}

/// Runs a token operation on tokio's blocking thread pool.
///
/// Token libraries block, and PIN suppression is tracked per thread, so a
/// token operation must stay on one thread from start to end.
async fn blocking<T, F>(access: &Arc<TokenAccess>, op: F) -> Result<T, TokenError>
where
    T: Send + 'static,
    F: FnOnce(&TokenAccess) -> Result<T, TokenError> + Send + 'static,
{
    let access = access.clone();
    task::spawn_blocking(move || op(&access))
        .await
        .map_err(|err| {
            TokenError::driver(format!("token operation did not complete: {err}"))
        })?
}
