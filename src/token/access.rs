//! The in-process token access API.

use std::sync::Arc;

use log::debug;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::api::token::TokenInfos;
use crate::commons::error::TokenError;
use crate::config::TokenAccessConfig;

use super::cache::TokenAccessCache;
use super::driver::DriverLoader;
use super::retry::with_retry;

//------------ TokenAccess ---------------------------------------------------

/// Gets certificates, signs and verifies with keys on the configured tokens.
///
/// There is one instance per process. It is created at startup and
/// shared by everything that needs token access.
pub struct TokenAccess {
    cache: TokenAccessCache,
}

impl TokenAccess {
    pub fn new(
        config: Arc<TokenAccessConfig>,
        loader: Arc<dyn DriverLoader>,
    ) -> Self {
        TokenAccess {
            cache: TokenAccessCache::new(config, loader),
        }
    }

    /// Creates token access through the PKCS#11 libraries of `config`.
    #[cfg(feature = "hsm")]
    pub fn from_config(config: Arc<TokenAccessConfig>) -> Self {
        Self::new(config, Arc::new(super::cryptoki::CryptokiLoader))
    }

    pub fn cache(&self) -> &TokenAccessCache {
        &self.cache
    }

    /// Returns the DER encoded certificate.
    pub fn get_certificate(
        &self,
        credential: &str,
        certificate_id: &str,
    ) -> Result<Vec<u8>, TokenError> {
        with_retry(&self.cache, "Get certificate", |cache| {
            let cert =
                cache.acquire_certificate_reference(credential, certificate_id)?;
            Ok(cert.certificate().to_vec())
        })
    }

    /// Signs `hash` with the private key belonging to the certificate.
    pub fn rsa_sign_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<Vec<u8>, TokenError> {
        algorithm.check_hash(hash)?;
        with_retry(&self.cache, "Sign hash", |cache| {
            let cert =
                cache.acquire_certificate_reference(credential, certificate_id)?;
            let signature = cert.sign_hash(hash, algorithm, padding)?;
            debug!(
                "Signed {} hash with certificate {} using {} padding",
                algorithm,
                cert.thumbprint(),
                padding
            );
            Ok(signature)
        })
    }

    /// Checks a signature over `hash` against the certificate's public key.
    pub fn rsa_verify_hash(
        &self,
        credential: &str,
        certificate_id: &str,
        hash: &[u8],
        signature: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<bool, TokenError> {
        algorithm.check_hash(hash)?;
        with_retry(&self.cache, "Verify hash", |cache| {
            let cert =
                cache.acquire_certificate_reference(credential, certificate_id)?;
            cert.verify_hash(hash, signature, algorithm, padding)
        })
    }

    /// Returns what every configured library reports about itself.
    pub fn get_token_infos(&self) -> Result<Vec<TokenInfos>, TokenError> {
        with_retry(&self.cache, "Get token infos", |cache| cache.token_infos())
    }
}
