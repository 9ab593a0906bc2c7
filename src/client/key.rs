//! A certificate and an RSA key that lives on a token.
//!
//! [`TokenKey`] lets signing code that wants a certificate and a private
//! key work with keys on a token. Signing is sent to the token through
//! the [`TokenAccessClient`], verification uses the certificate's public
//! key. The private key itself is never available.

use std::fmt;

use bytes::Bytes;
use openssl::pkey::{Id, PKey, Public};
use openssl::x509::X509;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::commons::error::TokenError;
use crate::token::reference::certificate_error;

use super::TokenAccessClient;

//------------ TokenKey ------------------------------------------------------

pub struct TokenKey {
    client: TokenAccessClient,
    credential: String,
    certificate_id: String,
    certificate: X509,
    der: Bytes,
    public_key: PKey<Public>,
}

impl TokenKey {
    /// Fetches the certificate and prepares the key for it.
    ///
    /// Fails with `InvalidInput` if the certificate does not hold an RSA
    /// key.
    pub async fn open(
        client: TokenAccessClient,
        credential: &str,
        certificate_id: &str,
    ) -> Result<Self, TokenError> {
        let der = client.get_certificate(credential, certificate_id).await?;
        let certificate = X509::from_der(&der).map_err(certificate_error)?;
        let public_key = certificate.public_key().map_err(certificate_error)?;
        if public_key.id() != Id::RSA {
            return Err(TokenError::invalid_input(format!(
                "certificate {certificate_id} does not hold an RSA key"
            )));
        }
        Ok(TokenKey {
            client,
            credential: credential.to_string(),
            certificate_id: certificate_id.to_string(),
            certificate,
            der,
            public_key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Returns the DER encoded certificate.
    pub fn certificate_der(&self) -> &Bytes {
        &self.der
    }

    pub fn certificate_id(&self) -> &str {
        &self.certificate_id
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    /// Returns the size of the RSA modulus in bits.
    pub fn key_size(&self) -> u32 {
        self.public_key.bits()
    }

    pub async fn sign_hash(
        &self,
        hash: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<Bytes, TokenError> {
        if hash.is_empty() {
            return Err(TokenError::invalid_input("hash must not be empty"));
        }
        self.client
            .rsa_sign_hash(
                &self.credential,
                &self.certificate_id,
                Bytes::copy_from_slice(hash),
                algorithm,
                padding,
            )
            .await
    }

    pub async fn verify_hash(
        &self,
        hash: &[u8],
        signature: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<bool, TokenError> {
        if hash.is_empty() {
            return Err(TokenError::invalid_input("hash must not be empty"));
        }
        if signature.is_empty() {
            return Err(TokenError::invalid_input("signature must not be empty"));
        }
        self.client
            .rsa_verify_hash(
                &self.credential,
                &self.certificate_id,
                Bytes::copy_from_slice(hash),
                Bytes::copy_from_slice(signature),
                algorithm,
                padding,
            )
            .await
    }
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("certificate_id", &self.certificate_id)
            .field("key_size", &self.key_size())
            .finish()
    }
}
