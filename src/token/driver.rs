//! The interface to a token library.
//!
//! A [`DriverLoader`] opens a library file and returns a [`TokenDriver`]
//! for it. The PKCS#11 implementation lives in
//! [`cryptoki`][super::cryptoki], an in-memory implementation for tests in
//! [`crate::test`]. Dropping a driver finalizes the library.

use std::fmt;
use std::path::Path;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::api::token::{LibraryInfo, SlotInfo, TokenInfo};
use crate::commons::error::TokenError;

use super::pin::PinProvider;

//------------ SlotEntry -----------------------------------------------------

/// A slot and the token inserted in it, if any.
#[derive(Clone, Debug)]
pub struct SlotEntry {
    pub info: SlotInfo,
    pub token: Option<TokenInfo>,
}

//------------ CertificateObject ---------------------------------------------

/// A certificate object found on a token.
#[derive(Clone)]
pub struct CertificateObject {
    /// The `CKA_ID` shared with the matching private key.
    pub id: Vec<u8>,

    pub label: String,

    /// The DER encoded certificate.
    pub value: Vec<u8>,

    /// Whether a private key with the same id was found.
    pub has_private_key: bool,
}

impl fmt::Debug for CertificateObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertificateObject")
            .field("id", &hex::encode(&self.id))
            .field("label", &self.label)
            .field("has_private_key", &self.has_private_key)
            .finish()
    }
}

//------------ SignMechanism -------------------------------------------------

/// How the private key is to be used for a signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignMechanism {
    /// `CKM_RSA_PKCS` over a DigestInfo.
    RsaPkcs,

    /// `CKM_RSA_PKCS_PSS` over a bare hash, with MGF1 over the same hash
    /// algorithm and a salt as long as the hash.
    RsaPkcsPss(HashAlgorithm),
}

impl SignMechanism {
    /// Returns the mechanism and the data to hand to the token for
    /// signing `hash`.
    pub fn for_hash(
        hash: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<(Self, Vec<u8>), TokenError> {
        algorithm.check_hash(hash)?;
        Ok(match padding {
            SignaturePadding::Pkcs1 => {
                (SignMechanism::RsaPkcs, algorithm.digest_info(hash))
            }
            SignaturePadding::Pss => {
                (SignMechanism::RsaPkcsPss(algorithm), hash.to_vec())
            }
        })
    }
}

//------------ TokenDriver ---------------------------------------------------

/// An opened token library.
///
/// Every method may be called from several threads at once.
pub trait TokenDriver: Send + Sync {
    fn library_info(&self) -> Result<LibraryInfo, TokenError>;

    /// Returns every slot in the order the library reports them.
    fn slots(&self) -> Result<Vec<SlotEntry>, TokenError>;

    /// Returns the certificates on the token in `slot_id`.
    ///
    /// Logs in with the PIN from `pins` unless the provider cancels, in
    /// which case private keys may stay invisible.
    fn certificates(
        &self,
        slot_id: u64,
        pins: &PinProvider,
    ) -> Result<Vec<CertificateObject>, TokenError>;

    /// Signs `data` with the private key with `CKA_ID` `key_id`.
    fn sign(
        &self,
        slot_id: u64,
        key_id: &[u8],
        mechanism: SignMechanism,
        data: &[u8],
        pins: &PinProvider,
    ) -> Result<Vec<u8>, TokenError>;
}

//------------ DriverLoader --------------------------------------------------

/// Opens token libraries.
pub trait DriverLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn TokenDriver>, TokenError>;

    /// Returns whether `path` can be loaded at all.
    fn is_available(&self, path: &Path) -> bool {
        path.is_file()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs1_wraps_hash_in_digest_info() {
        let hash = [7u8; 32];
        let (mechanism, data) = SignMechanism::for_hash(
            &hash,
            HashAlgorithm::Sha256,
            SignaturePadding::Pkcs1,
        )
        .unwrap();
        assert_eq!(mechanism, SignMechanism::RsaPkcs);
        assert_eq!(data.len(), 19 + 32);
        assert!(data.ends_with(&hash));
    }

    #[test]
    fn pss_signs_bare_hash() {
        let hash = [7u8; 48];
        let (mechanism, data) = SignMechanism::for_hash(
            &hash,
            HashAlgorithm::Sha384,
            SignaturePadding::Pss,
        )
        .unwrap();
        assert_eq!(mechanism, SignMechanism::RsaPkcsPss(HashAlgorithm::Sha384));
        assert_eq!(data, hash.to_vec());
    }

    #[test]
    fn wrong_hash_length_is_rejected() {
        let res = SignMechanism::for_hash(
            &[0; 20],
            HashAlgorithm::Sha256,
            SignaturePadding::Pss,
        );
        assert!(matches!(res, Err(TokenError::InvalidInput(_))));
    }
}
