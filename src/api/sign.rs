//! Requests and responses for signing and verifying hashes.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use openssl::hash::MessageDigest;
use openssl::md::{Md, MdRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::commons::error::TokenError;
use crate::commons::ext_serde::{de_bytes, ser_bytes};

//------------ HashAlgorithm -------------------------------------------------

/// The hash algorithm that produced the hash to be signed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// The length of a hash of this algorithm in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha1 => MessageDigest::sha1(),
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
            HashAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn md(self) -> &'static MdRef {
        match self {
            HashAlgorithm::Sha1 => Md::sha1(),
            HashAlgorithm::Sha256 => Md::sha256(),
            HashAlgorithm::Sha384 => Md::sha384(),
            HashAlgorithm::Sha512 => Md::sha512(),
        }
    }

    /// The DER encoded DigestInfo header that precedes the hash in a
    /// PKCS#1 v1.5 signature.
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02,
                0x1a, 0x05, 0x00, 0x04, 0x14,
            ],
            HashAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01,
                0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            HashAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01,
                0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            HashAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01,
                0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// Returns the DigestInfo structure wrapping `hash`.
    pub fn digest_info(self, hash: &[u8]) -> Vec<u8> {
        let prefix = self.digest_info_prefix();
        let mut res = Vec::with_capacity(prefix.len() + hash.len());
        res.extend_from_slice(prefix);
        res.extend_from_slice(hash);
        res
    }

    /// Checks that `hash` has the length of this algorithm's output.
    pub fn check_hash(self, hash: &[u8]) -> Result<(), TokenError> {
        if hash.len() == self.digest_len() {
            Ok(())
        } else {
            Err(TokenError::invalid_input(format!(
                "hash length {} does not match {}",
                hash.len(),
                self
            )))
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(TokenError::invalid_input(format!(
                "unsupported hash algorithm: {s}"
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        })
    }
}

impl Serialize for HashAlgorithm {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        HashAlgorithm::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ SignaturePadding ----------------------------------------------

/// The RSA signature padding scheme.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignaturePadding {
    /// RSASSA-PKCS1-v1_5.
    Pkcs1,

    /// RSASSA-PSS with MGF1 over the signed hash's algorithm and a salt as
    /// long as that hash.
    Pss,
}

impl FromStr for SignaturePadding {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pkcs1" => Ok(SignaturePadding::Pkcs1),
            "pss" => Ok(SignaturePadding::Pss),
            _ => Err(TokenError::invalid_input(format!(
                "unsupported signature padding: {s}"
            ))),
        }
    }
}

impl fmt::Display for SignaturePadding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SignaturePadding::Pkcs1 => "pkcs1",
            SignaturePadding::Pss => "pss",
        })
    }
}

impl Serialize for SignaturePadding {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for SignaturePadding {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        SignaturePadding::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ CertificateQuery ----------------------------------------------

/// The query parameters of a certificate request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateQuery {
    pub credential: String,

    #[serde(rename = "certificateId")]
    pub certificate_id: String,
}

//------------ SignRequest ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignRequest {
    pub credential: String,
    pub certificate_id: String,
    #[serde(deserialize_with = "de_bytes", serialize_with = "ser_bytes")]
    pub hash: Bytes,
    pub hash_algorithm: HashAlgorithm,
    pub padding: SignaturePadding,
}

//------------ SignResponse --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignResponse {
    #[serde(deserialize_with = "de_bytes", serialize_with = "ser_bytes")]
    pub signature: Bytes,
}

//------------ VerifyRequest -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VerifyRequest {
    pub credential: String,
    pub certificate_id: String,
    #[serde(deserialize_with = "de_bytes", serialize_with = "ser_bytes")]
    pub hash: Bytes,
    #[serde(deserialize_with = "de_bytes", serialize_with = "ser_bytes")]
    pub signature: Bytes,
    pub hash_algorithm: HashAlgorithm,
    pub padding: SignaturePadding,
}

//------------ VerifyResponse ------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}


//============ Tests =========================================================
