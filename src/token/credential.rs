//! Client credentials and the secrets derived from token PINs.
//!
//! A credential binds a tenant and one of its clients to a secret. The
//! secret is not the PIN of a token but a keyed hash over the tenant, the
//! client, the token serial number and its PIN. The server recomputes the
//! hash for every token the tenant may use and accepts the credential for
//! those tokens where it matches.
//!
//! The hash is fast and not cryptographically strong. It catches typos and
//! accidental reuse of a credential across tenants. It does not stop anyone
//! who can read the server configuration.

use std::fmt;
use std::hash::Hasher;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use twox_hash::XxHash64;

use crate::constants::{DFLT_CLIENT_SECRET_KEY, DFLT_CLIENT_SECRET_SALT};

/// Characters escaped in each credential part.
///
/// Everything except the RFC 3986 unreserved characters.
const CREDENTIAL_PART: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const CREDENTIAL_SEPARATOR: char = '&';
const SECRET_FIELD_SEPARATOR: &str = "\0";

//------------ ClientCredential ----------------------------------------------

/// The decoded parts of a credential string.
#[derive(Clone, Eq, PartialEq)]
pub struct ClientCredential {
    pub tenant: String,
    pub client: String,
    pub secret: String,
}

impl ClientCredential {
    pub fn new(
        tenant: impl Into<String>,
        client: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        ClientCredential {
            tenant: tenant.into(),
            client: client.into(),
            secret: secret.into(),
        }
    }

    /// Returns the credential string for these parts.
    pub fn encode(&self) -> String {
        encode(&self.tenant, &self.client, &self.secret)
    }

    /// Decodes a credential string.
    ///
    /// This never fails. Missing parts are empty and whatever does not
    /// decode as UTF-8 is replaced, so callers must check the parts
    /// before trusting them.
    pub fn decode(credential: &str) -> Self {
        let mut parts = credential.split(CREDENTIAL_SEPARATOR).map(unescape);
        let tenant = parts.next().unwrap_or_default();
        let client = parts.next().unwrap_or_default();
        let secret = parts.next().unwrap_or_default();
        ClientCredential { tenant, client, secret }
    }

    /// Returns the tenant id as used for lookups in the configuration.
    pub fn tenant_key(&self) -> String {
        self.tenant.to_lowercase()
    }
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("tenant", &self.tenant)
            .field("client", &self.client)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Escapes each part and joins them with `&`.
pub fn encode(tenant: &str, client: &str, secret: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        utf8_percent_encode(tenant, CREDENTIAL_PART),
        utf8_percent_encode(client, CREDENTIAL_PART),
        utf8_percent_encode(secret, CREDENTIAL_PART),
        sep = CREDENTIAL_SEPARATOR,
    )
}

fn unescape(part: &str) -> String {
    percent_decode_str(part).decode_utf8_lossy().into_owned()
}

//------------ SecretMaterial ------------------------------------------------

/// The server side key and salt mixed into every derived secret.
#[derive(Clone)]
pub struct SecretMaterial {
    key: String,
    salt: String,
}

impl SecretMaterial {
    pub fn new(key: impl Into<String>, salt: impl Into<String>) -> Self {
        SecretMaterial {
            key: key.into(),
            salt: salt.into(),
        }
    }

    /// Computes the client secret for a tenant, client and token.
    ///
    /// Tenant, client and token id are compared case-insensitively, so
    /// they are lower-cased first. The PIN is used as is.
    pub fn derive_secret(
        &self,
        tenant: &str,
        client: &str,
        token_id: &str,
        token_pin: &str,
    ) -> String {
        let input = [
            tenant.to_lowercase().as_str(),
            client.to_lowercase().as_str(),
            token_id.to_lowercase().as_str(),
            token_pin,
            self.key.as_str(),
            self.salt.as_str(),
        ]
        .join(SECRET_FIELD_SEPARATOR);

        let mut hasher = XxHash64::with_seed(0);
        hasher.write(input.as_bytes());
        STANDARD_NO_PAD.encode(hasher.finish().to_be_bytes())
    }

    /// Returns whether `candidate` is the secret for the given token.
    ///
    /// The protected PIN is known to the verifier anyway, so a plain
    /// comparison is good enough.
    pub fn verify_secret(
        &self,
        candidate: &str,
        tenant: &str,
        client: &str,
        token_id: &str,
        token_pin: &str,
    ) -> bool {
        candidate == self.derive_secret(tenant, client, token_id, token_pin)
    }
}

impl Default for SecretMaterial {
    fn default() -> Self {
        SecretMaterial::new(DFLT_CLIENT_SECRET_KEY, DFLT_CLIENT_SECRET_SALT)
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SecretMaterial(<redacted>)")
    }
}

/// Computes a client secret with the default key and salt.
pub fn derive_secret(
    tenant: &str,
    client: &str,
    token_id: &str,
    token_pin: &str,
) -> String {
    SecretMaterial::default().derive_secret(tenant, client, token_id, token_pin)
}

/// Verifies a client secret with the default key and salt.
pub fn verify_secret(
    candidate: &str,
    tenant: &str,
    client: &str,
    token_id: &str,
    token_pin: &str,
) -> bool {
    SecretMaterial::default().verify_secret(
        candidate, tenant, client, token_id, token_pin,
    )
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trip_with_reserved_characters() {
        let cred = ClientCredential::new("a&b", "c=d e", "x/y+z%");
        let encoded = cred.encode();
        assert_eq!(encoded.matches('&').count(), 2);
        assert_eq!(ClientCredential::decode(&encoded), cred);
    }

    #[test]
    fn unreserved_characters_stay_readable() {
        assert_eq!(encode("acme", "client-1.x_y~", "S3cr"), "acme&client-1.x_y~&S3cr");
        assert_eq!(encode("a b", "c", "d"), "a%20b&c&d");
    }

    #[test]
    fn decode_fills_missing_parts() {
        let cred = ClientCredential::decode("acme");
        assert_eq!(cred.tenant, "acme");
        assert_eq!(cred.client, "");
        assert_eq!(cred.secret, "");

        let cred = ClientCredential::decode("");
        assert_eq!(cred, ClientCredential::new("", "", ""));
    }

    #[test]
    fn decode_ignores_extra_parts() {
        let cred = ClientCredential::decode("a&b&c&d");
        assert_eq!(cred, ClientCredential::new("a", "b", "c"));
    }

    #[test]
    fn derive_secret_is_deterministic() {
        let one = derive_secret("acme", "client1", "T1", "1234");
        let two = derive_secret("acme", "client1", "T1", "1234");
        assert_eq!(one, two);
        // Eight bytes are eleven base64 characters without padding.
        assert_eq!(one.len(), 11);
        assert!(!one.ends_with('='));
    }

    #[test]
    fn derive_secret_ignores_case_except_pin() {
        let lower = derive_secret("acme", "client1", "t1", "abcd");
        assert_eq!(lower, derive_secret("ACME", "Client1", "T1", "abcd"));
        assert_ne!(lower, derive_secret("acme", "client1", "t1", "ABCD"));
    }

    #[test]
    fn derive_secret_depends_on_every_field() {
        let base = derive_secret("acme", "client1", "T1", "1234");
        assert_ne!(base, derive_secret("other", "client1", "T1", "1234"));
        assert_ne!(base, derive_secret("acme", "client2", "T1", "1234"));
        assert_ne!(base, derive_secret("acme", "client1", "T2", "1234"));
        assert_ne!(base, derive_secret("acme", "client1", "T1", "4321"));

        let material = SecretMaterial::new("other-key", "salt");
        assert_ne!(base, material.derive_secret("acme", "client1", "T1", "1234"));
        let material = SecretMaterial::new("secret", "pepper");
        assert_ne!(base, material.derive_secret("acme", "client1", "T1", "1234"));
    }

    #[test]
    fn fields_do_not_run_together() {
        assert_ne!(
            derive_secret("ab", "c", "T1", "1234"),
            derive_secret("a", "bc", "T1", "1234")
        );
    }

    #[test]
    fn verify_secret_matches_derived() {
        let secret = derive_secret("acme", "client1", "T1", "1234");
        assert!(verify_secret(&secret, "Acme", "client1", "t1", "1234"));
        assert!(!verify_secret("wrong", "acme", "client1", "T1", "1234"));
    }

    #[test]
    fn debug_hides_secret() {
        let cred = ClientCredential::new("acme", "client1", "topsecret");
        assert!(!format!("{cred:?}").contains("topsecret"));
    }
}
