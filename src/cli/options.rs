//! The command line options of `tokenkeeperc`.

#[cfg(feature = "hsm")]
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use clap::Parser;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::client::TokenAccessClient;
use crate::constants::{
    DFLT_CLIENT_SECRET_KEY, DFLT_CLIENT_SECRET_SALT, TOKENKEEPER_ENV_SERVER,
};
use crate::token::credential::{ClientCredential, SecretMaterial};

use super::Error;
use super::report::{Report, ReportFormat};

//------------ Options -------------------------------------------------------

/// The command line options for the tokenkeeper client.
#[derive(clap::Parser)]
#[command(version, about = "The tokenkeeper command line client.")]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won’t result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub async fn run(self) -> Result<Report, Error> {
        match self.command {
            Command::Secret(cmd) => Ok(cmd.run()),
            Command::Credential(cmd) => Ok(cmd.run()),
            Command::Tokens(cmd) => cmd.run(&self.general.access()?).await,
            Command::Certificate(cmd) => cmd.run(&self.general.access()?).await,
            Command::Sign(cmd) => cmd.run(&self.general.access()?).await,
            Command::Verify(cmd) => cmd.run(&self.general.access()?).await,
        }
    }
}

//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// The full URI to the tokenkeeper daemon.
    #[arg(
        short, long,
        env = TOKENKEEPER_ENV_SERVER,
        default_value = "http://localhost:3080/",
    )]
    pub server: String,

    /// Use the tokens of this machine as configured in this file, instead
    /// of asking a daemon.
    #[cfg(feature = "hsm")]
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Report format
    #[arg(short, long, default_value = "text")]
    pub format: ReportFormat,
}

impl GeneralOptions {
    /// Returns the token access to use.
    #[cfg(feature = "hsm")]
    pub fn access(&self) -> Result<TokenAccessClient, Error> {
        use std::sync::Arc;

        use crate::config::Config;
        use crate::token::TokenAccess;

        match &self.config {
            Some(path) => {
                let config = Config::parse(path)?;
                // The client runs on a current thread runtime, so there
                // is no other thread yet.
                config.token_access.export_environment();
                Ok(TokenAccessClient::local(Arc::new(TokenAccess::from_config(
                    config.token_access.clone(),
                ))))
            }
            None => Ok(TokenAccessClient::remote(&self.server)?),
        }
    }

    #[cfg(not(feature = "hsm"))]
    pub fn access(&self) -> Result<TokenAccessClient, Error> {
        Ok(TokenAccessClient::remote(&self.server)?)
    }
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// Derive the client secret for a tenant, client and token.
    Secret(Secret),

    /// Combine tenant, client and secret into a credential string.
    Credential(Credential),

    /// Show the token libraries, their slots and tokens.
    Tokens(Tokens),

    /// Get a certificate, base64 encoded DER.
    Certificate(Certificate),

    /// Sign a hash with the private key of a certificate.
    Sign(Sign),

    /// Verify a signature over a hash.
    Verify(Verify),
}

//------------ Secret --------------------------------------------------------

#[derive(clap::Parser)]
pub struct Secret {
    /// The tenant id
    #[arg(long)]
    tenant: String,

    /// The client id
    #[arg(long)]
    client: String,

    /// The serial number of the token
    #[arg(long)]
    token: String,

    /// The PIN of the token
    #[arg(long)]
    pin: String,

    /// The client_secret_key of the daemon
    #[arg(long, default_value = DFLT_CLIENT_SECRET_KEY)]
    secret_key: String,

    /// The client_secret_salt of the daemon
    #[arg(long, default_value = DFLT_CLIENT_SECRET_SALT)]
    secret_salt: String,
}

impl Secret {
    pub fn run(self) -> Report {
        let material = SecretMaterial::new(self.secret_key, self.secret_salt);
        Report::Secret(material.derive_secret(
            &self.tenant,
            &self.client,
            &self.token,
            &self.pin,
        ))
    }
}

//------------ Credential ----------------------------------------------------

#[derive(clap::Parser)]
pub struct Credential {
    /// The tenant id
    #[arg(long)]
    tenant: String,

    /// The client id
    #[arg(long)]
    client: String,

    /// The client secret
    #[arg(long)]
    secret: String,
}

impl Credential {
    pub fn run(self) -> Report {
        Report::Credential(
            ClientCredential::new(self.tenant, self.client, self.secret).encode(),
        )
    }
}

//------------ Tokens --------------------------------------------------------

#[derive(clap::Parser)]
pub struct Tokens;

impl Tokens {
    pub async fn run(self, client: &TokenAccessClient) -> Result<Report, Error> {
        Ok(Report::Tokens(client.get_token_infos().await?))
    }
}

//------------ KeyArgs -------------------------------------------------------

/// Selects a certificate and the credential to use it.
#[derive(clap::Args)]
pub struct KeyArgs {
    /// The credential string
    #[arg(long, env = "TOKENKEEPER_CREDENTIAL")]
    credential: String,

    /// The SHA-1 thumbprint of the certificate in hex
    #[arg(long, value_name = "thumbprint")]
    certificate_id: String,
}

//------------ Certificate ---------------------------------------------------

#[derive(clap::Parser)]
pub struct Certificate {
    #[command(flatten)]
    key: KeyArgs,
}

impl Certificate {
    pub async fn run(self, client: &TokenAccessClient) -> Result<Report, Error> {
        let der = client
            .get_certificate(&self.key.credential, &self.key.certificate_id)
            .await?;
        Ok(Report::Certificate(der))
    }
}

//------------ Sign ----------------------------------------------------------

#[derive(clap::Parser)]
pub struct Sign {
    #[command(flatten)]
    key: KeyArgs,

    /// The base64 encoded hash to sign
    #[arg(long)]
    hash: String,

    /// The algorithm that produced the hash
    #[arg(long, default_value = "SHA256")]
    algorithm: HashAlgorithm,

    /// The signature padding, pkcs1 or pss
    #[arg(long, default_value = "pkcs1")]
    padding: SignaturePadding,
}

impl Sign {
    pub async fn run(self, client: &TokenAccessClient) -> Result<Report, Error> {
        let hash = decode_base64("hash", &self.hash)?;
        let signature = client
            .rsa_sign_hash(
                &self.key.credential,
                &self.key.certificate_id,
                hash,
                self.algorithm,
                self.padding,
            )
            .await?;
        Ok(Report::Signature(signature))
    }
}

//------------ Verify --------------------------------------------------------

#[derive(clap::Parser)]
pub struct Verify {
    #[command(flatten)]
    key: KeyArgs,

    /// The base64 encoded hash that was signed
    #[arg(long)]
    hash: String,

    /// The base64 encoded signature
    #[arg(long)]
    signature: String,

    /// The algorithm that produced the hash
    #[arg(long, default_value = "SHA256")]
    algorithm: HashAlgorithm,

    /// The signature padding, pkcs1 or pss
    #[arg(long, default_value = "pkcs1")]
    padding: SignaturePadding,
}

impl Verify {
    pub async fn run(self, client: &TokenAccessClient) -> Result<Report, Error> {
        let hash = decode_base64("hash", &self.hash)?;
        let signature = decode_base64("signature", &self.signature)?;
        let valid = client
            .rsa_verify_hash(
                &self.key.credential,
                &self.key.certificate_id,
                hash,
                signature,
                self.algorithm,
                self.padding,
            )
            .await?;
        Ok(Report::Verified(valid))
    }
}

fn decode_base64(what: &str, value: &str) -> Result<Bytes, Error> {
    STANDARD
        .decode(value.trim())
        .map(Bytes::from)
        .map_err(|e| Error::input(format!("{what} is not valid base64: {e}")))
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::credential::derive_secret;

    #[test]
    fn parse_sign_command() {
        let options = Options::try_parse_from([
            "tokenkeeperc",
            "--server",
            "http://tokens.example.net/",
            "sign",
            "--credential",
            "acme&client1&abc",
            "--certificate-id",
            "0A1B",
            "--hash",
            "AAEC",
            "--algorithm",
            "sha384",
            "--padding",
            "PSS",
        ])
        .unwrap();
        assert_eq!(options.general.server, "http://tokens.example.net/");
        match options.command {
            Command::Sign(sign) => {
                assert_eq!(sign.key.certificate_id, "0A1B");
                assert_eq!(sign.algorithm, HashAlgorithm::Sha384);
                assert_eq!(sign.padding, SignaturePadding::Pss);
            }
            _ => panic!("expected sign command"),
        }
    }

    #[test]
    fn unknown_padding_is_rejected() {
        assert!(
            Options::try_parse_from([
                "tokenkeeperc",
                "sign",
                "--credential",
                "c",
                "--certificate-id",
                "0A",
                "--hash",
                "AA==",
                "--padding",
                "oaep",
            ])
            .is_err()
        );
    }

    #[tokio::test]
    async fn secret_matches_library_derivation() {
        let options = Options::try_parse_from([
            "tokenkeeperc",
            "secret",
            "--tenant",
            "acme",
            "--client",
            "client1",
            "--token",
            "T1",
            "--pin",
            "1234",
        ])
        .unwrap();
        match options.run().await.unwrap() {
            Report::Secret(secret) => {
                assert_eq!(secret, derive_secret("acme", "client1", "T1", "1234"))
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn invalid_base64_is_input_error() {
        assert!(matches!(
            decode_base64("hash", "not base64!"),
            Err(Error::Input(_))
        ));
    }
}
