//! Formatting command results for the user.

use std::fmt::Write;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::json;

use crate::api::token::TokenInfos;

//------------ ReportFormat --------------------------------------------------

/// How to print the result of a command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!("expected \"text\" or \"json\", found: \"{s}\"")),
        }
    }
}

//------------ Report --------------------------------------------------------

/// The result of a command.
#[derive(Clone, Debug)]
pub enum Report {
    Secret(String),
    Credential(String),
    Tokens(Vec<TokenInfos>),

    /// A DER encoded certificate.
    Certificate(Bytes),

    Signature(Bytes),
    Verified(bool),
}

impl Report {
    pub fn report(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Text => self.text(),
            ReportFormat::Json => self.json(),
        }
    }

    fn text(&self) -> String {
        match self {
            Report::Secret(secret) => secret.clone(),
            Report::Credential(credential) => credential.clone(),
            Report::Tokens(infos) => tokens_text(infos),
            Report::Certificate(der) => STANDARD.encode(der),
            Report::Signature(signature) => STANDARD.encode(signature),
            Report::Verified(true) => "valid".to_string(),
            Report::Verified(false) => "invalid".to_string(),
        }
    }

    fn json(&self) -> String {
        let value = match self {
            Report::Secret(secret) => json!({ "secret": secret }),
            Report::Credential(credential) => json!({ "credential": credential }),
            Report::Tokens(infos) => json!(infos),
            Report::Certificate(der) => {
                json!({ "certificate": STANDARD.encode(der) })
            }
            Report::Signature(signature) => {
                json!({ "signature": STANDARD.encode(signature) })
            }
            Report::Verified(valid) => json!({ "valid": valid }),
        };
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

fn tokens_text(infos: &[TokenInfos]) -> String {
    let mut res = String::new();
    for infos in infos {
        let library = &infos.library;
        let _ = writeln!(
            res,
            "Library: {} ({}), version {}, cryptoki {}",
            library.library_description,
            library.manufacturer_id,
            library.library_version,
            library.cryptoki_version
        );
        for slot in &infos.slots {
            let _ = writeln!(
                res,
                "  Slot {}: {}{}",
                slot.slot_id,
                slot.slot_description,
                if slot.flags.token_present { "" } else { " (empty)" }
            );
            for token in infos.tokens.iter().filter(|t| t.slot_id == slot.slot_id) {
                let _ = writeln!(
                    res,
                    "    Token {} '{}' ({} {})",
                    token.serial_number,
                    token.label,
                    token.manufacturer_id,
                    token.model
                );
                let problems = token.health_problems();
                if !problems.is_empty() {
                    let _ = writeln!(res, "      Problems: {}", problems.join(", "));
                }
            }
        }
    }
    res
}


//============ Tests =========================================================
