//! Descriptions of token libraries, slots and tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

//------------ Version -------------------------------------------------------

/// A major.minor version as reported by a token library.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8) -> Self {
        Version { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

//------------ TokenInfos ----------------------------------------------------

/// Everything one opened token library reports about itself.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfos {
    pub library: LibraryInfo,
    pub slots: Vec<SlotInfo>,
    pub tokens: Vec<TokenInfo>,
}

//------------ LibraryInfo ---------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LibraryInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub library_description: String,
    pub library_version: Version,
}

//------------ SlotInfo ------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotInfo {
    pub slot_id: u64,
    pub slot_description: String,
    pub manufacturer_id: String,
    pub flags: SlotFlags,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotFlags {
    pub token_present: bool,
    pub removable_device: bool,
    pub hardware_slot: bool,
}

//------------ TokenInfo -----------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfo {
    pub slot_id: u64,
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: TokenFlags,

    /// Session limits, `None` when the library reports no limit or does
    /// not know.
    pub max_session_count: Option<u64>,
    pub session_count: Option<u64>,
    pub max_rw_session_count: Option<u64>,
    pub rw_session_count: Option<u64>,

    pub max_pin_len: u64,
    pub min_pin_len: u64,

    pub total_public_memory: Option<u64>,
    pub free_public_memory: Option<u64>,
    pub total_private_memory: Option<u64>,
    pub free_private_memory: Option<u64>,

    pub hardware_version: Version,
    pub firmware_version: Version,
    pub utc_time: Option<String>,
}

impl TokenInfo {
    /// Returns the reasons this token is considered unhealthy, if any.
    ///
    /// Uninitialized tokens are never unhealthy. An initialized token is
    /// unhealthy when any user or SO PIN warning flag is raised.
    pub fn health_problems(&self) -> Vec<&'static str> {
        let flags = &self.flags;
        if !flags.token_initialized {
            return Vec::new();
        }
        [
            (flags.user_pin_count_low, "user PIN count low"),
            (flags.user_pin_final_try, "user PIN final try"),
            (flags.user_pin_locked, "user PIN locked"),
            (flags.user_pin_to_be_changed, "user PIN to be changed"),
            (flags.so_pin_count_low, "SO PIN count low"),
            (flags.so_pin_final_try, "SO PIN final try"),
            (flags.so_pin_locked, "SO PIN locked"),
            (flags.so_pin_to_be_changed, "SO PIN to be changed"),
        ]
        .into_iter()
        .filter_map(|(raised, problem)| raised.then_some(problem))
        .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenFlags {
    pub rng: bool,
    pub write_protected: bool,
    pub login_required: bool,
    pub user_pin_initialized: bool,
    pub restore_key_not_needed: bool,
    pub clock_on_token: bool,
    pub protected_authentication_path: bool,
    pub dual_crypto_operations: bool,
    pub token_initialized: bool,
    pub secondary_authentication: bool,
    pub user_pin_count_low: bool,
    pub user_pin_final_try: bool,
    pub user_pin_locked: bool,
    pub user_pin_to_be_changed: bool,
    pub so_pin_count_low: bool,
    pub so_pin_final_try: bool,
    pub so_pin_locked: bool,
    pub so_pin_to_be_changed: bool,
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn token(flags: TokenFlags) -> TokenInfo {
        TokenInfo {
            serial_number: "T1".into(),
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn uninitialized_token_is_healthy() {
        let info = token(TokenFlags {
            user_pin_locked: true,
            ..Default::default()
        });
        assert!(info.health_problems().is_empty());
    }

    #[test]
    fn pin_warnings_make_token_unhealthy() {
        let info = token(TokenFlags {
            token_initialized: true,
            user_pin_final_try: true,
            so_pin_locked: true,
            ..Default::default()
        });
        assert_eq!(
            info.health_problems(),
            vec!["user PIN final try", "SO PIN locked"]
        );
    }
}
