//! The PKCS#11 token driver, built on the `cryptoki` crate.
//!
//! Every operation opens its own read-only session and closes it again
//! when done. Closing the last session of the application on a token also
//! logs it out, so there is no explicit logout.

use std::fmt;
use std::path::{Path, PathBuf};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::{Limit, Slot};
use cryptoki::types::{AuthPin, Version as Pkcs11Version};
use log::{debug, trace, warn};
use secrecy::ExposeSecret;

use crate::api::sign::HashAlgorithm;
use crate::api::token::{
    LibraryInfo, SlotFlags, SlotInfo, TokenFlags, TokenInfo, Version,
};
use crate::commons::error::TokenError;

use super::driver::{
    CertificateObject, DriverLoader, SignMechanism, SlotEntry, TokenDriver,
};
use super::pin::PinProvider;

//------------ CryptokiLoader ------------------------------------------------

/// Loads PKCS#11 libraries from the file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct CryptokiLoader;

impl DriverLoader for CryptokiLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn TokenDriver>, TokenError> {
        Ok(Box::new(CryptokiDriver::load(path)?))
    }
}

//------------ CryptokiDriver ------------------------------------------------

/// One loaded and initialized PKCS#11 library.
///
/// Dropping the driver finalizes the library.
pub struct CryptokiDriver {
    path: PathBuf,
    pkcs11: Pkcs11,
}

impl CryptokiDriver {
    pub fn load(path: &Path) -> Result<Self, TokenError> {
        let pkcs11 = Pkcs11::new(path).map_err(|err| {
            TokenError::driver(format!(
                "Failed to load PKCS#11 library '{}': {}",
                path.display(),
                err
            ))
        })?;

        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(|err| {
            TokenError::driver(format!(
                "Failed to initialize PKCS#11 library '{}': {}",
                path.display(),
                err
            ))
        })?;

        debug!("Loaded PKCS#11 library '{}'", path.display());
        Ok(CryptokiDriver {
            path: path.to_path_buf(),
            pkcs11,
        })
    }

    fn err(&self, what: &str, err: Pkcs11Error) -> TokenError {
        TokenError::driver(format!("{} failed in '{}': {}", what, self.path.display(), err))
    }

    fn slot(&self, slot_id: u64) -> Result<Slot, TokenError> {
        self.pkcs11
            .get_all_slots()
            .map_err(|err| self.err("C_GetSlotList", err))?
            .into_iter()
            .find(|slot| slot.id() == slot_id)
            .ok_or_else(|| {
                TokenError::driver(format!(
                    "slot {} disappeared from '{}'",
                    slot_id,
                    self.path.display()
                ))
            })
    }

    fn token_info(&self, slot: Slot) -> Result<TokenInfo, TokenError> {
        let info = self
            .pkcs11
            .get_token_info(slot)
            .map_err(|err| self.err("C_GetTokenInfo", err))?;
        trace!("C_GetTokenInfo({}): {:?}", slot.id(), info);
        Ok(convert_token_info(slot.id(), &info))
    }

    /// Opens a session and logs in as user if the provider has a PIN.
    fn session(
        &self,
        slot_id: u64,
        pins: &PinProvider,
    ) -> Result<Session, TokenError> {
        let slot = self.slot(slot_id)?;
        let token = self.token_info(slot)?;
        let session = self
            .pkcs11
            .open_ro_session(slot)
            .map_err(|err| self.err("C_OpenSession", err))?;

        let answer = pins.token_pin(&token);
        match answer.pin {
            Some(pin) if !answer.cancel => {
                let pin = String::from_utf8_lossy(pin.expose_secret()).into_owned();
                match session.login(UserType::User, Some(&AuthPin::new(pin.into()))) {
                    Ok(()) => {}
                    Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
                    Err(err) => return Err(self.err("C_Login", err)),
                }
            }
            _ => trace!("Not logging in to token '{}'", token.serial_number),
        }
        Ok(session)
    }

    fn certificate_object(
        &self,
        session: &Session,
        handle: ObjectHandle,
    ) -> Result<CertificateObject, TokenError> {
        let mut cert = CertificateObject {
            id: Vec::new(),
            label: String::new(),
            value: Vec::new(),
            has_private_key: false,
        };
        let attrs = session
            .get_attributes(
                handle,
                &[AttributeType::Id, AttributeType::Label, AttributeType::Value],
            )
            .map_err(|err| self.err("C_GetAttributeValue", err))?;
        for attr in attrs {
            match attr {
                Attribute::Id(id) => cert.id = id,
                Attribute::Label(label) => {
                    cert.label = String::from_utf8_lossy(&label).into_owned()
                }
                Attribute::Value(value) => cert.value = value,
                _ => {}
            }
        }
        cert.has_private_key = self.private_key(session, &cert.id)?.is_some();
        Ok(cert)
    }

    fn private_key(
        &self,
        session: &Session,
        id: &[u8],
    ) -> Result<Option<ObjectHandle>, TokenError> {
        let template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Id(id.to_vec()),
        ];
        Ok(session
            .find_objects(&template)
            .map_err(|err| self.err("C_FindObjects", err))?
            .into_iter()
            .next())
    }
}

impl TokenDriver for CryptokiDriver {
    fn library_info(&self) -> Result<LibraryInfo, TokenError> {
        let info = self
            .pkcs11
            .get_library_info()
            .map_err(|err| self.err("C_GetInfo", err))?;
        trace!("C_GetInfo(): {:?}", info);
        Ok(LibraryInfo {
            cryptoki_version: version(info.cryptoki_version()),
            manufacturer_id: info.manufacturer_id().trim().to_string(),
            library_description: info.library_description().trim().to_string(),
            library_version: version(info.library_version()),
        })
    }

    fn slots(&self) -> Result<Vec<SlotEntry>, TokenError> {
        let mut entries = Vec::new();
        for slot in self
            .pkcs11
            .get_all_slots()
            .map_err(|err| self.err("C_GetSlotList", err))?
        {
            let info = self
                .pkcs11
                .get_slot_info(slot)
                .map_err(|err| self.err("C_GetSlotInfo", err))?;
            trace!("C_GetSlotInfo({}): {:?}", slot.id(), info);

            let token = if info.token_present() {
                Some(self.token_info(slot)?)
            } else {
                None
            };
            entries.push(SlotEntry {
                info: SlotInfo {
                    slot_id: slot.id(),
                    slot_description: info.slot_description().trim().to_string(),
                    manufacturer_id: info.manufacturer_id().trim().to_string(),
                    flags: SlotFlags {
                        token_present: info.token_present(),
                        removable_device: info.removable_device(),
                        hardware_slot: info.hardware_slot(),
                    },
                    hardware_version: version(info.hardware_version()),
                    firmware_version: version(info.firmware_version()),
                },
                token,
            });
        }
        Ok(entries)
    }

    fn certificates(
        &self,
        slot_id: u64,
        pins: &PinProvider,
    ) -> Result<Vec<CertificateObject>, TokenError> {
        let session = self.session(slot_id, pins)?;
        let handles = session
            .find_objects(&[Attribute::Class(ObjectClass::CERTIFICATE)])
            .map_err(|err| self.err("C_FindObjects", err))?;

        let mut certificates = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.certificate_object(&session, handle) {
                Ok(cert) => certificates.push(cert),
                Err(err) => {
                    warn!("Skipping certificate object in slot {slot_id}: {err}")
                }
            }
        }
        Ok(certificates)
    }

    fn sign(
        &self,
        slot_id: u64,
        key_id: &[u8],
        mechanism: SignMechanism,
        data: &[u8],
        pins: &PinProvider,
    ) -> Result<Vec<u8>, TokenError> {
        let session = self.session(slot_id, pins)?;
        let key = self.private_key(&session, key_id)?.ok_or_else(|| {
            TokenError::not_found(format!(
                "private key {} in slot {}",
                hex::encode(key_id),
                slot_id
            ))
        })?;
        session
            .sign(&mechanism_for(mechanism), key, data)
            .map_err(|err| self.err("C_Sign", err))
    }
}

impl fmt::Debug for CryptokiDriver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CryptokiDriver").field("path", &self.path).finish()
    }
}

//------------ Conversions ---------------------------------------------------

fn mechanism_for(mechanism: SignMechanism) -> Mechanism<'static> {
    match mechanism {
        SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
        SignMechanism::RsaPkcsPss(algorithm) => {
            let (hash_alg, mgf) = match algorithm {
                HashAlgorithm::Sha1 => (MechanismType::SHA1, PkcsMgfType::MGF1_SHA1),
                HashAlgorithm::Sha256 => {
                    (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256)
                }
                HashAlgorithm::Sha384 => {
                    (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384)
                }
                HashAlgorithm::Sha512 => {
                    (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512)
                }
            };
            Mechanism::RsaPkcsPss(PkcsPssParams {
                hash_alg,
                mgf,
                s_len: (algorithm.digest_len() as u64).into(),
            })
        }
    }
}

fn version(version: Pkcs11Version) -> Version {
    Version::new(version.major(), version.minor())
}

fn limit(limit: Limit) -> Option<u64> {
    match limit {
        Limit::Max(max) => Some(max),
        Limit::Unavailable | Limit::Infinite => None,
    }
}

fn convert_token_info(slot_id: u64, info: &cryptoki::slot::TokenInfo) -> TokenInfo {
    TokenInfo {
        slot_id,
        label: info.label().trim().to_string(),
        manufacturer_id: info.manufacturer_id().trim().to_string(),
        model: info.model().trim().to_string(),
        serial_number: info.serial_number().trim().to_string(),
        flags: TokenFlags {
            rng: info.rng(),
            write_protected: info.write_protected(),
            login_required: info.login_required(),
            user_pin_initialized: info.user_pin_initialized(),
            restore_key_not_needed: info.restore_key_not_needed(),
            clock_on_token: info.clock_on_token(),
            protected_authentication_path: info.protected_authentication_path(),
            dual_crypto_operations: info.dual_crypto_operations(),
            token_initialized: info.token_initialized(),
            secondary_authentication: info.secondary_authentication(),
            user_pin_count_low: info.user_pin_count_low(),
            user_pin_final_try: info.user_pin_final_try(),
            user_pin_locked: info.user_pin_locked(),
            user_pin_to_be_changed: info.user_pin_to_be_changed(),
            so_pin_count_low: info.so_pin_count_low(),
            so_pin_final_try: info.so_pin_final_try(),
            so_pin_locked: info.so_pin_locked(),
            so_pin_to_be_changed: info.so_pin_to_be_changed(),
        },
        max_session_count: limit(info.max_session_count()),
        session_count: info.session_count(),
        max_rw_session_count: limit(info.max_rw_session_count()),
        rw_session_count: info.rw_session_count(),
        max_pin_len: info.max_pin_length() as u64,
        min_pin_len: info.min_pin_length() as u64,
        total_public_memory: info.total_public_memory().map(|m| m as u64),
        free_public_memory: info.free_public_memory().map(|m| m as u64),
        total_private_memory: info.total_private_memory().map(|m| m as u64),
        free_private_memory: info.free_private_memory().map(|m| m as u64),
        hardware_version: version(info.hardware_version()),
        firmware_version: version(info.firmware_version()),
        utc_time: info.utc_time().map(|t| {
            format!(
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
                t.year, t.month, t.day, t.hour, t.minute, t.second
            )
        }),
    }
}


//============ Tests =========================================================

#[cfg(all(test, feature = "hsm-tests-pkcs11"))]
mod tests {
    use super::*;

    /// Needs SoftHSM v2 with an initialized token.
    #[test]
    fn enumerate_softhsm() {
        let path = Path::new("/usr/lib/softhsm/libsofthsm2.so");
        let driver = CryptokiDriver::load(path).unwrap();
        let library = driver.library_info().unwrap();
        assert!(!library.manufacturer_id.is_empty());
        let slots = driver.slots().unwrap();
        assert!(slots.iter().any(|slot| slot.token.is_some()));
    }
}
