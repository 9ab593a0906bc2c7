//! Reference counted handles to opened token libraries and to the
//! certificates located in them.
//!
//! The cache hands out [`ScopedContext`]s. Each context holds one count on
//! the referenced object for as long as it lives. Before the cache closes a
//! library it waits until all counts are gone, so nothing it closes is
//! still in use.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use openssl::sign::RsaPssSaltlen;
use openssl::x509::X509;

use crate::api::sign::{HashAlgorithm, SignaturePadding};
use crate::api::token::{SlotInfo, TokenInfo, TokenInfos};
use crate::commons::error::TokenError;
use crate::constants::DRAIN_PROGRESS_INTERVAL_MILLIS;

use super::driver::{CertificateObject, DriverLoader, SignMechanism, TokenDriver};
use super::pin::PinProvider;

//------------ RefCount ------------------------------------------------------

/// A reference count that can be waited on until it drops to zero.
#[derive(Debug, Default)]
pub struct RefCount {
    count: Mutex<usize>,
    unused: Condvar,
}

impl RefCount {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn acquire(&self) {
        *self.lock() += 1;
    }

    pub fn release(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.unused.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Blocks until the count is zero.
    ///
    /// Logs the outstanding count each time a wait interval passes.
    pub fn wait_until_unused(&self, what: &dyn fmt::Display) {
        let interval = Duration::from_millis(DRAIN_PROGRESS_INTERVAL_MILLIS);
        let mut count = self.lock();
        while *count > 0 {
            let (guard, timeout) = self
                .unused
                .wait_timeout(count, interval)
                .unwrap_or_else(|err| err.into_inner());
            count = guard;
            if timeout.timed_out() && *count > 0 {
                debug!("Waiting for {} references to {} to be released", *count, what);
            }
        }
    }
}

//------------ Referenced ----------------------------------------------------

/// Something that can be held through a [`ScopedContext`].
pub trait Referenced {
    fn ref_count(&self) -> &RefCount;
}

//------------ ScopedContext -------------------------------------------------

/// A counted reference to a cached object.
///
/// Creating the context acquires one count, releasing or dropping it gives
/// the count back. Release is idempotent.
pub struct ScopedContext<T: Referenced> {
    inner: Arc<T>,
    released: AtomicBool,
}

impl<T: Referenced> ScopedContext<T> {
    pub fn new(inner: Arc<T>) -> Self {
        inner.ref_count().acquire();
        ScopedContext {
            inner,
            released: AtomicBool::new(false),
        }
    }

    /// Gives back the count held by this context.
    ///
    /// Only the first call has any effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.ref_count().release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn shared(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: Referenced> Clone for ScopedContext<T> {
    fn clone(&self) -> Self {
        ScopedContext::new(self.inner.clone())
    }
}

impl<T: Referenced> Drop for ScopedContext<T> {
    fn drop(&mut self) {
        self.release()
    }
}

impl<T: Referenced> Deref for ScopedContext<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Referenced + fmt::Debug> fmt::Debug for ScopedContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScopedContext")
            .field("inner", &self.inner)
            .field("released", &self.is_released())
            .finish()
    }
}

//------------ StoreReference ------------------------------------------------

/// One opened token library.
///
/// The slots, tokens and certificates are enumerated once when the library
/// is opened. Certificate lookups use that snapshot, token information is
/// read fresh from the library.
pub struct StoreReference {
    path: PathBuf,
    driver: RwLock<Option<Box<dyn TokenDriver>>>,
    pins: PinProvider,
    slots: Vec<StoreSlot>,
    refs: RefCount,
}

/// A slot as seen when the library was opened.
#[derive(Clone, Debug)]
pub struct StoreSlot {
    pub info: SlotInfo,
    pub token: Option<StoreToken>,
}

#[derive(Clone, Debug)]
pub struct StoreToken {
    pub info: TokenInfo,
    pub certificates: Vec<StoreCertificate>,
}

#[derive(Clone, Debug)]
pub struct StoreCertificate {
    pub object: CertificateObject,

    /// The upper case hex SHA-1 thumbprint of the certificate.
    pub thumbprint: String,
}

/// A certificate picked from a store for signing.
#[derive(Clone, Debug)]
pub struct FoundCertificate {
    pub slot_id: u64,
    pub serial_number: String,
    pub certificate: StoreCertificate,
}

impl StoreReference {
    /// Loads the library at `path` and enumerates its contents.
    pub fn open(
        loader: &dyn DriverLoader,
        path: &Path,
        pins: PinProvider,
    ) -> Result<Self, TokenError> {
        debug!("Opening token library '{}'", path.display());
        let driver = loader.load(path)?;

        let mut slots = Vec::new();
        for entry in driver.slots()? {
            let token = match entry.token {
                Some(info) => {
                    let certificates = driver
                        .certificates(entry.info.slot_id, &pins)?
                        .into_iter()
                        .filter_map(|object| {
                            Self::with_thumbprint(path, object)
                        })
                        .collect();
                    Some(StoreToken { info, certificates })
                }
                None => None,
            };
            slots.push(StoreSlot { info: entry.info, token });
        }

        info!(
            "Opened token library '{}' with {} slots and {} tokens",
            path.display(),
            slots.len(),
            slots.iter().filter(|slot| slot.token.is_some()).count()
        );

        Ok(StoreReference {
            path: path.to_path_buf(),
            driver: RwLock::new(Some(driver)),
            pins,
            slots,
            refs: RefCount::default(),
        })
    }

    fn with_thumbprint(
        path: &Path,
        object: CertificateObject,
    ) -> Option<StoreCertificate> {
        match thumbprint(&object.value) {
            Ok(thumbprint) => Some(StoreCertificate { object, thumbprint }),
            Err(err) => {
                warn!(
                    "Ignoring unparsable certificate '{}' in '{}': {}",
                    object.label,
                    path.display(),
                    err
                );
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pins(&self) -> &PinProvider {
        &self.pins
    }

    pub fn slots(&self) -> &[StoreSlot] {
        &self.slots
    }

    /// Returns whether no slot held a token when the library was opened.
    ///
    /// Certificates are searched in that snapshot, so this is what tells
    /// whether a failed search may succeed after reopening.
    pub fn no_token_present(&self) -> bool {
        self.slots.iter().all(|slot| slot.token.is_none())
    }

    /// Returns whether the library is still open.
    pub fn is_open(&self) -> bool {
        self.driver
            .read()
            .map(|driver| driver.is_some())
            .unwrap_or(false)
    }

    /// Finds a certificate with a private key on one of the given tokens.
    ///
    /// Slots are searched in library order, certificates in the order the
    /// token returned them. Only tokens with a configured PIN qualify.
    pub fn find_certificate(
        &self,
        certificate_id: &str,
        authorized_tokens: &HashSet<String>,
    ) -> Option<FoundCertificate> {
        self.slots.iter().find_map(|slot| {
            let token = slot.token.as_ref()?;
            let serial = token.info.serial_number.trim().to_lowercase();
            if !authorized_tokens.contains(&serial) || !self.pins.has_pin(&serial) {
                return None;
            }
            token
                .certificates
                .iter()
                .find(|cert| {
                    cert.object.has_private_key
                        && cert.thumbprint.eq_ignore_ascii_case(certificate_id)
                })
                .map(|cert| FoundCertificate {
                    slot_id: slot.info.slot_id,
                    serial_number: token.info.serial_number.clone(),
                    certificate: cert.clone(),
                })
        })
    }

    /// Reads the current library, slot and token information.
    ///
    /// Never asks for a PIN.
    pub fn token_infos(&self) -> Result<TokenInfos, TokenError> {
        let _suppress = PinProvider::suppress_prompting();
        self.with_driver(|driver| {
            let library = driver.library_info()?;
            let mut slots = Vec::new();
            let mut tokens = Vec::new();
            for entry in driver.slots()? {
                slots.push(entry.info);
                if let Some(token) = entry.token {
                    tokens.push(token);
                }
            }
            Ok(TokenInfos { library, slots, tokens })
        })
    }

    pub fn sign(
        &self,
        slot_id: u64,
        key_id: &[u8],
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.with_driver(|driver| {
            driver.sign(slot_id, key_id, mechanism, data, &self.pins)
        })
    }

    fn with_driver<T>(
        &self,
        op: impl FnOnce(&dyn TokenDriver) -> Result<T, TokenError>,
    ) -> Result<T, TokenError> {
        let driver = self.driver.read().map_err(|_| {
            TokenError::driver(format!(
                "token library '{}' is in an inconsistent state",
                self.path.display()
            ))
        })?;
        match driver.as_deref() {
            Some(driver) => op(driver),
            None => Err(TokenError::driver(format!(
                "token library '{}' is closed",
                self.path.display()
            ))),
        }
    }

    /// Finalizes the library.
    ///
    /// Must only be called once no context refers to this store anymore.
    pub fn close(&self) {
        let mut driver = self.driver.write().unwrap_or_else(|err| err.into_inner());
        if driver.take().is_some() {
            info!("Closed token library '{}'", self.path.display());
        }
    }
}

impl Referenced for StoreReference {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl fmt::Debug for StoreReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StoreReference")
            .field("path", &self.path)
            .field("slots", &self.slots.len())
            .field("refs", &self.refs.count())
            .finish()
    }
}

impl fmt::Display for StoreReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "token library '{}'", self.path.display())
    }
}

//------------ CertificateReference ------------------------------------------

/// A certificate with a private key, located for one credential.
///
/// Holds a count on the store it was found in until the cache lets go of
/// it.
pub struct CertificateReference {
    store: ScopedContext<StoreReference>,
    found: FoundCertificate,
    refs: RefCount,
}

impl CertificateReference {
    pub fn new(
        store: ScopedContext<StoreReference>,
        found: FoundCertificate,
    ) -> Self {
        CertificateReference {
            store,
            found,
            refs: RefCount::default(),
        }
    }

    pub fn thumbprint(&self) -> &str {
        &self.found.certificate.thumbprint
    }

    pub fn serial_number(&self) -> &str {
        &self.found.serial_number
    }

    /// Returns the DER encoded certificate.
    pub fn certificate(&self) -> &[u8] {
        &self.found.certificate.object.value
    }

    pub fn store(&self) -> &StoreReference {
        &self.store
    }

    /// Gives back the count this certificate holds on its store.
    pub fn release_store(&self) {
        self.store.release()
    }

    /// Signs `hash` with the private key on the token.
    pub fn sign_hash(
        &self,
        hash: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<Vec<u8>, TokenError> {
        let (mechanism, data) = SignMechanism::for_hash(hash, algorithm, padding)?;
        self.store.sign(
            self.found.slot_id,
            &self.found.certificate.object.id,
            mechanism,
            &data,
        )
    }

    /// Verifies a signature over `hash` with the certificate's public key.
    ///
    /// This does not touch the token.
    pub fn verify_hash(
        &self,
        hash: &[u8],
        signature: &[u8],
        algorithm: HashAlgorithm,
        padding: SignaturePadding,
    ) -> Result<bool, TokenError> {
        verify_hash(self.certificate(), hash, signature, algorithm, padding)
    }
}

impl Referenced for CertificateReference {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl fmt::Debug for CertificateReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertificateReference")
            .field("thumbprint", &self.thumbprint())
            .field("serial_number", &self.serial_number())
            .field("refs", &self.refs.count())
            .finish()
    }
}

impl fmt::Display for CertificateReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "certificate {}", self.thumbprint())
    }
}

//------------ Helpers -------------------------------------------------------

/// Converts an openssl failure over certificate data read from a token.
///
/// The caller cannot have caused these, so they are driver errors.
pub fn certificate_error(err: ErrorStack) -> TokenError {
    TokenError::driver(format!("cannot process certificate from token: {err}"))
}

/// Returns the upper case hex SHA-1 thumbprint of a DER certificate.
pub fn thumbprint(der: &[u8]) -> Result<String, TokenError> {
    let cert = X509::from_der(der).map_err(certificate_error)?;
    let digest = cert.digest(MessageDigest::sha1()).map_err(certificate_error)?;
    Ok(hex::encode_upper(&digest[..]))
}

/// Verifies an RSA signature over a hash with a certificate's public key.
pub fn verify_hash(
    certificate: &[u8],
    hash: &[u8],
    signature: &[u8],
    algorithm: HashAlgorithm,
    padding: SignaturePadding,
) -> Result<bool, TokenError> {
    algorithm.check_hash(hash)?;
    let cert = X509::from_der(certificate).map_err(certificate_error)?;
    let key = cert.public_key().map_err(certificate_error)?;

    let mut ctx = PkeyCtx::new(&key).map_err(certificate_error)?;
    let setup = ctx.verify_init().and_then(|_| match padding {
        SignaturePadding::Pkcs1 => {
            ctx.set_rsa_padding(Padding::PKCS1)?;
            ctx.set_signature_md(algorithm.md())
        }
        SignaturePadding::Pss => {
            ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
            ctx.set_signature_md(algorithm.md())?;
            ctx.set_rsa_mgf1_md(algorithm.md())?;
            ctx.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)
        }
    });
    setup.map_err(certificate_error)?;

    // A malformed signature is an invalid one.
    Ok(ctx.verify(hash, signature).unwrap_or(false))
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Counted {
        refs: RefCount,
    }

    impl Referenced for Counted {
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }
    }

    #[test]
    fn context_acquires_and_releases() {
        let counted = Arc::new(Counted::default());
        let one = ScopedContext::new(counted.clone());
        let two = one.clone();
        assert_eq!(counted.refs.count(), 2);
        drop(one);
        assert_eq!(counted.refs.count(), 1);
        drop(two);
        assert_eq!(counted.refs.count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let counted = Arc::new(Counted::default());
        let keep = ScopedContext::new(counted.clone());
        let ctx = ScopedContext::new(counted.clone());
        ctx.release();
        ctx.release();
        assert!(ctx.is_released());
        assert_eq!(counted.refs.count(), 1);
        drop(ctx);
        assert_eq!(counted.refs.count(), 1);
        drop(keep);
        assert_eq!(counted.refs.count(), 0);
    }

    #[test]
    fn concurrent_cycles_return_to_zero() {
        let counted = Arc::new(Counted::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counted = counted.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let ctx = ScopedContext::new(counted.clone());
                        assert!(counted.refs.count() >= 1);
                        ctx.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counted.refs.count(), 0);
    }

    #[test]
    fn wait_returns_once_released() {
        let counted = Arc::new(Counted::default());
        let ctx = ScopedContext::new(counted.clone());
        let waiter = {
            let counted = counted.clone();
            thread::spawn(move || {
                counted.refs.wait_until_unused(&"test object");
                counted.refs.count()
            })
        };
        thread::sleep(Duration::from_millis(250));
        assert!(!waiter.is_finished());
        drop(ctx);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn unparsable_token_certificate_is_driver_error() {
        assert!(matches!(
            thumbprint(b"not a certificate"),
            Err(TokenError::Driver(_))
        ));
        let res = verify_hash(
            b"not a certificate",
            &[0; 32],
            &[0; 256],
            HashAlgorithm::Sha256,
            SignaturePadding::Pkcs1,
        );
        assert!(matches!(res, Err(TokenError::Driver(_))));
    }

    #[test]
    fn wait_on_unused_returns_immediately() {
        let counted = Counted::default();
        counted.refs.wait_until_unused(&"test object");
    }
}
