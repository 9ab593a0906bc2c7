//! The cache of opened token libraries and located certificates.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::api::token::TokenInfos;
use crate::commons::error::TokenError;
use crate::config::TokenAccessConfig;

use super::credential::{ClientCredential, SecretMaterial};
use super::driver::DriverLoader;
use super::reference::{
    CertificateReference, Referenced, ScopedContext, StoreReference,
};

/// Cached certificates are keyed by credential string and certificate id.
type CertificateKey = (String, String);

#[derive(Default)]
struct CacheState {
    /// Opened libraries in configuration order.
    stores: Vec<Arc<StoreReference>>,

    certificates: HashMap<CertificateKey, Arc<CertificateReference>>,

    /// Bumped by every invalidation.
    generation: u64,

    /// Invalidations still waiting to close their libraries.
    draining: usize,
}

//------------ TokenAccessCache ----------------------------------------------

/// Opened token libraries and certificates located for credentials.
///
/// All changes to the cache happen under a single lock. Slow token
/// operations run outside of it, while the caller holds a
/// [`ScopedContext`] on the objects involved.
pub struct TokenAccessCache {
    config: Arc<TokenAccessConfig>,
    material: SecretMaterial,
    loader: Arc<dyn DriverLoader>,
    state: Mutex<CacheState>,

    /// Signalled when an invalidation has closed its libraries.
    drained: Condvar,

    invalidations: AtomicUsize,
}

impl TokenAccessCache {
    pub fn new(
        config: Arc<TokenAccessConfig>,
        loader: Arc<dyn DriverLoader>,
    ) -> Self {
        TokenAccessCache {
            material: config.secret_material(),
            config,
            loader,
            state: Mutex::new(CacheState::default()),
            drained: Condvar::new(),
            invalidations: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Returns the configured library paths that can be loaded.
    fn library_paths(&self) -> Result<Vec<PathBuf>, TokenError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in &self.config.library_paths {
            if paths.contains(path) {
                continue;
            }
            if self.loader.is_available(path) {
                paths.push(path.clone());
            } else {
                warn!("Skipping unavailable token library '{}'", path.display());
            }
        }
        if paths.is_empty() {
            Err(TokenError::configuration("No valid library path found"))
        } else {
            Ok(paths)
        }
    }

    /// Returns a context for every opened library.
    ///
    /// Opens all available libraries first if none are open. A library
    /// must not be loaded twice, so while an invalidation is still closing
    /// the previous instances this waits for it to finish.
    pub fn acquire_store_references(
        &self,
    ) -> Result<Vec<ScopedContext<StoreReference>>, TokenError> {
        let mut state = self.lock();
        if state.stores.is_empty() && state.draining > 0 {
            debug!("Waiting for token libraries to be closed");
            state = self
                .drained
                .wait_while(state, |state| state.draining > 0)
                .unwrap_or_else(|err| err.into_inner());
        }
        if state.stores.is_empty() {
            let mut stores = Vec::new();
            for path in self.library_paths()? {
                let store = StoreReference::open(
                    self.loader.as_ref(),
                    &path,
                    self.config.pin_provider(),
                )?;
                stores.push(Arc::new(store));
            }
            state.stores = stores;
        }
        Ok(state
            .stores
            .iter()
            .map(|store| ScopedContext::new(store.clone()))
            .collect())
    }

    /// Returns a context for the certificate `certificate_id` usable with
    /// `credential`.
    ///
    /// On a cache miss this checks token health, authorizes the credential
    /// and searches the libraries in order. The first certificate with a
    /// private key on a token the credential unlocks wins.
    pub fn acquire_certificate_reference(
        &self,
        credential: &str,
        certificate_id: &str,
    ) -> Result<ScopedContext<CertificateReference>, TokenError> {
        let key = (credential.to_string(), certificate_id.to_uppercase());

        let generation = {
            let state = self.lock();
            if let Some(cert) = state.certificates.get(&key) {
                return Ok(ScopedContext::new(cert.clone()));
            }
            state.generation
        };

        self.validate_token_health()?;
        let authorized = self.authorized_tokens(credential)?;

        let cert = {
            let stores = self.acquire_store_references()?;
            let found = stores.iter().find_map(|store| {
                store
                    .find_certificate(certificate_id, &authorized)
                    .map(|found| (store, found))
            });
            match found {
                Some((store, found)) => {
                    debug!(
                        "Found certificate {} on token '{}' in '{}'",
                        found.certificate.thumbprint,
                        found.serial_number,
                        store.path().display()
                    );
                    Arc::new(CertificateReference::new(store.clone(), found))
                }
                None => return Err(TokenError::not_found(certificate_id)),
            }
        };

        let mut state = self.lock();
        if state.generation == generation {
            let cert = state.certificates.entry(key).or_insert(cert).clone();
            Ok(ScopedContext::new(cert))
        } else {
            // The cache was invalidated while we searched. The certificate
            // still works but must not outlive this call in the cache.
            debug!("Not caching certificate {certificate_id} found during invalidation");
            Ok(ScopedContext::new(cert))
        }
    }

    /// Returns the serial numbers of the tokens this credential unlocks.
    fn authorized_tokens(
        &self,
        credential: &str,
    ) -> Result<HashSet<String>, TokenError> {
        let cred = ClientCredential::decode(credential);
        let tokens = self.config.tenant_tokens(&cred.tenant).ok_or_else(|| {
            TokenError::credential(format!("unknown tenant '{}'", cred.tenant))
        })?;

        let authorized: HashSet<String> = tokens
            .iter()
            .filter(|token| match self.config.token_pin(token) {
                Some(pin) => self.material.verify_secret(
                    &cred.secret,
                    &cred.tenant,
                    &cred.client,
                    token,
                    pin,
                ),
                None => false,
            })
            .cloned()
            .collect();

        if authorized.is_empty() {
            Err(TokenError::credential(format!(
                "client secret of '{}' for tenant '{}' matches no token",
                cred.client, cred.tenant
            )))
        } else {
            Ok(authorized)
        }
    }

    /// Fails if any token reports PIN lockout or near-lockout.
    fn validate_token_health(&self) -> Result<(), TokenError> {
        let mut problems = Vec::new();
        for infos in self.token_infos()? {
            for token in &infos.tokens {
                let token_problems = token.health_problems();
                if !token_problems.is_empty() {
                    problems.push(format!(
                        "token '{}': {}",
                        token.serial_number,
                        token_problems.join(", ")
                    ));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            let msg = problems.join("; ");
            error!("Unhealthy tokens found: {msg}");
            Err(TokenError::token_health(msg))
        }
    }

    /// Reads library, slot and token information from every library.
    pub fn token_infos(&self) -> Result<Vec<TokenInfos>, TokenError> {
        self.acquire_store_references()?
            .iter()
            .map(|store| store.token_infos())
            .collect()
    }

    /// Returns whether some opened library had no token in any slot.
    ///
    /// This looks at what the libraries saw when they were opened, since
    /// that is what certificates are searched in. A token inserted later
    /// only becomes visible after the cache is invalidated. Libraries that
    /// cannot be opened count as having no token.
    pub fn no_token_present(&self) -> bool {
        match self.acquire_store_references() {
            Ok(stores) => stores.iter().any(|store| store.no_token_present()),
            Err(TokenError::Driver(msg)) => {
                debug!("Cannot open token libraries: {msg}");
                true
            }
            Err(_) => false,
        }
    }

    /// Empties the cache and closes every library.
    ///
    /// Blocks until all outstanding contexts have been released. The
    /// caller must not hold any context itself.
    pub fn invalidate_all(&self) {
        let (certificates, stores) = {
            let mut state = self.lock();
            state.generation += 1;
            state.draining += 1;
            let certificates: Vec<_> =
                state.certificates.drain().map(|(_, cert)| cert).collect();
            (certificates, std::mem::take(&mut state.stores))
        };

        for cert in &certificates {
            cert.ref_count().wait_until_unused(cert.as_ref());
            cert.release_store();
        }

        for store in &stores {
            store.ref_count().wait_until_unused(store.as_ref());
            store.close();
        }

        {
            let mut state = self.lock();
            state.draining -= 1;
        }
        self.drained.notify_all();

        self.invalidations.fetch_add(1, Ordering::AcqRel);
        info!(
            "Invalidated token access cache: released {} certificates and {} libraries",
            certificates.len(),
            stores.len()
        );
    }

    /// Returns how often the cache has been invalidated.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Acquire)
    }

    /// Returns the number of cached certificates.
    pub fn cached_certificates(&self) -> usize {
        self.lock().certificates.len()
    }

    /// Returns the number of opened libraries.
    pub fn cached_stores(&self) -> usize {
        self.lock().stores.len()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::test::{MockLoader, MockToken, mock_config, mock_credential};

    fn cache(loader: &Arc<MockLoader>) -> TokenAccessCache {
        TokenAccessCache::new(Arc::new(mock_config()), loader.clone())
    }

    #[test]
    fn stores_open_once() {
        let loader = MockLoader::with_tokens(vec![MockToken::new("T1")]);
        let cache = cache(&loader);
        let first = cache.acquire_store_references().unwrap();
        let second = cache.acquire_store_references().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(loader.opens(), 1);
        assert_eq!(first[0].ref_count().count(), 2);
    }

    #[test]
    fn no_valid_library_path() {
        let loader = MockLoader::with_tokens(vec![MockToken::new("T1")]);
        loader.set_available(false);
        let cache = cache(&loader);
        assert!(matches!(
            cache.acquire_store_references(),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn certificate_is_cached() {
        let token = MockToken::new("T1");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        let cache = cache(&loader);
        let credential = mock_credential("acme", "client1", "T1", "1234");

        let one = cache
            .acquire_certificate_reference(&credential, &thumbprint)
            .unwrap();
        let two = cache
            .acquire_certificate_reference(&credential, &thumbprint.to_lowercase())
            .unwrap();
        assert!(Arc::ptr_eq(one.shared(), two.shared()));
        assert_eq!(cache.cached_certificates(), 1);
        assert_eq!(one.ref_count().count(), 2);
    }

    #[test]
    fn unknown_tenant_and_wrong_secret() {
        let token = MockToken::new("T1");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        let cache = cache(&loader);

        let credential = mock_credential("nobody", "client1", "T1", "1234");
        assert!(matches!(
            cache.acquire_certificate_reference(&credential, &thumbprint),
            Err(TokenError::Credential(_))
        ));

        let credential = ClientCredential::new("acme", "client1", "wrong").encode();
        assert!(matches!(
            cache.acquire_certificate_reference(&credential, &thumbprint),
            Err(TokenError::Credential(_))
        ));
        assert_eq!(cache.cached_certificates(), 0);
    }

    #[test]
    fn certificate_on_unauthorized_token_is_not_found() {
        let token = MockToken::new("T3");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![MockToken::new("T1"), token]);
        let cache = cache(&loader);
        let credential = mock_credential("acme", "client1", "T1", "1234");
        assert!(matches!(
            cache.acquire_certificate_reference(&credential, &thumbprint),
            Err(TokenError::CertificateNotFound(_))
        ));
    }

    #[test]
    fn certificate_without_private_key_is_not_found() {
        let token = MockToken::new("T1").without_private_key();
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        let cache = cache(&loader);
        let credential = mock_credential("acme", "client1", "T1", "1234");
        assert!(matches!(
            cache.acquire_certificate_reference(&credential, &thumbprint),
            Err(TokenError::CertificateNotFound(_))
        ));
    }

    #[test]
    fn locked_token_fails_health_check() {
        let token = MockToken::new("T1");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        loader.set_user_pin_locked("T1", true);
        let cache = cache(&loader);
        let credential = mock_credential("acme", "client1", "T1", "1234");
        assert!(matches!(
            cache.acquire_certificate_reference(&credential, &thumbprint),
            Err(TokenError::TokenHealth(_))
        ));
    }

    #[test]
    fn invalidate_closes_everything() {
        let token = MockToken::new("T1");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        let cache = cache(&loader);
        let credential = mock_credential("acme", "client1", "T1", "1234");

        let cert = cache
            .acquire_certificate_reference(&credential, &thumbprint)
            .unwrap();
        drop(cert);

        cache.invalidate_all();
        assert_eq!(cache.invalidations(), 1);
        assert_eq!(cache.cached_certificates(), 0);
        assert_eq!(cache.cached_stores(), 0);
        assert_eq!(loader.closes(), 1);

        let cert = cache
            .acquire_certificate_reference(&credential, &thumbprint)
            .unwrap();
        assert!(cert.store().is_open());
        assert_eq!(loader.opens(), 2);
    }

    #[test]
    fn no_token_present_follows_opened_libraries() {
        let loader = MockLoader::with_tokens(vec![MockToken::new("T1")]);
        let cache = cache(&loader);
        assert!(!cache.no_token_present());

        // Removal is only seen once the library is reopened.
        loader.remove_token("T1");
        assert!(!cache.no_token_present());
        cache.invalidate_all();
        assert!(cache.no_token_present());

        // So is reinsertion, which is why a library without tokens is
        // worth reopening.
        loader.insert_token("T1");
        assert!(cache.no_token_present());
        cache.invalidate_all();
        assert!(!cache.no_token_present());
    }

    #[test]
    fn libraries_are_not_reopened_while_draining() {
        let token = MockToken::new("T1");
        let thumbprint = token.thumbprint();
        let loader = MockLoader::with_tokens(vec![token]);
        let cache = Arc::new(cache(&loader));
        let credential = mock_credential("acme", "client1", "T1", "1234");

        let held = cache
            .acquire_certificate_reference(&credential, &thumbprint)
            .unwrap();

        let invalidator = {
            let cache = cache.clone();
            thread::spawn(move || cache.invalidate_all())
        };
        while cache.cached_stores() > 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let found = Arc::new(AtomicBool::new(false));
        let searcher = {
            let cache = cache.clone();
            let found = found.clone();
            thread::spawn(move || {
                let cert = cache
                    .acquire_certificate_reference(&credential, &thumbprint)
                    .unwrap();
                found.store(true, Ordering::Release);
                assert!(cert.store().is_open());
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!found.load(Ordering::Acquire));
        assert_eq!(loader.opens(), 1);
        assert_eq!(loader.closes(), 0);

        drop(held);
        invalidator.join().unwrap();
        searcher.join().unwrap();
        assert!(loader.opens() - loader.closes() <= 1);
        assert_eq!(loader.opens(), 2);
        assert_eq!(loader.closes(), 1);
    }
}
