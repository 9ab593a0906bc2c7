//! Supplying PINs for token logins.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use secrecy::{ExposeSecret, SecretVec};

use crate::api::token::TokenInfo;

thread_local! {
    /// How many suppression scopes are active on this thread.
    static SUPPRESS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

//------------ PinResult -----------------------------------------------------

/// The answer to a PIN request.
///
/// If `cancel` is set, the login must be skipped and `pin` is `None`.
pub struct PinResult {
    pub cancel: bool,
    pub pin: Option<SecretVec<u8>>,
}

impl PinResult {
    fn cancel() -> Self {
        PinResult { cancel: true, pin: None }
    }

    fn pin(pin: &[u8]) -> Self {
        PinResult {
            cancel: false,
            pin: Some(SecretVec::new(pin.to_vec())),
        }
    }
}

impl fmt::Debug for PinResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PinResult")
            .field("cancel", &self.cancel)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

//------------ PinProvider ---------------------------------------------------

/// Hands out the configured PIN for a token by its serial number.
///
/// Only one PIN per token is supported: the key PIN is the token PIN.
pub struct PinProvider {
    pins: HashMap<String, SecretVec<u8>>,
}

impl PinProvider {
    /// Creates a provider from serial numbers and PINs.
    ///
    /// Serial numbers are matched case-insensitively.
    pub fn new<'a>(pins: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        PinProvider {
            pins: pins
                .into_iter()
                .map(|(serial, pin)| {
                    (normalize_serial(serial), SecretVec::new(pin.to_vec()))
                })
                .collect(),
        }
    }

    pub fn token_pin(&self, token: &TokenInfo) -> PinResult {
        if Self::is_suppressed() {
            return PinResult::cancel();
        }
        match self.pins.get(&normalize_serial(&token.serial_number)) {
            Some(pin) => PinResult::pin(pin.expose_secret()),
            None => PinResult::cancel(),
        }
    }

    pub fn key_pin(&self, token: &TokenInfo) -> PinResult {
        self.token_pin(token)
    }

    /// Returns whether a PIN is configured for this serial number.
    pub fn has_pin(&self, serial_number: &str) -> bool {
        self.pins.contains_key(&normalize_serial(serial_number))
    }

    /// Cancels every PIN request on this thread until the guard drops.
    ///
    /// Scopes nest. Other threads are not affected.
    pub fn suppress_prompting() -> SuppressGuard {
        SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() + 1));
        SuppressGuard { _not_send: PhantomData }
    }

    pub fn is_suppressed() -> bool {
        SUPPRESS_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl fmt::Debug for PinProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PinProvider")
            .field("tokens", &self.pins.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn normalize_serial(serial: &str) -> String {
    serial.trim().to_lowercase()
}

//------------ SuppressGuard -------------------------------------------------

/// An active PIN suppression scope.
///
/// The depth counter is per thread, so the guard must be dropped on the
/// thread that created it.
#[must_use]
pub struct SuppressGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESS_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    fn token(serial: &str) -> TokenInfo {
        TokenInfo {
            serial_number: serial.to_string(),
            ..Default::default()
        }
    }

    fn provider() -> PinProvider {
        PinProvider::new([("T1", b"1234".as_slice())])
    }

    #[test]
    fn returns_configured_pin() {
        let res = provider().token_pin(&token("t1"));
        assert!(!res.cancel);
        assert_eq!(res.pin.unwrap().expose_secret().as_slice(), b"1234");
    }

    #[test]
    fn unknown_token_cancels() {
        let res = provider().key_pin(&token("T2"));
        assert!(res.cancel);
        assert!(res.pin.is_none());
    }

    #[test]
    fn suppression_nests() {
        let pins = provider();
        {
            let _outer = PinProvider::suppress_prompting();
            {
                let _inner = PinProvider::suppress_prompting();
                assert!(pins.token_pin(&token("T1")).cancel);
            }
            assert!(pins.token_pin(&token("T1")).cancel);
        }
        assert!(!pins.token_pin(&token("T1")).cancel);
    }

    #[test]
    fn suppression_is_per_thread() {
        let pins = Arc::new(provider());
        let entered = Arc::new(Barrier::new(2));
        let checked = Arc::new(Barrier::new(2));

        let handle = {
            let entered = entered.clone();
            let checked = checked.clone();
            thread::spawn(move || {
                let _guard = PinProvider::suppress_prompting();
                entered.wait();
                checked.wait();
                assert!(PinProvider::is_suppressed());
            })
        };

        entered.wait();
        assert!(!pins.token_pin(&token("T1")).cancel);
        checked.wait();
        handle.join().unwrap();
    }

    #[test]
    fn debug_does_not_show_pins() {
        let pins = provider();
        let debug = format!("{pins:?} {:?}", pins.token_pin(&token("T1")));
        assert!(!debug.contains("1234"));
    }
}
