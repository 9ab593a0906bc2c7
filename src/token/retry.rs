//! Retrying token operations after invalidating the cache.
//!
//! Token libraries fail in ways that a fresh start often fixes: a device
//! was unplugged and plugged back in, a session went stale, the library
//! lost track of its slots. Every public operation therefore runs through
//! [`with_retry`]. On a failure that may be caused by such a condition the
//! whole cache is invalidated and the operation runs once more.

use std::time::Duration;

use backoff::backoff::Backoff;
use log::{error, warn};

use crate::commons::error::TokenError;
use crate::constants::TOKEN_ACCESS_MAX_RETRIES;

use super::cache::TokenAccessCache;

//------------ LimitedRetries ------------------------------------------------

/// A backoff policy that allows a fixed number of immediate retries.
#[derive(Clone, Debug)]
pub struct LimitedRetries {
    max: usize,
    left: usize,
}

impl LimitedRetries {
    pub fn new(max: usize) -> Self {
        LimitedRetries { max, left: max }
    }
}

impl Default for LimitedRetries {
    fn default() -> Self {
        LimitedRetries::new(TOKEN_ACCESS_MAX_RETRIES)
    }
}

impl Backoff for LimitedRetries {
    fn reset(&mut self) {
        self.left = self.max;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.left > 0 {
            self.left -= 1;
            Some(Duration::ZERO)
        } else {
            None
        }
    }
}

//------------ with_retry ----------------------------------------------------

/// Runs `op` against the cache, retrying once after an invalidation.
///
/// Driver errors are always retried. A missing certificate is retried
/// only if some library currently shows no token at all, so a certificate
/// that simply is not there fails right away. Everything else fails
/// right away, too. `op` must not keep any context it acquired once it
/// returns, or the invalidation would wait for it forever.
pub fn with_retry<T, F>(
    cache: &TokenAccessCache,
    desc: &str,
    mut op: F,
) -> Result<T, TokenError>
where
    F: FnMut(&TokenAccessCache) -> Result<T, TokenError>,
{
    let notify = |err: TokenError, _next: Duration| {
        warn!("{desc} failed, invalidating token access cache and retrying: {err}");
        cache.invalidate_all();
    };

    let attempt = || op(cache).map_err(|err| classify(cache, err));

    backoff::retry_notify(LimitedRetries::default(), attempt, notify).map_err(
        |err| match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => {
                error!("{desc} failed, retries exhausted: {err}");
                err
            }
        },
    )
}

/// Decides whether a failure is worth an invalidation and a retry.
fn classify(cache: &TokenAccessCache, err: TokenError) -> backoff::Error<TokenError> {
    match err {
        TokenError::Driver(_) => backoff::Error::transient(err),
        TokenError::CertificateNotFound(_) if cache.no_token_present() => {
            backoff::Error::transient(err)
        }
        _ => backoff::Error::permanent(err),
    }
}


//============ Tests =========================================================
