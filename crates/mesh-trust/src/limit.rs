//! Admission control for leaf signing.
//!
//! A positive `csr_max_per_second` meters requests through a token bucket
//! holding a single token. Otherwise a positive `csr_max_concurrent` caps
//! the number of signing requests in flight. Either way a request that
//! cannot be admitted within [`CSR_LIMIT_WAIT`] fails with
//! [`Error::RateLimited`].

use crate::config::BuiltinProviderConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Longest a signing request waits for admission.
pub const CSR_LIMIT_WAIT: Duration = Duration::from_millis(500);

const MAX_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub(crate) enum CsrLimiter {
    Unlimited,
    Rate {
        interval: Duration,
        /// Earliest instant the next request may proceed.
        next: Mutex<Instant>,
    },
    Concurrency(Arc<Semaphore>),
}

/// Held for the duration of one signing request.
#[derive(Debug)]
pub(crate) struct CsrPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl CsrLimiter {
    pub(crate) fn from_config(config: &BuiltinProviderConfig) -> Self {
        if config.csr_max_per_second > 0.0 {
            CsrLimiter::Rate {
                interval: Duration::try_from_secs_f64(1.0 / config.csr_max_per_second)
                    .unwrap_or(MAX_INTERVAL)
                    .min(MAX_INTERVAL),
                next: Mutex::new(Instant::now()),
            }
        } else if config.csr_max_concurrent > 0 {
            CsrLimiter::Concurrency(Arc::new(Semaphore::new(
                config.csr_max_concurrent as usize,
            )))
        } else {
            CsrLimiter::Unlimited
        }
    }

    pub(crate) async fn admit(&self) -> Result<CsrPermit> {
        match self {
            CsrLimiter::Unlimited => Ok(CsrPermit { _permit: None }),
            CsrLimiter::Rate { interval, next } => {
                let wait = {
                    let mut next = next.lock();
                    let now = Instant::now();
                    let slot = (*next).max(now);
                    let wait = slot - now;
                    if wait > CSR_LIMIT_WAIT {
                        return Err(rate_limited());
                    }
                    *next = slot + *interval;
                    wait
                };
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                Ok(CsrPermit { _permit: None })
            }
            CsrLimiter::Concurrency(semaphore) => {
                match tokio::time::timeout(CSR_LIMIT_WAIT, semaphore.clone().acquire_owned()).await
                {
                    Ok(Ok(permit)) => Ok(CsrPermit {
                        _permit: Some(permit),
                    }),
                    _ => Err(rate_limited()),
                }
            }
        }
    }
}

fn rate_limited() -> Error {
    Error::RateLimited("too many certificate signing requests".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_second: f64, concurrent: u32) -> CsrLimiter {
        CsrLimiter::from_config(&BuiltinProviderConfig {
            csr_max_per_second: per_second,
            csr_max_concurrent: concurrent,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unlimited() {
        let limiter = limiter(0.0, 0);
        for _ in 0..100 {
            limiter.admit().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rate_rejects_burst() {
        let limiter = limiter(1.0, 0);
        limiter.admit().await.unwrap();
        let err = limiter.admit().await.unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_waits_within_limit() {
        let limiter = limiter(10.0, 0);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.admit().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let limiter = limiter(0.0, 1);
        let held = limiter.admit().await.unwrap();
        assert!(matches!(
            limiter.admit().await,
            Err(Error::RateLimited(_))
        ));
        drop(held);
        limiter.admit().await.unwrap();
    }

    #[test]
    fn test_rate_takes_precedence_over_concurrency() {
        assert!(matches!(limiter(5.0, 1), CsrLimiter::Rate { .. }));
    }
}
