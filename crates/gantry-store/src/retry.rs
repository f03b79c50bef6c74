//! Bounded retry for contended store operations.
//!
//! Mirrors the caller-side deadlock-retry contract of a SQL row store:
//! operations that fail with [`StoreError::Contention`] are re-driven a
//! bounded number of times before the error propagates.

use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// How many times a contended operation is re-driven before giving up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Run `op` up to [`MAX_ATTEMPTS`] times, retrying only retryable errors.
pub fn with_retries<T>(mut op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %e, "store contention, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_success() {
        let result = with_retries(|| Ok::<_, StoreError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retries_contention_then_succeeds() {
        let mut calls = 0;
        let result = with_retries(|| {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Contention("lock wait".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retries(|| {
            calls += 1;
            Err(StoreError::Contention("lock wait".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, MAX_ATTEMPTS);
    }

    #[test]
    fn non_retryable_errors_fail_fast() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retries(|| {
            calls += 1;
            Err(StoreError::NotFound("device 9".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
