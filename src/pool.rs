//! Credential pool with cooldown-aware rotation
//!
//! Holds the interchangeable API keys for one provider. Rate-limited keys are
//! put on cooldown and skipped; cooldowns clear lazily once their expiry
//! passes. Only when every key is cooling down, even after sweeping expired
//! entries, does the pool report exhaustion.

use crate::{Error, Result};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A credential selected from the pool
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    /// Stable index of this key within the pool
    pub index: usize,

    /// The secret value, sent as the auth header
    pub secret: String,
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

struct PoolState {
    secrets: Vec<String>,
    /// Currently selected index; at most one key is active at a time
    active: usize,
    /// Cooldown expiry per slot; `None` means usable
    cooldowns: Vec<Option<Instant>>,
}

impl PoolState {
    fn cooling(&self, index: usize, now: Instant) -> bool {
        matches!(self.cooldowns[index], Some(expiry) if expiry > now)
    }

    /// Clear every cooldown whose expiry has passed
    fn sweep(&mut self, now: Instant) {
        for slot in self.cooldowns.iter_mut() {
            if matches!(slot, Some(expiry) if *expiry <= now) {
                *slot = None;
            }
        }
    }

    /// Advance `active` to the next usable slot, wrapping. Sweeps expired
    /// cooldowns before concluding that the pool is exhausted.
    fn advance(&mut self, now: Instant) -> Result<usize> {
        let n = self.secrets.len();
        for offset in 0..n {
            let candidate = (self.active + offset) % n;
            if !self.cooling(candidate, now) {
                self.active = candidate;
                return Ok(candidate);
            }
        }

        self.sweep(now);
        for offset in 0..n {
            let candidate = (self.active + offset) % n;
            if self.cooldowns[candidate].is_none() {
                self.active = candidate;
                return Ok(candidate);
            }
        }

        Err(Error::PoolExhausted)
    }
}

/// Pool of interchangeable credentials for one provider.
///
/// All mutation happens under a single mutex; the lock is never held across
/// an await point.
pub struct KeyPool {
    inner: Mutex<PoolState>,
}

impl KeyPool {
    /// Create a pool from the configured key list
    pub fn new(secrets: Vec<String>) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::Config("credential pool must not be empty".into()));
        }
        let cooldowns = vec![None; secrets.len()];
        Ok(KeyPool {
            inner: Mutex::new(PoolState {
                secrets,
                active: 0,
                cooldowns,
            }),
        })
    }

    /// Number of credentials in the pool
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().secrets.len()
    }

    /// Whether the pool holds no credentials (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The currently selected credential.
    ///
    /// If the selected slot is cooling down, selection advances first (the
    /// caller may race another request that just rotated). Returns
    /// [`Error::PoolExhausted`] when every key is cooling down.
    pub fn current(&self) -> Result<ApiKey> {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        let index = state.advance(now)?;
        Ok(ApiKey {
            index,
            secret: state.secrets[index].clone(),
        })
    }

    /// Record a failure for `index` and rotate to the next usable credential.
    ///
    /// A nonzero `cooldown` marks the key unusable until `now + cooldown`;
    /// the pool never invents a duration itself; callers derive it from the
    /// provider's rate-limit hint or the configured default.
    pub fn mark_failed(&self, index: usize, cooldown: Duration) -> Result<ApiKey> {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();
        if index >= state.secrets.len() {
            return Err(Error::Config(format!("key index {} out of range", index)));
        }

        if !cooldown.is_zero() {
            state.cooldowns[index] = Some(now + cooldown);
        }
        tracing::warn!(key = index, cooldown_ms = cooldown.as_millis() as u64, "credential cooling down, rotating");

        state.active = (index + 1) % state.secrets.len();
        let next = state.advance(now)?;
        Ok(ApiKey {
            index: next,
            secret: state.secrets[next].clone(),
        })
    }

    /// Whether the credential at `index` is currently usable
    pub fn is_available(&self, index: usize) -> bool {
        let now = Instant::now();
        let state = self.inner.lock().unwrap();
        index < state.secrets.len() && !state.cooling(index, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        KeyPool::new((0..n).map(|i| format!("sk-{}", i)).collect()).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(KeyPool::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_current_returns_first_key() {
        let pool = pool(3);
        let key = pool.current().unwrap();
        assert_eq!(key.index, 0);
        assert_eq!(key.secret, "sk-0");
    }

    #[test]
    fn test_rotation_skips_cooling_keys() {
        let pool = pool(3);
        let next = pool.mark_failed(0, Duration::from_secs(60)).unwrap();
        assert_eq!(next.index, 1);
        assert!(!pool.is_available(0));
        assert!(pool.is_available(1));
    }

    #[test]
    fn test_all_cooling_is_exhausted() {
        // After every key has been rate limited with a nonzero cooldown the
        // pool reports exhaustion; before that it always yields a usable key.
        let pool = pool(3);
        let k1 = pool.mark_failed(0, Duration::from_secs(60)).unwrap();
        assert_eq!(k1.index, 1);
        let k2 = pool.mark_failed(1, Duration::from_secs(60)).unwrap();
        assert_eq!(k2.index, 2);
        assert!(matches!(
            pool.mark_failed(2, Duration::from_secs(60)),
            Err(Error::PoolExhausted)
        ));
        assert!(matches!(pool.current(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_zero_cooldown_rotates_without_marking() {
        let pool = pool(2);
        let next = pool.mark_failed(0, Duration::ZERO).unwrap();
        assert_eq!(next.index, 1);
        assert!(pool.is_available(0));
    }

    #[test]
    fn test_cooldown_expiry_restores_key() {
        // A key marked failed with cooldown T is selectable again at any
        // selection attempt at time >= T, without an explicit reset.
        let pool = pool(2);
        pool.mark_failed(0, Duration::from_millis(20)).unwrap();
        pool.mark_failed(1, Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let key = pool.current().unwrap();
        assert!(key.index < 2);
        assert!(pool.is_available(0));
        assert!(pool.is_available(1));
    }

    #[test]
    fn test_wraps_past_cooling_slot() {
        let pool = pool(3);
        pool.mark_failed(1, Duration::from_secs(60)).unwrap();
        // Failing key 2 should wrap to key 0, skipping cooling key 1
        let next = pool.mark_failed(2, Duration::from_secs(60)).unwrap();
        assert_eq!(next.index, 0);
    }
}
