//! Exponential backoff with jitter.
//!
//! `delay = (first_delay + 2^attempt) seconds + uniform(0, that * 100) milliseconds`

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of jitter in milliseconds
pub trait JitterSource: Send + Sync {
    /// Uniform draw from `0..upper`
    fn jitter_ms(&self, upper: u64) -> u64;
}

/// Thread-local RNG; callers on different threads never contend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn jitter_ms(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Deterministic jitter for reproducible runs
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn jitter_ms(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..upper)
    }
}

/// No jitter at all; delays are exactly the base
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter_ms(&self, _upper: u64) -> u64 {
        0
    }
}

/// Computes randomized exponential retry delays
#[derive(Clone)]
pub struct BackoffEngine {
    jitter: Arc<dyn JitterSource>,
}

impl BackoffEngine {
    pub fn new(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    /// Delay before retry number `attempt` (1 for the first retry)
    pub fn delay(&self, first_delay_secs: u64, attempt: u32) -> Duration {
        let base_secs = base_delay_secs(first_delay_secs, attempt);
        let jitter = self.jitter.jitter_ms(base_secs.saturating_mul(100));
        Duration::from_secs(base_secs).saturating_add(Duration::from_millis(jitter))
    }
}

impl Default for BackoffEngine {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRngJitter))
    }
}

impl std::fmt::Debug for BackoffEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffEngine").finish_non_exhaustive()
    }
}

/// Deterministic part of the delay, in whole seconds
pub fn base_delay_secs(first_delay_secs: u64, attempt: u32) -> u64 {
    first_delay_secs.saturating_add(2u64.saturating_pow(attempt))
}
