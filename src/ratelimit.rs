// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! A per-RPC-name concurrency limiter. A limit of `n` for a name means at
//! most `n` requests of that RPC are in flight at once; unnamed RPCs are not
//! limited. The whole limiter can be switched off, which is the default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

#[derive(Debug)]
struct Slot {
    limit: usize,
    running: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    enabled: AtomicBool,
    slots: HashMap<String, Arc<Slot>>,
}

/// Releases the slot on drop.
pub struct Token {
    slot: Arc<Slot>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.slot.running.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RateLimiter {
    pub fn new(enabled: bool, limits: &HashMap<String, usize>) -> RateLimiter {
        let slots = limits
            .iter()
            .map(|(name, limit)| {
                (
                    name.clone(),
                    Arc::new(Slot {
                        limit: *limit,
                        running: AtomicUsize::new(0),
                    }),
                )
            })
            .collect();
        RateLimiter {
            enabled: AtomicBool::new(enabled),
            slots,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Admits one request of `name`, or fails with `RateLimitExceeded`.
    pub fn allow(&self, name: &str) -> Result<Option<Token>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let slot = match self.slots.get(name) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let mut running = slot.running.load(Ordering::Acquire);
        loop {
            if running >= slot.limit {
                return Err(Error::RateLimitExceeded(name.to_owned()));
            }
            match slot.running.compare_exchange_weak(
                running,
                running + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Some(Token { slot: slot.clone() }));
                }
                Err(actual) => running = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_unlimited() {
        let mut limits = HashMap::new();
        limits.insert("GetRegion".to_owned(), 0);
        let limiter = RateLimiter::new(false, &limits);
        for _ in 0..16 {
            assert!(limiter.allow("GetRegion").unwrap().is_none());
        }
    }

    #[test]
    fn test_concurrency_limit() {
        let mut limits = HashMap::new();
        limits.insert("Tso".to_owned(), 2);
        let limiter = RateLimiter::new(true, &limits);

        let t1 = limiter.allow("Tso").unwrap().unwrap();
        let _t2 = limiter.allow("Tso").unwrap().unwrap();
        assert!(limiter.allow("Tso").is_err());
        // Unnamed RPCs pass through.
        assert!(limiter.allow("GetMembers").unwrap().is_none());

        drop(t1);
        let _t3 = limiter.allow("Tso").unwrap().unwrap();
        assert!(limiter.allow("Tso").is_err());
    }
}
