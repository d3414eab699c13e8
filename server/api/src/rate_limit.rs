//! Fixed budgets per minute: 100 per authenticated user per nest on the
//! admin surface, 600 per client IP on the public status surface.
//! Breaches answer 429 with `Retry-After`.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::ApiError;

pub const ADMIN_RPM: u32 = 100;
pub const PUBLIC_RPM: u32 = 600;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimits {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, rpm: u32) -> Result<(), ApiError> {
        self.check_at(key, rpm, Instant::now())
    }

    fn check_at(&self, key: &str, rpm: u32, now: Instant) -> Result<(), ApiError> {
        let per_second = rpm as f64 / 60.0;
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: rpm as f64,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_second).min(rpm as f64);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after_seconds = ((1.0 - bucket.tokens) / per_second).ceil() as u64;
            Err(ApiError::RateLimited {
                retry_after_seconds: retry_after_seconds.max(1),
            })
        }
    }
}

/// Budget key for the admin surface.
pub fn admin_key(user_id: &str, nest_id: &str) -> String {
    format!("admin:{user_id}:{nest_id}")
}

/// Budget key for the public surface.
pub fn public_key(client_ip: &str) -> String {
    format!("public:{client_ip}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn budget_exhaustion_returns_retry_after() {
        let limits = RateLimits::new();
        let start = Instant::now();
        for _ in 0..100 {
            limits.check_at("admin:u:n", 100, start).unwrap();
        }
        let err = limits.check_at("admin:u:n", 100, start).unwrap_err();
        let ApiError::RateLimited {
            retry_after_seconds,
        } = err
        else {
            panic!("expected rate limit error");
        };
        assert!(retry_after_seconds >= 1);

        // Refill restores the budget.
        limits
            .check_at("admin:u:n", 100, start + Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn keys_are_isolated() {
        let limits = RateLimits::new();
        let start = Instant::now();
        for _ in 0..100 {
            limits.check_at(&admin_key("a", "n1"), 100, start).unwrap();
        }
        assert!(limits.check_at(&admin_key("a", "n1"), 100, start).is_err());
        assert!(limits.check_at(&admin_key("b", "n1"), 100, start).is_ok());
    }
}
