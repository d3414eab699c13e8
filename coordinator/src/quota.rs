//! Per-nest dispatch budgets. Excess probes are delayed to later ticks,
//! never dropped.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

struct Bucket {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rpm: u32) -> Self {
        Self {
            tokens: rpm as f64,
            capacity: rpm as f64,
            per_second: rpm as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct NestQuotas {
    buckets: HashMap<Uuid, Bucket>,
}

impl NestQuotas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one dispatch token for the nest; `false` means delay.
    pub fn try_dispatch(&mut self, nest_id: Uuid, rpm: u32) -> bool {
        self.try_dispatch_at(nest_id, rpm, Instant::now())
    }

    fn try_dispatch_at(&mut self, nest_id: Uuid, rpm: u32, now: Instant) -> bool {
        self.buckets
            .entry(nest_id)
            .or_insert_with(|| Bucket::new(rpm))
            .try_take(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn budget_exhausts_and_refills() {
        let mut quotas = NestQuotas::new();
        let nest = Uuid::new_v4();
        let start = Instant::now();

        for _ in 0..60 {
            assert!(quotas.try_dispatch_at(nest, 60, start));
        }
        assert!(!quotas.try_dispatch_at(nest, 60, start));

        // One token refills after a second.
        assert!(quotas.try_dispatch_at(nest, 60, start + Duration::from_secs(1)));
    }

    #[test]
    fn nests_do_not_share_buckets() {
        let mut quotas = NestQuotas::new();
        let start = Instant::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..60 {
            assert!(quotas.try_dispatch_at(a, 60, start));
        }
        assert!(!quotas.try_dispatch_at(a, 60, start));
        assert!(quotas.try_dispatch_at(b, 60, start));
    }
}
