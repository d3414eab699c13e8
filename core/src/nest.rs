use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier of a nest. Drives service limits, dispatch priority
/// and the per-nest probe rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Unlimited,
}

impl Tier {
    /// Broker message priority: lower value is served first.
    pub fn dispatch_priority(&self) -> u8 {
        match self {
            Tier::Free => 10,
            Tier::Pro => 5,
            Tier::Unlimited => 1,
        }
    }

    pub fn default_services_limit(&self) -> u32 {
        match self {
            Tier::Free => 5,
            Tier::Pro => 50,
            Tier::Unlimited => 1000,
        }
    }

    /// Probe dispatches allowed per minute for a nest of this tier.
    pub fn rpm_per_nest(&self) -> u32 {
        match self {
            Tier::Free => 60,
            Tier::Pro => 600,
            Tier::Unlimited => 6000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: Tier,
    pub services_limit: u32,
    pub team_limit: u32,
    pub valid_until: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn free() -> Self {
        Self {
            tier: Tier::Free,
            services_limit: Tier::Free.default_services_limit(),
            team_limit: 3,
            valid_until: None,
        }
    }
}

/// A tenant organisation. Owns services and users; surfaced publicly at
/// `<subdomain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nest {
    pub id: Uuid,
    pub subdomain: String,
    pub name: String,
    pub owner_email: String,
    pub subscription: Subscription,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Nest {
    pub fn new(subdomain: impl Into<String>, name: impl Into<String>, owner_email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subdomain: subdomain.into(),
            name: name.into(),
            owner_email: owner_email.into(),
            subscription: Subscription::free(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Subdomains become DNS labels: lowercase alphanumerics and hyphens,
/// no leading/trailing hyphen, at most 63 bytes.
pub fn is_dns_safe_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    s.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_validation() {
        assert!(is_dns_safe_subdomain("acme-status"));
        assert!(is_dns_safe_subdomain("a1"));
        assert!(!is_dns_safe_subdomain(""));
        assert!(!is_dns_safe_subdomain("-leading"));
        assert!(!is_dns_safe_subdomain("trailing-"));
        assert!(!is_dns_safe_subdomain("UpperCase"));
        assert!(!is_dns_safe_subdomain("dots.here"));
    }

    #[test]
    fn tier_priorities_are_ordered() {
        assert!(Tier::Unlimited.dispatch_priority() < Tier::Pro.dispatch_priority());
        assert!(Tier::Pro.dispatch_priority() < Tier::Free.dispatch_priority());
    }
}
