// ABOUTME: Per-tenant request budgets for each rate-limit category
// ABOUTME: Configured defaults with optional per-organization overrides

use std::collections::HashMap;

/// Endpoint families counted separately per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    SandboxCreate,
    Exec,
    Read,
}

impl RateCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RateCategory::SandboxCreate => "sandbox_create",
            RateCategory::Exec => "exec",
            RateCategory::Read => "read",
        }
    }
}

/// Requests allowed per minute in each category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub sandbox_create_per_min: u32,
    pub exec_per_min: u32,
    pub read_per_min: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            sandbox_create_per_min: 30,
            exec_per_min: 120,
            read_per_min: 600,
        }
    }
}

impl RateLimits {
    pub fn for_category(&self, category: RateCategory) -> u32 {
        match category {
            RateCategory::SandboxCreate => self.sandbox_create_per_min,
            RateCategory::Exec => self.exec_per_min,
            RateCategory::Read => self.read_per_min,
        }
    }
}

/// Source of tenant-specific limits.
pub trait QuotaProvider: Send + Sync {
    fn limits(&self, org_id: &str) -> RateLimits;
}

/// Limits from configuration: one default plus explicit per-org entries.
#[derive(Debug, Clone, Default)]
pub struct StaticQuotas {
    defaults: RateLimits,
    overrides: HashMap<String, RateLimits>,
}

impl StaticQuotas {
    pub fn new(defaults: RateLimits) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, org_id: impl Into<String>, limits: RateLimits) -> Self {
        self.overrides.insert(org_id.into(), limits);
        self
    }
}

impl QuotaProvider for StaticQuotas {
    fn limits(&self, org_id: &str) -> RateLimits {
        self.overrides
            .get(org_id)
            .copied()
            .unwrap_or(self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_defaults() {
        let generous = RateLimits {
            sandbox_create_per_min: 100,
            ..RateLimits::default()
        };
        let quotas = StaticQuotas::new(RateLimits::default()).with_override("org_big", generous);

        assert_eq!(
            quotas.limits("org_big").for_category(RateCategory::SandboxCreate),
            100
        );
        assert_eq!(
            quotas.limits("org_small").for_category(RateCategory::SandboxCreate),
            30
        );
        assert_eq!(quotas.limits("org_small").for_category(RateCategory::Read), 600);
    }
}
