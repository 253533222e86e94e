//! Per-request cost resolution.
//!
//! Cost is resolved in a fixed order: an explicit client header (only when the
//! [`ClientCostPolicy`] honors it), an active per-service pricing row, the
//! configured default, and finally [`FALLBACK_CREDIT_COST`]. An inactive
//! pricing row falls through to the next tier.

use serde::{Deserialize, Serialize};

use crate::credits::{FALLBACK_CREDIT_COST, MAX_CREDITS};

/// Persisted price of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePricing {
    /// Service slug.
    pub service: String,
    /// Credits charged per request.
    pub cost: u64,
    /// Inactive rows are ignored.
    pub is_active: bool,
}

/// Which tier produced the charged cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// The `x-ghost-credit-cost` request header.
    Header,
    /// The service pricing table.
    Pricing,
    /// The server's configured default cost.
    EnvDefault,
    /// The hardcoded fallback.
    Fallback,
}

/// Whether a client may declare its own cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCostPolicy {
    /// The cost header is ignored.
    #[default]
    Ignore,
    /// A well-formed cost header wins over every other tier.
    Honor,
}

/// Cost resolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPolicy {
    /// Treatment of the client cost header.
    #[serde(default)]
    pub client_cost: ClientCostPolicy,
    /// Default cost when no active pricing row exists.
    #[serde(default)]
    pub default_cost: Option<u64>,
}

/// The cost header is present, honored, and not a positive integer in range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid credit cost header: {0:?}")]
pub struct InvalidCostHeader(pub String);

impl CostPolicy {
    /// Resolves the cost of one request.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCostHeader`] if the client header is honored but is
    /// not an integer in `1..=MAX_CREDITS`.
    pub fn resolve(
        &self,
        header: Option<&str>,
        pricing: Option<&ServicePricing>,
    ) -> Result<(u64, CostSource), InvalidCostHeader> {
        if let (ClientCostPolicy::Honor, Some(raw)) = (self.client_cost, header) {
            let cost = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|c| (1..=MAX_CREDITS).contains(c))
                .ok_or_else(|| InvalidCostHeader(raw.to_owned()))?;
            return Ok((cost, CostSource::Header));
        }
        if let Some(p) = pricing.filter(|p| p.is_active && p.cost > 0) {
            return Ok((p.cost, CostSource::Pricing));
        }
        if let Some(cost) = self.default_cost.filter(|c| *c > 0) {
            return Ok((cost, CostSource::EnvDefault));
        }
        Ok((FALLBACK_CREDIT_COST, CostSource::Fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(cost: u64, is_active: bool) -> ServicePricing {
        ServicePricing {
            service: "weather".into(),
            cost,
            is_active,
        }
    }

    #[test]
    fn test_header_ignored_when_override_disabled() {
        let policy = CostPolicy {
            client_cost: ClientCostPolicy::Ignore,
            default_cost: Some(1),
        };
        assert_eq!(
            policy.resolve(Some("5"), None).unwrap(),
            (1, CostSource::EnvDefault)
        );
        // A garbage header is irrelevant when ignored.
        assert_eq!(
            policy.resolve(Some("lots"), None).unwrap(),
            (1, CostSource::EnvDefault)
        );
    }

    #[test]
    fn test_header_honored_when_allowed() {
        let policy = CostPolicy {
            client_cost: ClientCostPolicy::Honor,
            default_cost: Some(1),
        };
        let active = pricing(3, true);
        assert_eq!(
            policy.resolve(Some("5"), Some(&active)).unwrap(),
            (5, CostSource::Header)
        );
        assert!(policy.resolve(Some("0"), None).is_err());
        assert!(policy.resolve(Some("-2"), None).is_err());
        assert!(policy.resolve(Some("2147483648"), None).is_err());
    }

    #[test]
    fn test_inactive_pricing_falls_through() {
        let policy = CostPolicy {
            client_cost: ClientCostPolicy::Ignore,
            default_cost: Some(2),
        };
        let inactive = pricing(7, false);
        assert_eq!(
            policy.resolve(None, Some(&inactive)).unwrap(),
            (2, CostSource::EnvDefault)
        );
        let active = pricing(7, true);
        assert_eq!(
            policy.resolve(None, Some(&active)).unwrap(),
            (7, CostSource::Pricing)
        );
    }

    #[test]
    fn test_fallback_when_nothing_configured() {
        let policy = CostPolicy::default();
        assert_eq!(
            policy.resolve(None, Some(&pricing(0, true))).unwrap(),
            (FALLBACK_CREDIT_COST, CostSource::Fallback)
        );
    }
}
