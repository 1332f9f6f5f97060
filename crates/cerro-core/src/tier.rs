//! Access tiers and the per-tier rate policy.
//!
//! Tiers form a strict hierarchy: a credential of rank R may invoke any
//! endpoint whose required rank is <= R. Endpoints pick up their tier from a
//! `tier<N>` tag; credentials carry theirs in the trust store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Ordered access tier. `Tier0` is public, `Tier3` is internal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Public / free tier.
    #[default]
    Tier0,
    /// Partner tier.
    Tier1,
    /// Premium tier.
    Tier2,
    /// Internal / admin tier.
    Tier3,
}

impl Tier {
    /// All tiers in rank order.
    pub const ALL: [Self; 4] = [Self::Tier0, Self::Tier1, Self::Tier2, Self::Tier3];

    /// Numeric rank within the hierarchy.
    #[must_use]
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Returns true when a credential of this tier may invoke an endpoint
    /// requiring `required`.
    #[must_use]
    pub fn allows(self, required: Self) -> bool {
        self >= required
    }

    /// Parses a manifest tag of the form `tier0`..`tier3`.
    ///
    /// Returns `None` for anything else, including out-of-range `tier9`
    /// tags (which are skipped rather than rejected, matching the tag
    /// convention's tolerance for unknown tags).
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "tier0" => Some(Self::Tier0),
            "tier1" => Some(Self::Tier1),
            "tier2" => Some(Self::Tier2),
            "tier3" => Some(Self::Tier3),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.rank())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| {
            Error::InvalidInput(format!("tier must be one of tier0..tier3 (got {s})"))
        })
    }
}

/// Per-tier request budgets, in requests per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    budgets: [u32; 4],
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            budgets: [20, 100, 500, 10_000],
        }
    }
}

impl TierPolicy {
    /// Creates a policy from explicit per-tier budgets, tier0 first.
    #[must_use]
    pub const fn new(budgets: [u32; 4]) -> Self {
        Self { budgets }
    }

    /// The per-minute request budget for `tier`.
    #[must_use]
    pub const fn requests_per_minute(&self, tier: Tier) -> u32 {
        self.budgets[tier.rank() as usize]
    }
}
