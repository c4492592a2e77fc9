//! Execution tiers and specialist roles.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Capability/cost class of a worker, ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Cheapest tier; escalates soonest.
    Low,
    /// Intermediate tier.
    Mid,
    /// Most capable tier; never auto-escalates.
    High,
}

impl Tier {
    /// Every tier in ladder order.
    pub const ALL: [Self; 3] = [Self::Low, Self::Mid, Self::High];

    /// The next rung on the escalation ladder, or `None` at the top.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Mid),
            Self::Mid => Some(Self::High),
            Self::High => None,
        }
    }

    /// Stable lowercase identifier used in storage and wire formats.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(AppError::Config(format!("unknown tier: {other}"))),
        }
    }
}

/// Fixed-role worker type used for post-implementation handoffs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Specialist {
    /// Reviews the finished implementation.
    Review,
    /// Writes and runs tests against the implementation.
    Test,
    /// Integrates the branch.
    Merge,
}

impl Specialist {
    /// Tier a specialist runs at unless overridden.
    #[must_use]
    pub fn default_tier(self) -> Tier {
        match self {
            Self::Review => Tier::Mid,
            Self::Test | Self::Merge => Tier::Low,
        }
    }

    /// Role instruction prepended to the specialist's transfer document.
    #[must_use]
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Review => {
                "You are the review specialist. Review the completed work below, \
                 report defects, and do not start new features."
            }
            Self::Test => {
                "You are the test specialist. Extend and run the test suite for the \
                 completed work below and report failures."
            }
            Self::Merge => {
                "You are the merge specialist. Rebase, resolve conflicts and land the \
                 completed work below."
            }
        }
    }

    /// Stable lowercase identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Test => "test",
            Self::Merge => "merge",
        }
    }
}

impl Display for Specialist {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specialist {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "review" => Ok(Self::Review),
            "test" => Ok(Self::Test),
            "merge" => Ok(Self::Merge),
            other => Err(AppError::Config(format!("unknown specialist: {other}"))),
        }
    }
}
