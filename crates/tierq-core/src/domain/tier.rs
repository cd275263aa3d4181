//! Priority tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four fixed priority levels.
///
/// The derived `Ord` follows declaration order, so `Urgent < Low` when
/// compared; use [`PriorityTier::ALL`] for the dispatch walk (highest first).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl PriorityTier {
    /// Dispatch order, highest priority first. Never reordered at runtime.
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Urgent,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::Urgent => "urgent",
            PriorityTier::High => "high",
            PriorityTier::Normal => "normal",
            PriorityTier::Low => "low",
        }
    }

    /// Position in the dispatch walk (0 = Urgent).
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Is `self` strictly more urgent than `other`?
    pub fn outranks(self, other: PriorityTier) -> bool {
        self.rank() < other.rank()
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for PriorityTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(PriorityTier::Urgent),
            "high" => Ok(PriorityTier::High),
            "normal" => Ok(PriorityTier::Normal),
            "low" => Ok(PriorityTier::Low),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}
