//! Replica counts expressed either as an absolute number or a percentage.
//!
//! Values are kept in their declared form and only resolved against a
//! concrete total when a batch is applied, so a workload that is scaled
//! between batches still gets a consistent share.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An absolute count (`3`) or a percentage of some total (`"25%"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOrPercent {
    Int(u32),
    Percent(u32),
}

impl IntOrPercent {
    /// 100% of the total.
    pub const FULL: IntOrPercent = IntOrPercent::Percent(100);

    /// Resolve against `total`, rounding percentages up and clamping to
    /// `[0, total]`.
    pub fn resolve(&self, total: u32) -> u32 {
        match *self {
            IntOrPercent::Int(n) => n.min(total),
            IntOrPercent::Percent(p) => {
                let scaled = (u64::from(total) * u64::from(p)).div_ceil(100);
                (scaled.min(u64::from(total))) as u32
            }
        }
    }

    /// Resolve as a threshold: like [`resolve`](Self::resolve) but
    /// percentages round down and absolute values are not clamped.
    pub fn resolve_threshold(&self, total: u32) -> u32 {
        match *self {
            IntOrPercent::Int(n) => n,
            IntOrPercent::Percent(p) => ((u64::from(total) * u64::from(p)) / 100) as u32,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, IntOrPercent::Int(0) | IntOrPercent::Percent(0))
    }

    /// Percentages above 100 are never meaningful for replica counts.
    pub fn is_valid(&self) -> bool {
        match *self {
            IntOrPercent::Int(_) => true,
            IntOrPercent::Percent(p) => p <= 100,
        }
    }
}

impl Default for IntOrPercent {
    fn default() -> Self {
        IntOrPercent::Int(0)
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrPercent::Int(n) => write!(f, "{n}"),
            IntOrPercent::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl FromStr for IntOrPercent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            pct.trim()
                .parse::<u32>()
                .map(IntOrPercent::Percent)
                .map_err(|_| format!("invalid percentage: {s:?}"))
        } else {
            s.parse::<u32>()
                .map(IntOrPercent::Int)
                .map_err(|_| format!("invalid int or percentage: {s:?}"))
        }
    }
}

impl Serialize for IntOrPercent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IntOrPercent::Int(n) => serializer.serialize_u32(*n),
            IntOrPercent::Percent(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for IntOrPercent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(IntOrPercent::Int(n)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
