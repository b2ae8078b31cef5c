//! Typed pass-rate threshold table keyed by (category, strictness).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;

/// What kind of behavior a suite exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Curriculum,
    Defensive,
    Conversational,
    Safety,
    Formatting,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::Curriculum => "curriculum",
            Category::Defensive => "defensive",
            Category::Conversational => "conversational",
            Category::Safety => "safety",
            Category::Formatting => "formatting",
        }
    }
}

/// How strict a gate should be within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Lenient,
    Standard,
    Strict,
}

impl Strictness {
    pub fn name(&self) -> &'static str {
        match self {
            Strictness::Lenient => "lenient",
            Strictness::Standard => "standard",
            Strictness::Strict => "strict",
        }
    }
}

/// A named threshold tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThresholdTier {
    pub category: Category,
    pub strictness: Strictness,
}

impl ThresholdTier {
    pub fn new(category: Category, strictness: Strictness) -> Self {
        Self {
            category,
            strictness,
        }
    }

    /// The `Standard` tier of a category.
    pub fn standard(category: Category) -> Self {
        Self::new(category, Strictness::Standard)
    }
}

impl fmt::Display for ThresholdTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category.name(), self.strictness.name())
    }
}

/// One row of a threshold table as written in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierThreshold {
    pub category: Category,
    pub strictness: Strictness,
    pub percent: f64,
}

/// Where a threshold value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Exact,
    CategoryStandard,
    GlobalFallback,
}

/// Serialized form: a flat list of tiers plus the global fallback. Rows
/// are layered over [`ThresholdTable::standard`]; an omitted fallback keeps
/// the standard one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawThresholdTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<f64>,
    #[serde(default)]
    tiers: Vec<TierThreshold>,
}

/// Pass-rate thresholds in percent.
///
/// Lookup is total: exact tier, else the category's `Standard` tier, else the
/// global fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholdTable", into = "RawThresholdTable")]
pub struct ThresholdTable {
    tiers: HashMap<ThresholdTier, f64>,
    fallback: f64,
}

impl ThresholdTable {
    /// An empty table that answers every lookup with `fallback`.
    pub fn with_fallback(fallback: f64) -> Result<Self, ConfigError> {
        check_percent("fallback", fallback)?;
        Ok(Self {
            tiers: HashMap::new(),
            fallback,
        })
    }

    /// The default table shipped with evalgate.
    pub fn standard() -> Self {
        use Category::*;
        use Strictness::*;

        let tiers = [
            (Curriculum, Lenient, 80.0),
            (Curriculum, Standard, 90.0),
            (Curriculum, Strict, 95.0),
            (Defensive, Standard, 98.0),
            (Defensive, Strict, 100.0),
            (Conversational, Lenient, 75.0),
            (Conversational, Standard, 85.0),
            (Safety, Standard, 100.0),
        ]
        .into_iter()
        .map(|(c, s, p)| (ThresholdTier::new(c, s), p))
        .collect();

        Self {
            tiers,
            fallback: 95.0,
        }
    }

    /// Set or replace one tier.
    pub fn with_tier(mut self, tier: ThresholdTier, percent: f64) -> Result<Self, ConfigError> {
        check_percent(&tier.to_string(), percent)?;
        self.tiers.insert(tier, percent);
        Ok(self)
    }

    pub fn fallback(&self) -> f64 {
        self.fallback
    }

    /// Threshold for `tier`, never undefined.
    pub fn threshold(&self, tier: ThresholdTier) -> f64 {
        self.resolve(tier).0
    }

    /// Threshold for `tier` and which rule produced it.
    pub fn resolve(&self, tier: ThresholdTier) -> (f64, ThresholdSource) {
        if let Some(p) = self.tiers.get(&tier) {
            return (*p, ThresholdSource::Exact);
        }
        if let Some(p) = self.tiers.get(&ThresholdTier::standard(tier.category)) {
            return (*p, ThresholdSource::CategoryStandard);
        }
        (self.fallback, ThresholdSource::GlobalFallback)
    }

}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TryFrom<RawThresholdTable> for ThresholdTable {
    type Error = ConfigError;

    fn try_from(raw: RawThresholdTable) -> Result<Self, Self::Error> {
        let mut base = Self::standard();
        if let Some(fallback) = raw.fallback {
            check_percent("fallback", fallback)?;
            base.fallback = fallback;
        }
        raw.tiers
            .into_iter()
            .try_fold(base, |table, row| {
                table.with_tier(ThresholdTier::new(row.category, row.strictness), row.percent)
            })
    }
}

impl From<ThresholdTable> for RawThresholdTable {
    fn from(table: ThresholdTable) -> Self {
        let mut tiers: Vec<TierThreshold> = table
            .tiers
            .into_iter()
            .map(|(tier, percent)| TierThreshold {
                category: tier.category,
                strictness: tier.strictness,
                percent,
            })
            .collect();
        tiers.sort_by_key(|t| (t.category, t.strictness));
        Self {
            fallback: Some(table.fallback),
            tiers,
        }
    }
}

fn check_percent(tier: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange {
            tier: tier.to_string(),
            value,
        })
    }
}
