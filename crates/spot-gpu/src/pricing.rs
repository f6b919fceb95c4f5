//! Static fallback pricing and price analysis helpers.
//!
//! The fallback table is consulted only when live spot pricing is missing.
//! On-demand prices always come from the table since the spot market API
//! does not publish them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::providers::PriceSample;

/// Version tag of the built-in fallback table.
pub const PRICE_TABLE_VERSION: &str = "2026-09";

/// Hours used when projecting daily cost.
const HOURS_PER_DAY: f64 = 24.0;

/// Days used when projecting monthly cost.
const DAYS_PER_MONTH: f64 = 30.0;

/// Fallback price for one instance type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    /// On-demand hourly price in USD.
    pub on_demand_price: f64,
    /// Typical spot hourly price in USD.
    pub spot_price_estimate: f64,
}

/// Versioned `instance_type -> price` table with per-region overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    /// Table version.
    pub version: String,
    /// Prices applying to every region.
    #[serde(default)]
    pub default: HashMap<String, PriceEntry>,
    /// Region-specific prices, checked before `default`.
    #[serde(default)]
    pub regions: HashMap<String, HashMap<String, PriceEntry>>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let entries = [
            ("g4dn.xlarge", 0.526, 0.35),
            ("g4dn.2xlarge", 0.752, 0.70),
            ("g4dn.4xlarge", 1.204, 0.48),
            ("g4ad.xlarge", 0.379, 0.25),
            ("g5.xlarge", 1.006, 0.40),
            ("g5.2xlarge", 1.212, 0.55),
            ("g5g.xlarge", 0.42, 0.18),
            ("g5g.2xlarge", 0.556, 0.24),
            ("p3.2xlarge", 3.06, 1.10),
        ];

        let default = entries
            .into_iter()
            .map(|(name, on_demand, spot)| {
                (
                    name.to_string(),
                    PriceEntry {
                        on_demand_price: on_demand,
                        spot_price_estimate: spot,
                    },
                )
            })
            .collect();

        Self {
            version: PRICE_TABLE_VERSION.to_string(),
            default,
            regions: HashMap::new(),
        }
    }
}

impl PriceTable {
    /// Create an empty table.
    #[must_use]
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            default: HashMap::new(),
            regions: HashMap::new(),
        }
    }

    /// Add a price applying to every region.
    #[must_use]
    pub fn with_default(mut self, instance_type: impl Into<String>, entry: PriceEntry) -> Self {
        self.default.insert(instance_type.into(), entry);
        self
    }

    /// Add a region-specific price.
    #[must_use]
    pub fn with_region(
        mut self,
        region: impl Into<String>,
        instance_type: impl Into<String>,
        entry: PriceEntry,
    ) -> Self {
        self.regions
            .entry(region.into())
            .or_default()
            .insert(instance_type.into(), entry);
        self
    }

    /// Look up the price of an instance type in a region.
    #[must_use]
    pub fn lookup(&self, region: &str, instance_type: &str) -> Option<PriceEntry> {
        self.regions
            .get(region)
            .and_then(|r| r.get(instance_type))
            .or_else(|| self.default.get(instance_type))
            .copied()
    }
}

/// Newest sample per `(instance_type, zone)`.
#[must_use]
pub fn latest_by_zone(samples: &[PriceSample]) -> BTreeMap<(String, String), PriceSample> {
    let mut latest: BTreeMap<(String, String), PriceSample> = BTreeMap::new();
    for sample in samples {
        let key = (sample.instance_type.clone(), sample.zone.clone());
        let stale = matches!(latest.get(&key), Some(existing) if existing.timestamp >= sample.timestamp);
        if !stale {
            latest.insert(key, sample.clone());
        }
    }
    latest
}

/// Spot price statistics for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceStats {
    /// Zone.
    pub zone: String,
    /// Newest observed price.
    pub current_price: f64,
    /// Mean price.
    pub avg_price: f64,
    /// Lowest price.
    pub min_price: f64,
    /// Highest price.
    pub max_price: f64,
    /// `(max - min) / min`, 0 when min is 0.
    pub volatility: f64,
    /// Number of samples.
    pub sample_count: usize,
}

impl PriceStats {
    /// Compute per-zone statistics for one instance type.
    ///
    /// Samples of other instance types must be filtered out by the caller.
    #[must_use]
    pub fn from_samples(samples: &[PriceSample]) -> Vec<Self> {
        let mut by_zone: BTreeMap<&str, Vec<&PriceSample>> = BTreeMap::new();
        for sample in samples {
            by_zone.entry(sample.zone.as_str()).or_default().push(sample);
        }

        by_zone
            .into_iter()
            .filter_map(|(zone, zone_samples)| {
                let newest = zone_samples.iter().max_by_key(|s| s.timestamp)?;
                let prices: Vec<f64> = zone_samples.iter().map(|s| s.price).collect();
                let min_price = prices.iter().copied().fold(f64::INFINITY, f64::min);
                let max_price = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                #[allow(clippy::cast_precision_loss)]
                let avg_price = prices.iter().sum::<f64>() / prices.len() as f64;
                let volatility = if min_price > 0.0 {
                    (max_price - min_price) / min_price
                } else {
                    0.0
                };

                Some(Self {
                    zone: zone.to_string(),
                    current_price: newest.price,
                    avg_price,
                    min_price,
                    max_price,
                    volatility,
                    sample_count: prices.len(),
                })
            })
            .collect()
    }
}

/// Zone with the lowest current price.
#[must_use]
pub fn best_zone(stats: &[PriceStats]) -> Option<&PriceStats> {
    stats.iter().min_by(|a, b| {
        a.current_price
            .total_cmp(&b.current_price)
            .then_with(|| a.zone.cmp(&b.zone))
    })
}

/// Spot versus on-demand savings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Savings {
    /// Spot hourly price.
    pub spot_price: f64,
    /// On-demand hourly price.
    pub on_demand_price: f64,
    /// Saved per hour.
    pub hourly: f64,
    /// Saved per day.
    pub daily: f64,
    /// Saved per 30-day month.
    pub monthly: f64,
    /// Savings as a percentage of on-demand.
    pub percent: f64,
}

impl Savings {
    /// Compute savings of running at `spot_price` instead of `on_demand_price`.
    #[must_use]
    pub fn new(spot_price: f64, on_demand_price: f64) -> Self {
        let hourly = on_demand_price - spot_price;
        let percent = if on_demand_price > 0.0 {
            hourly / on_demand_price * 100.0
        } else {
            0.0
        };

        Self {
            spot_price,
            on_demand_price,
            hourly,
            daily: hourly * HOURS_PER_DAY,
            monthly: hourly * HOURS_PER_DAY * DAYS_PER_MONTH,
            percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(zone: &str, price: f64, minute: u32) -> PriceSample {
        PriceSample {
            instance_type: "g4dn.xlarge".to_string(),
            zone: zone.to_string(),
            price,
            timestamp: Utc.with_ymd_and_hms(2026, 10, 16, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_lookup_prefers_region_override() {
        let table = PriceTable::default().with_region(
            "eu-west-1",
            "g4dn.xlarge",
            PriceEntry {
                on_demand_price: 0.6,
                spot_price_estimate: 0.4,
            },
        );

        let eu = table.lookup("eu-west-1", "g4dn.xlarge").unwrap();
        let us = table.lookup("us-east-1", "g4dn.xlarge").unwrap();
        assert!((eu.spot_price_estimate - 0.4).abs() < f64::EPSILON);
        assert!((us.spot_price_estimate - 0.35).abs() < f64::EPSILON);
        assert!(table.lookup("us-east-1", "x1.unknown").is_none());
    }

    #[test]
    fn test_latest_by_zone_keeps_newest() {
        let samples = vec![
            sample("us-east-1a", 0.30, 5),
            sample("us-east-1a", 0.40, 10),
            sample("us-east-1b", 0.20, 1),
        ];

        let latest = latest_by_zone(&samples);
        let a = &latest[&("g4dn.xlarge".to_string(), "us-east-1a".to_string())];
        assert!((a.price - 0.40).abs() < f64::EPSILON);
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn test_price_stats() {
        let samples = vec![
            sample("us-east-1a", 0.20, 1),
            sample("us-east-1a", 0.30, 2),
            sample("us-east-1a", 0.25, 3),
        ];

        let stats = PriceStats::from_samples(&samples);
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert!((s.current_price - 0.25).abs() < 1e-9);
        assert!((s.avg_price - 0.25).abs() < 1e-9);
        assert!((s.volatility - 0.5).abs() < 1e-9);
        assert_eq!(s.sample_count, 3);
    }

    #[test]
    fn test_zero_min_price_has_zero_volatility() {
        let stats = PriceStats::from_samples(&[sample("z", 0.0, 1), sample("z", 0.5, 2)]);
        assert!(stats[0].volatility.abs() < f64::EPSILON);
    }

    #[test]
    fn test_best_zone() {
        let stats = PriceStats::from_samples(&[
            sample("us-east-1a", 0.40, 1),
            sample("us-east-1b", 0.31, 1),
            sample("us-east-1c", 0.35, 1),
        ]);
        assert_eq!(best_zone(&stats).unwrap().zone, "us-east-1b");
        assert!(best_zone(&[]).is_none());
    }

    #[test]
    fn test_savings() {
        let savings = Savings::new(0.35, 0.70);
        assert!((savings.hourly - 0.35).abs() < 1e-9);
        assert!((savings.daily - 8.4).abs() < 1e-9);
        assert!((savings.monthly - 252.0).abs() < 1e-9);
        assert!((savings.percent - 50.0).abs() < 1e-9);

        assert!(Savings::new(0.35, 0.0).percent.abs() < f64::EPSILON);
    }
}
