//! Configuration selection across regions.
//!
//! Each region is scanned independently (availability, images, prices,
//! scoring) with a bounded number of scans in flight. Scans are read-only;
//! the only shared state is the gateway's image memo.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SelectionError;
use crate::market::{MarketData, ResolvedImage};
use crate::pricing::{latest_by_zone, PriceTable};
use crate::scoring::{self, Candidate, CandidateInput, PriceSource, Scorer};

/// Default number of region scans in flight.
pub const DEFAULT_MAX_CONCURRENT_SCANS: usize = 4;

/// Margin applied to the closest miss when suggesting a budget.
pub const SUGGESTED_BUDGET_MARGIN: f64 = 1.15;

/// What one region contributed to a selection run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegionOutcome {
    /// At least one candidate fits the budget.
    Affordable {
        /// Region.
        region: String,
        /// Top-ranked in-budget candidate.
        best: Box<Candidate>,
        /// Number of in-budget candidates.
        in_budget: usize,
    },
    /// Candidates exist but all exceed the budget.
    OverBudget {
        /// Region.
        region: String,
        /// Cheapest candidate observed.
        closest_miss: Box<Candidate>,
    },
    /// Nothing scorable in this region.
    Skipped {
        /// Region.
        region: String,
        /// Why the region produced no candidates.
        reason: String,
    },
}

impl RegionOutcome {
    /// Region this outcome belongs to.
    #[must_use]
    pub fn region(&self) -> &str {
        match self {
            Self::Affordable { region, .. }
            | Self::OverBudget { region, .. }
            | Self::Skipped { region, .. } => region,
        }
    }
}

/// Full result of a selection run, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct Shortlist {
    /// Budget ceiling in USD/hour.
    pub budget: f64,
    /// Every scored candidate across regions, in rank order.
    pub ranked: Vec<Candidate>,
    /// Per-region outcomes, in the order the regions were given.
    pub outcomes: Vec<RegionOutcome>,
}

impl Shortlist {
    /// Best in-budget candidate across regions.
    #[must_use]
    pub fn best(&self) -> Option<&Candidate> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                RegionOutcome::Affordable { best, .. } => Some(best.as_ref()),
                _ => None,
            })
            .min_by(|a, b| scoring::compare(a, b))
    }

    /// Cheapest over-budget candidate across regions.
    #[must_use]
    pub fn closest_miss(&self) -> Option<&Candidate> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                RegionOutcome::OverBudget { closest_miss, .. } => Some(closest_miss.as_ref()),
                _ => None,
            })
            .min_by(|a, b| cheapest_first(a, b))
    }

    /// Turn the shortlist into the winning candidate.
    ///
    /// # Errors
    /// Returns [`SelectionError`] if no region produced an in-budget
    /// candidate.
    pub fn into_best(self) -> Result<Candidate, SelectionError> {
        if let Some(best) = self.best() {
            return Ok(best.clone());
        }

        let regions_examined = self
            .outcomes
            .iter()
            .map(|o| o.region().to_string())
            .collect();

        match self.closest_miss().cloned() {
            Some(miss) => Err(SelectionError::NoAffordableConfiguration {
                budget: self.budget,
                regions_examined,
                suggested_budget: Some(suggested_budget(miss.spot_price)),
                closest_miss: Some(Box::new(miss)),
                outcomes: self.outcomes,
            }),
            None => Err(SelectionError::NoCandidates {
                regions_examined,
                outcomes: self.outcomes,
            }),
        }
    }
}

fn cheapest_first(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    a.spot_price
        .total_cmp(&b.spot_price)
        .then_with(|| scoring::compare(a, b))
}

/// Closest-miss price plus margin, rounded up to the cent.
#[must_use]
pub fn suggested_budget(closest_price: f64) -> f64 {
    ((closest_price * SUGGESTED_BUDGET_MARGIN * 100.0) - 1e-9).ceil() / 100.0
}

/// Configuration selector.
pub struct Selector {
    market: Arc<MarketData>,
    scorer: Scorer,
    prices: PriceTable,
    max_concurrent_scans: usize,
}

impl Selector {
    /// Create a selector with the default scorer and price table.
    pub fn new(market: Arc<MarketData>) -> Self {
        Self {
            market,
            scorer: Scorer::default(),
            prices: PriceTable::default(),
            max_concurrent_scans: DEFAULT_MAX_CONCURRENT_SCANS,
        }
    }

    /// Replace the scorer.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replace the fallback price table.
    #[must_use]
    pub fn with_price_table(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// Bound the number of region scans in flight.
    #[must_use]
    pub fn with_max_concurrent_scans(mut self, max: usize) -> Self {
        self.max_concurrent_scans = max.max(1);
        self
    }

    /// Fallback price table in use.
    #[must_use]
    pub fn price_table(&self) -> &PriceTable {
        &self.prices
    }

    /// Scan every region and rank all candidates.
    pub async fn shortlist(
        &self,
        budget: f64,
        regions: &[String],
        candidate_types: &[String],
    ) -> Shortlist {
        info!(
            budget,
            regions = %regions.join(","),
            candidates = candidate_types.len(),
            "Selecting configuration"
        );

        let scans: Vec<(Vec<Candidate>, RegionOutcome)> = stream::iter(regions)
            .map(|region| self.scan_region(budget, region, candidate_types))
            .buffered(self.max_concurrent_scans)
            .collect()
            .await;

        let mut all = Vec::new();
        let mut outcomes = Vec::with_capacity(scans.len());
        for (candidates, outcome) in scans {
            all.extend(candidates);
            outcomes.push(outcome);
        }

        Shortlist {
            budget,
            ranked: scoring::rank(all),
            outcomes,
        }
    }

    /// Best in-budget candidate across regions.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoAffordableConfiguration`] (with the
    /// closest miss and a suggested budget) if nothing fits the budget, or
    /// [`SelectionError::NoCandidates`] if nothing was scorable at all.
    pub async fn select(
        &self,
        budget: f64,
        regions: &[String],
        candidate_types: &[String],
    ) -> Result<Candidate, SelectionError> {
        let best = self
            .shortlist(budget, regions, candidate_types)
            .await
            .into_best()?;

        info!(
            instance_type = %best.instance_type,
            region = %best.region,
            zone = %best.zone,
            spot_price = best.spot_price,
            efficiency = best.efficiency_score,
            "Selected configuration"
        );
        Ok(best)
    }

    async fn scan_region(
        &self,
        budget: f64,
        region: &str,
        candidate_types: &[String],
    ) -> (Vec<Candidate>, RegionOutcome) {
        let skipped = |reason: &str| {
            info!(region = %region, "Skipping region: {reason}");
            (
                Vec::new(),
                RegionOutcome::Skipped {
                    region: region.to_string(),
                    reason: reason.to_string(),
                },
            )
        };

        let available = self
            .market
            .list_available_instance_types(region, candidate_types)
            .await;
        if available.is_empty() {
            return skipped("none of the candidate instance types are offered");
        }

        let images = self.resolve_images(region, available.keys()).await;
        if images.is_empty() {
            return skipped("no machine image resolved for any offered type");
        }

        let priced_types: Vec<String> = images.keys().cloned().collect();
        let samples = match self.market.get_price_samples(region, &priced_types, None).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(region = %region, "Price history unavailable, using fallback table: {e}");
                Vec::new()
            }
        };
        let latest = latest_by_zone(&samples);

        let mut candidates = Vec::new();
        for (instance_type, image) in &images {
            let zones = available.get(instance_type).map(Vec::as_slice).unwrap_or_default();
            let table = self.prices.lookup(region, instance_type);
            let on_demand_price = table.map_or(0.0, |e| e.on_demand_price);

            for zone in zones {
                let (spot_price, price_source) =
                    match latest.get(&(instance_type.clone(), zone.clone())) {
                        Some(sample) => (sample.price, PriceSource::Live),
                        None => match table {
                            Some(entry) => {
                                warn!(
                                    region = %region,
                                    zone = %zone,
                                    instance_type = %instance_type,
                                    estimate = entry.spot_price_estimate,
                                    "No price sample, using fallback estimate"
                                );
                                (entry.spot_price_estimate, PriceSource::Fallback)
                            }
                            None => {
                                warn!(
                                    region = %region,
                                    zone = %zone,
                                    instance_type = %instance_type,
                                    "No price sample and no fallback price, excluding"
                                );
                                continue;
                            }
                        },
                    };

                let input = CandidateInput {
                    instance_type,
                    image_id: &image.image_id,
                    image_tier: image.tier,
                    region,
                    zone,
                    spot_price,
                    on_demand_price,
                    price_source,
                };
                match self.scorer.candidate(&input) {
                    Some(candidate) => candidates.push(candidate),
                    None => {
                        debug!(instance_type = %instance_type, "Unknown instance type, excluding");
                        break;
                    }
                }
            }
        }

        if candidates.is_empty() {
            return skipped("no priced, scorable candidates");
        }

        let ranked = scoring::rank(candidates);
        let in_budget: Vec<&Candidate> =
            ranked.iter().filter(|c| c.spot_price <= budget).collect();

        let outcome = if let Some(best) = in_budget.first() {
            info!(
                region = %region,
                instance_type = %best.instance_type,
                zone = %best.zone,
                spot_price = best.spot_price,
                in_budget = in_budget.len(),
                "Region best in budget"
            );
            RegionOutcome::Affordable {
                region: region.to_string(),
                best: Box::new((*best).clone()),
                in_budget: in_budget.len(),
            }
        } else {
            let closest = ranked
                .iter()
                .min_by(|a, b| cheapest_first(a, b))
                .cloned()
                .map(Box::new);
            match closest {
                Some(closest_miss) => {
                    info!(
                        region = %region,
                        instance_type = %closest_miss.instance_type,
                        spot_price = closest_miss.spot_price,
                        budget,
                        "Nothing in budget"
                    );
                    RegionOutcome::OverBudget {
                        region: region.to_string(),
                        closest_miss,
                    }
                }
                None => return skipped("no priced, scorable candidates"),
            }
        };

        (ranked, outcome)
    }

    async fn resolve_images<'a>(
        &self,
        region: &str,
        instance_types: impl Iterator<Item = &'a String>,
    ) -> BTreeMap<String, ResolvedImage> {
        let lookups = instance_types.map(|instance_type| async move {
            let image = self.market.resolve_image(instance_type, region).await;
            (instance_type, image)
        });

        let mut images = BTreeMap::new();
        for (instance_type, image) in futures::future::join_all(lookups).await {
            match image {
                Ok(image) => {
                    images.insert(instance_type.clone(), image);
                }
                Err(e) => warn!(region = %region, "Excluding {instance_type}: {e}"),
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggested_budget_rounds_up_to_cent() {
        assert!((suggested_budget(0.9) - 1.04).abs() < 1e-9);
        assert!((suggested_budget(1.0) - 1.15).abs() < 1e-9);
        assert!((suggested_budget(0.333) - 0.39).abs() < 1e-9);
    }

    #[test]
    fn test_empty_shortlist_has_no_candidates_error() {
        let shortlist = Shortlist {
            budget: 1.0,
            ranked: Vec::new(),
            outcomes: vec![RegionOutcome::Skipped {
                region: "us-east-1".to_string(),
                reason: "none".to_string(),
            }],
        };

        match shortlist.into_best() {
            Err(SelectionError::NoCandidates {
                regions_examined, ..
            }) => assert_eq!(regions_examined, vec!["us-east-1".to_string()]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
