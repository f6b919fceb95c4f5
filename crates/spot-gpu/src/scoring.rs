//! Configuration scoring.
//!
//! Pure and deterministic: no I/O, no clocks. Performance scores come from a
//! static capability table; efficiency is `performance_score / spot_price`.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::market::ImageTier;
use crate::pricing::Savings;
use crate::providers::Architecture;

/// Upper bound of a performance score.
pub const MAX_SCORE: u8 = 100;

/// Hardware profile of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceProfile {
    /// Instance type name.
    pub instance_type: String,
    /// CPU architecture.
    pub architecture: Architecture,
    /// GPU model (e.g. "T4", "A10G").
    pub gpu_model: String,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// Number of virtual CPUs.
    pub vcpus: u32,
    /// RAM in GB.
    pub ram_gb: u32,
    /// Performance score in `[0, 100]`.
    pub performance_score: u8,
}

impl InstanceProfile {
    /// Create a profile whose score is derived from its hardware.
    pub fn new(
        instance_type: impl Into<String>,
        architecture: Architecture,
        gpu_model: impl Into<String>,
        gpu_count: u32,
        vcpus: u32,
        ram_gb: u32,
    ) -> Self {
        let gpu_model = gpu_model.into();
        let performance_score = derive_score(&gpu_model, gpu_count, vcpus, ram_gb);
        Self {
            instance_type: instance_type.into(),
            architecture,
            gpu_model,
            gpu_count,
            vcpus,
            ram_gb,
            performance_score,
        }
    }

    /// Override the derived score.
    #[must_use]
    pub fn with_score(mut self, score: u8) -> Self {
        self.performance_score = score.min(MAX_SCORE);
        self
    }
}

/// Relative weight of one GPU of a given model.
fn gpu_weight(model: &str) -> f64 {
    match model {
        "V100" => 60.0,
        "A10G" => 55.0,
        "T4" => 40.0,
        "T4G" => 35.0,
        "V520" => 30.0,
        _ => 20.0,
    }
}

/// Score from GPU, vCPU and RAM weights, clamped to `[0, 100]`.
#[must_use]
pub fn derive_score(gpu_model: &str, gpu_count: u32, vcpus: u32, ram_gb: u32) -> u8 {
    let raw = f64::from(gpu_count) * gpu_weight(gpu_model)
        + f64::from(vcpus)
        + f64::from(ram_gb) * 0.25;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = raw.round().clamp(0.0, f64::from(MAX_SCORE)) as u8;
    score
}

/// Where a candidate's spot price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Live spot price sample.
    Live,
    /// Static fallback table estimate.
    Fallback,
}

/// A scored, priced, provisionable configuration.
///
/// Built only through [`Scorer::candidate`], which derives `efficiency_score`
/// from the candidate's own `spot_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Instance type.
    pub instance_type: String,
    /// CPU architecture.
    pub architecture: Architecture,
    /// Machine image ID.
    pub image_id: String,
    /// Tier of the resolved image.
    pub image_tier: ImageTier,
    /// Region.
    pub region: String,
    /// Availability zone.
    pub zone: String,
    /// Spot hourly price in USD.
    pub spot_price: f64,
    /// On-demand hourly price in USD (0 when unknown).
    pub on_demand_price: f64,
    /// Where `spot_price` came from.
    pub price_source: PriceSource,
    /// Performance score in `[0, 100]`.
    pub performance_score: u8,
    /// `performance_score / spot_price`.
    pub efficiency_score: f64,
}

impl Candidate {
    /// `(on_demand - spot) / on_demand`, 0 when on-demand is unknown.
    #[must_use]
    pub fn savings_ratio(&self) -> f64 {
        if self.on_demand_price > 0.0 {
            ((self.on_demand_price - self.spot_price) / self.on_demand_price).max(0.0)
        } else {
            0.0
        }
    }

    /// Savings-weighted efficiency. Reporting only; ranking never uses it.
    #[must_use]
    pub fn weighted_efficiency(&self) -> f64 {
        self.efficiency_score * (1.0 + self.savings_ratio())
    }

    /// Spot versus on-demand savings.
    #[must_use]
    pub fn savings(&self) -> Savings {
        Savings::new(self.spot_price, self.on_demand_price)
    }
}

/// Inputs for building a candidate.
#[derive(Debug, Clone)]
pub struct CandidateInput<'a> {
    /// Instance type.
    pub instance_type: &'a str,
    /// Machine image ID.
    pub image_id: &'a str,
    /// Tier of the resolved image.
    pub image_tier: ImageTier,
    /// Region.
    pub region: &'a str,
    /// Availability zone.
    pub zone: &'a str,
    /// Spot hourly price.
    pub spot_price: f64,
    /// On-demand hourly price.
    pub on_demand_price: f64,
    /// Price provenance.
    pub price_source: PriceSource,
}

/// Performance scorer backed by a capability table.
#[derive(Debug, Clone)]
pub struct Scorer {
    profiles: HashMap<String, InstanceProfile>,
}

impl Default for Scorer {
    fn default() -> Self {
        use Architecture::{Arm64, X86_64};

        Self::new([
            InstanceProfile::new("g4dn.xlarge", X86_64, "T4", 1, 4, 16),
            InstanceProfile::new("g4dn.2xlarge", X86_64, "T4", 1, 8, 32),
            InstanceProfile::new("g4dn.4xlarge", X86_64, "T4", 1, 16, 64),
            InstanceProfile::new("g4ad.xlarge", X86_64, "V520", 1, 4, 16),
            InstanceProfile::new("g5.xlarge", X86_64, "A10G", 1, 4, 16),
            InstanceProfile::new("g5.2xlarge", X86_64, "A10G", 1, 8, 32),
            InstanceProfile::new("g5g.xlarge", Arm64, "T4G", 1, 4, 8),
            InstanceProfile::new("g5g.2xlarge", Arm64, "T4G", 1, 8, 16),
            InstanceProfile::new("p3.2xlarge", X86_64, "V100", 1, 8, 61),
        ])
    }
}

impl Scorer {
    /// Create a scorer from a set of profiles.
    pub fn new(profiles: impl IntoIterator<Item = InstanceProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.instance_type.clone(), p))
                .collect(),
        }
    }

    /// Override the score of a known instance type.
    #[must_use]
    pub fn with_score(mut self, instance_type: &str, score: u8) -> Self {
        if let Some(profile) = self.profiles.remove(instance_type) {
            self.profiles
                .insert(instance_type.to_string(), profile.with_score(score));
        }
        self
    }

    /// Profile of an instance type.
    #[must_use]
    pub fn profile(&self, instance_type: &str) -> Option<&InstanceProfile> {
        self.profiles.get(instance_type)
    }

    /// Performance score; unknown instance types score 0.
    #[must_use]
    pub fn score(&self, instance_type: &str) -> u8 {
        self.profile(instance_type)
            .map_or(0, |p| p.performance_score)
    }

    /// Build a candidate, deriving its score and efficiency.
    ///
    /// Returns `None` for instance types that score 0.
    #[must_use]
    pub fn candidate(&self, input: &CandidateInput<'_>) -> Option<Candidate> {
        let profile = self.profile(input.instance_type)?;
        if profile.performance_score == 0 {
            return None;
        }

        Some(Candidate {
            instance_type: input.instance_type.to_string(),
            architecture: profile.architecture,
            image_id: input.image_id.to_string(),
            image_tier: input.image_tier,
            region: input.region.to_string(),
            zone: input.zone.to_string(),
            spot_price: input.spot_price,
            on_demand_price: input.on_demand_price,
            price_source: input.price_source,
            performance_score: profile.performance_score,
            efficiency_score: efficiency(profile.performance_score, input.spot_price),
        })
    }
}

/// `performance_score / price`; 0 for any non-positive or non-finite price.
#[must_use]
pub fn efficiency(performance_score: u8, price: f64) -> f64 {
    if !price.is_finite() || price <= 0.0 {
        return 0.0;
    }
    f64::from(performance_score) / price
}

/// Ranking order: efficiency descending, then spot price ascending, then
/// instance type, zone and region by name.
#[must_use]
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.efficiency_score
        .total_cmp(&a.efficiency_score)
        .then_with(|| a.spot_price.total_cmp(&b.spot_price))
        .then_with(|| a.instance_type.cmp(&b.instance_type))
        .then_with(|| a.zone.cmp(&b.zone))
        .then_with(|| a.region.cmp(&b.region))
}

/// Stable sort of candidates into ranking order.
#[must_use]
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare);
    candidates
}
