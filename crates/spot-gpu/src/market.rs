//! Market data gateway.
//!
//! Read-only accessor over [`CloudApi`]: instance type availability, spot
//! price samples, and machine image resolution. Image lookups are memoized
//! in a concurrent map keyed by `(instance_type, region, architecture)` so
//! parallel region scans share one memo without locking each other out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::MarketDataError;
use crate::providers::{Architecture, CloudApi, ImageFilter, PriceSample};

/// Default lifetime of a memoized image.
pub const DEFAULT_IMAGE_TTL: Duration = Duration::from_secs(3600);

/// Image owner aliases and account IDs searched during discovery.
const IMAGE_OWNERS: &[&str] = &["amazon", "099720109477"];

/// Quality tier of a resolved image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageTier {
    /// GPU deep-learning base image.
    Primary,
    /// GPU framework image.
    Secondary,
    /// Plain LTS OS image, or an entry of the static fallback table.
    Fallback,
}

impl std::fmt::Display for ImageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A resolved machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedImage {
    /// Image ID.
    pub image_id: String,
    /// Tier of the pattern (or table) it came from.
    pub tier: ImageTier,
    /// Image name, empty for table entries.
    pub name: String,
}

/// Architecture implied by an instance type name.
///
/// Graviton families carry a `g` after the generation digit (`g5g`, `c7gn`).
#[must_use]
pub fn architecture_for(instance_type: &str) -> Architecture {
    let family = instance_type.split('.').next().unwrap_or_default();
    let suffix = family
        .find(|c: char| c.is_ascii_digit())
        .map_or("", |i| family[i..].trim_start_matches(|c: char| c.is_ascii_digit()));

    if suffix.contains('g') {
        Architecture::Arm64
    } else {
        Architecture::X86_64
    }
}

/// Image name patterns per architecture, and the static fallback table.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    patterns: HashMap<Architecture, Vec<(ImageTier, String)>>,
    owners: Vec<String>,
    fallback: HashMap<(String, Architecture), String>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        use Architecture::{Arm64, X86_64};

        let patterns = HashMap::from([
            (
                X86_64,
                vec![
                    (
                        ImageTier::Primary,
                        "Deep Learning Base OSS Nvidia Driver GPU AMI (Ubuntu 22.04)*".to_string(),
                    ),
                    (
                        ImageTier::Secondary,
                        "Deep Learning OSS Nvidia Driver AMI GPU PyTorch*(Ubuntu 22.04)*".to_string(),
                    ),
                    (
                        ImageTier::Fallback,
                        "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*".to_string(),
                    ),
                ],
            ),
            (
                Arm64,
                vec![
                    (
                        ImageTier::Primary,
                        "Deep Learning ARM64 Base OSS Nvidia Driver GPU AMI (Ubuntu 22.04)*"
                            .to_string(),
                    ),
                    (
                        ImageTier::Secondary,
                        "Deep Learning ARM64 AMI OSS Nvidia Driver GPU PyTorch*(Ubuntu 22.04)*"
                            .to_string(),
                    ),
                    (
                        ImageTier::Fallback,
                        "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-arm64-server-*".to_string(),
                    ),
                ],
            ),
        ]);

        let fallback = [
            ("us-east-1", X86_64, "ami-0a7a4e87939439934"),
            ("us-east-1", Arm64, "ami-0c9bfc21ac5bf10eb"),
            ("us-west-2", X86_64, "ami-0b8c6b923777519db"),
            ("us-west-2", Arm64, "ami-0e1a2f0d6c3b2e8a4"),
            ("eu-west-1", X86_64, "ami-0c1c30571d2dae5c9"),
            ("eu-west-1", Arm64, "ami-0d6e9a8f2b1f3c4d7"),
            ("eu-central-1", X86_64, "ami-04a5a6be1fa530f1c"),
            ("ap-northeast-1", X86_64, "ami-0d52744d6551d851e"),
            ("ap-southeast-1", X86_64, "ami-0497a974f8d5dcef8"),
        ]
        .into_iter()
        .map(|(region, arch, image)| ((region.to_string(), arch), image.to_string()))
        .collect();

        Self {
            patterns,
            owners: IMAGE_OWNERS.iter().map(ToString::to_string).collect(),
            fallback,
        }
    }
}

impl ImageCatalog {
    /// Catalog with no patterns and no fallback entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            patterns: HashMap::new(),
            owners: IMAGE_OWNERS.iter().map(ToString::to_string).collect(),
            fallback: HashMap::new(),
        }
    }

    /// Append a name pattern for an architecture.
    #[must_use]
    pub fn with_pattern(
        mut self,
        architecture: Architecture,
        tier: ImageTier,
        pattern: impl Into<String>,
    ) -> Self {
        self.patterns
            .entry(architecture)
            .or_default()
            .push((tier, pattern.into()));
        self
    }

    /// Set the fallback image for a region and architecture.
    #[must_use]
    pub fn with_fallback(
        mut self,
        region: impl Into<String>,
        architecture: Architecture,
        image_id: impl Into<String>,
    ) -> Self {
        self.fallback
            .insert((region.into(), architecture), image_id.into());
        self
    }

    fn fallback_image(&self, region: &str, architecture: Architecture) -> Option<&String> {
        self.fallback.get(&(region.to_string(), architecture))
    }
}

type ImageKey = (String, String, Architecture);

/// Market data gateway over the provisioning API.
pub struct MarketData {
    api: Arc<dyn CloudApi>,
    catalog: ImageCatalog,
    memo: DashMap<ImageKey, (ResolvedImage, Instant)>,
    ttl: Duration,
}

impl MarketData {
    /// Create a gateway with the default image catalog.
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        Self {
            api,
            catalog: ImageCatalog::default(),
            memo: DashMap::new(),
            ttl: DEFAULT_IMAGE_TTL,
        }
    }

    /// Replace the image catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: ImageCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Set the image memo lifetime.
    #[must_use]
    pub fn with_image_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Which of `candidates` are offered in `region`, with their zones.
    ///
    /// Types with no zones are left out. API errors are logged and treated
    /// as "unavailable here".
    pub async fn list_available_instance_types(
        &self,
        region: &str,
        candidates: &[String],
    ) -> BTreeMap<String, Vec<String>> {
        let lookups = candidates.iter().map(|instance_type| async move {
            let zones = self
                .api
                .list_instance_type_availability(instance_type, region)
                .await;
            (instance_type, zones)
        });

        let mut available = BTreeMap::new();
        for (instance_type, zones) in futures::future::join_all(lookups).await {
            match zones {
                Ok(zones) if zones.is_empty() => {
                    debug!(region = %region, instance_type = %instance_type, "Not offered");
                }
                Ok(zones) => {
                    available.insert(instance_type.clone(), zones);
                }
                Err(e) => {
                    warn!(
                        region = %region,
                        instance_type = %instance_type,
                        "Availability lookup failed, treating as unavailable: {e}"
                    );
                }
            }
        }
        available
    }

    /// Newest compatible image for an instance type.
    ///
    /// Tries the catalog's name patterns in order, then the static table.
    ///
    /// # Errors
    /// Returns [`MarketDataError::ImageNotFound`] if discovery and the table
    /// both come up empty.
    pub async fn resolve_image(
        &self,
        instance_type: &str,
        region: &str,
    ) -> Result<ResolvedImage, MarketDataError> {
        let architecture = architecture_for(instance_type);
        let key = (instance_type.to_string(), region.to_string(), architecture);

        if let Some(entry) = self.memo.get(&key) {
            let (image, stored) = entry.value();
            if stored.elapsed() < self.ttl {
                debug!(instance_type = %instance_type, region = %region, image_id = %image.image_id, "Image memo hit");
                return Ok(image.clone());
            }
        }

        let image = self.discover_image(instance_type, region, architecture).await?;
        self.memo.insert(key, (image.clone(), Instant::now()));
        Ok(image)
    }

    async fn discover_image(
        &self,
        instance_type: &str,
        region: &str,
        architecture: Architecture,
    ) -> Result<ResolvedImage, MarketDataError> {
        let patterns = self
            .catalog
            .patterns
            .get(&architecture)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (tier, pattern) in patterns {
            let filter = ImageFilter {
                name_pattern: pattern.clone(),
                architecture,
                owners: self.catalog.owners.clone(),
            };

            match self.api.describe_images(region, &filter).await {
                Ok(images) => {
                    let newest = images
                        .into_iter()
                        .filter(|image| image.architecture == architecture)
                        .max_by(|a, b| {
                            a.creation_date
                                .cmp(&b.creation_date)
                                .then_with(|| a.image_id.cmp(&b.image_id))
                        });
                    if let Some(image) = newest {
                        info!(
                            instance_type = %instance_type,
                            region = %region,
                            image_id = %image.image_id,
                            tier = %tier,
                            "Resolved image"
                        );
                        return Ok(ResolvedImage {
                            image_id: image.image_id,
                            tier: *tier,
                            name: image.name,
                        });
                    }
                }
                Err(e) => {
                    warn!(region = %region, pattern = %pattern, "Image discovery failed: {e}");
                }
            }
        }

        if let Some(image_id) = self.catalog.fallback_image(region, architecture) {
            warn!(
                instance_type = %instance_type,
                region = %region,
                image_id = %image_id,
                "Discovery found no image, using fallback table"
            );
            return Ok(ResolvedImage {
                image_id: image_id.clone(),
                tier: ImageTier::Fallback,
                name: String::new(),
            });
        }

        Err(MarketDataError::ImageNotFound {
            instance_type: instance_type.to_string(),
            region: region.to_string(),
            architecture,
        })
    }

    /// Recent price samples for a batch of instance types.
    ///
    /// An empty result is returned as-is; callers substitute the fallback
    /// table for anything missing.
    ///
    /// # Errors
    /// Returns error if the price history call fails.
    pub async fn get_price_samples(
        &self,
        region: &str,
        instance_types: &[String],
        zone: Option<&str>,
    ) -> Result<Vec<PriceSample>, MarketDataError> {
        let samples = self
            .api
            .get_spot_price_history(region, instance_types, zone)
            .await?;
        debug!(region = %region, count = samples.len(), "Fetched price samples");
        Ok(samples)
    }
}
