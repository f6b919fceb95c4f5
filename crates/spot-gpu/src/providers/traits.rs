//! Cloud provisioning trait and common types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to the cloud provisioning API.
#[derive(Error, Debug)]
pub enum CloudApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Quota exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// CPU architecture of an instance type or machine image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM (Graviton).
    Arm64,
}

impl Architecture {
    /// Architecture label as used in image filters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter passed to image discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFilter {
    /// Image name glob (e.g. `Deep Learning Base*`).
    pub name_pattern: String,
    /// Required architecture.
    pub architecture: Architecture,
    /// Image owner accounts/aliases.
    pub owners: Vec<String>,
}

/// A machine image returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineImage {
    /// Image ID.
    pub image_id: String,
    /// Image name.
    pub name: String,
    /// Image architecture.
    pub architecture: Architecture,
    /// When the image was published.
    pub creation_date: Option<DateTime<Utc>>,
}

/// One spot price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    /// Instance type.
    pub instance_type: String,
    /// Availability zone.
    pub zone: String,
    /// Hourly price in USD.
    pub price: f64,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
}

/// Request for one-time spot capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequest {
    /// Instance type.
    pub instance_type: String,
    /// Machine image ID.
    pub image_id: String,
    /// Region.
    pub region: String,
    /// Availability zone.
    pub zone: String,
    /// Maximum hourly price in USD.
    pub max_price: f64,
    /// Subnet the instance is placed in.
    pub subnet_id: String,
    /// Tags applied to the request.
    pub tags: BTreeMap<String, String>,
}

/// Fulfilment state of a capacity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityRequestState {
    /// Waiting for fulfilment.
    Open,
    /// Fulfilled; an instance exists.
    Active,
    /// Rejected or failed.
    Failed,
    /// Cancelled by the caller or the provider.
    Cancelled,
    /// Closed without an instance.
    Closed,
}

impl std::fmt::Display for CapacityRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Status of a capacity request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequestStatus {
    /// Request ID.
    pub request_id: String,
    /// Current state.
    pub state: CapacityRequestState,
    /// Instance ID once fulfilled.
    pub instance_id: Option<String>,
    /// Provider status code (e.g. `capacity-not-available`).
    pub status_code: Option<String>,
    /// Provider status message.
    pub message: Option<String>,
}

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Instance is pending.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is stopping.
    Stopping,
    /// Instance is stopped.
    Stopped,
    /// Instance is terminated.
    Terminated,
    /// Unknown state.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Instance state and network placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Instance ID.
    pub instance_id: String,
    /// Current state.
    pub state: InstanceState,
    /// Public IPv4 address.
    pub public_ip: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
}

/// Trait for the cloud provisioning API.
///
/// Every call is region scoped. Implementations perform no retries of their
/// own; callers decide how to degrade.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Zones in `region` offering `instance_type`. Empty means unavailable.
    async fn list_instance_type_availability(
        &self,
        instance_type: &str,
        region: &str,
    ) -> Result<Vec<String>, CloudApiError>;

    /// Machine images matching a filter.
    async fn describe_images(
        &self,
        region: &str,
        filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>, CloudApiError>;

    /// Recent spot price samples for a batch of instance types.
    async fn get_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        zone: Option<&str>,
    ) -> Result<Vec<PriceSample>, CloudApiError>;

    /// Subnet usable for placement in `zone`, if any.
    async fn find_subnet(&self, region: &str, zone: &str) -> Result<Option<String>, CloudApiError>;

    /// Submit a one-time capacity request. Returns the request ID.
    async fn request_capacity(&self, req: &CapacityRequest) -> Result<String, CloudApiError>;

    /// Get the status of a capacity request.
    async fn describe_capacity_request(
        &self,
        region: &str,
        request_id: &str,
    ) -> Result<CapacityRequestStatus, CloudApiError>;

    /// Cancel a capacity request. Cancelling a closed request is not an error.
    async fn cancel_capacity_request(
        &self,
        region: &str,
        request_id: &str,
    ) -> Result<(), CloudApiError>;

    /// Get instance state and addresses.
    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription, CloudApiError>;

    /// Apply tags to a resource.
    async fn tag_resource(
        &self,
        region: &str,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudApiError>;
}
