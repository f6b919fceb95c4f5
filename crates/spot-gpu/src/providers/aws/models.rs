//! EC2 API request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// Common types
// ============================================================================

/// Resource tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Tag specification for resource creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagSpecification {
    /// Resource type to tag.
    pub resource_type: String,
    /// Tags to apply.
    pub tags: Vec<Tag>,
}

/// Request filter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Filter {
    /// Filter name.
    pub name: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    /// Build a filter with the given values.
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// EC2 error envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// EC2 error detail.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorDetail {
    /// Error code (e.g. `MaxSpotInstanceCountExceeded`).
    pub code: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Instance type offerings
// ============================================================================

/// Describe instance type offerings request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstanceTypeOfferingsRequest {
    /// Location granularity (`availability-zone`).
    pub location_type: String,
    /// Filters.
    pub filters: Vec<Filter>,
}

/// Describe instance type offerings response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstanceTypeOfferingsResponse {
    /// Offerings.
    #[serde(default)]
    pub instance_type_offerings: Vec<InstanceTypeOffering>,
}

/// One offering of an instance type in a location.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceTypeOffering {
    /// Instance type.
    pub instance_type: String,
    /// Location (zone name).
    pub location: String,
}

// ============================================================================
// Images
// ============================================================================

/// Describe images request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeImagesRequest {
    /// Owner aliases or account IDs.
    pub owners: Vec<String>,
    /// Filters.
    pub filters: Vec<Filter>,
}

/// Describe images response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeImagesResponse {
    /// Images.
    #[serde(default)]
    pub images: Vec<Ec2Image>,
}

/// EC2 machine image.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ec2Image {
    /// Image ID.
    pub image_id: String,
    /// Image name.
    #[serde(default)]
    pub name: String,
    /// Architecture (`x86_64`, `arm64`).
    pub architecture: String,
    /// Creation date (RFC 3339).
    pub creation_date: Option<String>,
    /// Image state.
    pub state: Option<String>,
}

// ============================================================================
// Spot price history
// ============================================================================

/// Describe spot price history request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSpotPriceHistoryRequest {
    /// Instance types.
    pub instance_types: Vec<String>,
    /// Product descriptions (`Linux/UNIX`).
    pub product_descriptions: Vec<String>,
    /// Optional zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Window start (RFC 3339).
    pub start_time: String,
}

/// Describe spot price history response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSpotPriceHistoryResponse {
    /// Price history entries.
    #[serde(default)]
    pub spot_price_history: Vec<SpotPrice>,
}

/// One spot price history entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotPrice {
    /// Instance type.
    pub instance_type: String,
    /// Zone.
    pub availability_zone: String,
    /// Price as a decimal string.
    pub spot_price: String,
    /// Timestamp (RFC 3339).
    pub timestamp: String,
}

// ============================================================================
// Subnets
// ============================================================================

/// Describe subnets request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSubnetsRequest {
    /// Filters.
    pub filters: Vec<Filter>,
}

/// Describe subnets response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSubnetsResponse {
    /// Subnets.
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// EC2 subnet.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    /// Subnet ID.
    pub subnet_id: String,
    /// Zone.
    pub availability_zone: String,
    /// Free IPv4 addresses.
    #[serde(default)]
    pub available_ip_address_count: u32,
}

// ============================================================================
// Spot instance requests
// ============================================================================

/// Request spot instances body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestSpotInstancesRequest {
    /// Maximum price as a decimal string.
    pub spot_price: String,
    /// Number of instances.
    pub instance_count: u32,
    /// Request type (`one-time`).
    #[serde(rename = "Type")]
    pub request_type: String,
    /// Launch specification.
    pub launch_specification: LaunchSpecification,
    /// Tags applied to the request.
    pub tag_specifications: Vec<TagSpecification>,
}

/// Launch specification for a spot request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchSpecification {
    /// Image ID.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet ID.
    pub subnet_id: String,
    /// Placement.
    pub placement: Placement,
}

/// Instance placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Placement {
    /// Zone.
    pub availability_zone: String,
}

/// Request spot instances response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestSpotInstancesResponse {
    /// Created requests.
    #[serde(default)]
    pub spot_instance_requests: Vec<SpotInstanceRequest>,
}

/// Describe spot instance requests body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSpotInstanceRequestsRequest {
    /// Request IDs.
    pub spot_instance_request_ids: Vec<String>,
}

/// Describe spot instance requests response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSpotInstanceRequestsResponse {
    /// Requests.
    #[serde(default)]
    pub spot_instance_requests: Vec<SpotInstanceRequest>,
}

/// Spot instance request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotInstanceRequest {
    /// Request ID.
    pub spot_instance_request_id: String,
    /// State (`open`, `active`, `failed`, `cancelled`, `closed`).
    pub state: String,
    /// Fulfilled instance ID.
    pub instance_id: Option<String>,
    /// Detailed status.
    pub status: Option<SpotRequestStatus>,
}

/// Detailed status of a spot request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotRequestStatus {
    /// Status code (e.g. `capacity-not-available`).
    pub code: String,
    /// Status message.
    pub message: Option<String>,
}

/// Cancel spot instance requests body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelSpotInstanceRequestsRequest {
    /// Request IDs.
    pub spot_instance_request_ids: Vec<String>,
}

// ============================================================================
// Instances
// ============================================================================

/// Describe instances body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesRequest {
    /// Instance IDs.
    pub instance_ids: Vec<String>,
}

/// Describe instances response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesResponse {
    /// Reservations.
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

/// Reservation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    /// Instances.
    #[serde(default)]
    pub instances: Vec<Ec2Instance>,
}

/// EC2 instance.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ec2Instance {
    /// Instance ID.
    pub instance_id: String,
    /// Instance state.
    pub state: InstanceStateInfo,
    /// Public IPv4 address.
    pub public_ip_address: Option<String>,
    /// Private IPv4 address.
    pub private_ip_address: Option<String>,
}

/// Instance state.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceStateInfo {
    /// State code.
    pub code: i32,
    /// State name.
    pub name: String,
}

/// Create tags body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateTagsRequest {
    /// Resource IDs.
    pub resources: Vec<String>,
    /// Tags.
    pub tags: Vec<Tag>,
}
