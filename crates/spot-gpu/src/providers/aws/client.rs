//! EC2 API client implementation.
//!
//! Requests are sent as JSON bodies to `?Action=<name>` endpoints. They are
//! not SigV4 signed here; point the endpoint at a signing proxy when talking
//! to the real service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    CancelSpotInstanceRequestsRequest, CreateTagsRequest, DescribeImagesRequest,
    DescribeImagesResponse, DescribeInstanceTypeOfferingsRequest,
    DescribeInstanceTypeOfferingsResponse, DescribeInstancesRequest, DescribeInstancesResponse,
    DescribeSpotInstanceRequestsRequest, DescribeSpotInstanceRequestsResponse,
    DescribeSpotPriceHistoryRequest, DescribeSpotPriceHistoryResponse, DescribeSubnetsRequest,
    DescribeSubnetsResponse, Ec2Image, Ec2Instance, ErrorResponse, Filter, LaunchSpecification,
    Placement, RequestSpotInstancesRequest, RequestSpotInstancesResponse, SpotInstanceRequest,
    Tag, TagSpecification,
};
use crate::providers::traits::{
    Architecture, CapacityRequest, CapacityRequestState, CapacityRequestStatus, CloudApi,
    CloudApiError, ImageFilter, InstanceDescription, InstanceState, MachineImage, PriceSample,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// EC2 API version.
const API_VERSION: &str = "2016-11-15";

/// How far back spot price history is fetched.
const PRICE_HISTORY_HOURS: i64 = 1;

/// EC2-style cloud provisioning client.
#[derive(Clone)]
pub struct Ec2Client {
    /// HTTP client.
    client: Client,
    /// Fixed endpoint overriding the per-region default.
    endpoint: Option<String>,
}

impl Ec2Client {
    /// Create a new client using per-region default endpoints.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new() -> Result<Self, CloudApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudApiError::Http)?;

        Ok(Self {
            client,
            endpoint: None,
        })
    }

    /// Send every request to a fixed endpoint (signing proxy, local stub).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Get the EC2 endpoint for a region.
    fn ec2_endpoint(&self, region: &str) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ec2.{region}.amazonaws.com"))
    }

    /// Execute an EC2 action.
    async fn ec2_request<T, B>(&self, region: &str, action: &str, body: &B) -> Result<T, CloudApiError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!(
            "{}/?Action={action}&Version={API_VERSION}",
            self.ec2_endpoint(region)
        );
        debug!(url = %url, region = %region, action = %action, "EC2 request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Amz-Date", Utc::now().format("%Y%m%dT%H%M%SZ").to_string())
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Execute an EC2 action whose response body is ignored.
    async fn ec2_action<B: serde::Serialize>(
        &self,
        region: &str,
        action: &str,
        body: &B,
    ) -> Result<(), CloudApiError> {
        self.ec2_request::<serde_json::Value, B>(region, action, body)
            .await
            .map(|_| ())
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudApiError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudApiError::Serialization(e)
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(CloudApiError::NotFound(text));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudApiError::Auth(text));
        }

        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) if is_quota_code(&err.error.code) => Err(CloudApiError::QuotaExceeded(
                format!("{}: {}", err.error.code, err.error.message),
            )),
            Ok(err) => Err(CloudApiError::Api {
                status: status.as_u16(),
                message: format!("{}: {}", err.error.code, err.error.message),
            }),
            Err(_) => Err(CloudApiError::Api {
                status: status.as_u16(),
                message: text,
            }),
        }
    }

    /// Convert an EC2 image to our type. Unknown architectures are dropped.
    fn to_machine_image(image: &Ec2Image) -> Option<MachineImage> {
        let architecture = match image.architecture.as_str() {
            "x86_64" => Architecture::X86_64,
            "arm64" => Architecture::Arm64,
            _ => return None,
        };
        if image.state.as_deref().is_some_and(|s| s != "available") {
            return None;
        }

        Some(MachineImage {
            image_id: image.image_id.clone(),
            name: image.name.clone(),
            architecture,
            creation_date: parse_timestamp(image.creation_date.as_deref()),
        })
    }

    /// Convert a spot request to our status type.
    fn to_request_status(req: &SpotInstanceRequest) -> CapacityRequestStatus {
        let state = match req.state.as_str() {
            "open" => CapacityRequestState::Open,
            "active" => CapacityRequestState::Active,
            "cancelled" => CapacityRequestState::Cancelled,
            "closed" => CapacityRequestState::Closed,
            _ => CapacityRequestState::Failed,
        };

        CapacityRequestStatus {
            request_id: req.spot_instance_request_id.clone(),
            state,
            instance_id: req.instance_id.clone(),
            status_code: req.status.as_ref().map(|s| s.code.clone()),
            message: req.status.as_ref().and_then(|s| s.message.clone()),
        }
    }

    /// Convert an EC2 instance to our type.
    fn to_instance(ec2: &Ec2Instance) -> InstanceDescription {
        let state = match ec2.state.name.as_str() {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "shutting-down" | "terminated" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        };

        InstanceDescription {
            instance_id: ec2.instance_id.clone(),
            state,
            public_ip: ec2.public_ip_address.clone(),
            private_ip: ec2.private_ip_address.clone(),
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_quota_code(code: &str) -> bool {
    code.contains("LimitExceeded") || code.contains("CountExceeded") || code.contains("Quota")
}

fn to_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter()
        .map(|(key, value)| Tag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

#[async_trait]
impl CloudApi for Ec2Client {
    async fn list_instance_type_availability(
        &self,
        instance_type: &str,
        region: &str,
    ) -> Result<Vec<String>, CloudApiError> {
        let body = DescribeInstanceTypeOfferingsRequest {
            location_type: "availability-zone".to_string(),
            filters: vec![Filter::new("instance-type", vec![instance_type.to_string()])],
        };

        let response: DescribeInstanceTypeOfferingsResponse = self
            .ec2_request(region, "DescribeInstanceTypeOfferings", &body)
            .await?;

        let mut zones: Vec<String> = response
            .instance_type_offerings
            .into_iter()
            .filter(|o| o.instance_type == instance_type)
            .map(|o| o.location)
            .collect();
        zones.sort();
        zones.dedup();
        Ok(zones)
    }

    async fn describe_images(
        &self,
        region: &str,
        filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>, CloudApiError> {
        let body = DescribeImagesRequest {
            owners: filter.owners.clone(),
            filters: vec![
                Filter::new("name", vec![filter.name_pattern.clone()]),
                Filter::new("architecture", vec![filter.architecture.as_str().to_string()]),
                Filter::new("state", vec!["available".to_string()]),
            ],
        };

        let response: DescribeImagesResponse =
            self.ec2_request(region, "DescribeImages", &body).await?;

        Ok(response
            .images
            .iter()
            .filter_map(Self::to_machine_image)
            .filter(|img| img.architecture == filter.architecture)
            .collect())
    }

    async fn get_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        zone: Option<&str>,
    ) -> Result<Vec<PriceSample>, CloudApiError> {
        let start = Utc::now() - chrono::Duration::hours(PRICE_HISTORY_HOURS);
        let body = DescribeSpotPriceHistoryRequest {
            instance_types: instance_types.to_vec(),
            product_descriptions: vec!["Linux/UNIX".to_string()],
            availability_zone: zone.map(str::to_string),
            start_time: start.to_rfc3339(),
        };

        let response: DescribeSpotPriceHistoryResponse = self
            .ec2_request(region, "DescribeSpotPriceHistory", &body)
            .await?;

        let samples = response
            .spot_price_history
            .iter()
            .filter_map(|p| {
                let price = p.spot_price.parse::<f64>().ok()?;
                let timestamp = parse_timestamp(Some(&p.timestamp))?;
                Some(PriceSample {
                    instance_type: p.instance_type.clone(),
                    zone: p.availability_zone.clone(),
                    price,
                    timestamp,
                })
            })
            .collect();

        Ok(samples)
    }

    async fn find_subnet(&self, region: &str, zone: &str) -> Result<Option<String>, CloudApiError> {
        let body = DescribeSubnetsRequest {
            filters: vec![
                Filter::new("availability-zone", vec![zone.to_string()]),
                Filter::new("state", vec!["available".to_string()]),
            ],
        };

        let response: DescribeSubnetsResponse =
            self.ec2_request(region, "DescribeSubnets", &body).await?;

        Ok(response
            .subnets
            .into_iter()
            .filter(|s| s.availability_zone == zone && s.available_ip_address_count > 0)
            .max_by_key(|s| s.available_ip_address_count)
            .map(|s| s.subnet_id))
    }

    async fn request_capacity(&self, req: &CapacityRequest) -> Result<String, CloudApiError> {
        info!(
            instance_type = %req.instance_type,
            zone = %req.zone,
            max_price = req.max_price,
            "Requesting spot capacity"
        );

        let body = RequestSpotInstancesRequest {
            spot_price: format!("{:.4}", req.max_price),
            instance_count: 1,
            request_type: "one-time".to_string(),
            launch_specification: LaunchSpecification {
                image_id: req.image_id.clone(),
                instance_type: req.instance_type.clone(),
                subnet_id: req.subnet_id.clone(),
                placement: Placement {
                    availability_zone: req.zone.clone(),
                },
            },
            tag_specifications: vec![TagSpecification {
                resource_type: "spot-instances-request".to_string(),
                tags: to_tags(&req.tags),
            }],
        };

        let response: RequestSpotInstancesResponse = self
            .ec2_request(&req.region, "RequestSpotInstances", &body)
            .await?;

        let request = response
            .spot_instance_requests
            .first()
            .ok_or_else(|| CloudApiError::Api {
                status: 500,
                message: "No spot request returned from creation".to_string(),
            })?;

        info!(request_id = %request.spot_instance_request_id, "Spot request created");
        Ok(request.spot_instance_request_id.clone())
    }

    async fn describe_capacity_request(
        &self,
        region: &str,
        request_id: &str,
    ) -> Result<CapacityRequestStatus, CloudApiError> {
        let body = DescribeSpotInstanceRequestsRequest {
            spot_instance_request_ids: vec![request_id.to_string()],
        };

        let response: DescribeSpotInstanceRequestsResponse = self
            .ec2_request(region, "DescribeSpotInstanceRequests", &body)
            .await?;

        response
            .spot_instance_requests
            .iter()
            .find(|r| r.spot_instance_request_id == request_id)
            .map(Self::to_request_status)
            .ok_or_else(|| CloudApiError::NotFound(format!("Spot request not found: {request_id}")))
    }

    async fn cancel_capacity_request(
        &self,
        region: &str,
        request_id: &str,
    ) -> Result<(), CloudApiError> {
        info!(request_id = %request_id, "Cancelling spot request");

        let body = CancelSpotInstanceRequestsRequest {
            spot_instance_request_ids: vec![request_id.to_string()],
        };

        match self
            .ec2_action(region, "CancelSpotInstanceRequests", &body)
            .await
        {
            Err(CloudApiError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription, CloudApiError> {
        let body = DescribeInstancesRequest {
            instance_ids: vec![instance_id.to_string()],
        };

        let response: DescribeInstancesResponse =
            self.ec2_request(region, "DescribeInstances", &body).await?;

        let ec2 = response
            .reservations
            .iter()
            .flat_map(|r| r.instances.iter())
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| CloudApiError::NotFound(format!("Instance not found: {instance_id}")))?;

        Ok(Self::to_instance(ec2))
    }

    async fn tag_resource(
        &self,
        region: &str,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudApiError> {
        debug!(resource_id = %resource_id, count = tags.len(), "Tagging resource");

        let body = CreateTagsRequest {
            resources: vec![resource_id.to_string()],
            tags: to_tags(tags),
        };

        self.ec2_action(region, "CreateTags", &body).await
    }
}
