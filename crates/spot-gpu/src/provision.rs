//! Provisioning state machine.
//!
//! Acquires spot capacity for a selected candidate by walking the region's
//! zones in ascending price order. Each zone attempt submits one request and
//! polls it to a terminal state. Any request that is not fulfilled is
//! cancelled before the machine moves on or returns, so no request is ever
//! left open behind a finished run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProvisioningError;
use crate::poll::{poll, PollOutcome, PollPolicy, PollStep};
use crate::pricing::latest_by_zone;
use crate::providers::{
    CapacityRequest, CapacityRequestState, CloudApi, CloudApiError, InstanceDescription,
    InstanceState, PriceSample,
};
use crate::scoring::Candidate;

/// Tag key identifying resources created by this tool.
pub const MANAGED_BY_TAG: &str = "ManagedBy";

/// Value of [`MANAGED_BY_TAG`].
pub const MANAGED_BY_VALUE: &str = "spot-gpu";

/// State of one zone attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Request submitted, awaiting fulfilment.
    Pending,
    /// Fulfilled.
    Active,
    /// Rejected by the provider or never submitted.
    Failed,
    /// Cancelled by this machine.
    Cancelled,
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a zone attempt did not produce an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No subnet exists in the zone.
    NoSubnet,
    /// The provider has no spare capacity.
    Capacity,
    /// The price ceiling is below the market price.
    Price,
    /// An account limit was hit.
    Quota,
    /// The image is invalid or not permitted.
    Image,
    /// Still pending after the last poll.
    Timeout,
    /// The run was cancelled.
    Interrupted,
    /// Rejected for another reason (provider status code).
    Rejected(String),
    /// The provisioning API failed.
    Api(String),
}

impl FailureReason {
    /// Classify a provider status code or error message.
    #[must_use]
    pub fn classify(code: &str) -> Self {
        let lower = code.to_ascii_lowercase();
        if lower.contains("capacity") {
            Self::Capacity
        } else if lower.contains("price") {
            Self::Price
        } else if lower.contains("limit") || lower.contains("quota") || lower.contains("exceeded")
        {
            Self::Quota
        } else if lower.contains("ami") || lower.contains("image") {
            Self::Image
        } else {
            Self::Rejected(code.to_string())
        }
    }

    /// Classify a failed API call.
    #[must_use]
    pub fn from_api_error(error: &CloudApiError) -> Self {
        match error {
            CloudApiError::QuotaExceeded(_) => Self::Quota,
            CloudApiError::Api { message, .. } => match Self::classify(message) {
                Self::Rejected(_) => Self::Api(error.to_string()),
                reason => reason,
            },
            other => Self::Api(other.to_string()),
        }
    }

    /// Suggested remedy for this reason, if there is one.
    #[must_use]
    pub fn remedy(&self, region: &str) -> Option<String> {
        match self {
            Self::NoSubnet => Some(format!(
                "Create a subnet in the remaining zones of {region}"
            )),
            Self::Capacity => Some(format!(
                "Spot capacity is short in {region}; enable cross-region search or try another region"
            )),
            Self::Price => Some("Raise the budget above the current spot price".to_string()),
            Self::Quota => Some(format!(
                "Check the spot vCPU quota for G and VT instances in {region}"
            )),
            Self::Image => Some("Check the machine image exists and is shared with the account".to_string()),
            Self::Timeout => Some("Retry later; requests stayed pending past the poll limit".to_string()),
            Self::Interrupted => None,
            Self::Rejected(code) => Some(format!("Inspect the provider status '{code}'")),
            Self::Api(_) => Some("Retry; the provisioning API returned errors".to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSubnet => write!(f, "no subnet in zone"),
            Self::Capacity => write!(f, "insufficient capacity"),
            Self::Price => write!(f, "price ceiling below market"),
            Self::Quota => write!(f, "quota exceeded"),
            Self::Image => write!(f, "image rejected"),
            Self::Timeout => write!(f, "not fulfilled in time"),
            Self::Interrupted => write!(f, "run cancelled"),
            Self::Rejected(code) => write!(f, "rejected: {code}"),
            Self::Api(message) => write!(f, "API error: {message}"),
        }
    }
}

/// One try to acquire capacity in one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningAttempt {
    /// Zone.
    pub zone: String,
    /// Request ID, once the request was accepted.
    pub request_id: Option<String>,
    /// Current state.
    pub state: AttemptState,
    /// Instance ID, once active.
    pub instance_id: Option<String>,
    /// Why the attempt failed.
    pub reason: Option<FailureReason>,
}

impl ProvisioningAttempt {
    fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
            request_id: None,
            state: AttemptState::Pending,
            instance_id: None,
            reason: None,
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        self.state = AttemptState::Failed;
        self.reason = Some(reason);
    }
}

/// Poll bounds of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningPolicy {
    /// Fulfilment polling of one request.
    pub fulfilment: PollPolicy,
    /// Wait for the instance to run with an address.
    pub running: PollPolicy,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            fulfilment: PollPolicy::attempts(Duration::from_secs(15), 10),
            running: PollPolicy::deadline(Duration::from_secs(10), Duration::from_secs(300)),
        }
    }
}

/// A fulfilled, running instance.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedHost {
    /// Instance ID.
    pub instance_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Image ID.
    pub image_id: String,
    /// Region.
    pub region: String,
    /// Zone the instance landed in.
    pub zone: String,
    /// Request that produced the instance.
    pub request_id: String,
    /// Price ceiling of the request.
    pub max_price: f64,
    /// Public IPv4 address.
    pub public_ip: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
    /// Every zone attempt of the run, in order.
    pub attempts: Vec<ProvisioningAttempt>,
}

impl ProvisionedHost {
    /// Address to reach the host at, preferring the public one.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.public_ip.as_deref().or(self.private_ip.as_deref())
    }
}

/// Order zones by ascending latest spot price.
///
/// Zones without a sample keep their relative order after the priced ones.
/// With no samples at all the list is returned as given.
#[must_use]
pub fn order_zones(zones: &[String], samples: &[PriceSample]) -> Vec<String> {
    let latest = latest_by_zone(samples);
    let price_of = |zone: &str| {
        latest
            .iter()
            .find(|((_, z), _)| z == zone)
            .map(|(_, sample)| sample.price)
    };

    let mut priced: Vec<(String, f64)> = Vec::new();
    let mut unpriced: Vec<String> = Vec::new();
    for zone in zones {
        match price_of(zone) {
            Some(price) => priced.push((zone.clone(), price)),
            None => unpriced.push(zone.clone()),
        }
    }
    priced.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    priced
        .into_iter()
        .map(|(zone, _)| zone)
        .chain(unpriced)
        .collect()
}

/// Outcome of a single zone attempt.
enum ZoneResult {
    Fulfilled(String),
    Failed,
    Interrupted,
}

/// Provisioning state machine over the cloud API.
pub struct Provisioner {
    api: Arc<dyn CloudApi>,
    policy: ProvisioningPolicy,
}

impl Provisioner {
    /// Create a provisioner with default poll bounds.
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        Self {
            api,
            policy: ProvisioningPolicy::default(),
        }
    }

    /// Set the poll bounds.
    #[must_use]
    pub fn with_policy(mut self, policy: ProvisioningPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Acquire an instance for `candidate` at a ceiling of `max_price`.
    ///
    /// # Errors
    /// Returns [`ProvisioningError::Exhausted`] when every zone failed,
    /// [`ProvisioningError::Cancelled`] when `cancel` fired (after
    /// cancelling any open request), or
    /// [`ProvisioningError::InstanceNotRunning`] when the fulfilled
    /// instance never became reachable.
    pub async fn provision(
        &self,
        candidate: &Candidate,
        max_price: f64,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedHost, ProvisioningError> {
        let zones = self.zone_order(candidate).await;
        info!(
            instance_type = %candidate.instance_type,
            region = %candidate.region,
            zones = %zones.join(","),
            max_price,
            "Provisioning"
        );

        let mut attempts: Vec<ProvisioningAttempt> = Vec::with_capacity(zones.len());
        for zone in &zones {
            if cancel.is_cancelled() {
                return Err(cancelled(candidate, attempts));
            }

            let mut attempt = ProvisioningAttempt::new(zone);
            let result = self
                .attempt_zone(candidate, zone, max_price, &mut attempt, cancel)
                .await;
            debug_assert_ne!(attempt.state, AttemptState::Pending);
            attempts.push(attempt);

            match result {
                ZoneResult::Fulfilled(instance_id) => {
                    return self
                        .finish(candidate, zone, max_price, instance_id, attempts, cancel)
                        .await;
                }
                ZoneResult::Failed => {}
                ZoneResult::Interrupted => return Err(cancelled(candidate, attempts)),
            }
        }

        warn!(
            instance_type = %candidate.instance_type,
            region = %candidate.region,
            attempts = attempts.len(),
            "All zones exhausted"
        );
        Err(ProvisioningError::Exhausted {
            instance_type: candidate.instance_type.clone(),
            region: candidate.region.clone(),
            attempts,
        })
    }

    /// Zones of the candidate's region, cheapest first.
    async fn zone_order(&self, candidate: &Candidate) -> Vec<String> {
        let region = &candidate.region;
        let mut zones = match self
            .api
            .list_instance_type_availability(&candidate.instance_type, region)
            .await
        {
            Ok(zones) => zones,
            Err(e) => {
                warn!(region = %region, "Availability lookup failed, using selected zone only: {e}");
                Vec::new()
            }
        };
        if zones.is_empty() {
            zones.push(candidate.zone.clone());
        }

        match self
            .api
            .get_spot_price_history(region, std::slice::from_ref(&candidate.instance_type), None)
            .await
        {
            Ok(samples) if !samples.is_empty() => order_zones(&zones, &samples),
            Ok(_) => {
                warn!(region = %region, "No fresh prices, trying zones unordered");
                zones
            }
            Err(e) => {
                warn!(region = %region, "Price refresh failed, trying zones unordered: {e}");
                zones
            }
        }
    }

    async fn attempt_zone(
        &self,
        candidate: &Candidate,
        zone: &str,
        max_price: f64,
        attempt: &mut ProvisioningAttempt,
        cancel: &CancellationToken,
    ) -> ZoneResult {
        let region = &candidate.region;

        let subnet_id = match self.api.find_subnet(region, zone).await {
            Ok(Some(subnet_id)) => subnet_id,
            Ok(None) => {
                info!(zone = %zone, "No subnet in zone, skipping");
                attempt.fail(FailureReason::NoSubnet);
                return ZoneResult::Failed;
            }
            Err(e) => {
                warn!(zone = %zone, "Subnet lookup failed, skipping: {e}");
                attempt.fail(FailureReason::from_api_error(&e));
                return ZoneResult::Failed;
            }
        };

        let request = CapacityRequest {
            instance_type: candidate.instance_type.clone(),
            image_id: candidate.image_id.clone(),
            region: region.clone(),
            zone: zone.to_string(),
            max_price,
            subnet_id,
            tags: BTreeMap::from([
                (
                    "Name".to_string(),
                    format!("spot-gpu-{}", candidate.instance_type),
                ),
                (MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string()),
            ]),
        };

        let request_id = match self.api.request_capacity(&request).await {
            Ok(request_id) => request_id,
            Err(e) => {
                warn!(zone = %zone, "Capacity request rejected: {e}");
                attempt.fail(FailureReason::from_api_error(&e));
                return ZoneResult::Failed;
            }
        };
        info!(zone = %zone, request_id = %request_id, "Capacity requested");
        attempt.request_id = Some(request_id.clone());

        let last_code: Mutex<Option<String>> = Mutex::new(None);
        let outcome = poll(&self.policy.fulfilment, cancel, "fulfilment", |n| {
            let request_id = request_id.clone();
            let last_code = &last_code;
            async move {
                let status = match self.api.describe_capacity_request(region, &request_id).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(request_id = %request_id, attempt = n, "Status check failed: {e}");
                        return PollStep::Pending;
                    }
                };
                debug!(
                    request_id = %request_id,
                    attempt = n,
                    state = %status.state,
                    code = status.status_code.as_deref().unwrap_or("-"),
                    "Request status"
                );
                if status.status_code.is_some() {
                    if let Ok(mut code) = last_code.lock() {
                        code.clone_from(&status.status_code);
                    }
                }

                match (status.state, status.instance_id) {
                    (CapacityRequestState::Active, Some(instance_id)) => {
                        PollStep::Done(Ok(instance_id))
                    }
                    (CapacityRequestState::Open | CapacityRequestState::Active, _) => {
                        PollStep::Pending
                    }
                    (state, _) => PollStep::Done(Err(status
                        .status_code
                        .as_deref()
                        .or(status.message.as_deref())
                        .map_or_else(
                            || FailureReason::Rejected(state.to_string()),
                            FailureReason::classify,
                        ))),
                }
            }
        })
        .await;

        match outcome {
            PollOutcome::Ready {
                value: Ok(instance_id),
                ..
            } => {
                info!(zone = %zone, instance_id = %instance_id, "Request fulfilled");
                attempt.state = AttemptState::Active;
                attempt.instance_id = Some(instance_id.clone());
                ZoneResult::Fulfilled(instance_id)
            }
            PollOutcome::Ready {
                value: Err(reason), ..
            } => {
                warn!(zone = %zone, request_id = %request_id, "Request failed: {reason}");
                self.cancel_request(region, &request_id).await;
                attempt.state = AttemptState::Failed;
                attempt.reason = Some(reason);
                ZoneResult::Failed
            }
            PollOutcome::Exhausted { attempts, .. } => {
                let last_code = last_code.into_inner().unwrap_or_else(PoisonError::into_inner);
                let reason = last_code
                    .as_deref()
                    .map_or(FailureReason::Timeout, |code| match FailureReason::classify(code) {
                        FailureReason::Rejected(_) => FailureReason::Timeout,
                        reason => reason,
                    });
                warn!(
                    zone = %zone,
                    request_id = %request_id,
                    polls = attempts,
                    "Request still pending, cancelling: {reason}"
                );
                attempt.state = self.cancel_request(region, &request_id).await;
                attempt.reason = Some(reason);
                ZoneResult::Failed
            }
            PollOutcome::Cancelled { .. } => {
                warn!(zone = %zone, request_id = %request_id, "Run cancelled, cancelling open request");
                attempt.state = self.cancel_request(region, &request_id).await;
                attempt.reason = Some(FailureReason::Interrupted);
                ZoneResult::Interrupted
            }
        }
    }

    /// Cancel a request, returning the resulting attempt state.
    async fn cancel_request(&self, region: &str, request_id: &str) -> AttemptState {
        match self.api.cancel_capacity_request(region, request_id).await {
            Ok(()) => {
                debug!(request_id = %request_id, "Request cancelled");
                AttemptState::Cancelled
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    "Failed to cancel request, it may need manual cleanup: {e}"
                );
                AttemptState::Failed
            }
        }
    }

    async fn finish(
        &self,
        candidate: &Candidate,
        zone: &str,
        max_price: f64,
        instance_id: String,
        attempts: Vec<ProvisioningAttempt>,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedHost, ProvisioningError> {
        let region = &candidate.region;

        let tags = BTreeMap::from([
            (
                "Name".to_string(),
                format!("spot-gpu-{}", candidate.instance_type),
            ),
            ("InstanceType".to_string(), candidate.instance_type.clone()),
            ("ImageId".to_string(), candidate.image_id.clone()),
            ("ImageTier".to_string(), candidate.image_tier.to_string()),
            ("Zone".to_string(), zone.to_string()),
            ("SpotPrice".to_string(), format!("{:.4}", candidate.spot_price)),
            ("MaxPrice".to_string(), format!("{max_price:.4}")),
            (MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string()),
        ]);
        if let Err(e) = self.api.tag_resource(region, &instance_id, &tags).await {
            warn!(instance_id = %instance_id, "Failed to tag instance: {e}");
        }

        let description = match self.wait_running(region, &instance_id, cancel).await {
            Ok(description) => description,
            Err(e) => {
                error!(
                    instance_id = %instance_id,
                    zone = %zone,
                    "Fulfilled instance left in place, terminate it manually: {e}"
                );
                return Err(match e {
                    ProvisioningError::Cancelled { .. } => cancelled(candidate, attempts),
                    e => e,
                });
            }
        };

        let request_id = attempts
            .last()
            .and_then(|a| a.request_id.clone())
            .unwrap_or_default();

        info!(
            instance_id = %instance_id,
            zone = %zone,
            public_ip = description.public_ip.as_deref().unwrap_or("-"),
            "Instance running"
        );

        Ok(ProvisionedHost {
            instance_id,
            instance_type: candidate.instance_type.clone(),
            image_id: candidate.image_id.clone(),
            region: region.clone(),
            zone: zone.to_string(),
            request_id,
            max_price,
            public_ip: description.public_ip,
            private_ip: description.private_ip,
            attempts,
        })
    }

    /// Wait for the instance to run with a public address.
    async fn wait_running(
        &self,
        region: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceDescription, ProvisioningError> {
        let outcome = poll(&self.policy.running, cancel, "instance running", |n| async move {
            match self.api.describe_instance(region, instance_id).await {
                Ok(d) if d.state == InstanceState::Running && d.public_ip.is_some() => {
                    PollStep::Done(Ok(d))
                }
                Ok(d) if matches!(
                    d.state,
                    InstanceState::Stopping | InstanceState::Stopped | InstanceState::Terminated
                ) =>
                {
                    PollStep::Done(Err(d.state))
                }
                Ok(d) => {
                    debug!(instance_id = %instance_id, attempt = n, state = %d.state, "Waiting for instance");
                    PollStep::Pending
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, attempt = n, "Describe failed: {e}");
                    PollStep::Pending
                }
            }
        })
        .await;

        match outcome {
            PollOutcome::Ready { value: Ok(d), .. } => Ok(d),
            PollOutcome::Ready {
                value: Err(state), ..
            } => Err(ProvisioningError::InstanceNotRunning {
                instance_id: instance_id.to_string(),
                reason: format!("instance entered state {state}"),
            }),
            PollOutcome::Exhausted { elapsed, .. } => Err(ProvisioningError::InstanceNotRunning {
                instance_id: instance_id.to_string(),
                reason: format!(
                    "not running with a public address after {}s",
                    elapsed.as_secs()
                ),
            }),
            PollOutcome::Cancelled { .. } => Err(ProvisioningError::Cancelled {
                instance_type: String::new(),
                region: region.to_string(),
                attempts: Vec::new(),
            }),
        }
    }
}

fn cancelled(candidate: &Candidate, attempts: Vec<ProvisioningAttempt>) -> ProvisioningError {
    ProvisioningError::Cancelled {
        instance_type: candidate.instance_type.clone(),
        region: candidate.region.clone(),
        attempts,
    }
}
