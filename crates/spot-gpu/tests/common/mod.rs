//! In-memory fakes of the cloud API and the remote command channel.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::Instant;

use spot_gpu::providers::{
    Architecture, CapacityRequest, CapacityRequestState, CapacityRequestStatus, CloudApi,
    CloudApiError, ImageFilter, InstanceDescription, InstanceState, MachineImage, PriceSample,
};
use spot_gpu::remote::{CommandOutput, RemoteError, RemoteExecutor};

/// Public address every fake instance gets.
pub const FAKE_PUBLIC_IP: &str = "203.0.113.10";

/// How a zone answers capacity requests.
#[derive(Debug, Clone)]
pub enum ZoneScript {
    /// Active after this many status polls.
    Fulfil { after_polls: u32 },
    /// Provider fails the request with this status code.
    Fail { code: String },
    /// Request stays open forever.
    StayOpen { code: Option<String> },
    /// Submission is rejected outright.
    Reject(String),
}

/// How fulfilled instances report themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceScript {
    /// Running with a public address.
    Running,
    /// Running, but never assigned a public address.
    NoPublicIp,
    /// Stuck in this state.
    Stuck(InstanceState),
}

/// A recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Availability { region: String, instance_type: String },
    DescribeImages { region: String, pattern: String },
    PriceHistory { region: String },
    FindSubnet { zone: String },
    RequestCapacity { zone: String, max_price_cents: u64 },
    DescribeRequest { request_id: String },
    CancelRequest { request_id: String },
    DescribeInstance { instance_id: String },
    Tag { resource_id: String, tags: BTreeMap<String, String> },
}

#[derive(Default)]
struct CloudState {
    availability: HashMap<(String, String), Vec<String>>,
    images: HashMap<String, Vec<MachineImage>>,
    prices: HashMap<String, Vec<PriceSample>>,
    price_history_fails: bool,
    no_subnet: HashSet<String>,
    zones: HashMap<String, ZoneScript>,
    requests: HashMap<String, String>,
    polls: HashMap<String, u32>,
    instance: Option<InstanceScript>,
    cancel_fails: bool,
    availability_delay: Duration,
    calls: Vec<Call>,
}

/// In-memory [`CloudApi`].
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `instance_type` in `zones` of `region`.
    pub fn offer(self, region: &str, instance_type: &str, zones: &[&str]) -> Self {
        self.state.lock().unwrap().availability.insert(
            (region.to_string(), instance_type.to_string()),
            zones.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Publish an image in `region`.
    pub fn image(self, region: &str, image_id: &str, architecture: Architecture) -> Self {
        self.state
            .lock()
            .unwrap()
            .images
            .entry(region.to_string())
            .or_default()
            .push(MachineImage {
                image_id: image_id.to_string(),
                name: format!("Deep Learning Base {image_id}"),
                architecture,
                creation_date: Some(Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()),
            });
        self
    }

    /// Add a spot price sample.
    pub fn price(self, region: &str, instance_type: &str, zone: &str, price: f64) -> Self {
        self.state
            .lock()
            .unwrap()
            .prices
            .entry(region.to_string())
            .or_default()
            .push(PriceSample {
                instance_type: instance_type.to_string(),
                zone: zone.to_string(),
                price,
                timestamp: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
            });
        self
    }

    /// Make every price history call fail.
    pub fn failing_price_history(self) -> Self {
        self.state.lock().unwrap().price_history_fails = true;
        self
    }

    /// Remove the subnet of a zone.
    pub fn without_subnet(self, zone: &str) -> Self {
        self.state.lock().unwrap().no_subnet.insert(zone.to_string());
        self
    }

    /// Script a zone's capacity behaviour (default: fulfil on first poll).
    pub fn zone(self, zone: &str, script: ZoneScript) -> Self {
        self.state
            .lock()
            .unwrap()
            .zones
            .insert(zone.to_string(), script);
        self
    }

    /// Script what `describe_instance` reports (default: running).
    pub fn instance(self, script: InstanceScript) -> Self {
        self.state.lock().unwrap().instance = Some(script);
        self
    }

    /// Make every request cancellation fail.
    pub fn failing_cancel(self) -> Self {
        self.state.lock().unwrap().cancel_fails = true;
        self
    }

    /// Delay every availability lookup.
    pub fn slow_availability(self, delay: Duration) -> Self {
        self.state.lock().unwrap().availability_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn requested_zones(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RequestCapacity { zone, .. } => Some(zone),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled_requests(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CancelRequest { request_id } => Some(request_id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

pub fn request_id_for(zone: &str) -> String {
    format!("sir-{zone}")
}

pub fn instance_id_for(zone: &str) -> String {
    format!("i-{zone}")
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_instance_type_availability(
        &self,
        instance_type: &str,
        region: &str,
    ) -> Result<Vec<String>, CloudApiError> {
        self.record(Call::Availability {
            region: region.to_string(),
            instance_type: instance_type.to_string(),
        });
        let delay = self.state.lock().unwrap().availability_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .availability
            .get(&(region.to_string(), instance_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn describe_images(
        &self,
        region: &str,
        filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>, CloudApiError> {
        self.record(Call::DescribeImages {
            region: region.to_string(),
            pattern: filter.name_pattern.clone(),
        });
        Ok(self
            .state
            .lock()
            .unwrap()
            .images
            .get(region)
            .map(|images| {
                images
                    .iter()
                    .filter(|i| i.architecture == filter.architecture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_spot_price_history(
        &self,
        region: &str,
        instance_types: &[String],
        zone: Option<&str>,
    ) -> Result<Vec<PriceSample>, CloudApiError> {
        self.record(Call::PriceHistory {
            region: region.to_string(),
        });
        let state = self.state.lock().unwrap();
        if state.price_history_fails {
            return Err(CloudApiError::Api {
                status: 503,
                message: "RequestLimitExceeded".to_string(),
            });
        }
        Ok(state
            .prices
            .get(region)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| instance_types.contains(&s.instance_type))
                    .filter(|s| zone.map_or(true, |z| z == s.zone))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_subnet(&self, _region: &str, zone: &str) -> Result<Option<String>, CloudApiError> {
        self.record(Call::FindSubnet {
            zone: zone.to_string(),
        });
        let state = self.state.lock().unwrap();
        Ok((!state.no_subnet.contains(zone)).then(|| format!("subnet-{zone}")))
    }

    async fn request_capacity(&self, req: &CapacityRequest) -> Result<String, CloudApiError> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_price_cents = (req.max_price * 100.0).round() as u64;
        self.record(Call::RequestCapacity {
            zone: req.zone.clone(),
            max_price_cents,
        });

        let mut state = self.state.lock().unwrap();
        if let Some(ZoneScript::Reject(message)) = state.zones.get(&req.zone) {
            return Err(CloudApiError::Api {
                status: 400,
                message: message.clone(),
            });
        }
        let request_id = request_id_for(&req.zone);
        state.requests.insert(request_id.clone(), req.zone.clone());
        Ok(request_id)
    }

    async fn describe_capacity_request(
        &self,
        _region: &str,
        request_id: &str,
    ) -> Result<CapacityRequestStatus, CloudApiError> {
        self.record(Call::DescribeRequest {
            request_id: request_id.to_string(),
        });

        let mut state = self.state.lock().unwrap();
        let zone = state
            .requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| CloudApiError::NotFound(request_id.to_string()))?;
        let polls = {
            let polls = state.polls.entry(request_id.to_string()).or_default();
            *polls += 1;
            *polls
        };
        let script = state
            .zones
            .get(&zone)
            .cloned()
            .unwrap_or(ZoneScript::Fulfil { after_polls: 1 });

        let status = |s: CapacityRequestState, instance_id: Option<String>, code: Option<String>| {
            CapacityRequestStatus {
                request_id: request_id.to_string(),
                state: s,
                instance_id,
                status_code: code,
                message: None,
            }
        };

        Ok(match script {
            ZoneScript::Fulfil { after_polls } if polls >= after_polls => status(
                CapacityRequestState::Active,
                Some(instance_id_for(&zone)),
                Some("fulfilled".to_string()),
            ),
            ZoneScript::Fulfil { .. } => status(
                CapacityRequestState::Open,
                None,
                Some("pending-fulfillment".to_string()),
            ),
            ZoneScript::Fail { code } => status(CapacityRequestState::Failed, None, Some(code)),
            ZoneScript::StayOpen { code } => status(CapacityRequestState::Open, None, code),
            ZoneScript::Reject(_) => status(CapacityRequestState::Open, None, None),
        })
    }

    async fn cancel_capacity_request(
        &self,
        _region: &str,
        request_id: &str,
    ) -> Result<(), CloudApiError> {
        self.record(Call::CancelRequest {
            request_id: request_id.to_string(),
        });
        if self.state.lock().unwrap().cancel_fails {
            return Err(CloudApiError::Api {
                status: 500,
                message: "InternalError".to_string(),
            });
        }
        Ok(())
    }

    async fn describe_instance(
        &self,
        _region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription, CloudApiError> {
        self.record(Call::DescribeInstance {
            instance_id: instance_id.to_string(),
        });
        let script = self
            .state
            .lock()
            .unwrap()
            .instance
            .unwrap_or(InstanceScript::Running);
        let (state, public_ip) = match script {
            InstanceScript::Running => (InstanceState::Running, Some(FAKE_PUBLIC_IP.to_string())),
            InstanceScript::NoPublicIp => (InstanceState::Running, None),
            InstanceScript::Stuck(state) => (state, None),
        };
        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state,
            public_ip,
            private_ip: Some("10.0.0.10".to_string()),
        })
    }

    async fn tag_resource(
        &self,
        _region: &str,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudApiError> {
        self.record(Call::Tag {
            resource_id: resource_id.to_string(),
            tags: tags.clone(),
        });
        Ok(())
    }
}

type Handler =
    dyn Fn(&str, Duration) -> Result<CommandOutput, RemoteError> + Send + Sync + 'static;

/// Scripted [`RemoteExecutor`].
///
/// The handler receives the command and the virtual time elapsed since the
/// fake was created.
pub struct FakeRemote {
    start: Instant,
    handler: Box<Handler>,
    commands: Mutex<Vec<(Duration, String)>>,
}

impl FakeRemote {
    pub fn new(
        handler: impl Fn(&str, Duration) -> Result<CommandOutput, RemoteError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            handler: Box::new(handler),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn ran(&self, fragment: &str) -> bool {
        self.commands().iter().any(|c| c.contains(fragment))
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn execute(
        &self,
        _host: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let elapsed = self.start.elapsed();
        self.commands
            .lock()
            .unwrap()
            .push((elapsed, command.to_string()));
        (self.handler)(command, elapsed)
    }
}

pub fn ok(stdout: &str) -> Result<CommandOutput, RemoteError> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    })
}

pub fn refused() -> Result<CommandOutput, RemoteError> {
    Err(RemoteError::Connect {
        host: FAKE_PUBLIC_IP.to_string(),
        message: "Connection refused".to_string(),
    })
}

/// Which readiness command a string is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Echo,
    BootInit,
    Markers,
    Tail,
    Resources,
    Gpu,
    Docker,
    Mount,
    Other,
}

pub fn classify(command: &str) -> Cmd {
    if command.starts_with("echo") {
        Cmd::Echo
    } else if command.starts_with("cloud-init") {
        Cmd::BootInit
    } else if command.starts_with("ls -1") {
        Cmd::Markers
    } else if command.starts_with("tail") {
        Cmd::Tail
    } else if command.starts_with("uptime") {
        Cmd::Resources
    } else if command.starts_with("nvidia-smi") {
        Cmd::Gpu
    } else if command.starts_with("docker") {
        Cmd::Docker
    } else if command.starts_with("mountpoint") {
        Cmd::Mount
    } else {
        Cmd::Other
    }
}

/// A host that is reachable, booted, fully set up and healthy.
pub fn healthy_host(command: &str, _elapsed: Duration) -> Result<CommandOutput, RemoteError> {
    match classify(command) {
        Cmd::Echo => ok("spot-gpu-ready\n"),
        Cmd::BootInit => ok("status: done\n"),
        Cmd::Markers => ok(
            "system-update.done\nnvidia-driver.done\ndocker.done\nnvidia-container-toolkit.done\nshared-storage.done\napplication.done\nsetup-complete\n",
        ),
        Cmd::Gpu => ok("NVIDIA A10G, 23028 MiB\n"),
        Cmd::Docker => ok("27.3.1\n"),
        Cmd::Mount => ok("mounted /mnt/efs\n"),
        Cmd::Tail => ok("setup finished\n"),
        Cmd::Resources => ok(" 10:00:00 up 5 min, load average: 0.10\n"),
        Cmd::Other => ok(""),
    }
}
