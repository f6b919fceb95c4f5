//! Settings.
//!
//! Loaded from an optional TOML file, then overridden by `SPOT_GPU_*`
//! environment variables. CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::poll::PollPolicy;
use crate::provision::ProvisioningPolicy;
use crate::readiness::{ReadinessPolicy, SetupLayout};
use crate::remote::SshExecutor;

/// Regions the tool knows how to price and provision in.
pub const SUPPORTED_REGIONS: &[&str] = &[
    "us-east-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-northeast-1",
    "ap-southeast-1",
];

/// Highest accepted budget in USD/hour.
pub const MAX_BUDGET: f64 = 10.0;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Price ceiling in USD/hour.
    #[serde(default = "default_budget")]
    pub budget: f64,

    /// Primary region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Also search `extra_regions`.
    #[serde(default)]
    pub cross_region: bool,

    /// Regions added by cross-region search.
    #[serde(default = "default_extra_regions")]
    pub extra_regions: Vec<String>,

    /// Candidate instance types.
    #[serde(default = "default_instance_types")]
    pub instance_types: Vec<String>,

    /// Capacity request polling.
    #[serde(default)]
    pub provisioning: ProvisioningSettings,

    /// Readiness phases.
    #[serde(default)]
    pub readiness: ReadinessSettings,

    /// Remote command channel.
    #[serde(default)]
    pub ssh: SshSettings,

    /// Market data access.
    #[serde(default)]
    pub market: MarketSettings,
}

fn default_budget() -> f64 {
    0.75
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_extra_regions() -> Vec<String> {
    ["us-west-2", "eu-west-1", "ap-northeast-1"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_instance_types() -> Vec<String> {
    [
        "g4dn.xlarge",
        "g4dn.2xlarge",
        "g5.xlarge",
        "g5.2xlarge",
        "g4ad.xlarge",
        "g5g.xlarge",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            region: default_region(),
            cross_region: false,
            extra_regions: default_extra_regions(),
            instance_types: default_instance_types(),
            provisioning: ProvisioningSettings::default(),
            readiness: ReadinessSettings::default(),
            ssh: SshSettings::default(),
            market: MarketSettings::default(),
        }
    }
}

/// `[provisioning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    /// Seconds between fulfilment polls.
    pub poll_interval_secs: u64,
    /// Fulfilment polls per zone.
    pub max_polls: u32,
    /// Seconds to wait for the instance to run.
    pub running_timeout_secs: u64,
    /// Seconds between running-state polls.
    pub running_poll_interval_secs: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_polls: 10,
            running_timeout_secs: 300,
            running_poll_interval_secs: 10,
        }
    }
}

/// `[readiness]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Phase 1 bound.
    pub connectivity_timeout_secs: u64,
    /// Phase 1 poll interval.
    pub connectivity_interval_secs: u64,
    /// Phase 2 bound.
    pub boot_init_timeout_secs: u64,
    /// Phase 2 poll interval.
    pub boot_init_interval_secs: u64,
    /// Phase 3 bound.
    pub setup_timeout_secs: u64,
    /// Phase 3 poll interval.
    pub setup_interval_secs: u64,
    /// Timeout of each remote command.
    pub command_timeout_secs: u64,
    /// Log lines included in diagnostics.
    pub log_tail_lines: usize,
    /// Step marker directory on the host.
    pub marker_dir: String,
    /// Named setup stages.
    pub stages: Vec<String>,
    /// Terminal marker file name.
    pub complete_marker: String,
    /// Setup log path on the host.
    pub setup_log: String,
    /// Shared storage mount point.
    pub shared_mount: String,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        let layout = SetupLayout::default();
        Self {
            connectivity_timeout_secs: 300,
            connectivity_interval_secs: 15,
            boot_init_timeout_secs: 1200,
            boot_init_interval_secs: 30,
            setup_timeout_secs: 1800,
            setup_interval_secs: 30,
            command_timeout_secs: 30,
            log_tail_lines: 50,
            marker_dir: layout.marker_dir,
            stages: layout.stages,
            complete_marker: layout.complete_marker,
            setup_log: layout.setup_log,
            shared_mount: layout.shared_mount,
        }
    }
}

/// `[ssh]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Login user.
    pub user: String,
    /// Private key path.
    pub key_path: Option<PathBuf>,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_path: None,
            connect_timeout_secs: 10,
        }
    }
}

/// `[market]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    /// Image memo lifetime.
    pub image_ttl_secs: u64,
    /// Region scans in flight.
    pub max_concurrent_scans: usize,
    /// Provisioning API endpoint override.
    pub endpoint: Option<String>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            image_ttl_secs: 3600,
            max_concurrent_scans: 4,
            endpoint: None,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid settings TOML.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read settings from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from an optional file, then apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file or an override is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Apply `SPOT_GPU_*` overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Env`] for values that do not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SPOT_GPU_BUDGET") {
            self.budget = value.trim().parse().map_err(|_| ConfigError::Env {
                name: "SPOT_GPU_BUDGET".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("SPOT_GPU_REGION") {
            self.region = value.trim().to_string();
        }
        if let Some(value) = lookup("SPOT_GPU_CROSS_REGION") {
            self.cross_region = parse_bool(&value).ok_or_else(|| ConfigError::Env {
                name: "SPOT_GPU_CROSS_REGION".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("SPOT_GPU_SSH_USER") {
            self.ssh.user = value.trim().to_string();
        }
        if let Some(value) = lookup("SPOT_GPU_SSH_KEY") {
            self.ssh.key_path = Some(PathBuf::from(value.trim()));
        }
        Ok(())
    }

    /// Regions to search: the primary region, plus the extra regions when
    /// cross-region search is on.
    #[must_use]
    pub fn regions(&self) -> Vec<String> {
        let mut regions = vec![self.region.clone()];
        if self.cross_region {
            for region in &self.extra_regions {
                if !regions.contains(region) {
                    regions.push(region.clone());
                }
            }
        }
        regions
    }

    /// Check every setting, reporting all problems at once.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] listing every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !self.budget.is_finite() || self.budget <= 0.0 {
            problems.push(format!("budget must be positive, got {}", self.budget));
        } else if self.budget > MAX_BUDGET {
            problems.push(format!(
                "budget {} exceeds the ${MAX_BUDGET:.2}/hr ceiling",
                self.budget
            ));
        }

        if self.region.trim().is_empty() {
            problems.push("region is empty".to_string());
        }
        for region in self.regions() {
            if !region.trim().is_empty() && !SUPPORTED_REGIONS.contains(&region.as_str()) {
                problems.push(format!(
                    "unsupported region {region} (supported: {})",
                    SUPPORTED_REGIONS.join(", ")
                ));
            }
        }

        if self.instance_types.is_empty() {
            problems.push("instance_types is empty".to_string());
        }

        let p = &self.provisioning;
        if p.poll_interval_secs == 0 || p.max_polls == 0 {
            problems.push("provisioning poll interval and max polls must be non-zero".to_string());
        }
        if p.running_timeout_secs == 0 || p.running_poll_interval_secs == 0 {
            problems.push("provisioning running wait must be non-zero".to_string());
        }

        let r = &self.readiness;
        for (name, bound, interval) in [
            ("connectivity", r.connectivity_timeout_secs, r.connectivity_interval_secs),
            ("boot_init", r.boot_init_timeout_secs, r.boot_init_interval_secs),
            ("setup", r.setup_timeout_secs, r.setup_interval_secs),
        ] {
            if bound == 0 || interval == 0 {
                problems.push(format!("readiness {name} bound and interval must be non-zero"));
            }
        }
        if r.command_timeout_secs == 0 {
            problems.push("readiness command timeout must be non-zero".to_string());
        }

        if self.market.max_concurrent_scans == 0 {
            problems.push("market max_concurrent_scans must be non-zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Provisioning poll bounds.
    #[must_use]
    pub fn provisioning_policy(&self) -> ProvisioningPolicy {
        let p = &self.provisioning;
        ProvisioningPolicy {
            fulfilment: PollPolicy::attempts(Duration::from_secs(p.poll_interval_secs), p.max_polls),
            running: PollPolicy::deadline(
                Duration::from_secs(p.running_poll_interval_secs),
                Duration::from_secs(p.running_timeout_secs),
            ),
        }
    }

    /// Readiness phase bounds.
    #[must_use]
    pub fn readiness_policy(&self) -> ReadinessPolicy {
        let r = &self.readiness;
        let phase = |interval: u64, bound: u64| {
            PollPolicy::deadline(Duration::from_secs(interval), Duration::from_secs(bound))
        };
        ReadinessPolicy {
            connectivity: phase(r.connectivity_interval_secs, r.connectivity_timeout_secs),
            boot_init: phase(r.boot_init_interval_secs, r.boot_init_timeout_secs),
            workload_setup: phase(r.setup_interval_secs, r.setup_timeout_secs),
            command_timeout: Duration::from_secs(r.command_timeout_secs),
            log_tail_lines: r.log_tail_lines,
        }
    }

    /// Setup marker layout.
    #[must_use]
    pub fn setup_layout(&self) -> SetupLayout {
        let r = &self.readiness;
        SetupLayout {
            marker_dir: r.marker_dir.clone(),
            stages: r.stages.clone(),
            complete_marker: r.complete_marker.clone(),
            setup_log: r.setup_log.clone(),
            shared_mount: r.shared_mount.clone(),
        }
    }

    /// SSH executor for the configured user and key.
    #[must_use]
    pub fn ssh_executor(&self) -> SshExecutor {
        let ssh = SshExecutor::new(&self.ssh.user)
            .with_connect_timeout(Duration::from_secs(self.ssh.connect_timeout_secs));
        match &self.ssh.key_path {
            Some(key) => ssh.with_key(key),
            None => ssh,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
