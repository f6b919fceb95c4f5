//! Run-level error taxonomy.
//!
//! Fatal errors carry what was tried and why each option was rejected, and
//! expose [`remedies`](OrchestratorError::remedies) for rendering next steps.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::providers::{Architecture, CloudApiError};
use crate::provision::{AttemptState, FailureReason, ProvisioningAttempt};
use crate::readiness::{Diagnostics, ReadinessPhase, StageProgress};
use crate::scoring::Candidate;
use crate::selector::RegionOutcome;

/// Regions suggested when a single-region search fails.
const ALTERNATE_REGIONS: &[&str] = &["us-west-2", "eu-west-1", "ap-northeast-1"];

/// Market data errors. Non-fatal to a run; they exclude one candidate.
#[derive(Error, Debug)]
pub enum MarketDataError {
    /// Neither discovery nor the fallback table produced an image.
    #[error("No {architecture} image for {instance_type} in {region}")]
    ImageNotFound {
        instance_type: String,
        region: String,
        architecture: Architecture,
    },

    /// The provisioning API failed.
    #[error(transparent)]
    Api(#[from] CloudApiError),
}

/// Selection failures.
#[derive(Error, Debug)]
pub enum SelectionError {
    /// Candidates exist but none fits the budget.
    #[error(
        "No configuration within ${budget:.2}/hr across {} region(s)",
        regions_examined.len()
    )]
    NoAffordableConfiguration {
        budget: f64,
        regions_examined: Vec<String>,
        closest_miss: Option<Box<Candidate>>,
        suggested_budget: Option<f64>,
        outcomes: Vec<RegionOutcome>,
    },

    /// The run was cancelled while regions were being scanned.
    #[error("Selection cancelled while scanning {}", regions.join(", "))]
    Cancelled { regions: Vec<String> },

    /// No region produced a single scorable candidate.
    #[error("No candidate configuration found in {}", regions_examined.join(", "))]
    NoCandidates {
        regions_examined: Vec<String>,
        outcomes: Vec<RegionOutcome>,
    },
}

impl SelectionError {
    /// Concrete next steps for the caller.
    #[must_use]
    pub fn remedies(&self) -> Vec<String> {
        let mut remedies = Vec::new();
        match self {
            Self::NoAffordableConfiguration {
                budget,
                regions_examined,
                closest_miss,
                suggested_budget,
                ..
            } => {
                if let (Some(miss), Some(suggested)) = (closest_miss, suggested_budget) {
                    let raise = if *budget > 0.0 {
                        (suggested / budget - 1.0) * 100.0
                    } else {
                        100.0
                    };
                    remedies.push(format!(
                        "Raise the budget to ${suggested:.2}/hr (+{raise:.0}%) to afford {} in {} at ${:.4}/hr",
                        miss.instance_type, miss.zone, miss.spot_price
                    ));
                }
                remedies.extend(alternate_regions(regions_examined));
                remedies.push(
                    "Add cheaper instance types (e.g. g4ad.xlarge, g5g.xlarge) to the candidate list"
                        .to_string(),
                );
            }
            Self::Cancelled { .. } => {
                remedies.push("Re-run with a longer --timeout-secs".to_string());
            }
            Self::NoCandidates {
                regions_examined, ..
            } => {
                remedies.extend(alternate_regions(regions_examined));
                remedies.push(
                    "Check that the candidate instance types are offered and have images in these regions"
                        .to_string(),
                );
            }
        }
        remedies
    }
}

fn alternate_regions(examined: &[String]) -> Vec<String> {
    let untried: Vec<&str> = ALTERNATE_REGIONS
        .iter()
        .copied()
        .filter(|r| !examined.iter().any(|e| e == r))
        .collect();
    if untried.is_empty() {
        Vec::new()
    } else {
        vec![format!(
            "Enable cross-region search or try region {}",
            untried.join(", ")
        )]
    }
}

/// Provisioning failures.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    /// Every zone was tried and none fulfilled.
    #[error(
        "All {} zone(s) exhausted for {instance_type} in {region}",
        attempts.len()
    )]
    Exhausted {
        instance_type: String,
        region: String,
        attempts: Vec<ProvisioningAttempt>,
    },

    /// The run was cancelled; open requests were cancelled first.
    #[error("Provisioning of {instance_type} in {region} cancelled")]
    Cancelled {
        instance_type: String,
        region: String,
        attempts: Vec<ProvisioningAttempt>,
    },

    /// The instance was fulfilled but never reached a usable running state.
    #[error("Instance {instance_id} did not become reachable: {reason}")]
    InstanceNotRunning { instance_id: String, reason: String },
}

impl ProvisioningError {
    /// Concrete next steps for the caller.
    #[must_use]
    pub fn remedies(&self) -> Vec<String> {
        match self {
            Self::Exhausted {
                region, attempts, ..
            } => {
                let reasons: BTreeSet<&FailureReason> =
                    attempts.iter().filter_map(|a| a.reason.as_ref()).collect();
                let mut remedies: Vec<String> = reasons
                    .into_iter()
                    .filter_map(|reason| reason.remedy(region))
                    .collect();
                remedies.dedup();
                if remedies.is_empty() {
                    remedies.push(format!("Retry later or try a region other than {region}"));
                }
                remedies
            }
            Self::Cancelled { attempts, .. } => {
                let mut remedies: Vec<String> = attempts
                    .iter()
                    .filter(|a| a.state == AttemptState::Active)
                    .filter_map(|a| a.instance_id.as_deref())
                    .map(left_running)
                    .collect();
                remedies.push("Re-run with a longer --timeout-secs".to_string());
                remedies
            }
            Self::InstanceNotRunning { instance_id, .. } => vec![
                left_running(instance_id),
                format!("Inspect instance {instance_id} in the console; it may have been reclaimed"),
            ],
        }
    }
}

fn left_running(instance_id: &str) -> String {
    format!("Terminate instance {instance_id} if it is still running; it is billed until then")
}

/// Readiness failures.
#[derive(Error, Debug)]
pub enum ReadinessError {
    /// A phase ran out of time without an explicit error.
    #[error(
        "{phase} did not complete within {}s ({attempts} checks)",
        elapsed.as_secs()
    )]
    Timeout {
        phase: ReadinessPhase,
        elapsed: Duration,
        attempts: u32,
        diagnostics: Box<Diagnostics>,
    },

    /// A named stage reported an explicit failure.
    #[error("Setup stage '{stage}' failed")]
    Setup {
        stage: String,
        log_tail: Vec<String>,
        progress: Vec<StageProgress>,
    },

    /// Validation was cancelled.
    #[error("Readiness validation cancelled during {phase}")]
    Cancelled { phase: ReadinessPhase },
}

impl ReadinessError {
    /// Concrete next steps for the caller.
    #[must_use]
    pub fn remedies(&self) -> Vec<String> {
        match self {
            Self::Timeout {
                phase: ReadinessPhase::Connectivity,
                ..
            } => vec![
                "Check that the security group allows inbound SSH from this machine".to_string(),
                "Check the SSH user and key match the image".to_string(),
            ],
            Self::Timeout { phase, .. } => vec![format!(
                "{phase} may still finish; keep watching the host or re-run `spot-gpu validate`"
            )],
            Self::Setup { stage, .. } => vec![format!(
                "Fix the '{stage}' step of the setup script and re-provision"
            )],
            Self::Cancelled { .. } => vec!["Re-run `spot-gpu validate` against the host".to_string()],
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for [`Settings`](crate::config::Settings).
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override has an invalid value.
    #[error("Invalid value for {name}: {value}")]
    Env { name: String, value: String },

    /// One or more settings are out of range.
    #[error("Invalid settings: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
}

/// Umbrella error of the orchestrator entry points.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Selection failed.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Provisioning failed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// Readiness validation failed.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    /// Settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Concrete next steps for the caller.
    #[must_use]
    pub fn remedies(&self) -> Vec<String> {
        match self {
            Self::Selection(e) => e.remedies(),
            Self::Provisioning(e) => e.remedies(),
            Self::Readiness(e) => e.remedies(),
            Self::Config(_) => vec!["Fix the settings file or SPOT_GPU_* variables".to_string()],
        }
    }
}
