//! Readiness validation of a provisioned host.
//!
//! Three strictly ordered phases, each a bounded poll over the remote
//! command channel:
//!
//! 1. **Connectivity**: the channel opens and runs a trivial command.
//! 2. **Boot-init**: `cloud-init status` reports done.
//! 3. **Workload setup**: the setup script's marker directory holds the
//!    terminal marker. Per-stage `<stage>.done` / `<stage>.error` markers
//!    report progress; an error marker ends validation at once.
//!
//! A phase that runs out of time is a [`ReadinessError::Timeout`] and later
//! phases never start. After phase 3, subsystem checks (GPU, container
//! runtime, shared storage) are reported as pass/warn without failing the
//! run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReadinessError;
use crate::poll::{poll, PollOutcome, PollPolicy, PollStep};
use crate::remote::RemoteExecutor;

/// Most recent remote errors kept for diagnostics.
const MAX_ERROR_LOG: usize = 20;

/// Boot-init output log on the host.
const BOOT_INIT_LOG: &str = "/var/log/cloud-init-output.log";

/// Command proving the channel works.
const CONNECTIVITY_COMMAND: &str = "echo spot-gpu-ready";

/// Expected output of [`CONNECTIVITY_COMMAND`].
const CONNECTIVITY_REPLY: &str = "spot-gpu-ready";

/// Command reporting boot-init state.
const BOOT_INIT_COMMAND: &str = "cloud-init status";

/// Command collecting resource utilisation for diagnostics.
const RESOURCE_COMMAND: &str = "uptime; free -m; df -h /; \
     nvidia-smi --query-gpu=utilization.gpu,memory.used,memory.total --format=csv,noheader 2>/dev/null || true";

/// Validation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPhase {
    /// Remote command channel opens.
    Connectivity,
    /// First-boot configuration completes.
    BootInit,
    /// Setup script reaches its terminal marker.
    WorkloadSetup,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::BootInit => write!(f, "boot-init"),
            Self::WorkloadSetup => write!(f, "workload-setup"),
        }
    }
}

/// Status of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Not there yet.
    Pending,
    /// Phase goal reached.
    Done,
    /// Explicit failure observed.
    Error,
}

/// One polling observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheckpoint {
    /// Phase observed.
    pub phase: ReadinessPhase,
    /// 1-based poll number within the phase.
    pub attempt: u32,
    /// Observed status.
    pub status: CheckStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// Latest checkpoint per phase plus a bounded log of remote errors.
#[derive(Debug, Default)]
struct CheckpointLog {
    latest: BTreeMap<ReadinessPhase, ReadinessCheckpoint>,
    errors: Vec<String>,
}

impl CheckpointLog {
    fn record(&mut self, checkpoint: ReadinessCheckpoint) {
        self.latest.insert(checkpoint.phase, checkpoint);
    }

    fn record_error(&mut self, phase: ReadinessPhase, attempt: u32, message: &str) {
        self.errors.push(format!("[{phase} #{attempt}] {message}"));
        if self.errors.len() > MAX_ERROR_LOG {
            let excess = self.errors.len() - MAX_ERROR_LOG;
            self.errors.drain(..excess);
        }
    }
}

/// State of a named setup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No marker yet.
    Pending,
    /// `<stage>.done` present.
    Done,
    /// `<stage>.error` present.
    Error,
}

/// Progress of one setup stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Stage name.
    pub stage: String,
    /// Observed status.
    pub status: StageStatus,
}

/// Diagnostic dump attached to a timeout.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    /// Latest observation of the timed-out phase.
    pub last_checkpoint: Option<ReadinessCheckpoint>,
    /// Most recent remote errors across phases.
    pub recent_errors: Vec<String>,
    /// Load, memory, disk and GPU utilisation, when the host answered.
    pub resource_usage: Option<String>,
    /// Last lines of the relevant log.
    pub log_tail: Vec<String>,
    /// Setup stage progress at the time of the timeout.
    pub progress: Vec<StageProgress>,
}

/// Outcome of a subsystem check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemStatus {
    /// Subsystem works.
    Pass,
    /// Subsystem missing or unhealthy; the host is still usable.
    Warn,
}

/// Result of one subsystem check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemCheck {
    /// Subsystem name.
    pub name: String,
    /// Result.
    pub status: SubsystemStatus,
    /// Output or failure detail.
    pub detail: String,
}

/// Time spent in one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    /// Phase.
    pub phase: ReadinessPhase,
    /// Polls performed.
    pub attempts: u32,
    /// Wall time spent.
    pub elapsed: Duration,
}

/// Successful validation report.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    /// Host address validated.
    pub host: String,
    /// Per-phase timings, in order.
    pub phases: Vec<PhaseTiming>,
    /// Final setup stage progress.
    pub progress: Vec<StageProgress>,
    /// Subsystem check results.
    pub subsystems: Vec<SubsystemCheck>,
    /// Latest checkpoint of each phase.
    pub checkpoints: Vec<ReadinessCheckpoint>,
}

impl ReadinessReport {
    /// Whether every subsystem check passed.
    #[must_use]
    pub fn all_subsystems_pass(&self) -> bool {
        self.subsystems
            .iter()
            .all(|c| c.status == SubsystemStatus::Pass)
    }
}

/// Poll bounds of the three phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Phase 1 bound and interval.
    pub connectivity: PollPolicy,
    /// Phase 2 bound and interval.
    pub boot_init: PollPolicy,
    /// Phase 3 bound and interval.
    pub workload_setup: PollPolicy,
    /// Timeout of each remote command.
    pub command_timeout: Duration,
    /// Log lines included in diagnostics.
    pub log_tail_lines: usize,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            connectivity: PollPolicy::deadline(Duration::from_secs(15), Duration::from_secs(300)),
            boot_init: PollPolicy::deadline(Duration::from_secs(30), Duration::from_secs(1200)),
            workload_setup: PollPolicy::deadline(
                Duration::from_secs(30),
                Duration::from_secs(1800),
            ),
            command_timeout: Duration::from_secs(30),
            log_tail_lines: 50,
        }
    }
}

/// Where the setup script leaves its markers and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupLayout {
    /// Directory holding step markers.
    pub marker_dir: String,
    /// Named stages, in execution order.
    pub stages: Vec<String>,
    /// Terminal marker file name.
    pub complete_marker: String,
    /// Setup log path.
    pub setup_log: String,
    /// Shared storage mount point.
    pub shared_mount: String,
}

impl Default for SetupLayout {
    fn default() -> Self {
        Self {
            marker_dir: "/var/lib/spot-gpu/steps".to_string(),
            stages: [
                "system-update",
                "nvidia-driver",
                "docker",
                "nvidia-container-toolkit",
                "shared-storage",
                "application",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            complete_marker: "setup-complete".to_string(),
            setup_log: "/var/log/spot-gpu-setup.log".to_string(),
            shared_mount: "/mnt/efs".to_string(),
        }
    }
}

/// Parsed `cloud-init status` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootStatus {
    /// Boot-init finished.
    Done,
    /// Boot-init reported an error.
    Error,
    /// Still running (or not started).
    Running(String),
}

/// Parse `cloud-init status` output.
#[must_use]
pub fn parse_boot_status(stdout: &str) -> BootStatus {
    let status = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(str::trim)
        .unwrap_or_default();

    match status {
        "done" | "degraded done" => BootStatus::Done,
        "error" | "degraded error" => BootStatus::Error,
        other if other.is_empty() => BootStatus::Running("unknown".to_string()),
        other => BootStatus::Running(other.to_string()),
    }
}

/// Parsed marker directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerScan {
    /// Progress of each configured stage.
    pub progress: Vec<StageProgress>,
    /// First stage with an error marker.
    pub failed_stage: Option<String>,
    /// Whether the terminal marker is present.
    pub complete: bool,
}

impl MarkerScan {
    /// Number of stages done.
    #[must_use]
    pub fn done_count(&self) -> usize {
        self.progress
            .iter()
            .filter(|p| p.status == StageStatus::Done)
            .count()
    }
}

/// Parse a one-name-per-line listing of the marker directory.
///
/// Error markers of stages outside the configured list still count.
#[must_use]
pub fn parse_markers(listing: &str, layout: &SetupLayout) -> MarkerScan {
    let files: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let has = |name: &str| files.iter().any(|f| *f == name);

    let progress: Vec<StageProgress> = layout
        .stages
        .iter()
        .map(|stage| {
            let status = if has(&format!("{stage}.error")) {
                StageStatus::Error
            } else if has(&format!("{stage}.done")) {
                StageStatus::Done
            } else {
                StageStatus::Pending
            };
            StageProgress {
                stage: stage.clone(),
                status,
            }
        })
        .collect();

    let failed_stage = progress
        .iter()
        .find(|p| p.status == StageStatus::Error)
        .map(|p| p.stage.clone())
        .or_else(|| {
            files
                .iter()
                .find_map(|f| f.strip_suffix(".error"))
                .map(ToString::to_string)
        });

    MarkerScan {
        progress,
        failed_stage,
        complete: has(&layout.complete_marker),
    }
}

/// One observation made by a phase check.
enum Observation<T> {
    Pending(String),
    Done(T, String),
    Failed {
        stage: String,
        detail: String,
        progress: Vec<StageProgress>,
    },
}

/// Three-phase readiness validator.
pub struct ReadinessValidator {
    remote: Arc<dyn RemoteExecutor>,
    policy: ReadinessPolicy,
    layout: SetupLayout,
}

impl ReadinessValidator {
    /// Create a validator with default bounds and layout.
    pub fn new(remote: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            remote,
            policy: ReadinessPolicy::default(),
            layout: SetupLayout::default(),
        }
    }

    /// Set the phase bounds.
    #[must_use]
    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the setup marker layout.
    #[must_use]
    pub fn with_layout(mut self, layout: SetupLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Run all three phases against `host`, then the subsystem checks.
    ///
    /// # Errors
    /// Returns [`ReadinessError::Setup`] on an explicit boot-init or stage
    /// error, [`ReadinessError::Timeout`] when a phase exceeds its bound,
    /// and [`ReadinessError::Cancelled`] when `cancel` fires.
    pub async fn validate(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadinessReport, ReadinessError> {
        let log = Mutex::new(CheckpointLog::default());
        let mut phases = Vec::with_capacity(3);

        info!(host = %host, "Validating readiness");

        let ((), timing) = self
            .run_phase(ReadinessPhase::Connectivity, host, &log, cancel, |attempt| {
                self.check_connectivity(host, attempt, &log)
            })
            .await?;
        phases.push(timing);

        let ((), timing) = self
            .run_phase(ReadinessPhase::BootInit, host, &log, cancel, |attempt| {
                self.check_boot_init(host, attempt, &log)
            })
            .await?;
        phases.push(timing);

        let (progress, timing) = self
            .run_phase(ReadinessPhase::WorkloadSetup, host, &log, cancel, |attempt| {
                self.check_setup(host, attempt, &log)
            })
            .await?;
        phases.push(timing);

        let subsystems = self.check_subsystems(host).await;
        for check in &subsystems {
            match check.status {
                SubsystemStatus::Pass => info!(host = %host, subsystem = %check.name, "Subsystem ok"),
                SubsystemStatus::Warn => {
                    warn!(host = %host, subsystem = %check.name, "Subsystem check failed: {}", check.detail);
                }
            }
        }

        let log = log.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(ReadinessReport {
            host: host.to_string(),
            phases,
            progress,
            subsystems,
            checkpoints: log.latest.into_values().collect(),
        })
    }

    async fn run_phase<T, F, Fut>(
        &self,
        phase: ReadinessPhase,
        host: &str,
        log: &Mutex<CheckpointLog>,
        cancel: &CancellationToken,
        mut check: F,
    ) -> Result<(T, PhaseTiming), ReadinessError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Observation<T>>,
    {
        let policy = match phase {
            ReadinessPhase::Connectivity => self.policy.connectivity,
            ReadinessPhase::BootInit => self.policy.boot_init,
            ReadinessPhase::WorkloadSetup => self.policy.workload_setup,
        };
        info!(host = %host, phase = %phase, "Phase started");
        let start = Instant::now();

        let phase_name = phase.to_string();
        let outcome = poll(&policy, cancel, &phase_name, |attempt| {
            let observation = check(attempt);
            async move {
                let observation = observation.await;
                let (status, detail) = match &observation {
                    Observation::Pending(detail) => (CheckStatus::Pending, detail.clone()),
                    Observation::Done(_, detail) => (CheckStatus::Done, detail.clone()),
                    Observation::Failed { detail, .. } => (CheckStatus::Error, detail.clone()),
                };
                debug!(phase = %phase, attempt, status = ?status, "{detail}");
                lock(log).record(ReadinessCheckpoint {
                    phase,
                    attempt,
                    status,
                    detail,
                });

                match observation {
                    Observation::Pending(_) => PollStep::Pending,
                    Observation::Done(value, _) => PollStep::Done(Ok(value)),
                    Observation::Failed {
                        stage, progress, ..
                    } => PollStep::Done(Err((stage, progress))),
                }
            }
        })
        .await;

        match outcome {
            PollOutcome::Ready {
                value: Ok(value),
                attempts,
            } => {
                let elapsed = start.elapsed();
                info!(
                    host = %host,
                    phase = %phase,
                    attempts,
                    elapsed_secs = elapsed.as_secs(),
                    "Phase complete"
                );
                Ok((
                    value,
                    PhaseTiming {
                        phase,
                        attempts,
                        elapsed,
                    },
                ))
            }
            PollOutcome::Ready {
                value: Err((stage, progress)),
                ..
            } => {
                let log_path = match phase {
                    ReadinessPhase::BootInit => BOOT_INIT_LOG,
                    _ => self.layout.setup_log.as_str(),
                };
                let log_tail = self.log_tail(host, log_path).await;
                warn!(host = %host, phase = %phase, stage = %stage, "Setup failed");
                Err(ReadinessError::Setup {
                    stage,
                    log_tail,
                    progress,
                })
            }
            PollOutcome::Exhausted { attempts, elapsed } => {
                warn!(
                    host = %host,
                    phase = %phase,
                    attempts,
                    elapsed_secs = elapsed.as_secs(),
                    "Phase timed out"
                );
                let diagnostics = self.diagnostics(phase, host, log).await;
                Err(ReadinessError::Timeout {
                    phase,
                    elapsed,
                    attempts,
                    diagnostics: Box::new(diagnostics),
                })
            }
            PollOutcome::Cancelled { .. } => Err(ReadinessError::Cancelled { phase }),
        }
    }

    async fn check_connectivity(
        &self,
        host: &str,
        attempt: u32,
        log: &Mutex<CheckpointLog>,
    ) -> Observation<()> {
        match self
            .remote
            .execute(host, CONNECTIVITY_COMMAND, self.policy.command_timeout)
            .await
        {
            Ok(out) if out.success() && out.stdout.contains(CONNECTIVITY_REPLY) => {
                Observation::Done((), "channel open".to_string())
            }
            Ok(out) => Observation::Pending(format!("unexpected reply (exit {})", out.exit_code)),
            Err(e) => {
                lock(log).record_error(ReadinessPhase::Connectivity, attempt, &e.to_string());
                Observation::Pending(e.to_string())
            }
        }
    }

    async fn check_boot_init(
        &self,
        host: &str,
        attempt: u32,
        log: &Mutex<CheckpointLog>,
    ) -> Observation<()> {
        match self
            .remote
            .execute(host, BOOT_INIT_COMMAND, self.policy.command_timeout)
            .await
        {
            Ok(out) => match parse_boot_status(&out.stdout) {
                BootStatus::Done => Observation::Done((), "status: done".to_string()),
                BootStatus::Error => Observation::Failed {
                    stage: ReadinessPhase::BootInit.to_string(),
                    detail: "status: error".to_string(),
                    progress: Vec::new(),
                },
                BootStatus::Running(status) => Observation::Pending(format!("status: {status}")),
            },
            Err(e) => {
                warn!(host = %host, attempt, "Transient remote failure during boot-init: {e}");
                lock(log).record_error(ReadinessPhase::BootInit, attempt, &e.to_string());
                Observation::Pending(e.to_string())
            }
        }
    }

    async fn check_setup(
        &self,
        host: &str,
        attempt: u32,
        log: &Mutex<CheckpointLog>,
    ) -> Observation<Vec<StageProgress>> {
        let command = format!("ls -1 {} 2>/dev/null || true", self.layout.marker_dir);
        match self
            .remote
            .execute(host, &command, self.policy.command_timeout)
            .await
        {
            Ok(out) => {
                let scan = parse_markers(&out.stdout, &self.layout);
                let detail = format!(
                    "{}/{} stages done",
                    scan.done_count(),
                    self.layout.stages.len()
                );
                if let Some(stage) = scan.failed_stage {
                    Observation::Failed {
                        detail: format!("stage {stage} failed ({detail})"),
                        stage,
                        progress: scan.progress,
                    }
                } else if scan.complete {
                    Observation::Done(scan.progress, detail)
                } else {
                    Observation::Pending(detail)
                }
            }
            Err(e) => {
                warn!(host = %host, attempt, "Transient remote failure during setup: {e}");
                lock(log).record_error(ReadinessPhase::WorkloadSetup, attempt, &e.to_string());
                Observation::Pending(e.to_string())
            }
        }
    }

    async fn log_tail(&self, host: &str, path: &str) -> Vec<String> {
        let command = format!("tail -n {} {path} 2>/dev/null", self.policy.log_tail_lines);
        match self
            .remote
            .execute(host, &command, self.policy.command_timeout)
            .await
        {
            Ok(out) => out.stdout.lines().map(ToString::to_string).collect(),
            Err(e) => {
                debug!(host = %host, "Could not read {path}: {e}");
                Vec::new()
            }
        }
    }

    async fn diagnostics(
        &self,
        phase: ReadinessPhase,
        host: &str,
        log: &Mutex<CheckpointLog>,
    ) -> Diagnostics {
        let (last_checkpoint, recent_errors) = {
            let log = lock(log);
            (log.latest.get(&phase).cloned(), log.errors.clone())
        };

        let mut diagnostics = Diagnostics {
            last_checkpoint,
            recent_errors,
            ..Diagnostics::default()
        };

        // unreachable host: nothing more to collect
        if phase == ReadinessPhase::Connectivity {
            return diagnostics;
        }

        diagnostics.resource_usage = self
            .remote
            .execute(host, RESOURCE_COMMAND, self.policy.command_timeout)
            .await
            .ok()
            .map(|out| out.stdout.trim().to_string());

        let log_path = if phase == ReadinessPhase::BootInit {
            BOOT_INIT_LOG
        } else {
            self.layout.setup_log.as_str()
        };
        diagnostics.log_tail = self.log_tail(host, log_path).await;

        if phase == ReadinessPhase::WorkloadSetup {
            let command = format!("ls -1 {} 2>/dev/null || true", self.layout.marker_dir);
            if let Ok(out) = self
                .remote
                .execute(host, &command, self.policy.command_timeout)
                .await
            {
                diagnostics.progress = parse_markers(&out.stdout, &self.layout).progress;
            }
        }

        diagnostics
    }

    async fn check_subsystems(&self, host: &str) -> Vec<SubsystemCheck> {
        let checks = [
            (
                "gpu",
                "nvidia-smi --query-gpu=name,memory.total --format=csv,noheader".to_string(),
            ),
            (
                "container-runtime",
                "docker info --format '{{.ServerVersion}}'".to_string(),
            ),
            (
                "shared-storage",
                format!(
                    "mountpoint -q {mount} && echo mounted {mount}",
                    mount = self.layout.shared_mount
                ),
            ),
        ];

        let mut results = Vec::with_capacity(checks.len());
        for (name, command) in checks {
            let (status, detail) = match self
                .remote
                .execute(host, &command, self.policy.command_timeout)
                .await
            {
                Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                    (SubsystemStatus::Pass, out.stdout.trim().to_string())
                }
                Ok(out) => (
                    SubsystemStatus::Warn,
                    format!("exit {}: {}", out.exit_code, out.stderr.trim()),
                ),
                Err(e) => (SubsystemStatus::Warn, e.to_string()),
            };
            results.push(SubsystemCheck {
                name: name.to_string(),
                status,
                detail,
            });
        }
        results
    }
}

fn lock(log: &Mutex<CheckpointLog>) -> std::sync::MutexGuard<'_, CheckpointLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}
