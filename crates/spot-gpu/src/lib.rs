//! Spot GPU instance selection and provisioning.
//!
//! Picks the most cost-efficient GPU instance type, image and zone under an
//! hourly budget from live spot market data, acquires the capacity with
//! ordered zone fallback, and waits for the host to become usable.
//!
//! ## Flow
//!
//! ```text
//! Settings ─► Selector ──────────────► Provisioner ─────────► ReadinessValidator
//!              │ MarketData + Scorer     │ zones by price       │ connectivity
//!              │ per region, parallel    │ request, poll,       │ boot-init
//!              ▼                         │ cancel on failure    │ workload setup
//!           Candidate                    ▼                      ▼
//!                                  ProvisionedHost        ReadinessReport
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use spot_gpu::{Ec2Client, Orchestrator, SshExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! let api = Arc::new(Ec2Client::new()?);
//! let orchestrator = Orchestrator::new(api, Arc::new(SshExecutor::new("ubuntu")));
//! let cancel = CancellationToken::new();
//!
//! let host = orchestrator
//!     .select_and_provision(0.75, &regions, &candidates, &cancel)
//!     .await?;
//! let report = orchestrator
//!     .validate_readiness(host.address().unwrap_or_default(), &cancel)
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod market;
pub mod orchestrator;
pub mod poll;
pub mod pricing;
pub mod providers;
pub mod provision;
pub mod readiness;
pub mod remote;
pub mod scoring;
pub mod selector;

pub use config::Settings;
pub use error::{
    ConfigError, MarketDataError, OrchestratorError, ProvisioningError, ReadinessError,
    SelectionError,
};
pub use market::{ImageTier, MarketData};
pub use orchestrator::Orchestrator;
pub use providers::{CloudApi, CloudApiError, Ec2Client};
pub use provision::{ProvisionedHost, Provisioner, ProvisioningAttempt};
pub use readiness::{ReadinessReport, ReadinessValidator};
pub use remote::{RemoteExecutor, SshExecutor};
pub use scoring::{Candidate, Scorer};
pub use selector::{RegionOutcome, Selector, Shortlist};
