//! Entry points tying selection, provisioning and readiness together.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::error::{OrchestratorError, ProvisioningError, SelectionError};
use crate::market::MarketData;
use crate::providers::CloudApi;
use crate::provision::{ProvisionedHost, Provisioner};
use crate::readiness::{ReadinessReport, ReadinessValidator};
use crate::remote::RemoteExecutor;
use crate::selector::Selector;

/// Selection, provisioning and readiness for one run.
pub struct Orchestrator {
    selector: Selector,
    provisioner: Provisioner,
    validator: ReadinessValidator,
}

impl Orchestrator {
    /// Build an orchestrator with default bounds.
    pub fn new(api: Arc<dyn CloudApi>, remote: Arc<dyn RemoteExecutor>) -> Self {
        let market = Arc::new(MarketData::new(Arc::clone(&api)));
        Self {
            selector: Selector::new(market),
            provisioner: Provisioner::new(api),
            validator: ReadinessValidator::new(remote),
        }
    }

    /// Build an orchestrator configured from settings.
    pub fn from_settings(
        settings: &Settings,
        api: Arc<dyn CloudApi>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let market = Arc::new(
            MarketData::new(Arc::clone(&api))
                .with_image_ttl(Duration::from_secs(settings.market.image_ttl_secs)),
        );
        Self {
            selector: Selector::new(market)
                .with_max_concurrent_scans(settings.market.max_concurrent_scans),
            provisioner: Provisioner::new(api).with_policy(settings.provisioning_policy()),
            validator: ReadinessValidator::new(remote)
                .with_policy(settings.readiness_policy())
                .with_layout(settings.setup_layout()),
        }
    }

    /// Replace the selector.
    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    /// Replace the provisioner.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Replace the readiness validator.
    #[must_use]
    pub fn with_validator(mut self, validator: ReadinessValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Selector in use, for shortlist reporting.
    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Pick the best affordable configuration and acquire an instance.
    ///
    /// The budget doubles as the request's price ceiling. No capacity is
    /// requested when selection fails or `cancel` fires during the scan.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Selection`] or
    /// [`OrchestratorError::Provisioning`] with full context.
    pub async fn select_and_provision(
        &self,
        budget: f64,
        regions: &[String],
        candidate_types: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProvisionedHost, OrchestratorError> {
        let candidate = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(SelectionError::Cancelled {
                    regions: regions.to_vec(),
                }
                .into());
            }
            result = self.selector.select(budget, regions, candidate_types) => result?,
        };

        if cancel.is_cancelled() {
            return Err(ProvisioningError::Cancelled {
                instance_type: candidate.instance_type,
                region: candidate.region,
                attempts: Vec::new(),
            }
            .into());
        }

        let host = self.provisioner.provision(&candidate, budget, cancel).await?;
        info!(
            instance_id = %host.instance_id,
            zone = %host.zone,
            address = host.address().unwrap_or("-"),
            "Host provisioned"
        );
        Ok(host)
    }

    /// Wait for `address` to pass all readiness phases.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Readiness`] on timeout, explicit setup
    /// failure or cancellation.
    pub async fn validate_readiness(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadinessReport, OrchestratorError> {
        Ok(self.validator.validate(address, cancel).await?)
    }
}
