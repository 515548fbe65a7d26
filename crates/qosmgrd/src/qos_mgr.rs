//! QoS Manager - drives the kernel toward the policy in the config file

use std::path::PathBuf;

use qosmgr_common::{Diagnostics, QosMgrError, QosMgrResult};
use tracing::{info, warn};

use crate::backend::{ShaperBackend, Tolerance};
use crate::commands;
use crate::config_builder::{build_policy, release_targets, ReleaseTarget};
use crate::macro_reader::read_macro_file;
use crate::plan::{compile_apply, compile_release, DirectionPlan, ShapingOperation, Step};
use crate::types::QosPlan;

/// QoS Manager
///
/// Owns the backend and the diagnostics of a run. Operations are issued one
/// at a time, in plan order.
pub struct QosMgr<B: ShaperBackend> {
    config_path: PathBuf,
    backend: B,
    diagnostics: Diagnostics,
}

impl<B: ShaperBackend> QosMgr<B> {
    /// Create a new QosMgr instance
    pub fn new(config_path: impl Into<PathBuf>, backend: B) -> Self {
        let config_path = config_path.into();
        info!("QosMgr initialized with {}", config_path.display());

        Self {
            config_path,
            backend,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Reads and validates the policy without touching the backend.
    pub fn load_policy(&mut self) -> QosMgrResult<QosPlan> {
        let raw = read_macro_file(&self.config_path)?;
        build_policy(&raw, &mut self.diagnostics)
    }

    /// Tears down existing shaping and applies the policy from scratch.
    ///
    /// # Errors
    ///
    /// * [`QosMgrError::SourceUnreadable`] / [`QosMgrError::NoUnitsResolved`]
    ///   before any operation is issued
    /// * [`QosMgrError::ApplyFailed`] naming every interface whose upload or
    ///   download tree did not complete, after a full teardown
    /// * any unexpected backend error, after a full teardown
    pub async fn apply(&mut self) -> QosMgrResult<()> {
        info!("Applying QoS policy from {}", self.config_path.display());

        let raw = read_macro_file(&self.config_path)?;
        let policy = build_policy(&raw, &mut self.diagnostics)?;
        let targets = release_targets(&raw);

        match self.converge(&policy, &targets).await {
            Ok(failed) if failed.is_empty() => {
                info!(
                    "QoS applied to {} interface(s), {} service(s)",
                    policy.interfaces.len(),
                    policy.services.len()
                );
                Ok(())
            }
            Ok(failed) => {
                let err = QosMgrError::ApplyFailed { interfaces: failed };
                self.diagnostics.error(err.to_string());
                warn!("Removing partially applied QoS configuration");
                self.run_release(&targets).await;
                Err(err)
            }
            Err(e) => {
                self.diagnostics
                    .error(format!("Unexpected error while applying QoS: {}", e));
                warn!("Rolling back QoS configuration");
                self.run_release(&targets).await;
                Err(e)
            }
        }
    }

    /// Removes shaping from every interface the policy names.
    ///
    /// Never fails: an unreadable policy means there is nothing to release,
    /// and individual teardown failures are only logged.
    pub async fn release(&mut self) {
        info!("Releasing QoS configuration");

        let raw = match read_macro_file(&self.config_path) {
            Ok(raw) => raw,
            Err(e) => {
                self.diagnostics
                    .warning(format!("{}. Nothing to release", e));
                return;
            }
        };

        let targets = release_targets(&raw);
        if targets.is_empty() {
            self.diagnostics
                .info("No QoS interfaces defined. Nothing to release");
            return;
        }
        self.run_release(&targets).await;
    }

    async fn converge(
        &mut self,
        policy: &QosPlan,
        targets: &[ReleaseTarget],
    ) -> QosMgrResult<Vec<String>> {
        self.run_release(targets).await;

        let plan = compile_apply(policy, &mut self.diagnostics);
        for step in &plan.preload {
            self.run_step(step).await?;
        }

        let mut failed = Vec::new();
        for iface in &plan.interfaces {
            if !self.backend.device_exists(&iface.name) {
                self.diagnostics.warning(format!(
                    "Interface {} not found. Skipping QoS for it",
                    iface.name
                ));
                continue;
            }

            info!("Configuring QoS on {}", iface.name);
            let mut completed = self.run_direction(&iface.upload).await?;
            if let Some(download) = &iface.download {
                if completed {
                    completed = self.run_direction(download).await?;
                } else {
                    self.diagnostics.warning(format!(
                        "Skipping download shaping on {} after upload failure",
                        iface.name
                    ));
                }
            }

            if !completed {
                failed.push(iface.name.clone());
            }
        }

        Ok(failed)
    }

    /// Runs a direction's steps, stopping at the first fatal failure.
    ///
    /// Returns false only if the HTB tree or its classification failed. A
    /// redirect stage failure skips the direction but leaves it successful.
    async fn run_direction(&mut self, plan: &DirectionPlan) -> QosMgrResult<bool> {
        if !self.run_steps(&plan.redirect).await? {
            self.diagnostics.error(format!(
                "Redirect to {} failed. Skipping {} shaping on it",
                plan.device, plan.direction
            ));
            return Ok(true);
        }

        if !self.run_steps(&plan.steps).await? {
            self.diagnostics.error(format!(
                "Aborting {} shaping on {}",
                plan.direction, plan.device
            ));
            return Ok(false);
        }

        info!("{} shaping on {} configured", plan.direction, plan.device);
        Ok(true)
    }

    /// Runs steps in order. On a fatal failure, issues its cleanup and stops.
    async fn run_steps(&mut self, steps: &[Step]) -> QosMgrResult<bool> {
        for step in steps {
            if self.run_step(step).await? {
                continue;
            }

            for op in &step.cleanup {
                self.backend.execute(op, Tolerance::BestEffort).await?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Issues one step. Returns false only for a failure its tolerance does
    /// not absorb.
    async fn run_step(&mut self, step: &Step) -> QosMgrResult<bool> {
        let outcome = self.backend.execute(&step.op, step.tolerance).await?;
        if outcome.succeeded {
            if let Some(note) = outcome.diagnostic {
                self.diagnostics.debug(note);
            }
            return Ok(true);
        }

        let detail = outcome.diagnostic.unwrap_or_default();
        match step.tolerance {
            Tolerance::BestEffort => {
                self.diagnostics.debug(format!(
                    "Ignoring failure of '{}': {}",
                    commands::render(&step.op),
                    detail
                ));
                Ok(true)
            }
            Tolerance::Fatal | Tolerance::TolerateExisting => {
                self.diagnostics.error(format!(
                    "Operation failed '{}': {}",
                    commands::render(&step.op),
                    detail
                ));
                Ok(false)
            }
        }
    }

    async fn run_release(&mut self, targets: &[ReleaseTarget]) {
        let plan = compile_release(targets);

        for teardown in &plan.devices {
            if !self.backend.device_exists(&teardown.device) {
                self.diagnostics
                    .debug(format!("{} not present. Skipping teardown", teardown.device));
                continue;
            }

            for step in &teardown.steps {
                if let Err(e) = self.run_step(step).await {
                    self.diagnostics.warning(format!(
                        "Teardown of {} hit an error: {}",
                        teardown.device, e
                    ));
                }

                if let ShapingOperation::DeleteVirtualDevice { device } = &step.op {
                    if self.backend.device_exists(device) {
                        self.diagnostics
                            .warning(format!("{} still present after deletion", device));
                    } else {
                        info!("{} removed", device);
                    }
                }
            }
        }
    }
}
