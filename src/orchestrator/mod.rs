//! Fans deployments out across environments and artifacts.
//!
//! Every (environment, artifact) pair runs as its own task with its own
//! session. Tasks report exactly one [`DeploymentOutcome`] each over a channel
//! sized to the number of units, so no send ever waits. The orchestrator joins
//! every task before draining the channel and folds failures into a single
//! [`AggregateError`]. One failing unit never stops its siblings.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{DeploymentTarget, Flow, TargetOverrides, resolve_environment};
use crate::local::{LocalError, LocalToolchain};
use crate::process::CommandRunner;
use crate::protocol::{ServerOptions, UnitError, UnitId, deploy_bundle, deploy_server};
use crate::session::SessionProvider;
use crate::settings::{ProcessTiming, Settings};

mod plan;

pub use plan::{
    is_selected, local_artifact_path, module_name, plan_bundle_unit, plan_server_units,
    remote_join,
};

/// Result reported by one deployment unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentOutcome {
    /// Unit identity.
    pub unit: UnitId,
    /// Failure description with unit context, or `None` on success.
    pub error: Option<String>,
}

impl DeploymentOutcome {
    /// Returns `true` when the unit succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Every outcome of a run in which at least one unit failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregateError {
    outcomes: Vec<DeploymentOutcome>,
}

impl AggregateError {
    /// All outcomes in arrival order, successes included.
    #[must_use]
    pub fn outcomes(&self) -> &[DeploymentOutcome] {
        &self.outcomes
    }

    /// Failure descriptions in arrival order.
    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.error.as_deref())
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<&str> = self.failures().collect();
        write!(
            f,
            "deployment finished with {} failure(s):\n{}",
            failures.len(),
            failures.join("\n")
        )
    }
}

impl std::error::Error for AggregateError {}

/// Errors returned by a deployment run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// The shared server build failed, so nothing was scheduled.
    #[error("server build failed: {0}")]
    Build(#[source] LocalError),
    /// At least one unit failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// What to deploy in one run.
#[derive(Clone, Copy, Debug)]
pub struct DeployRequest<'a> {
    /// Project root holding build output.
    pub project_dir: &'a Utf8Path,
    /// Deployment file.
    pub config_path: &'a Utf8Path,
    /// Environments to deploy, in order.
    pub environments: &'a [String],
    /// Module filter for server artifacts; empty selects all.
    pub modules: &'a [String],
    /// Overrides applied to every environment.
    pub overrides: &'a TargetOverrides,
}

/// Schedules and supervises deployment units.
#[derive(Debug)]
pub struct DeployOrchestrator<P, R> {
    provider: Arc<P>,
    toolchain: Arc<LocalToolchain<R>>,
    server_options: ServerOptions,
    unzip_bin: String,
    limit: Option<Arc<Semaphore>>,
}

impl<P, R> DeployOrchestrator<P, R>
where
    P: SessionProvider + 'static,
    R: CommandRunner + 'static,
{
    /// Creates an orchestrator. `settings.max_parallel` caps how many units
    /// run at once.
    #[must_use]
    pub fn new(provider: P, toolchain: LocalToolchain<R>, settings: &Settings) -> Self {
        Self {
            provider: Arc::new(provider),
            toolchain: Arc::new(toolchain),
            server_options: ServerOptions {
                timing: settings.process_timing(),
                profile_flag: settings.profile_flag.clone(),
            },
            unzip_bin: settings.unzip_bin.clone(),
            limit: settings
                .max_parallel
                .map(|permits| Arc::new(Semaphore::new(permits))),
        }
    }

    /// Replaces the process timings.
    #[must_use]
    pub fn with_timing(mut self, timing: ProcessTiming) -> Self {
        self.server_options.timing = timing;
        self
    }

    /// Builds the server project once, then deploys every selected artifact
    /// to every requested environment.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Build`] when the shared build fails and
    /// [`DeployError::Aggregate`] when any unit fails.
    pub async fn deploy_servers(
        &self,
        request: &DeployRequest<'_>,
    ) -> Result<Vec<DeploymentOutcome>, DeployError> {
        if request.environments.is_empty() {
            debug!("no server environments requested");
            return Ok(Vec::new());
        }
        self.toolchain
            .build_server_project(request.project_dir)
            .await
            .map_err(DeployError::Build)?;

        let mut jobs = Vec::new();
        for environment in request.environments {
            let Some(target) = resolve(request, environment, Flow::Server) else {
                continue;
            };
            for unit in plan_server_units(request.project_dir, &target, request.modules) {
                let provider = Arc::clone(&self.provider);
                let options = self.server_options.clone();
                let id = unit.id.clone();
                jobs.push((id, async move {
                    let report = deploy_server(provider.as_ref(), &unit, &options).await?;
                    info!(pid = report.pid, bytes = report.bytes, "artifact deployed");
                    Ok::<(), UnitError>(())
                }));
            }
        }
        aggregate(self.fan_out(jobs).await)
    }

    /// Builds, packages and deploys the static bundle for every requested
    /// environment, one unit per environment.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Aggregate`] when any unit fails.
    pub async fn deploy_bundles(
        &self,
        request: &DeployRequest<'_>,
    ) -> Result<Vec<DeploymentOutcome>, DeployError> {
        let mut jobs = Vec::new();
        for environment in request.environments {
            let Some(target) = resolve(request, environment, Flow::Bundle) else {
                continue;
            };
            let unit = plan_bundle_unit(request.project_dir, &target);
            let provider = Arc::clone(&self.provider);
            let toolchain = Arc::clone(&self.toolchain);
            let unzip_bin = self.unzip_bin.clone();
            let id = unit.id.clone();
            jobs.push((id, async move {
                toolchain
                    .build_bundle(&unit.project_dir, &unit.target.build_script)
                    .await
                    .map_err(UnitError::Build)?;
                let archive = toolchain
                    .package_directory(&unit.project_dir, &unit.target.output_dir)
                    .await
                    .map_err(UnitError::Package)?;
                let report = deploy_bundle(provider.as_ref(), &unit, &archive, &unzip_bin).await?;
                info!(bytes = report.bytes, "bundle deployed");
                Ok::<(), UnitError>(())
            }));
        }
        aggregate(self.fan_out(jobs).await)
    }

    async fn fan_out<F>(&self, jobs: Vec<(UnitId, F)>) -> Vec<DeploymentOutcome>
    where
        F: Future<Output = Result<(), UnitError>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(jobs.len().max(1));
        let mut handles = Vec::with_capacity(jobs.len());
        for (id, job) in jobs {
            let tx = tx.clone();
            let limit = self.limit.clone();
            let span = info_span!(
                "unit",
                environment = %id.environment,
                artifact = %id.artifact
            );
            let unit = id.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = match limit {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    info!("deployment unit started");
                    let error = match job.await {
                        Ok(()) => {
                            info!("deployment unit succeeded");
                            None
                        }
                        Err(err) => {
                            error!(stage = %err.stage(), error = %err, "deployment unit failed");
                            Some(format!("{unit}: {err} (last completed stage: {})", err.stage()))
                        }
                    };
                    if tx.send(DeploymentOutcome { unit, error }).await.is_err() {
                        debug!("outcome receiver dropped");
                    }
                }
                .instrument(span),
            );
            handles.push((id, handle));
        }
        drop(tx);

        let mut lost = Vec::new();
        for (id, handle) in handles {
            if let Err(err) = handle.await {
                lost.push(DeploymentOutcome {
                    error: Some(format!("{id}: deployment task aborted: {err}")),
                    unit: id,
                });
            }
        }

        let mut outcomes = Vec::with_capacity(lost.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.append(&mut lost);
        outcomes
    }
}

fn resolve(
    request: &DeployRequest<'_>,
    environment: &str,
    flow: Flow,
) -> Option<DeploymentTarget> {
    match resolve_environment(request.config_path, environment, request.overrides, flow) {
        Ok(target) => Some(target),
        Err(err) => {
            warn!(
                environment,
                error = %err,
                "skipping environment: configuration could not be resolved"
            );
            None
        }
    }
}

fn aggregate(outcomes: Vec<DeploymentOutcome>) -> Result<Vec<DeploymentOutcome>, DeployError> {
    if outcomes.iter().all(DeploymentOutcome::is_success) {
        Ok(outcomes)
    } else {
        Err(AggregateError { outcomes }.into())
    }
}
