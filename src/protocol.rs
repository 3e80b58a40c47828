//! Per-unit deployment sequences.
//!
//! A server unit moves through `start → connected → uploaded → superseded →
//! launched → verified`; a bundle unit through `start → connected → uploaded
//! → unpacked`. The first failing step ends the unit. Each sequence owns its
//! session and closes it before returning, whatever the outcome.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DeploymentTarget;
use crate::lifecycle::{LaunchSpec, LifecycleError, ProcessManager, SupersedeOutcome};
use crate::local::LocalError;
use crate::session::{RemoteSession, SessionError, SessionProvider, run_checked};
use crate::settings::ProcessTiming;
use crate::transfer::{TransferError, transfer};

/// Progress markers for both deployment sequences.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Nothing has happened yet.
    Start,
    /// A session is open.
    Connected,
    /// The artifact or archive is on the remote host.
    Uploaded,
    /// Any previous instance has been dealt with.
    Superseded,
    /// The launch command returned.
    Launched,
    /// The new instance was found in the process table.
    Verified,
    /// The bundle was extracted in place.
    Unpacked,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Connected => "connected",
            Self::Uploaded => "uploaded",
            Self::Superseded => "superseded",
            Self::Launched => "launched",
            Self::Verified => "verified",
            Self::Unpacked => "unpacked",
        };
        f.write_str(name)
    }
}

/// Identity of one deployment unit.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UnitId {
    /// Environment name.
    pub environment: String,
    /// Artifact name, or the bundle output directory.
    pub artifact: String,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.environment, self.artifact)
    }
}

/// Work for one server artifact on one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerUnit {
    /// Unit identity.
    pub id: UnitId,
    /// Built artifact on the local machine.
    pub local_path: Utf8PathBuf,
    /// Destination on the remote host.
    pub remote_path: String,
    /// Resolved environment, copied per unit.
    pub target: DeploymentTarget,
}

/// Work for one static bundle on one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleUnit {
    /// Unit identity.
    pub id: UnitId,
    /// Project root where the build script runs.
    pub project_dir: Utf8PathBuf,
    /// Remote location of the uploaded archive.
    pub remote_archive: String,
    /// Remote directory the archive is unpacked into.
    pub remote_dir: String,
    /// Resolved environment, copied per unit.
    pub target: DeploymentTarget,
}

/// Errors that end a deployment unit.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UnitError {
    /// Raised when the session cannot be opened.
    #[error("connection failed: {0}")]
    Connect(#[source] SessionError),
    /// Raised when the upload fails.
    #[error("upload failed: {0}")]
    Transfer(#[source] TransferError),
    /// Raised when the new instance cannot be started or verified.
    #[error("launch failed: {0}")]
    Launch(#[source] LifecycleError),
    /// Raised when the remote unpack command fails.
    #[error("unpack failed: {0}")]
    Unpack(#[source] SessionError),
    /// Raised when the per-environment bundle build fails.
    #[error("build failed: {0}")]
    Build(#[source] LocalError),
    /// Raised when the bundle cannot be archived.
    #[error("packaging failed: {0}")]
    Package(#[source] LocalError),
}

impl UnitError {
    /// Last stage the unit completed before failing.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Connect(_) | Self::Build(_) | Self::Package(_) => Stage::Start,
            Self::Transfer(_) => Stage::Connected,
            Self::Launch(LifecycleError::Launch { .. }) => Stage::Superseded,
            Self::Launch(_) => Stage::Launched,
            Self::Unpack(_) => Stage::Uploaded,
        }
    }
}

/// Summary of a verified server deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerReport {
    /// Bytes uploaded.
    pub bytes: u64,
    /// Result of stopping the previous instance; `None` when that failed and
    /// the failure was tolerated.
    pub superseded: Option<SupersedeOutcome>,
    /// Process identifier of the new instance.
    pub pid: u32,
}

/// Summary of an unpacked bundle deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleReport {
    /// Bytes uploaded.
    pub bytes: u64,
}

/// Settings shared by every server unit in a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerOptions {
    /// Supersede and verification timings.
    pub timing: ProcessTiming,
    /// Flag carrying the environment name to the launched artifact.
    pub profile_flag: String,
}

/// Remote command that replaces `remote_dir` with the contents of
/// `remote_archive`.
#[must_use]
pub fn unpack_command(remote_dir: &str, remote_archive: &str, unzip_bin: &str) -> String {
    let dir = escape(remote_dir.into());
    format!(
        "rm -rf {dir} && mkdir -p {dir} && cd {dir} && {} -o {}",
        escape(unzip_bin.into()),
        escape(remote_archive.into())
    )
}

fn advance(stage: Stage) {
    debug!(stage = %stage, "unit advanced");
}

async fn release<S: RemoteSession>(mut session: S) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "failed to close session");
    }
}

/// Runs the server sequence for `unit`.
///
/// A failure to stop the previous instance is logged and tolerated.
///
/// # Errors
///
/// Returns [`UnitError`] from the first failing step.
pub async fn deploy_server<P: SessionProvider + ?Sized>(
    provider: &P,
    unit: &ServerUnit,
    options: &ServerOptions,
) -> Result<ServerReport, UnitError> {
    let session = provider
        .open(&unit.target.endpoint)
        .await
        .map_err(UnitError::Connect)?;
    advance(Stage::Connected);
    let result = drive_server(&session, unit, options).await;
    release(session).await;
    result
}

async fn drive_server<S: RemoteSession>(
    session: &S,
    unit: &ServerUnit,
    options: &ServerOptions,
) -> Result<ServerReport, UnitError> {
    let bytes = transfer(session, &unit.local_path, &unit.remote_path)
        .await
        .map_err(UnitError::Transfer)?;
    advance(Stage::Uploaded);

    let manager = ProcessManager::new(session, options.timing);
    let superseded = match manager.supersede(&unit.remote_path).await {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            warn!(error = %err, "failed to stop previous instance; continuing");
            None
        }
    };
    advance(Stage::Superseded);

    let spec = LaunchSpec {
        artifact_path: &unit.remote_path,
        runtime_path: &unit.target.runtime_path,
        profile_flag: &options.profile_flag,
        environment: &unit.id.environment,
    };
    let pid = manager.launch(&spec).await.map_err(UnitError::Launch)?;
    advance(Stage::Verified);
    Ok(ServerReport {
        bytes,
        superseded,
        pid,
    })
}

/// Runs the bundle sequence for `unit`, uploading the local `archive`.
///
/// # Errors
///
/// Returns [`UnitError`] from the first failing step.
pub async fn deploy_bundle<P: SessionProvider + ?Sized>(
    provider: &P,
    unit: &BundleUnit,
    archive: &Utf8Path,
    unzip_bin: &str,
) -> Result<BundleReport, UnitError> {
    let session = provider
        .open(&unit.target.endpoint)
        .await
        .map_err(UnitError::Connect)?;
    advance(Stage::Connected);
    let result = drive_bundle(&session, unit, archive, unzip_bin).await;
    release(session).await;
    result
}

async fn drive_bundle<S: RemoteSession>(
    session: &S,
    unit: &BundleUnit,
    archive: &Utf8Path,
    unzip_bin: &str,
) -> Result<BundleReport, UnitError> {
    let bytes = transfer(session, archive, &unit.remote_archive)
        .await
        .map_err(UnitError::Transfer)?;
    advance(Stage::Uploaded);

    let command = unpack_command(&unit.remote_dir, &unit.remote_archive, unzip_bin);
    run_checked(session, &command)
        .await
        .map_err(UnitError::Unpack)?;
    advance(Stage::Unpacked);
    info!(remote_dir = %unit.remote_dir, "bundle unpacked");
    Ok(BundleReport { bytes })
}
