//! Turns resolved environments into deployment units.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::config::DeploymentTarget;
use crate::protocol::{BundleUnit, ServerUnit, UnitId};

/// Module an artifact belongs to: the text before its first `.`.
#[must_use]
pub fn module_name(artifact: &str) -> &str {
    artifact
        .split_once('.')
        .map_or(artifact, |(module, _)| module)
}

/// Joins a remote base path and a name with forward slashes.
#[must_use]
pub fn remote_join(base: &str, name: &str) -> String {
    let base_path = base.replace('\\', "/");
    let file_name = name.replace('\\', "/");
    format!(
        "{}/{}",
        base_path.trim_end_matches('/'),
        file_name.trim_start_matches('/')
    )
}

/// Where the local build leaves `artifact`.
///
/// A single-artifact project builds into `<project>/target`; a multi-module
/// project builds each artifact into `<project>/<module>/target`.
#[must_use]
pub fn local_artifact_path(project: &Utf8Path, artifact: &str, artifact_count: usize) -> Utf8PathBuf {
    if artifact_count == 1 {
        project.join("target").join(artifact)
    } else {
        project
            .join(module_name(artifact))
            .join("target")
            .join(artifact)
    }
}

/// Returns `true` when `artifact` passes the module filter. An empty filter
/// selects everything.
#[must_use]
pub fn is_selected(artifact: &str, modules: &[String]) -> bool {
    modules.is_empty() || modules.iter().any(|module| module == module_name(artifact))
}

/// Builds one server unit per selected artifact of `target`.
#[must_use]
pub fn plan_server_units(
    project: &Utf8Path,
    target: &DeploymentTarget,
    modules: &[String],
) -> Vec<ServerUnit> {
    let count = target.artifacts.len();
    target
        .artifacts
        .iter()
        .filter(|artifact| {
            let selected = is_selected(artifact, modules);
            if !selected {
                info!(
                    environment = %target.environment,
                    artifact = %artifact,
                    "module not selected for deployment"
                );
            }
            selected
        })
        .map(|artifact| ServerUnit {
            id: UnitId {
                environment: target.environment.clone(),
                artifact: artifact.clone(),
            },
            local_path: local_artifact_path(project, artifact, count),
            remote_path: remote_join(&target.remote_base_path, artifact),
            target: target.clone(),
        })
        .collect()
}

/// Builds the bundle unit for `target`.
#[must_use]
pub fn plan_bundle_unit(project: &Utf8Path, target: &DeploymentTarget) -> BundleUnit {
    let normalised = target.output_dir.replace('\\', "/");
    let output_dir = normalised.trim_end_matches('/');
    BundleUnit {
        id: UnitId {
            environment: target.environment.clone(),
            artifact: output_dir.to_owned(),
        },
        project_dir: project.to_path_buf(),
        remote_archive: remote_join(&target.remote_base_path, &format!("{output_dir}.zip")),
        remote_dir: remote_join(&target.remote_base_path, output_dir),
        target: target.clone(),
    }
}
