//! Local build and packaging steps.
//!
//! These wrap external tools: Maven for the shared server build, npm for
//! per-environment bundle builds and `zip` for bundle archives.

use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::process::{CommandOutput, CommandRunner, SpawnError};
use crate::settings::Settings;

/// Number of output lines kept in [`LocalError::Build`].
pub const BUILD_OUTPUT_TAIL_LINES: usize = 20;

/// Errors raised by local build and packaging steps.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LocalError {
    /// Raised when a tool cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when a build tool exits non-zero.
    #[error("`{program}` exited with status {status}:\n{output}")]
    Build {
        /// Command line that failed.
        program: String,
        /// Human readable exit status.
        status: String,
        /// Last lines of the tool's stdout followed by its stderr.
        output: String,
    },
    /// Raised when the bundle output directory is missing.
    #[error("output directory {0} does not exist")]
    MissingOutputDir(Utf8PathBuf),
    /// Raised when the archive cannot be produced.
    #[error("failed to package {path}: {message}")]
    Package {
        /// Archive path.
        path: Utf8PathBuf,
        /// Diagnostic detail.
        message: String,
    },
}

/// Runs local tools through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct LocalToolchain<R> {
    runner: R,
    maven_bin: String,
    maven_goals: Vec<String>,
    npm_bin: String,
    zip_bin: String,
}

impl<R: CommandRunner> LocalToolchain<R> {
    /// Builds a toolchain from tool settings.
    #[must_use]
    pub fn new(runner: R, settings: &Settings) -> Self {
        Self {
            runner,
            maven_bin: settings.maven_bin.clone(),
            maven_goals: settings.maven_goals(),
            npm_bin: settings.npm_bin.clone(),
            zip_bin: settings.zip_bin.clone(),
        }
    }

    /// Runs the shared server build in `project_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Spawn`] or [`LocalError::Build`].
    pub async fn build_server_project(&self, project_dir: &Utf8Path) -> Result<(), LocalError> {
        info!(project = %project_dir, "building server project");
        let args: Vec<OsString> = self.maven_goals.iter().map(OsString::from).collect();
        self.run_build(project_dir, &self.maven_bin, &args).await
    }

    /// Runs the npm `script` in `project_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Spawn`] or [`LocalError::Build`].
    pub async fn build_bundle(&self, project_dir: &Utf8Path, script: &str) -> Result<(), LocalError> {
        info!(project = %project_dir, script, "building bundle");
        let args = [OsString::from("run"), OsString::from(script)];
        self.run_build(project_dir, &self.npm_bin, &args).await
    }

    /// Archives `<project_dir>/<output_dir>` into `<output_dir>.zip` beside it
    /// and returns the archive path.
    ///
    /// Entries are stored relative to the output directory. Any stale archive
    /// is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::MissingOutputDir`], [`LocalError::Spawn`] or
    /// [`LocalError::Package`].
    pub async fn package_directory(
        &self,
        project_dir: &Utf8Path,
        output_dir: &str,
    ) -> Result<Utf8PathBuf, LocalError> {
        let source = project_dir.join(output_dir);
        let is_dir = tokio::fs::metadata(&source)
            .await
            .is_ok_and(|metadata| metadata.is_dir());
        let Some(name) = source.file_name().map(str::to_owned).filter(|_| is_dir) else {
            return Err(LocalError::MissingOutputDir(source));
        };
        let archive_name = format!("{name}.zip");
        let archive = source.with_file_name(&archive_name);
        let package_err = |message: String| LocalError::Package {
            path: archive.clone(),
            message,
        };

        match tokio::fs::remove_file(&archive).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(package_err(err.to_string())),
        }

        let args = [
            OsString::from("-q"),
            OsString::from("-r"),
            OsString::from(format!("../{archive_name}")),
            OsString::from("."),
        ];
        let output = self.runner.run_in(&source, &self.zip_bin, &args).await?;
        if !output.is_success() {
            return Err(package_err(format!(
                "{} exited with status {}: {}",
                self.zip_bin,
                output.status_text(),
                output.stderr.trim()
            )));
        }
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(package_err(String::from("archive was not created")));
        }
        info!(archive = %archive, "bundle packaged");
        Ok(archive)
    }

    async fn run_build(
        &self,
        dir: &Utf8Path,
        program: &str,
        args: &[OsString],
    ) -> Result<(), LocalError> {
        let output = self.runner.run_in(dir, program, args).await?;
        check_build(program, args, &output)
    }
}

fn check_build(program: &str, args: &[OsString], output: &CommandOutput) -> Result<(), LocalError> {
    if output.is_success() {
        return Ok(());
    }
    let mut line = vec![program.to_owned()];
    line.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    Err(LocalError::Build {
        program: line.join(" "),
        status: output.status_text(),
        output: output_tail(output, BUILD_OUTPUT_TAIL_LINES),
    })
}

/// Last `limit` non-blank lines of stdout then stderr. Maven reports compile
/// errors on stdout, npm usually on stderr.
fn output_tail(output: &CommandOutput, limit: usize) -> String {
    let lines: Vec<&str> = output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .filter(|line| !line.trim().is_empty())
        .collect();
    let skip = lines.len().saturating_sub(limit);
    lines
        .into_iter()
        .skip(skip)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests;
