//! Command-line interface definitions for the `ferry` binary.
//!
//! This module centralises the clap parser structure so both the main binary
//! and the build script can reuse it when generating the manual page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `ferry` binary.
#[derive(Debug, Parser)]
#[command(
    name = "ferry",
    version,
    about = "Deploy server JARs and static bundles to remote hosts over SSH"
)]
pub(crate) struct Cli {
    /// Environments that receive server artifacts, comma separated.
    #[arg(short = 'e', long = "env", value_name = "ENVS", value_delimiter = ',')]
    pub(crate) env: Vec<String>,
    /// Environments that receive the static web bundle, comma separated.
    #[arg(short = 'w', long = "web", value_name = "ENVS", value_delimiter = ',')]
    pub(crate) web: Vec<String>,
    /// Only deploy server artifacts whose module name is listed.
    ///
    /// The module name is the artifact name up to its first `.`, so `admin`
    /// selects `admin.jar`.
    #[arg(short = 'm', long = "module", value_name = "MODULES", value_delimiter = ',')]
    pub(crate) modules: Vec<String>,
    /// Project root containing the build output.
    #[arg(short = 'p', long = "project", value_name = "DIR", default_value = ".")]
    pub(crate) project_dir: Utf8PathBuf,
    /// Deployment file describing each environment.
    // Kept in step with `ferry::DEFAULT_CONFIG_PATH`; the build script cannot
    // see the library.
    #[arg(short = 'c', long, value_name = "FILE", default_value = "./deploy.toml")]
    pub(crate) config: Utf8PathBuf,
    /// Write a sample deployment file with dev, test and prod environments,
    /// then exit.
    #[arg(long)]
    pub(crate) init_config: bool,
    /// Replace an existing deployment file when used with --init-config.
    #[arg(long, requires = "init_config")]
    pub(crate) force: bool,
    /// Override the server address (`host[:port]`) of every environment.
    #[arg(short = 's', long, value_name = "ADDRESS")]
    pub(crate) server: Option<String>,
    /// Override the remote user of every environment.
    #[arg(short = 'u', long, value_name = "USER")]
    pub(crate) username: Option<String>,
    /// Override the password of every environment.
    #[arg(long, value_name = "PASSWORD")]
    pub(crate) password: Option<String>,
    /// Override the remote Java runtime of every environment.
    #[arg(short = 'j', long, value_name = "PATH")]
    pub(crate) java_path: Option<String>,
    /// Override the remote base directory of every environment.
    #[arg(short = 'r', long, value_name = "PATH")]
    pub(crate) remote_base_path: Option<String>,
}
