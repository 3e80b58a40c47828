//! Per-environment deployment file (`deploy.toml`).
//!
//! The file holds one `[environments.<name>]` table per deployment target.
//! Each table is resolved into an immutable [`DeploymentTarget`] before any
//! remote work is scheduled. Reads and writes go through `cap-std` and the
//! TOML support re-exported by `ortho-config`.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{Credential, SshEndpoint};

/// Default location of the deployment file.
pub const DEFAULT_CONFIG_PATH: &str = "./deploy.toml";

/// Default SSH port used when `server` omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised while loading, resolving or writing the deployment file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the file cannot be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is not valid TOML for the expected layout.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the requested environment has no table.
    #[error("environment '{0}' is not defined in the deployment file")]
    UnknownEnvironment(String),
    /// Raised when a required field is empty.
    #[error("environment '{environment}' is missing {field}")]
    MissingField {
        /// Environment being resolved.
        environment: String,
        /// Field that failed validation.
        field: &'static str,
    },
    /// Raised when neither a password nor an identity file is configured.
    #[error("environment '{0}' needs a password or an identity_file")]
    MissingCredential(String),
    /// Raised when `server` cannot be split into host and port.
    #[error("environment '{environment}' has an invalid server address '{address}'")]
    InvalidAddress {
        /// Environment being resolved.
        environment: String,
        /// Offending address.
        address: String,
    },
    /// Raised when `--init-config` would overwrite an existing file.
    #[error("{0} already exists; rerun with --force to replace it")]
    Exists(Utf8PathBuf),
    /// Raised when the sample file cannot be written.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Path that could not be written.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Which deployment flow a target is being resolved for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Long-running server artifacts (JAR packages).
    Server,
    /// Packaged static-site bundles.
    Bundle,
}

/// Raw deployment file layout.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeployFile {
    /// Environment tables keyed by name.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// One `[environments.<name>]` table.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Host address as `host[:port]`.
    pub server: String,
    /// Remote user.
    pub username: String,
    /// Password for the remote user.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Private key used instead of a password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    /// Java runtime on the remote host.
    pub java_path: String,
    /// Directory on the remote host that receives artifacts.
    pub remote_base_path: String,
    /// Server artifacts to deploy, in order.
    pub jar_files: Vec<String>,
    /// npm script that builds the static bundle.
    pub scripts: String,
    /// Bundle output directory relative to the project root.
    pub output_dir: String,
}

impl std::fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .field("identity_file", &self.identity_file)
            .field("java_path", &self.java_path)
            .field("remote_base_path", &self.remote_base_path)
            .field("jar_files", &self.jar_files)
            .field("scripts", &self.scripts)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

/// Command-line overrides applied to every resolved environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetOverrides {
    /// Replaces `server`.
    pub server: Option<String>,
    /// Replaces `username`.
    pub username: Option<String>,
    /// Replaces `password`.
    pub password: Option<String>,
    /// Replaces `java_path`.
    pub java_path: Option<String>,
    /// Replaces `remote_base_path`.
    pub remote_base_path: Option<String>,
}

impl TargetOverrides {
    /// Applies every populated override to `config`.
    pub fn apply(&self, config: &mut EnvironmentConfig) {
        let pairs = [
            (&self.server, &mut config.server),
            (&self.username, &mut config.username),
            (&self.password, &mut config.password),
            (&self.java_path, &mut config.java_path),
            (&self.remote_base_path, &mut config.remote_base_path),
        ];
        for (value, slot) in pairs {
            if let Some(value) = value {
                slot.clone_from(value);
            }
        }
    }
}

/// Immutable, validated settings for one environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentTarget {
    /// Environment name, also used as the activation profile.
    pub environment: String,
    /// How to reach the host.
    pub endpoint: SshEndpoint,
    /// Java runtime on the remote host.
    pub runtime_path: String,
    /// Directory on the remote host that receives artifacts.
    pub remote_base_path: String,
    /// Server artifacts to deploy, in order.
    pub artifacts: Vec<String>,
    /// npm script that builds the static bundle.
    pub build_script: String,
    /// Bundle output directory relative to the project root.
    pub output_dir: String,
}

impl DeployFile {
    /// Parses a deployment file from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the content is malformed.
    pub fn from_toml(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Reads and parses the deployment file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let (dir, file_name) = open_parent(path).map_err(|message| ConfigError::Read {
            path: path.to_path_buf(),
            message,
        })?;
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| ConfigError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::from_toml(path, &contents)
    }

    /// Resolves the named environment for `flow`, applying `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the environment is undefined or invalid.
    pub fn resolve(
        &self,
        environment: &str,
        overrides: &TargetOverrides,
        flow: Flow,
    ) -> Result<DeploymentTarget, ConfigError> {
        let mut config = self
            .environments
            .get(environment)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEnvironment(environment.to_owned()))?;
        overrides.apply(&mut config);
        config.into_target(environment, flow)
    }

    /// Builds the three-environment sample written by `--init-config`.
    #[must_use]
    pub fn sample() -> Self {
        let jars = || {
            vec![
                String::from("admin.jar"),
                String::from("client.jar"),
                String::from("websocket.jar"),
            ]
        };
        let mut environments = BTreeMap::new();
        environments.insert(
            String::from("dev"),
            EnvironmentConfig {
                server: String::from("192.168.31.60:22"),
                username: String::from("root"),
                password: String::from("change-me"),
                identity_file: None,
                java_path: String::from("/opt/soft/zulu11/bin/java"),
                remote_base_path: String::from("/opt/apps"),
                jar_files: jars(),
                scripts: String::from("build:dev"),
                output_dir: String::from("dist-dev"),
            },
        );
        environments.insert(
            String::from("test"),
            EnvironmentConfig {
                server: String::from("test-server:22"),
                username: String::from("test-user"),
                password: String::from("test-password"),
                identity_file: None,
                java_path: String::from("/usr/bin/java"),
                remote_base_path: String::from("/opt/test/apps"),
                jar_files: jars(),
                scripts: String::from("build:test"),
                output_dir: String::from("dist-test"),
            },
        );
        environments.insert(
            String::from("prod"),
            EnvironmentConfig {
                server: String::from("prod-server:22"),
                username: String::from("prod-user"),
                password: String::new(),
                identity_file: Some(String::from("~/.ssh/id_ed25519")),
                java_path: String::from("/usr/java/latest/bin/java"),
                remote_base_path: String::from("/opt/prod/apps"),
                jar_files: jars(),
                scripts: String::from("build"),
                output_dir: String::from("dist"),
            },
        );
        Self { environments }
    }

    /// Renders the file as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Write`] when serialisation fails.
    pub fn to_toml(&self, path: &Utf8Path) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

impl EnvironmentConfig {
    fn into_target(self, environment: &str, flow: Flow) -> Result<DeploymentTarget, ConfigError> {
        let missing = |field| ConfigError::MissingField {
            environment: environment.to_owned(),
            field,
        };
        require(&self.server, "server").map_err(missing)?;
        require(&self.username, "username").map_err(missing)?;
        require(&self.remote_base_path, "remote_base_path").map_err(missing)?;
        match flow {
            Flow::Server => {
                require(&self.java_path, "java_path").map_err(missing)?;
                if self.jar_files.iter().all(|jar| jar.trim().is_empty()) {
                    return Err(missing("jar_files"));
                }
            }
            Flow::Bundle => {
                require(&self.scripts, "scripts").map_err(missing)?;
                require(&self.output_dir, "output_dir").map_err(missing)?;
            }
        }

        let credential = self.credential(environment)?;
        let (host, port) =
            parse_address(&self.server).ok_or_else(|| ConfigError::InvalidAddress {
                environment: environment.to_owned(),
                address: self.server.clone(),
            })?;

        Ok(DeploymentTarget {
            environment: environment.to_owned(),
            endpoint: SshEndpoint {
                host,
                port,
                username: self.username.trim().to_owned(),
                credential,
            },
            runtime_path: self.java_path.trim().to_owned(),
            remote_base_path: self.remote_base_path.trim().to_owned(),
            artifacts: self
                .jar_files
                .iter()
                .map(|jar| jar.trim().to_owned())
                .filter(|jar| !jar.is_empty())
                .collect(),
            build_script: self.scripts.trim().to_owned(),
            output_dir: self.output_dir.trim().to_owned(),
        })
    }

    fn credential(&self, environment: &str) -> Result<Credential, ConfigError> {
        if let Some(identity) = self.identity_file.as_deref()
            && !identity.trim().is_empty()
        {
            return Ok(Credential::IdentityFile(Utf8PathBuf::from(identity.trim())));
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingCredential(environment.to_owned()));
        }
        Ok(Credential::Password(self.password.clone()))
    }
}

fn require(value: &str, field: &'static str) -> Result<(), &'static str> {
    if value.trim().is_empty() {
        Err(field)
    } else {
        Ok(())
    }
}

/// Splits `host[:port]` into its parts. Bracketed IPv6 literals are accepted.
#[must_use]
pub fn parse_address(address: &str) -> Option<(String, u16)> {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_owned(), port));
    }

    match address.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Some((address.to_owned(), DEFAULT_SSH_PORT)),
        Some((host, port)) if !host.is_empty() => Some((host.to_owned(), port.parse().ok()?)),
        Some(_) => None,
        None if address.is_empty() => None,
        None => Some((address.to_owned(), DEFAULT_SSH_PORT)),
    }
}

/// Loads `path` and resolves `environment` in one step.
///
/// The file is re-read for every environment so that a broken file only
/// affects the environments that are resolved from it.
///
/// # Errors
///
/// Returns [`ConfigError`] from loading or resolution.
pub fn resolve_environment(
    path: &Utf8Path,
    environment: &str,
    overrides: &TargetOverrides,
    flow: Flow,
) -> Result<DeploymentTarget, ConfigError> {
    DeployFile::load(path)?.resolve(environment, overrides, flow)
}

/// Writes the sample deployment file to `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Exists`] when the file is present and `force` is
/// `false`, or [`ConfigError::Write`] on I/O failure.
pub fn write_sample(path: &Utf8Path, force: bool) -> Result<(), ConfigError> {
    let write_err = |message: String| ConfigError::Write {
        path: path.to_path_buf(),
        message,
    };
    let parent = parent_of(path);
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| write_err(err.to_string()))?;
    let (dir, file_name) = open_parent(path).map_err(write_err)?;

    let exists = dir
        .try_exists(file_name)
        .map_err(|err| write_err(err.to_string()))?;
    if exists && !force {
        return Err(ConfigError::Exists(path.to_path_buf()));
    }

    let rendered = DeployFile::sample().to_toml(path)?;
    dir.write(file_name, rendered)
        .map_err(|err| write_err(err.to_string()))
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| String::from("configuration path is missing a filename"))?;
    let dir = Dir::open_ambient_dir(parent_of(path), ambient_authority())
        .map_err(|err: io::Error| err.to_string())?;
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests;
