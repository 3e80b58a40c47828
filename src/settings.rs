//! Tool settings loaded via `ortho-config`.
//!
//! [`Settings`] covers how `ferry` talks to the local toolchain and to remote
//! hosts. It is separate from the per-environment deployment file handled by
//! [`crate::config`]. Values merge defaults, `ferry.toml` discovery and
//! `FERRY_*` environment variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SSH connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default grace period between launching an artifact and the first liveness
/// check.
pub const DEFAULT_LAUNCH_SETTLE_MS: u64 = 2_000;

/// Local toolchain and remote transport settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FERRY",
    discovery(
        app_name = "ferry",
        env_var = "FERRY_CONFIG_PATH",
        config_file_name = "ferry.toml",
        dotfile_name = ".ferry.toml",
        project_file_name = "ferry.toml"
    )
)]
pub struct Settings {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable used for password credentials.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Whether to reuse one authenticated connection per session through an
    /// OpenSSH control socket.
    #[ortho_config(default = true)]
    pub ssh_multiplex: bool,
    /// Connection timeout passed to `ssh`.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    /// Maven executable used for the shared server build.
    #[ortho_config(default = "mvn".to_owned())]
    pub maven_bin: String,
    /// Whitespace separated Maven goals.
    #[ortho_config(default = "clean package".to_owned())]
    pub maven_args: String,
    /// npm executable used for bundle builds.
    #[ortho_config(default = "npm".to_owned())]
    pub npm_bin: String,
    /// Local `zip` executable used to package bundles.
    #[ortho_config(default = "zip".to_owned())]
    pub zip_bin: String,
    /// Remote `unzip` executable used to unpack bundles.
    #[ortho_config(default = "unzip".to_owned())]
    pub unzip_bin: String,
    /// Flag used to pass the environment name to a launched artifact.
    #[ortho_config(default = "--spring.profiles.active".to_owned())]
    pub profile_flag: String,
    /// Delay before the first post-launch liveness check.
    #[ortho_config(default = DEFAULT_LAUNCH_SETTLE_MS)]
    pub launch_settle_ms: u64,
    /// Ceiling on post-launch polling, measured from the launch command.
    #[ortho_config(default = 10_000)]
    pub launch_verify_timeout_ms: u64,
    /// Interval between process-table polls.
    #[ortho_config(default = 500)]
    pub poll_interval_ms: u64,
    /// How long to wait for a superseded process to leave the process table.
    #[ortho_config(default = 5_000)]
    pub terminate_timeout_ms: u64,
    /// Upper bound on concurrently running deployment units. Unset means one
    /// task per unit with no cap.
    pub max_parallel: Option<usize>,
}

/// Errors raised when loading or validating [`Settings`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is empty.
    #[error("missing {field}: set FERRY_{env_suffix} or add {field} to ferry.toml", env_suffix = field.to_uppercase())]
    Missing {
        /// Field that failed validation.
        field: String,
    },
    /// Raised when a numeric value is out of range.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Field that failed validation.
        field: String,
    },
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            ssh_multiplex: true,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            maven_bin: String::from("mvn"),
            maven_args: String::from("clean package"),
            npm_bin: String::from("npm"),
            zip_bin: String::from("zip"),
            unzip_bin: String::from("unzip"),
            profile_flag: String::from("--spring.profiles.active"),
            launch_settle_ms: DEFAULT_LAUNCH_SETTLE_MS,
            launch_verify_timeout_ms: 10_000,
            poll_interval_ms: 500,
            terminate_timeout_ms: 5_000,
            max_parallel: None,
        }
    }
}

impl Settings {
    /// Loads settings from defaults, configuration files and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails, or a
    /// validation error from [`Settings::validate`].
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        let settings = Self::load_from_iter([std::ffi::OsString::from("ferry")])
            .map_err(|err| SettingsError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Ensures required values are present.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (value, field) in [
            (&self.ssh_bin, "ssh_bin"),
            (&self.sshpass_bin, "sshpass_bin"),
            (&self.maven_bin, "maven_bin"),
            (&self.npm_bin, "npm_bin"),
            (&self.zip_bin, "zip_bin"),
            (&self.unzip_bin, "unzip_bin"),
            (&self.profile_flag, "profile_flag"),
        ] {
            if value.trim().is_empty() {
                return Err(SettingsError::Missing {
                    field: field.to_owned(),
                });
            }
        }
        if self.connect_timeout_secs == 0 {
            return Err(SettingsError::Zero {
                field: String::from("connect_timeout_secs"),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(SettingsError::Zero {
                field: String::from("poll_interval_ms"),
            });
        }
        if self.max_parallel == Some(0) {
            return Err(SettingsError::Zero {
                field: String::from("max_parallel"),
            });
        }
        Ok(())
    }

    /// Process lifecycle timings derived from these settings.
    #[must_use]
    pub const fn process_timing(&self) -> ProcessTiming {
        ProcessTiming {
            launch_settle: Duration::from_millis(self.launch_settle_ms),
            verify_timeout: Duration::from_millis(self.launch_verify_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            terminate_timeout: Duration::from_millis(self.terminate_timeout_ms),
        }
    }

    /// Maven arguments split on whitespace.
    #[must_use]
    pub fn maven_goals(&self) -> Vec<String> {
        self.maven_args
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }
}

/// Timings that govern supersede and launch verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessTiming {
    /// Grace period after issuing the launch command.
    pub launch_settle: Duration,
    /// Ceiling on post-launch polling, measured from the launch command.
    pub verify_timeout: Duration,
    /// Interval between process-table polls.
    pub poll_interval: Duration,
    /// How long a superseded process may take to exit.
    pub terminate_timeout: Duration,
}

impl ProcessTiming {
    /// Timings with no waiting, used by tests.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            launch_settle: Duration::ZERO,
            verify_timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            terminate_timeout: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[test]
    fn defaults_validate() {
        assert_eq!(Settings::default().validate(), Ok(()));
    }

    #[rstest]
    #[case("ssh_bin")]
    #[case("zip_bin")]
    #[case("profile_flag")]
    fn validate_rejects_blank_binaries(#[case] field: &str) {
        let mut settings = Settings::default();
        match field {
            "ssh_bin" => settings.ssh_bin = String::from("  "),
            "zip_bin" => settings.zip_bin = String::new(),
            _ => settings.profile_flag = String::new(),
        }

        let err = settings.validate().expect_err("blank value should fail");
        assert_eq!(
            err,
            SettingsError::Missing {
                field: field.to_owned()
            }
        );
        assert!(err.to_string().contains(&format!("FERRY_{}", field.to_uppercase())));
    }

    #[test]
    fn validate_rejects_zero_parallelism() {
        let settings = Settings {
            max_parallel: Some(0),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Zero { ref field }) if field == "max_parallel"
        ));
    }

    #[test]
    fn process_timing_converts_milliseconds() {
        let timing = Settings::default().process_timing();
        assert_eq!(timing.launch_settle, Duration::from_secs(2));
        assert_eq!(timing.verify_timeout, Duration::from_secs(10));
        assert_eq!(timing.poll_interval, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn environment_variables_override_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("FERRY_SSH_BIN", "/usr/local/bin/ssh"),
            ("FERRY_PROFILE_FLAG", "--profile"),
        ])
        .await;

        let settings = Settings::load_without_cli_args()
            .expect("settings should load with env overrides");

        assert_eq!(settings.ssh_bin, "/usr/local/bin/ssh");
        assert_eq!(settings.profile_flag, "--profile");
        assert_eq!(settings.zip_bin, "zip", "unset values keep their defaults");
    }

    #[test]
    fn maven_goals_split_on_whitespace() {
        let settings = Settings {
            maven_args: String::from(" clean  package -DskipTests "),
            ..Settings::default()
        };
        assert_eq!(settings.maven_goals(), ["clean", "package", "-DskipTests"]);
    }
}
