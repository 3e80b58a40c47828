//! Binary entry point for the ferry CLI.

use std::io::{self, Write};
use std::process;
use std::time::{Duration, Instant};

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferry::{
    ConfigError, DeployError, DeployOrchestrator, DeployRequest, LocalToolchain, Settings,
    SettingsError, SshSessionProvider, StreamingCommandRunner, TargetOverrides, write_sample,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server deployment failed: {0}")]
    Server(#[source] DeployError),
    #[error("web deployment failed: {0}")]
    Bundle(#[source] DeployError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(errors) => {
            for err in &errors {
                report_error(err);
            }
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), Vec<CliError>> {
    if cli.init_config {
        write_sample(&cli.config, cli.force).map_err(|err| vec![CliError::from(err)])?;
        info!(path = %cli.config, "sample deployment file written");
        return Ok(());
    }

    let servers = listed(&cli.env);
    let bundles = listed(&cli.web);
    if servers.is_empty() && bundles.is_empty() {
        warn!("nothing to deploy: pass --env for server artifacts or --web for the web bundle");
        return Ok(());
    }

    let settings = Settings::load_without_cli_args().map_err(|err| vec![CliError::from(err)])?;
    let orchestrator = DeployOrchestrator::new(
        SshSessionProvider::new(&settings),
        LocalToolchain::new(StreamingCommandRunner, &settings),
        &settings,
    );
    let overrides = TargetOverrides {
        server: cli.server,
        username: cli.username,
        password: cli.password,
        java_path: cli.java_path,
        remote_base_path: cli.remote_base_path,
    };
    let modules = listed(&cli.modules);
    let server_request = DeployRequest {
        project_dir: &cli.project_dir,
        config_path: &cli.config,
        environments: &servers,
        modules: &modules,
        overrides: &overrides,
    };
    let bundle_request = DeployRequest {
        environments: &bundles,
        ..server_request
    };

    let started = Instant::now();
    let mut errors = Vec::new();
    if !servers.is_empty()
        && let Err(err) = orchestrator.deploy_servers(&server_request).await
    {
        errors.push(CliError::Server(err));
    }
    if !bundles.is_empty()
        && let Err(err) = orchestrator.deploy_bundles(&bundle_request).await
    {
        errors.push(CliError::Bundle(err));
    }
    info!(
        elapsed = %format_elapsed(started.elapsed()),
        failed = !errors.is_empty(),
        "deployment run finished"
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Trims entries and drops empty ones, so `-e dev,` means just `dev`.
fn listed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect()
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total.checked_div(3_600).unwrap_or_default();
    let minutes = total
        .checked_rem(3_600)
        .and_then(|rest| rest.checked_div(60))
        .unwrap_or_default();
    let seconds = total.checked_rem(60).unwrap_or_default();
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;

    #[rstest]
    #[case(0, "00:00:00")]
    #[case(59, "00:00:59")]
    #[case(61, "00:01:01")]
    #[case(3_725, "01:02:05")]
    #[case(90_000, "25:00:00")]
    fn elapsed_time_is_formatted_as_clock(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(format_elapsed(Duration::from_secs(secs)), expected);
    }

    #[test]
    fn listed_drops_blank_entries() {
        let values = vec![String::from(" dev"), String::new(), String::from("prod ")];
        assert_eq!(listed(&values), ["dev", "prod"]);
    }

    #[test]
    fn write_error_prints_message_line() {
        let mut buffer = Vec::new();
        write_error(
            &mut buffer,
            &CliError::Settings(SettingsError::Zero {
                field: String::from("max_parallel"),
            }),
        );
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text, "configuration error: max_parallel must be greater than zero\n");
    }

    #[test]
    fn cli_defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["ferry"]).expect("no arguments are required");
        assert_eq!(cli.config, Utf8PathBuf::from(ferry::DEFAULT_CONFIG_PATH));
        assert_eq!(cli.project_dir, Utf8PathBuf::from("."));
        assert!(cli.env.is_empty() && cli.web.is_empty());
    }
}
