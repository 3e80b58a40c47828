//! Remote process lifecycle: find, terminate, launch and verify artifacts.
//!
//! Processes are identified by searching the remote process table for the
//! artifact's remote path. A path that appears in an unrelated command line
//! will match too; there is no pid file to narrow the search.

use std::time::Instant;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::session::{RemoteSession, SessionError};
use crate::settings::ProcessTiming;

/// Errors raised while managing remote processes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when the process table cannot be queried.
    #[error("failed to look up processes for {path}: {source}")]
    Lookup {
        /// Remote artifact path.
        path: String,
        /// Underlying session error.
        #[source]
        source: SessionError,
    },
    /// Raised when the termination signal fails for a reason other than the
    /// process being gone already.
    #[error("failed to terminate processes for {path}: {message}")]
    Kill {
        /// Remote artifact path.
        path: String,
        /// Combined output of the kill command.
        message: String,
    },
    /// Raised when terminated processes outlive the termination timeout.
    #[error("processes {pids:?} for {path} are still running")]
    StillRunning {
        /// Remote artifact path.
        path: String,
        /// Identifiers that were still present.
        pids: Vec<u32>,
    },
    /// Raised when the launch command itself fails.
    #[error("failed to launch {path}: {message}")]
    Launch {
        /// Remote artifact path.
        path: String,
        /// Combined output or transport error.
        message: String,
    },
    /// Raised when no process is found after launching.
    #[error("{path} is not running after launch")]
    Verify {
        /// Remote artifact path.
        path: String,
    },
}

/// Result of [`ProcessManager::supersede`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SupersedeOutcome {
    /// Nothing was running for the artifact.
    NoMatch,
    /// These processes were signalled and have exited.
    Terminated(Vec<u32>),
}

/// What to start on the remote host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaunchSpec<'a> {
    /// Remote artifact path.
    pub artifact_path: &'a str,
    /// Java runtime on the remote host.
    pub runtime_path: &'a str,
    /// Flag that carries the environment name, such as
    /// `--spring.profiles.active`.
    pub profile_flag: &'a str,
    /// Environment name passed as the activation profile.
    pub environment: &'a str,
}

/// Remote command listing the pids whose command line contains `path`.
#[must_use]
pub fn lookup_command(path: &str) -> String {
    format!(
        "ps -ef | grep -F -- {} | grep -v grep | awk '{{print $2}}'",
        escape(path.into())
    )
}

/// Remote command sending the default termination signal to `pids`.
#[must_use]
pub fn kill_command(pids: &[u32]) -> String {
    let list: Vec<String> = pids.iter().map(u32::to_string).collect();
    format!("kill {}", list.join(" "))
}

/// Remote command that starts the artifact detached, discarding its output.
#[must_use]
pub fn launch_command(spec: &LaunchSpec<'_>) -> String {
    let profile = format!("{}={}", spec.profile_flag, spec.environment);
    format!(
        "nohup {} -jar {} {} > /dev/null 2>&1 < /dev/null &",
        escape(spec.runtime_path.into()),
        escape(spec.artifact_path.into()),
        escape(profile.into())
    )
}

/// Extracts process identifiers from lookup output, ignoring anything that is
/// not a number.
#[must_use]
pub fn parse_pids(stdout: &str) -> Vec<u32> {
    stdout
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn is_absent_process(output: &str) -> bool {
    output.to_lowercase().contains("no such process")
}

/// Drives process termination and launch over one session.
#[derive(Debug)]
pub struct ProcessManager<'a, S: ?Sized> {
    session: &'a S,
    timing: ProcessTiming,
}

impl<'a, S: RemoteSession + ?Sized> ProcessManager<'a, S> {
    /// Creates a manager bound to `session`.
    #[must_use]
    pub const fn new(session: &'a S, timing: ProcessTiming) -> Self {
        Self { session, timing }
    }

    /// Returns the pids currently running `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Lookup`] when the query cannot run.
    pub async fn lookup(&self, path: &str) -> Result<Vec<u32>, LifecycleError> {
        let command = lookup_command(path);
        debug!(command = %command, "running remote command");
        let lookup_err = |source| LifecycleError::Lookup {
            path: path.to_owned(),
            source,
        };
        let output = self.session.run(&command).await.map_err(lookup_err)?;
        if !output.is_success() {
            return Err(lookup_err(SessionError::CommandFailed {
                command,
                status: output.status_text(),
                output: output.combined(),
            }));
        }
        Ok(parse_pids(&output.stdout))
    }

    /// Terminates any running instance of `path` and waits for it to exit.
    ///
    /// A missing process counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or kill fails, or when the
    /// processes are still present after the termination timeout.
    pub async fn supersede(&self, path: &str) -> Result<SupersedeOutcome, LifecycleError> {
        let pids = self.lookup(path).await?;
        if pids.is_empty() {
            info!(path, "no matching process");
            return Ok(SupersedeOutcome::NoMatch);
        }

        let command = kill_command(&pids);
        debug!(command = %command, "running remote command");
        let output = self
            .session
            .run(&command)
            .await
            .map_err(|err| LifecycleError::Kill {
                path: path.to_owned(),
                message: err.to_string(),
            })?;
        if !output.is_success() {
            let message = output.combined();
            if !is_absent_process(&message) {
                return Err(LifecycleError::Kill {
                    path: path.to_owned(),
                    message: message.trim().to_owned(),
                });
            }
            debug!(path, "process exited before it was signalled");
        }

        let deadline = Instant::now() + self.timing.terminate_timeout;
        loop {
            let remaining = self.lookup(path).await?;
            if remaining.is_empty() {
                info!(path, pids = ?pids, "terminated previous instance");
                return Ok(SupersedeOutcome::Terminated(pids));
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::StillRunning {
                    path: path.to_owned(),
                    pids: remaining,
                });
            }
            sleep(self.timing.poll_interval).await;
        }
    }

    /// Starts the artifact and polls until it shows up in the process table.
    ///
    /// The first check happens after the settle interval; polling stops once
    /// the verify timeout, measured from the launch command, has passed. Pids
    /// already running `path` before the launch never count as the new
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Launch`] when the command fails and
    /// [`LifecycleError::Verify`] when no process appears in time.
    pub async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<u32, LifecycleError> {
        let path = spec.artifact_path;
        let launch_err = |message: String| LifecycleError::Launch {
            path: path.to_owned(),
            message,
        };
        let previous = self.lookup(path).await?;
        if !previous.is_empty() {
            warn!(path, pids = ?previous, "previous instance still running; ignoring it");
        }
        let command = launch_command(spec);
        debug!(command = %command, "running remote command");
        let started = Instant::now();
        let output = self
            .session
            .run(&command)
            .await
            .map_err(|err| launch_err(err.to_string()))?;
        if !output.is_success() {
            return Err(launch_err(format!(
                "exited with status {}: {}",
                output.status_text(),
                output.combined().trim()
            )));
        }

        sleep(self.timing.launch_settle).await;
        let deadline = started + self.timing.verify_timeout;
        loop {
            let current = self.lookup(path).await?;
            if let Some(pid) = current.into_iter().find(|pid| !previous.contains(pid)) {
                info!(path, pid, "launch verified");
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::Verify {
                    path: path.to_owned(),
                });
            }
            sleep(self.timing.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::SessionProvider;
    use crate::test_support::{FakeHost, FakeSessionProvider, endpoint_for};
    use rstest::rstest;

    const JAR: &str = "/opt/apps/admin.jar";

    fn spec() -> LaunchSpec<'static> {
        LaunchSpec {
            artifact_path: JAR,
            runtime_path: "/opt/java/bin/java",
            profile_flag: "--spring.profiles.active",
            environment: "dev",
        }
    }

    #[test]
    fn launch_command_detaches_and_tags_profile() {
        assert_eq!(
            launch_command(&spec()),
            "nohup /opt/java/bin/java -jar /opt/apps/admin.jar \
             --spring.profiles.active=dev > /dev/null 2>&1 < /dev/null &"
        );
    }

    #[test]
    fn lookup_command_escapes_path_and_excludes_itself() {
        assert_eq!(
            lookup_command("/opt/my apps/a.jar"),
            "ps -ef | grep -F -- '/opt/my apps/a.jar' | grep -v grep | awk '{print $2}'"
        );
    }

    #[rstest]
    #[case("", &[])]
    #[case("  \n", &[])]
    #[case("1234\n", &[1234])]
    #[case("12\n34\n", &[12, 34])]
    #[case("warning\n56\n", &[56])]
    fn parse_pids_reads_numeric_tokens(#[case] stdout: &str, #[case] expected: &[u32]) {
        assert_eq!(parse_pids(stdout), expected);
    }

    #[rstest]
    #[case("kill: (42) - No such process", true)]
    #[case("bash: kill: (42) - no such process", true)]
    #[case("kill: (42) - Operation not permitted", false)]
    fn absent_process_detection(#[case] output: &str, #[case] expected: bool) {
        assert_eq!(is_absent_process(output), expected);
    }

    #[tokio::test]
    async fn supersede_without_process_is_a_no_op() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let outcome = manager.supersede(JAR).await.expect("supersede");

        assert_eq!(outcome, SupersedeOutcome::NoMatch);
        assert!(
            !host.commands().iter().any(|cmd| cmd.starts_with("kill")),
            "no kill should be sent"
        );
    }

    #[tokio::test]
    async fn supersede_terminates_running_instance() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let pid = host.start_process(JAR);
        let other = host.start_process("/opt/apps/client.jar");
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let outcome = manager.supersede(JAR).await.expect("supersede");

        assert_eq!(outcome, SupersedeOutcome::Terminated(vec![pid]));
        assert_eq!(manager.lookup(JAR).await.expect("lookup"), Vec::<u32>::new());
        assert_eq!(host.running(), vec![(other, String::from("/opt/apps/client.jar"))]);
    }

    #[tokio::test]
    async fn supersede_treats_vanished_process_as_success() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let pid = host.start_process(JAR);
        host.vanish_on_kill();
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let outcome = manager.supersede(JAR).await.expect("absent process is success");

        assert_eq!(outcome, SupersedeOutcome::Terminated(vec![pid]));
    }

    #[tokio::test]
    async fn supersede_reports_processes_that_ignore_the_signal() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let pid = host.start_process(JAR);
        host.ignore_kill();
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let err = manager.supersede(JAR).await.expect_err("process outlives timeout");

        assert_eq!(
            err,
            LifecycleError::StillRunning {
                path: String::from(JAR),
                pids: vec![pid],
            }
        );
    }

    #[tokio::test]
    async fn supersede_surfaces_other_kill_failures() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let _pid = host.start_process(JAR);
        host.deny_kill("kill: (1) - Operation not permitted");
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let err = manager.supersede(JAR).await.expect_err("kill should fail");

        assert!(
            matches!(err, LifecycleError::Kill { ref message, .. } if message.contains("not permitted")),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn launch_returns_discovered_pid() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let pid = manager.launch(&spec()).await.expect("launch");

        assert_eq!(host.running(), vec![(pid, String::from(JAR))]);
    }

    #[tokio::test]
    async fn launch_fails_verification_when_process_dies() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        host.crash_on_launch();
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let err = manager.launch(&spec()).await.expect_err("verify should fail");

        assert_eq!(
            err,
            LifecycleError::Verify {
                path: String::from(JAR)
            }
        );
    }
    const fn polling(timeout: Duration) -> ProcessTiming {
        ProcessTiming {
            launch_settle: Duration::ZERO,
            verify_timeout: timeout,
            poll_interval: Duration::from_millis(1),
            terminate_timeout: timeout,
        }
    }

    fn lookups(host: &FakeHost) -> usize {
        host.commands()
            .iter()
            .filter(|cmd| cmd.starts_with("ps -ef"))
            .count()
    }

    #[tokio::test]
    async fn launch_keeps_polling_until_the_process_appears() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        host.delay_launch(3);
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, polling(Duration::from_secs(5)));

        let pid = manager.launch(&spec()).await.expect("launch");

        assert_eq!(host.running(), vec![(pid, String::from(JAR))]);
        // one lookup before the launch, three empty polls, then the hit
        assert_eq!(lookups(&host), 5);
    }

    #[tokio::test]
    async fn launch_gives_up_when_the_process_appears_too_late() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        host.delay_launch(u32::MAX);
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, polling(Duration::from_millis(20)));

        let err = manager.launch(&spec()).await.expect_err("verify should time out");

        assert_eq!(
            err,
            LifecycleError::Verify {
                path: String::from(JAR)
            }
        );
        assert!(lookups(&host) > 2, "expected repeated polls");
    }

    #[tokio::test]
    async fn launch_ignores_an_instance_that_outlived_supersede() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let stale = host.start_process(JAR);
        host.crash_on_launch();
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let err = manager.launch(&spec()).await.expect_err("stale pid is not the new one");

        assert_eq!(
            err,
            LifecycleError::Verify {
                path: String::from(JAR)
            }
        );
        assert_eq!(host.running(), vec![(stale, String::from(JAR))]);
    }

    #[tokio::test]
    async fn launch_returns_the_new_pid_next_to_a_stale_one() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let stale = host.start_process(JAR);
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, ProcessTiming::immediate());

        let pid = manager.launch(&spec()).await.expect("launch");

        assert_ne!(pid, stale);
        assert_eq!(manager.lookup(JAR).await.expect("lookup"), vec![stale, pid]);
    }

    #[tokio::test]
    async fn supersede_waits_for_a_slow_exit() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let pid = host.start_process(JAR);
        host.linger_on_kill(3);
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, polling(Duration::from_secs(5)));

        let outcome = manager.supersede(JAR).await.expect("supersede");

        assert_eq!(outcome, SupersedeOutcome::Terminated(vec![pid]));
        assert!(host.running().is_empty());
        // initial lookup, three polls that still see the pid, then the empty one
        assert_eq!(lookups(&host), 5);
    }

    #[tokio::test]
    async fn supersede_gives_up_when_the_exit_outlasts_the_timeout() {
        let provider = FakeSessionProvider::new();
        let host = provider.add_host("app-1");
        let pid = host.start_process(JAR);
        host.linger_on_kill(u32::MAX);
        let session = provider.open(&endpoint_for("app-1")).await.expect("open");
        let manager = ProcessManager::new(&session, polling(Duration::from_millis(20)));

        let err = manager.supersede(JAR).await.expect_err("exit is too slow");

        assert_eq!(
            err,
            LifecycleError::StillRunning {
                path: String::from(JAR),
                pids: vec![pid],
            }
        );
        assert!(lookups(&host) > 2, "expected repeated polls");
    }
}
