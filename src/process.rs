//! Local command execution used by the build and packaging steps.
//!
//! Remote work goes through [`crate::session`]; this module only covers
//! commands that run on the operator's machine, such as `mvn`, `npm` and
//! `zip`.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8Path;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable representation of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Raised when a local command cannot be started.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to spawn {program}: {message}")]
pub struct SpawnError {
    /// Command that failed to start.
    pub program: String,
    /// Operating system error string.
    pub message: String,
}

/// Future returned by [`CommandRunner`] implementations.
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, SpawnError>> + Send + 'a>>;

/// Abstraction over local command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` inside `dir`, capturing stdout and stderr.
    fn run_in<'a>(
        &'a self,
        dir: &'a Utf8Path,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run_in<'a>(
        &'a self,
        dir: &'a Utf8Path,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .current_dir(dir)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| SpawnError {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Command runner that forwards child output to this process's stdout and
/// stderr line by line while also capturing it.
#[derive(Clone, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run_in<'a>(
        &'a self,
        dir: &'a Utf8Path,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let spawn_err = |err: io::Error| SpawnError {
                program: program.to_owned(),
                message: err.to_string(),
            };
            let mut child = Command::new(program)
                .args(args)
                .current_dir(dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_err)?;

            let (stdout, stderr) = tokio::join!(
                forward_lines(child.stdout.take(), tokio::io::stdout()),
                forward_lines(child.stderr.take(), tokio::io::stderr()),
            );
            let status = child.wait().await.map_err(spawn_err)?;

            Ok(CommandOutput {
                code: status.code(),
                stdout,
                stderr,
            })
        })
    }
}

/// Copies `source` into `sink` one line at a time and returns everything
/// read. A failing sink stops forwarding but not capturing.
async fn forward_lines<R, W>(source: Option<R>, mut sink: W) -> String
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(reader) = source else {
        return String::new();
    };
    let mut buffered = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    let mut forwarding = true;
    loop {
        line.clear();
        match buffered.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if forwarding {
                    forwarding = sink.write_all(&line).await.is_ok();
                }
                captured.extend_from_slice(&line);
            }
        }
    }
    sink.flush().await.ok();
    String::from_utf8_lossy(&captured).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, camino::Utf8PathBuf) {
        let tmp = TempDir::new().expect("temp dir");
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        (tmp, root)
    }

    #[rstest]
    #[case("printf out && printf err 1>&2", Some(0), "out", "err")]
    #[case("printf out && printf err 1>&2; exit 42", Some(42), "out", "err")]
    #[case("", Some(0), "", "")]
    #[tokio::test]
    async fn process_runner_captures_output(
        #[case] script: &str,
        #[case] expected_code: Option<i32>,
        #[case] expected_stdout: &str,
        #[case] expected_stderr: &str,
    ) {
        let (_tmp, root) = temp_root();
        let output = ProcessCommandRunner
            .run_in(&root, "sh", &[OsString::from("-c"), OsString::from(script)])
            .await
            .expect("command should execute");

        assert_eq!(output.code, expected_code);
        assert_eq!(output.stdout, expected_stdout);
        assert_eq!(output.stderr, expected_stderr);
    }

    #[tokio::test]
    async fn process_runner_uses_working_directory() {
        let (_tmp, root) = temp_root();
        let output = ProcessCommandRunner
            .run_in(&root, "pwd", &[])
            .await
            .expect("pwd should run");

        let reported = output.stdout.trim();
        let canonical = std::fs::canonicalize(&root).expect("canonical root");
        assert_eq!(std::path::Path::new(reported), canonical.as_path());
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failures() {
        let (_tmp, root) = temp_root();
        let err = ProcessCommandRunner
            .run_in(&root, "definitely-not-a-real-binary-xyz", &[])
            .await
            .expect_err("spawn should fail");

        assert_eq!(err.program, "definitely-not-a-real-binary-xyz");
    }

    #[rstest]
    #[case("printf out && printf err 1>&2", Some(0), "out", "err")]
    #[case("printf out && printf err 1>&2; exit 42", Some(42), "out", "err")]
    #[case("exit 7", Some(7), "", "")]
    #[tokio::test]
    async fn streaming_runner_captures_output(
        #[case] script: &str,
        #[case] expected_code: Option<i32>,
        #[case] expected_stdout: &str,
        #[case] expected_stderr: &str,
    ) {
        let (_tmp, root) = temp_root();
        let output = StreamingCommandRunner
            .run_in(&root, "sh", &[OsString::from("-c"), OsString::from(script)])
            .await
            .expect("command should execute");

        assert_eq!(output.code, expected_code);
        assert_eq!(output.stdout, expected_stdout);
        assert_eq!(output.stderr, expected_stderr);
    }

    #[tokio::test]
    async fn streaming_runner_keeps_large_interleaved_output() {
        let (_tmp, root) = temp_root();
        let script = "for i in $(seq 1 50); do printf \"out-%03d\\n\" $i; \
                      printf \"err-%03d\\n\" $i 1>&2; done";
        let output = StreamingCommandRunner
            .run_in(&root, "sh", &[OsString::from("-c"), OsString::from(script)])
            .await
            .expect("command should execute");

        let expected_out: String = (1..=50).map(|i| format!("out-{i:03}\n")).collect();
        let expected_err: String = (1..=50).map(|i| format!("err-{i:03}\n")).collect();
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout, expected_out);
        assert_eq!(output.stderr, expected_err);
    }

    #[tokio::test]
    async fn streaming_runner_reports_spawn_failures() {
        let (_tmp, root) = temp_root();
        let err = StreamingCommandRunner
            .run_in(&root, "definitely-not-a-real-binary-xyz", &[])
            .await
            .expect_err("spawn should fail");

        assert_eq!(err.program, "definitely-not-a-real-binary-xyz");
    }

    #[tokio::test]
    async fn forwarded_lines_reach_the_sink_and_the_capture() {
        let source: &[u8] = b"[INFO] Building orders\n[ERROR] cannot find symbol\npartial";
        let mut sink = Vec::new();

        let captured = forward_lines(Some(source), &mut sink).await;

        assert_eq!(captured, "[INFO] Building orders\n[ERROR] cannot find symbol\npartial");
        assert_eq!(sink, source);
    }

    #[test]
    fn status_text_handles_missing_code() {
        let output = CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.status_text(), "unknown");
        assert!(!output.is_success());
    }
}
