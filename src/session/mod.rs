//! Authenticated remote-shell sessions.
//!
//! A session is opened per deployment unit and owned by that unit alone.
//! Each [`RemoteSession::run`] call executes in a fresh remote shell, so
//! multi-step actions must be chained into one self-contained command string.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::debug;

mod ssh;

pub use ssh::{SshChannel, SshSession, SshSessionProvider};

/// How to authenticate against a remote host.
#[derive(Clone, Eq, PartialEq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Public key authentication with a private key file.
    IdentityFile(Utf8PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// Connection details for one remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshEndpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port for SSH.
    pub port: u16,
    /// Remote user to connect as.
    pub username: String,
    /// Authentication material.
    pub credential: Credential,
}

impl SshEndpoint {
    /// `user@host` destination string.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Output of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote command, if any.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Standard output followed by standard error.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);
        combined
    }

    /// Human readable representation of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised by sessions and channels.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when authentication or the network connection fails.
    #[error("failed to connect to {destination}: {message}")]
    Connect {
        /// `user@host:port` that was dialled.
        destination: String,
        /// Diagnostic output from the transport.
        message: String,
    },
    /// Raised when the local transport process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when reading from or writing to a channel fails.
    #[error("session I/O failed: {0}")]
    Io(String),
    /// Raised by [`run_checked`] when a command exits non-zero.
    #[error("remote command `{command}` exited with status {status}: {output}")]
    CommandFailed {
        /// Command that was executed.
        command: String,
        /// Human readable exit status.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },
    /// Raised when releasing the connection fails.
    #[error("failed to close session: {0}")]
    Close(String),
}

/// Future returned by session operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// A raw byte channel attached to one running remote command.
///
/// Bytes written to the channel arrive on the command's standard input.
pub trait DataChannel: AsyncWrite + Send + Unpin {
    /// Closes the input side and waits for the remote command to exit.
    fn finish(self) -> SessionFuture<'static, RemoteCommandOutput>;
}

/// A live connection to one host.
pub trait RemoteSession: Send + Sync {
    /// Channel type returned by [`RemoteSession::open_channel`].
    type Channel: DataChannel;

    /// Runs one self-contained command and captures its output. A non-zero
    /// exit status is reported in the output, not as an error.
    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, RemoteCommandOutput>;

    /// Starts `command` with a writable standard input.
    fn open_channel<'a>(&'a self, command: &'a str) -> SessionFuture<'a, Self::Channel>;

    /// Releases the connection. Calling it more than once is harmless.
    fn close(&mut self) -> SessionFuture<'_, ()>;
}

/// Opens sessions for deployment units.
pub trait SessionProvider: Send + Sync {
    /// Session type produced by this provider.
    type Session: RemoteSession + 'static;

    /// Connects and authenticates against `endpoint`.
    fn open<'a>(&'a self, endpoint: &'a SshEndpoint) -> SessionFuture<'a, Self::Session>;
}

/// Runs `command` and returns its combined output, treating a non-zero exit
/// status as [`SessionError::CommandFailed`].
///
/// # Errors
///
/// Returns transport errors from the session or
/// [`SessionError::CommandFailed`] carrying the combined output.
pub async fn run_checked<S: RemoteSession + ?Sized>(
    session: &S,
    command: &str,
) -> Result<String, SessionError> {
    debug!(command, "running remote command");
    let output = session.run(command).await?;
    if output.is_success() {
        return Ok(output.combined());
    }
    Err(SessionError::CommandFailed {
        command: command.to_owned(),
        status: output.status_text(),
        output: output.combined(),
    })
}
