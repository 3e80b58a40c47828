//! Single-file upload using the `scp` sink protocol.
//!
//! The remote side runs `scp -t <dest>` and reads one control line
//! (`C<mode> <length> <name>`), exactly `length` payload bytes and a NUL
//! terminator from standard input. The receiver trusts the declared length,
//! so the file is streamed through a reader capped at that length and the
//! terminator is only sent once the full count has been copied.

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::session::{DataChannel, RemoteSession, SessionError, run_checked};

/// Permission bits sent for uploaded files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Errors raised while uploading a file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when the local file cannot be inspected.
    #[error("failed to stat {path}: {message}")]
    Stat {
        /// Local path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the local path is not a regular file.
    #[error("{0} is not a regular file")]
    NotAFile(String),
    /// Raised when the local file cannot be read.
    #[error("failed to read {path}: {message}")]
    Open {
        /// Local path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the remote parent directory cannot be created.
    #[error("failed to create remote directory {dir}: {source}")]
    RemoteMkdir {
        /// Remote directory.
        dir: String,
        /// Underlying session error.
        #[source]
        source: SessionError,
    },
    /// Raised when the bytes read differ from the size reported by `stat`.
    #[error("{path} changed during upload: declared {declared} bytes, read {actual}")]
    LengthMismatch {
        /// Local path.
        path: String,
        /// Length taken from file metadata.
        declared: u64,
        /// Length actually read.
        actual: u64,
    },
    /// Raised when the remote file name cannot be carried in a header line.
    #[error("remote path {0} has no usable file name")]
    InvalidName(String),
    /// Raised when the receiver cannot be started or rejects the upload.
    #[error("scp receiver for {remote} failed: {message}")]
    Protocol {
        /// Remote destination.
        remote: String,
        /// Diagnostic output.
        message: String,
    },
    /// Raised when streaming bytes to the receiver fails.
    #[error("failed to stream {remote}: {message}")]
    Io {
        /// Remote destination.
        remote: String,
        /// Operating system error string.
        message: String,
    },
}

/// Control line fields announcing one file to the receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CopyHeader {
    mode: u32,
    name: String,
    len: u64,
}

impl CopyHeader {
    /// Builds the header for a `len`-byte upload to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidName`] when `remote` has no file name
    /// that fits on a control line.
    pub fn new(remote: &str, len: u64) -> Result<Self, TransferError> {
        let name = remote_file_name(remote)
            .ok_or_else(|| TransferError::InvalidName(remote.to_owned()))?;
        Ok(Self {
            mode: DEFAULT_FILE_MODE,
            name: name.to_owned(),
            len,
        })
    }

    /// Control line sent ahead of the payload.
    #[must_use]
    pub fn line(&self) -> String {
        format!("C{:04o} {} {}\n", self.mode, self.len, self.name)
    }

    /// Declared payload length in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for an empty file.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Base name of a remote path, if it can be sent in a control line.
#[must_use]
pub fn remote_file_name(remote: &str) -> Option<&str> {
    let name = remote.rsplit('/').next()?;
    let usable = !name.is_empty() && name != "." && name != ".." && !name.contains(['\n', '\r']);
    usable.then_some(name)
}

/// Parent directory of a remote path when it needs creating first.
///
/// Returns `None` for bare names and for files directly under `/`.
#[must_use]
pub fn remote_parent(remote: &str) -> Option<&str> {
    let (parent, _) = remote.rsplit_once('/')?;
    let trivial = parent.is_empty() || parent == "." || parent == "/";
    (!trivial).then_some(parent)
}

/// Remote command that creates `dir` and its parents.
#[must_use]
pub fn mkdir_command(dir: &str) -> String {
    format!("mkdir -p {}", escape(dir.into()))
}

/// Remote command that starts the `scp` sink for `remote`.
#[must_use]
pub fn receiver_command(remote: &str) -> String {
    format!("scp -t {}", escape(remote.into()))
}

/// Uploads `local` to `remote` over `session`, returning the bytes sent.
///
/// Any failure leaves the remote file in an undefined state; retrying means
/// calling this function again from the start.
///
/// # Errors
///
/// Returns [`TransferError`] describing the failing step.
pub async fn transfer<S: RemoteSession + ?Sized>(
    session: &S,
    local: &Utf8Path,
    remote: &str,
) -> Result<u64, TransferError> {
    let metadata = tokio::fs::metadata(local)
        .await
        .map_err(|err| TransferError::Stat {
            path: local.to_string(),
            message: err.to_string(),
        })?;
    if !metadata.is_file() {
        return Err(TransferError::NotAFile(local.to_string()));
    }
    info!(
        local = %local,
        remote,
        size_mb = %format_megabytes(metadata.len()),
        "uploading file"
    );

    if let Some(dir) = remote_parent(remote) {
        run_checked(session, &mkdir_command(dir))
            .await
            .map_err(|source| TransferError::RemoteMkdir {
                dir: dir.to_owned(),
                source,
            })?;
    }

    let header = CopyHeader::new(remote, metadata.len())?;
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|err| TransferError::Open {
            path: local.to_string(),
            message: err.to_string(),
        })?;

    let sent = send(session, &header, file, local.as_str(), remote).await?;
    info!(local = %local, remote, bytes = sent, "upload complete");
    Ok(sent)
}

/// Streams `source` to the receiver for `remote`.
///
/// At most the declared length is read. When the source yields fewer bytes
/// the channel is dropped before the terminator, so the receiver never
/// accepts a short file.
async fn send<S, R>(
    session: &S,
    header: &CopyHeader,
    source: R,
    local: &str,
    remote: &str,
) -> Result<u64, TransferError>
where
    S: RemoteSession + ?Sized,
    R: AsyncRead + Unpin,
{
    let command = receiver_command(remote);
    debug!(command = %command, "starting scp receiver");
    let protocol_err = |message: String| TransferError::Protocol {
        remote: remote.to_owned(),
        message,
    };
    let io_err = |err: std::io::Error| TransferError::Io {
        remote: remote.to_owned(),
        message: err.to_string(),
    };

    let mut channel = session
        .open_channel(&command)
        .await
        .map_err(|err| protocol_err(err.to_string()))?;
    channel
        .write_all(header.line().as_bytes())
        .await
        .map_err(io_err)?;
    let mut limited = source.take(header.len());
    let copied = tokio::io::copy(&mut limited, &mut channel)
        .await
        .map_err(io_err)?;
    if copied != header.len() {
        drop(channel);
        return Err(TransferError::LengthMismatch {
            path: local.to_owned(),
            declared: header.len(),
            actual: copied,
        });
    }
    channel.write_all(&[0]).await.map_err(io_err)?;
    channel.flush().await.map_err(io_err)?;

    let output = channel
        .finish()
        .await
        .map_err(|err| protocol_err(err.to_string()))?;
    if output.is_success() {
        return Ok(copied);
    }
    Err(protocol_err(format!(
        "exited with status {}: {}",
        output.status_text(),
        output.combined().trim()
    )))
}

/// Formats a byte count as megabytes with two decimals, using integer maths.
#[must_use]
pub fn format_megabytes(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    let hundredths = bytes.saturating_mul(100).checked_div(MIB).unwrap_or_default();
    let whole = hundredths.checked_div(100).unwrap_or_default();
    let fraction = hundredths.checked_rem(100).unwrap_or_default();
    format!("{whole}.{fraction:02}")
}
