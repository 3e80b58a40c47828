//! Session provider backed by the system `ssh` client.
//!
//! Opening a session starts an OpenSSH multiplexing master on a private
//! control socket; later commands and data channels ride on that socket so
//! authentication happens once per unit. Password credentials are handed to
//! `sshpass` through the `SSHPASS` environment variable and never appear on a
//! command line.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;
use uuid::Uuid;

use super::{
    Credential, DataChannel, RemoteCommandOutput, RemoteSession, SessionError, SessionFuture,
    SessionProvider, SshEndpoint,
};
use crate::settings::Settings;

/// How long an orphaned multiplexing master lingers before exiting on its own.
const CONTROL_PERSIST_SECS: u32 = 600;

#[derive(Clone, Debug, Eq, PartialEq)]
struct Transport {
    ssh_bin: String,
    sshpass_bin: String,
    connect_timeout_secs: u64,
}

/// Opens [`SshSession`]s using the system `ssh` binary.
#[derive(Clone, Debug)]
pub struct SshSessionProvider {
    transport: Transport,
    multiplex: bool,
}

impl SshSessionProvider {
    /// Builds a provider from tool settings.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            transport: Transport {
                ssh_bin: settings.ssh_bin.clone(),
                sshpass_bin: settings.sshpass_bin.clone(),
                connect_timeout_secs: settings.connect_timeout_secs,
            },
            multiplex: settings.ssh_multiplex,
        }
    }
}

impl SessionProvider for SshSessionProvider {
    type Session = SshSession;

    fn open<'a>(&'a self, endpoint: &'a SshEndpoint) -> SessionFuture<'a, Self::Session> {
        Box::pin(async move {
            let control_path = self
                .multiplex
                .then(|| std::env::temp_dir().join(format!("ferry-{}.sock", Uuid::new_v4().simple())));
            let mut session = SshSession {
                transport: self.transport.clone(),
                endpoint: endpoint.clone(),
                control_path,
                closed: true,
            };

            let args = session.connect_args();
            let output = session
                .transport
                .command(endpoint, args, true)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| session.transport.spawn_error(endpoint, &err))?;
            if !output.status.success() {
                return Err(SessionError::Connect {
                    destination: format!("{}:{}", endpoint.destination(), endpoint.port),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                });
            }
            // From here on the control master must be released.
            session.closed = false;
            debug!(destination = %endpoint.destination(), "ssh session established");
            Ok(session)
        })
    }
}

/// A connection to one host through the system `ssh` client.
#[derive(Debug)]
pub struct SshSession {
    transport: Transport,
    endpoint: SshEndpoint,
    control_path: Option<PathBuf>,
    closed: bool,
}

impl SshSession {
    fn connect_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(control) = &self.control_path {
            args.extend(control_options(control, "yes"));
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("ControlPersist={CONTROL_PERSIST_SECS}")));
        }
        args.extend(self.transport.common_options(&self.endpoint));
        args.push(OsString::from(self.endpoint.destination()));
        args.push(OsString::from("true"));
        args
    }

    fn exec_args(&self, command: &str) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(control) = &self.control_path {
            args.extend(control_options(control, "no"));
        }
        args.extend(self.transport.common_options(&self.endpoint));
        args.push(OsString::from(self.endpoint.destination()));
        args.push(OsString::from(command));
        args
    }

    fn exit_args(&self) -> Option<Vec<OsString>> {
        let control = self.control_path.as_ref()?;
        Some(vec![
            OsString::from("-S"),
            control.clone().into_os_string(),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(self.endpoint.destination()),
        ])
    }

    fn exec_command(&self, command: &str) -> Command {
        // Commands on a live control socket are already authenticated.
        let authenticate = self.control_path.is_none();
        self.transport
            .command(&self.endpoint, self.exec_args(command), authenticate)
    }
}

impl RemoteSession for SshSession {
    type Channel = SshChannel;

    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            let output = self
                .exec_command(command)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| self.transport.spawn_error(&self.endpoint, &err))?;
            Ok(RemoteCommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn open_channel<'a>(&'a self, command: &'a str) -> SessionFuture<'a, Self::Channel> {
        Box::pin(async move {
            let mut child = self
                .exec_command(command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| self.transport.spawn_error(&self.endpoint, &err))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SessionError::Io(String::from("channel has no standard input")))?;
            Ok(SshChannel {
                child,
                stdin: Some(stdin),
            })
        })
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            let Some(args) = self.exit_args() else {
                return Ok(());
            };
            let output = Command::new(&self.transport.ssh_bin)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| SessionError::Close(err.to_string()))?;
            if output.status.success() {
                Ok(())
            } else {
                Err(SessionError::Close(
                    String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                ))
            }
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(args) = self.exit_args() else {
            return;
        };
        // Drop can run on a runtime worker, so the blocking wait happens on
        // a detached thread.
        let ssh_bin = self.transport.ssh_bin.clone();
        let spawned = std::thread::Builder::new()
            .name(String::from("ferry-ssh-exit"))
            .spawn(move || {
                let result = std::process::Command::new(ssh_bin)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                if let Err(err) = result {
                    debug!(error = %err, "failed to release ssh control master on drop");
                }
            });
        if let Err(err) = spawned {
            debug!(error = %err, "failed to start ssh control master release");
        }
    }
}

/// Standard input of a remote command started by [`SshSession`].
#[derive(Debug)]
pub struct SshChannel {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl SshChannel {
    fn stdin(&mut self) -> io::Result<Pin<&mut ChildStdin>> {
        self.stdin
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel input closed"))
    }
}

impl AsyncWrite for SshChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stdin() {
            Ok(stdin) => stdin.poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin() {
            Ok(stdin) => stdin.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin() {
            Ok(stdin) => stdin.poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl DataChannel for SshChannel {
    fn finish(mut self) -> SessionFuture<'static, RemoteCommandOutput> {
        Box::pin(async move {
            drop(self.stdin.take());
            let output = self
                .child
                .wait_with_output()
                .await
                .map_err(|err| SessionError::Io(err.to_string()))?;
            Ok(RemoteCommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

impl Transport {
    fn common_options(&self, endpoint: &SshEndpoint) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(endpoint.port.to_string())];
        for option in [
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            String::from("ServerAliveInterval=15"),
            String::from("ServerAliveCountMax=3"),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }

        match &endpoint.credential {
            Credential::IdentityFile(path) => {
                args.push(OsString::from("-i"));
                args.push(OsString::from(expand_tilde(path.as_str())));
                args.push(OsString::from("-o"));
                args.push(OsString::from("BatchMode=yes"));
            }
            Credential::Password(_) => {
                args.push(OsString::from("-o"));
                args.push(OsString::from("NumberOfPasswordPrompts=1"));
            }
        }
        args
    }

    /// Wraps `ssh_args` with `sshpass` when the endpoint authenticates with a
    /// password and this invocation has to authenticate.
    fn command(&self, endpoint: &SshEndpoint, ssh_args: Vec<OsString>, authenticate: bool) -> Command {
        match &endpoint.credential {
            Credential::Password(password) if authenticate => {
                let mut command = Command::new(&self.sshpass_bin);
                command
                    .arg("-e")
                    .arg(&self.ssh_bin)
                    .args(ssh_args)
                    .env("SSHPASS", password);
                command
            }
            _ => {
                let mut command = Command::new(&self.ssh_bin);
                command.args(ssh_args);
                command
            }
        }
    }

    fn spawn_error(&self, endpoint: &SshEndpoint, err: &io::Error) -> SessionError {
        let program = match endpoint.credential {
            Credential::Password(_) => &self.sshpass_bin,
            Credential::IdentityFile(_) => &self.ssh_bin,
        };
        SessionError::Spawn {
            program: program.clone(),
            message: err.to_string(),
        }
    }
}

fn control_options(control: &std::path::Path, master: &str) -> [OsString; 4] {
    [
        OsString::from("-S"),
        control.as_os_str().to_owned(),
        OsString::from("-o"),
        OsString::from(format!("ControlMaster={master}")),
    ]
}

/// Expands a leading `~/` prefix to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(test)]
pub(super) mod test_hooks {
    //! Accessors that let sibling tests inspect argument construction.

    use super::*;

    pub(in crate::session) fn session_for(
        settings: &Settings,
        endpoint: &SshEndpoint,
        control: Option<&str>,
    ) -> SshSession {
        let provider = SshSessionProvider::new(settings);
        SshSession {
            transport: provider.transport,
            endpoint: endpoint.clone(),
            control_path: control.map(PathBuf::from),
            closed: true,
        }
    }

    pub(in crate::session) fn mark_established(session: &mut SshSession) {
        session.closed = false;
    }

    pub(in crate::session) fn connect_args(session: &SshSession) -> Vec<String> {
        lossy(session.connect_args())
    }

    pub(in crate::session) fn exec_args(session: &SshSession, command: &str) -> Vec<String> {
        lossy(session.exec_args(command))
    }

    pub(in crate::session) fn exit_args(session: &SshSession) -> Option<Vec<String>> {
        session.exit_args().map(lossy)
    }

    pub(in crate::session) fn program_for(
        session: &SshSession,
        authenticate: bool,
    ) -> (String, Vec<String>) {
        let command = session
            .transport
            .command(&session.endpoint, Vec::new(), authenticate);
        let std_command = command.as_std();
        (
            std_command.get_program().to_string_lossy().into_owned(),
            std_command
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        )
    }

    fn lossy(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}
