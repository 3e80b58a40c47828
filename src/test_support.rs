//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeSessionProvider`] simulates a set of remote hosts, each with a process
//! table and a filesystem of received files, understanding the commands that
//! the transfer, lifecycle and protocol modules send. [`ScriptedRunner`]
//! stands in for local build and packaging commands.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::lifecycle::lookup_command;
use crate::process::{CommandOutput, CommandRunner, RunnerFuture, SpawnError};
use crate::session::{
    Credential, DataChannel, RemoteCommandOutput, RemoteSession, SessionError, SessionFuture,
    SessionProvider, SshEndpoint,
};

/// First pid handed out by the simulated hosts.
const FIRST_PID: u32 = 1_000;

/// Endpoint for a fake host using password authentication.
#[must_use]
pub fn endpoint_for(host: &str) -> SshEndpoint {
    SshEndpoint {
        host: host.to_owned(),
        port: 22,
        username: String::from("deploy"),
        credential: Credential::Password(String::from("secret")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Default)]
enum KillMode {
    #[default]
    Terminate,
    Vanish,
    Ignore,
    Deny(String),
    Linger(u32),
}

#[derive(Debug, Default)]
struct HostState {
    unreachable: bool,
    latency: Duration,
    files: BTreeMap<String, Vec<u8>>,
    processes: BTreeMap<u32, String>,
    starting: BTreeMap<u32, (String, u32)>,
    stopping: BTreeMap<u32, u32>,
    launch_delay: u32,
    commands: Vec<String>,
    kill_mode: KillMode,
    crash_on_launch: bool,
    fail_mkdir: bool,
    fail_receiver: bool,
    fail_unpack: bool,
}

#[derive(Debug)]
struct Network {
    hosts: BTreeMap<String, HostState>,
    next_pid: u32,
    opened: usize,
    closed: usize,
    active: usize,
    peak_active: usize,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
            next_pid: FIRST_PID,
            opened: 0,
            closed: 0,
            active: 0,
            peak_active: 0,
        }
    }
}

impl Network {
    fn allocate_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.saturating_add(1);
        pid
    }

    fn host_mut(&mut self, name: &str) -> &mut HostState {
        self.hosts.entry(name.to_owned()).or_default()
    }

    fn release(&mut self) {
        self.closed = self.closed.saturating_add(1);
        self.active = self.active.saturating_sub(1);
    }

    fn execute(&mut self, host: &str, command: &str) -> RemoteCommandOutput {
        let next_pid = self.next_pid;
        let state = self.host_mut(host);
        state.commands.push(command.to_owned());

        if command.starts_with("mkdir -p ") {
            return if state.fail_mkdir {
                failure(1, "mkdir: cannot create directory: Permission denied")
            } else {
                success("")
            };
        }
        if command.starts_with("ps -ef") {
            state.advance_lookups(command);
            let pids: Vec<String> = state
                .processes
                .iter()
                .filter(|(_, path)| lookup_command(path) == command)
                .map(|(pid, _)| format!("{pid}\n"))
                .collect();
            return success(&pids.concat());
        }
        if let Some(list) = command.strip_prefix("kill ") {
            let pids: Vec<u32> = list
                .split_whitespace()
                .filter_map(|pid| pid.parse().ok())
                .collect();
            return kill(state, &pids);
        }
        if command.starts_with("nohup ") {
            let artifact = command
                .split_whitespace()
                .skip_while(|token| *token != "-jar")
                .nth(1)
                .map(|token| token.trim_matches('\'').to_owned());
            let Some(artifact) = artifact else {
                return failure(1, "Error: -jar requires jar file specification");
            };
            if !state.crash_on_launch {
                if state.launch_delay == 0 {
                    state.processes.insert(next_pid, artifact);
                } else {
                    state
                        .starting
                        .insert(next_pid, (artifact, state.launch_delay));
                }
                self.next_pid = next_pid.saturating_add(1);
            }
            return success("");
        }
        if command.starts_with("rm -rf ") {
            return if state.fail_unpack {
                failure(9, "unzip: cannot find or open archive")
            } else {
                success("")
            };
        }
        failure(127, "sh: command not found")
    }
}

impl HostState {
    /// Counts one lookup against delayed starts and lingering exits that
    /// `command` would match.
    fn advance_lookups(&mut self, command: &str) {
        let mut started = Vec::new();
        for (pid, (path, remaining)) in &mut self.starting {
            if lookup_command(path) != command {
                continue;
            }
            match remaining.checked_sub(1) {
                Some(left) => *remaining = left,
                None => started.push(*pid),
            }
        }
        for pid in started {
            if let Some((path, _)) = self.starting.remove(&pid) {
                self.processes.insert(pid, path);
            }
        }

        let mut exited = Vec::new();
        for (pid, remaining) in &mut self.stopping {
            let matched = self
                .processes
                .get(pid)
                .is_some_and(|path| lookup_command(path) == command);
            if !matched {
                continue;
            }
            match remaining.checked_sub(1) {
                Some(left) => *remaining = left,
                None => exited.push(*pid),
            }
        }
        for pid in exited {
            self.stopping.remove(&pid);
            self.processes.remove(&pid);
        }
    }
}

fn kill(state: &mut HostState, pids: &[u32]) -> RemoteCommandOutput {
    let absent = |pid: &u32| format!("kill: ({pid}) - No such process\n");
    match state.kill_mode.clone() {
        KillMode::Terminate => {
            let missing: Vec<String> = pids
                .iter()
                .filter(|pid| state.processes.remove(*pid).is_none())
                .map(absent)
                .collect();
            if missing.is_empty() {
                success("")
            } else {
                failure(1, &missing.concat())
            }
        }
        KillMode::Vanish => {
            for pid in pids {
                state.processes.remove(pid);
            }
            let messages: Vec<String> = pids.iter().map(absent).collect();
            failure(1, &messages.concat())
        }
        KillMode::Ignore => success(""),
        KillMode::Linger(lookups) => {
            let missing: Vec<String> = pids
                .iter()
                .filter(|pid| !state.processes.contains_key(*pid))
                .map(absent)
                .collect();
            for pid in pids {
                if state.processes.contains_key(pid) {
                    state.stopping.entry(*pid).or_insert(lookups);
                }
            }
            if missing.is_empty() {
                success("")
            } else {
                failure(1, &missing.concat())
            }
        }
        KillMode::Deny(message) => failure(1, &message),
    }
}

fn success(stdout: &str) -> RemoteCommandOutput {
    RemoteCommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

fn failure(code: i32, stderr: &str) -> RemoteCommandOutput {
    RemoteCommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

/// Session provider backed by simulated hosts.
#[derive(Clone, Debug, Default)]
pub struct FakeSessionProvider {
    network: Arc<Mutex<Network>>,
}

impl FakeSessionProvider {
    /// Creates a provider with no hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or returns) the simulated host reachable as `name`.
    #[must_use]
    pub fn add_host(&self, name: &str) -> FakeHost {
        lock(&self.network).host_mut(name);
        FakeHost {
            network: Arc::clone(&self.network),
            name: name.to_owned(),
        }
    }

    /// Number of sessions opened successfully.
    #[must_use]
    pub fn opened(&self) -> usize {
        lock(&self.network).opened
    }

    /// Number of sessions released, by `close` or by drop.
    #[must_use]
    pub fn closed(&self) -> usize {
        lock(&self.network).closed
    }

    /// Highest number of sessions open at the same time.
    #[must_use]
    pub fn peak_sessions(&self) -> usize {
        lock(&self.network).peak_active
    }
}

impl SessionProvider for FakeSessionProvider {
    type Session = FakeSession;

    fn open<'a>(&'a self, endpoint: &'a SshEndpoint) -> SessionFuture<'a, Self::Session> {
        Box::pin(async move {
            let mut network = lock(&self.network);
            let reachable = network
                .hosts
                .get(&endpoint.host)
                .is_some_and(|host| !host.unreachable);
            if !reachable {
                return Err(SessionError::Connect {
                    destination: format!("{}:{}", endpoint.destination(), endpoint.port),
                    message: String::from("Connection refused"),
                });
            }
            network.opened = network.opened.saturating_add(1);
            network.active = network.active.saturating_add(1);
            network.peak_active = network.peak_active.max(network.active);
            Ok(FakeSession {
                network: Arc::clone(&self.network),
                host: endpoint.host.clone(),
                closed: false,
            })
        })
    }
}

/// Handle for inspecting and configuring one simulated host.
#[derive(Clone, Debug)]
pub struct FakeHost {
    network: Arc<Mutex<Network>>,
    name: String,
}

impl FakeHost {
    fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> T {
        f(lock(&self.network).host_mut(&self.name))
    }

    /// Registers a running process for `artifact_path` and returns its pid.
    #[must_use]
    pub fn start_process(&self, artifact_path: &str) -> u32 {
        let mut network = lock(&self.network);
        let pid = network.allocate_pid();
        network
            .host_mut(&self.name)
            .processes
            .insert(pid, artifact_path.to_owned());
        pid
    }

    /// Running processes as `(pid, artifact path)` pairs in pid order.
    #[must_use]
    pub fn running(&self) -> Vec<(u32, String)> {
        self.with_state(|state| {
            state
                .processes
                .iter()
                .map(|(pid, path)| (*pid, path.clone()))
                .collect()
        })
    }

    /// Contents of a file received at `path`.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.with_state(|state| state.files.get(path).cloned())
    }

    /// Every command received, in order. Data channels are recorded as
    /// `channel: <command>`.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.with_state(|state| state.commands.clone())
    }

    /// Refuses new connections.
    pub fn set_unreachable(&self) {
        self.with_state(|state| state.unreachable = true);
    }

    /// Delays every command and channel by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|state| state.latency = latency);
    }

    /// Makes `mkdir -p` fail.
    pub fn fail_mkdir(&self) {
        self.with_state(|state| state.fail_mkdir = true);
    }

    /// Makes the `scp` receiver reject uploads.
    pub fn fail_receiver(&self) {
        self.with_state(|state| state.fail_receiver = true);
    }

    /// Makes the bundle unpack command fail.
    pub fn fail_unpack(&self) {
        self.with_state(|state| state.fail_unpack = true);
    }

    /// Launched processes exit straight away.
    pub fn crash_on_launch(&self) {
        self.with_state(|state| state.crash_on_launch = true);
    }

    /// Launched processes only show up in the process table once `lookups`
    /// lookups for them have come back empty.
    pub fn delay_launch(&self, lookups: u32) {
        self.with_state(|state| state.launch_delay = lookups);
    }

    /// Signalled processes keep showing up for `lookups` more lookups before
    /// they exit.
    pub fn linger_on_kill(&self, lookups: u32) {
        self.with_state(|state| state.kill_mode = KillMode::Linger(lookups));
    }

    /// Processes exit just before the kill signal lands.
    pub fn vanish_on_kill(&self) {
        self.with_state(|state| state.kill_mode = KillMode::Vanish);
    }

    /// Processes survive the kill signal.
    pub fn ignore_kill(&self) {
        self.with_state(|state| state.kill_mode = KillMode::Ignore);
    }

    /// `kill` fails with `message`, leaving processes running.
    pub fn deny_kill(&self, message: &str) {
        let mode = KillMode::Deny(message.to_owned());
        self.with_state(|state| state.kill_mode = mode);
    }
}

/// Session against a simulated host.
#[derive(Debug)]
pub struct FakeSession {
    network: Arc<Mutex<Network>>,
    host: String,
    closed: bool,
}

impl FakeSession {
    fn latency(&self) -> Duration {
        lock(&self.network).host_mut(&self.host).latency
    }
}

impl RemoteSession for FakeSession {
    type Channel = FakeChannel;

    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            tokio::time::sleep(self.latency()).await;
            Ok(lock(&self.network).execute(&self.host, command))
        })
    }

    fn open_channel<'a>(&'a self, command: &'a str) -> SessionFuture<'a, Self::Channel> {
        Box::pin(async move {
            tokio::time::sleep(self.latency()).await;
            lock(&self.network)
                .host_mut(&self.host)
                .commands
                .push(format!("channel: {command}"));
            Ok(FakeChannel {
                network: Arc::clone(&self.network),
                host: self.host.clone(),
                command: command.to_owned(),
                received: Vec::new(),
            })
        })
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                lock(&self.network).release();
            }
            Ok(())
        })
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.closed {
            lock(&self.network).release();
        }
    }
}

/// Data channel that buffers bytes until [`DataChannel::finish`].
#[derive(Debug)]
pub struct FakeChannel {
    network: Arc<Mutex<Network>>,
    host: String,
    command: String,
    received: Vec<u8>,
}

impl AsyncWrite for FakeChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().received.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl DataChannel for FakeChannel {
    fn finish(self) -> SessionFuture<'static, RemoteCommandOutput> {
        Box::pin(async move {
            let mut network = lock(&self.network);
            let state = network.host_mut(&self.host);
            let Some(dest) = self.command.strip_prefix("scp -t ") else {
                return Ok(failure(127, "sh: command not found"));
            };
            if state.fail_receiver {
                return Ok(failure(1, "scp: permission denied"));
            }
            match parse_scp_upload(&self.received) {
                Some(payload) => {
                    state
                        .files
                        .insert(dest.trim_matches('\'').to_owned(), payload);
                    Ok(success(""))
                }
                None => Ok(failure(1, "scp: protocol error")),
            }
        })
    }
}

/// Decodes `C<mode> <len> <name>\n<bytes>\0`, requiring the declared length to
/// match the payload exactly.
fn parse_scp_upload(received: &[u8]) -> Option<Vec<u8>> {
    let newline = received.iter().position(|byte| *byte == b'\n')?;
    let (header_bytes, rest) = received.split_at(newline);
    let header = std::str::from_utf8(header_bytes).ok()?;
    let mut fields = header.strip_prefix('C')?.splitn(3, ' ');
    let _mode = fields.next()?;
    let length: usize = fields.next()?.parse().ok()?;
    fields.next().filter(|name| !name.is_empty())?;

    let body = rest.get(1..)?;
    let (payload, terminator) = body.split_at_checked(length)?;
    (terminator == [0]).then(|| payload.to_vec())
}

type Hook = Arc<dyn Fn(&CommandInvocation) + Send + Sync>;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
    fallback: Option<CommandOutput>,
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("responses", &self.responses)
            .field("invocations", &self.invocations)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Working directory.
    pub dir: Utf8PathBuf,
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that succeeds whenever no response is queued.
    #[must_use]
    pub fn succeeding() -> Self {
        Self {
            fallback: Some(output(Some(0), "", "")),
            ..Self::default()
        }
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Registers a side effect that runs for every invocation, such as
    /// creating the files a real tool would write.
    pub fn on_run(&self, hook: impl Fn(&CommandInvocation) + Send + Sync + 'static) {
        lock(&self.hooks).push(Arc::new(hook));
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(output(code, stdout, stderr));
    }
}

fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_in<'a>(
        &'a self,
        dir: &'a Utf8Path,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let invocation = CommandInvocation {
                dir: dir.to_path_buf(),
                program: program.to_owned(),
                args: args.to_vec(),
            };
            let hooks = lock(&self.hooks).clone();
            for hook in hooks {
                hook(&invocation);
            }
            lock(&self.invocations).push(invocation);
            lock(&self.responses)
                .pop_front()
                .or_else(|| self.fallback.clone())
                .ok_or_else(|| SpawnError {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
