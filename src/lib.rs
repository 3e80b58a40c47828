//! Core library for the ferry deployment tool.
//!
//! The crate builds a project locally, copies its server artifacts or packaged
//! web bundle to remote hosts over SSH, and restarts the remote process. Every
//! (environment, artifact) pair deploys concurrently over its own session and
//! failures are aggregated rather than aborting sibling units.

pub mod config;
pub mod lifecycle;
pub mod local;
pub mod orchestrator;
pub mod process;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod test_support;
pub mod transfer;

pub use config::{
    ConfigError, DEFAULT_CONFIG_PATH, DeployFile, DeploymentTarget, EnvironmentConfig, Flow,
    TargetOverrides, resolve_environment, write_sample,
};
pub use lifecycle::{LifecycleError, ProcessManager, SupersedeOutcome};
pub use local::{LocalError, LocalToolchain};
pub use orchestrator::{
    AggregateError, DeployError, DeployOrchestrator, DeployRequest, DeploymentOutcome,
};
pub use process::{
    CommandOutput, CommandRunner, ProcessCommandRunner, SpawnError, StreamingCommandRunner,
};
pub use protocol::{Stage, UnitError, UnitId, deploy_bundle, deploy_server};
pub use session::{
    Credential, RemoteCommandOutput, RemoteSession, SessionError, SessionProvider, SshEndpoint,
    SshSessionProvider,
};
pub use settings::{ProcessTiming, Settings, SettingsError};
pub use transfer::{TransferError, transfer};
