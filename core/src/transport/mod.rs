//! Transports carry a formatted command to where it runs and bring back raw
//! output. Strategy selection lives here so every executor kind is dispatched
//! from one table.

pub mod clixml;
pub mod local;
pub mod ntlm;
pub mod ssh;
pub mod winrm;

use crate::error::{FailureKind, TransportError};
use crate::model::{ExecutorKind, Host, RemoteProtocol};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use local::LocalTransport;
pub use ssh::SshTransport;
pub use winrm::WinRmTransport;

pub const SSH_STAGING_ROOT: &str = "/tmp";
pub const WINRM_STAGING_ROOT: &str = "C:\\Windows\\Temp";

/// Unparsed result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

pub struct Invocation<'a> {
    pub command: &'a str,
    pub executor: &'a ExecutorKind,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Local,
    Ssh,
    WinRm,
}

impl Channel {
    pub fn staging_root(&self) -> Option<&'static str> {
        match self {
            Channel::Local => None,
            Channel::Ssh => Some(SSH_STAGING_ROOT),
            Channel::WinRm => Some(WINRM_STAGING_ROOT),
        }
    }

    pub fn separator(&self) -> char {
        match self {
            Channel::WinRm => '\\',
            Channel::Local => std::path::MAIN_SEPARATOR,
            Channel::Ssh => '/',
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Local => write!(f, "local"),
            Channel::Ssh => write!(f, "ssh"),
            Channel::WinRm => write!(f, "winrm"),
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    fn channel(&self) -> Channel;

    /// Writes one local file to `destination` on the target, creating parent
    /// directories. `elevated` wraps the auxiliary commands, never the file.
    async fn upload(
        &mut self,
        source: &Path,
        destination: &str,
        elevated: bool,
    ) -> Result<(), TransportError>;

    async fn execute(
        &mut self,
        invocation: Invocation<'_>,
    ) -> Result<RawResponse, TransportError>;

    async fn close(&mut self) {}
}

/// How a command for a given executor reaches its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    LocalProcess,
    CloudCli { cli: String },
    Ssh,
    WinRmCommand,
    WinRmPowerShell,
    Manual,
    Unsupported { reason: String },
}

impl Strategy {
    pub fn select(executor: &ExecutorKind, host: Option<&Host>) -> Self {
        let Some(host) = host else {
            return match executor {
                ExecutorKind::Shell { .. }
                | ExecutorKind::CommandPrompt
                | ExecutorKind::PowerShell => Strategy::LocalProcess,
                ExecutorKind::CloudCli { cli } => Strategy::CloudCli { cli: cli.clone() },
                ExecutorKind::Manual => Strategy::Manual,
            };
        };

        let strategy = match executor {
            ExecutorKind::Shell { .. } => Strategy::Ssh,
            ExecutorKind::CommandPrompt => Strategy::WinRmCommand,
            ExecutorKind::PowerShell => Strategy::WinRmPowerShell,
            ExecutorKind::Manual => return Strategy::Manual,
            ExecutorKind::CloudCli { cli } => {
                return Strategy::Unsupported {
                    reason: format!("cloud executor '{cli}' cannot run on remote host {host}"),
                }
            }
        };

        match (host.protocol, strategy.channel()) {
            (Some(RemoteProtocol::Ssh), Some(Channel::WinRm))
            | (Some(RemoteProtocol::WinRm), Some(Channel::Ssh)) => Strategy::Unsupported {
                reason: format!(
                    "executor '{executor}' cannot run over the {} inventory of host {host}",
                    host.protocol.map(|p| p.to_string()).unwrap_or_default()
                ),
            },
            _ => strategy,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            Strategy::LocalProcess | Strategy::CloudCli { .. } => Some(Channel::Local),
            Strategy::Ssh => Some(Channel::Ssh),
            Strategy::WinRmCommand | Strategy::WinRmPowerShell => Some(Channel::WinRm),
            Strategy::Manual | Strategy::Unsupported { .. } => None,
        }
    }
}

/// What a factory needs to open one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTarget<'a> {
    pub channel: Channel,
    pub host: Option<&'a Host>,
    pub workdir: &'a Path,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, target: SessionTarget<'_>) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, target: SessionTarget<'_>) -> Result<Box<dyn Transport>, TransportError> {
        match (target.channel, target.host) {
            (Channel::Local, _) => Ok(Box::new(LocalTransport::new(target.workdir))),
            (Channel::Ssh, Some(host)) => Ok(Box::new(SshTransport::connect(host).await?)),
            (Channel::WinRm, Some(host)) => Ok(Box::new(WinRmTransport::new(host)?)),
            (channel, None) => Err(TransportError::protocol(format!(
                "{channel} session requires a remote host"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    TimedOut,
    Cancelled,
}

impl Interrupt {
    pub(crate) fn into_error(self, timeout: Duration) -> TransportError {
        match self {
            Interrupt::TimedOut => TransportError::timeout(timeout.as_secs()),
            Interrupt::Cancelled => TransportError::cancelled(),
        }
    }
}

/// Runs `operation` until it finishes, the timeout elapses or the token is
/// cancelled. The caller is responsible for tearing down whatever the
/// interrupted operation left running.
pub(crate) async fn guarded<F>(
    operation: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupt>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        outcome = tokio::time::timeout(timeout, operation) => {
            outcome.map_err(|_| Interrupt::TimedOut)
        }
    }
}

pub(crate) fn missing_credentials(host: &Host) -> TransportError {
    TransportError::new(
        FailureKind::AuthenticationFailed,
        format!("no authentication method configured for {host}"),
    )
}
