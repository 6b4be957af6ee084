use super::{
    guarded, missing_credentials, Channel, Interrupt, Invocation, RawResponse, Transport,
};
use crate::error::{FailureKind, TransportError};
use crate::model::{AuthMethod, Host};
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned.
        Ok(true)
    }
}

/// One authenticated SSH session. Every command gets its own channel.
pub struct SshTransport {
    session: client::Handle<ClientHandler>,
    host: String,
}

impl SshTransport {
    pub async fn connect(host: &Host) -> Result<Self, TransportError> {
        let username = host
            .username
            .as_deref()
            .ok_or_else(|| missing_credentials(host))?;
        let methods = host.auth_methods();
        if methods.is_empty() {
            return Err(missing_credentials(host));
        }

        let config = Arc::new(client::Config::default());
        let address = (host.hostname.clone(), host.ssh_port());
        let connect_timeout = Duration::from_secs(host.timeout);
        debug!(host = %host, port = host.ssh_port(), "opening ssh session");

        let connect = client::connect(config, address, ClientHandler);
        let mut session = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(classify(&err)),
            Err(_) => {
                return Err(TransportError::new(
                    FailureKind::ConnectionFailed,
                    format!(
                        "unable to connect to {}:{} within {}s",
                        host.hostname,
                        host.ssh_port(),
                        host.timeout
                    ),
                ))
            }
        };

        let mut last_failure = None;
        for method in methods {
            match authenticate(&mut session, username, method).await {
                Ok(true) => {
                    return Ok(Self {
                        session,
                        host: host.hostname.clone(),
                    })
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(host = %host, error = %err.message, "ssh authentication attempt failed");
                    last_failure = Some(err);
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            TransportError::authentication(format!("server rejected credentials for {host}"))
        }))
    }

    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>, TransportError> {
        self.session
            .channel_open_session()
            .await
            .map_err(|err| classify(&err))
    }
}

async fn authenticate(
    session: &mut client::Handle<ClientHandler>,
    username: &str,
    method: AuthMethod<'_>,
) -> Result<bool, TransportError> {
    let outcome = match method {
        AuthMethod::KeyPath(path) => {
            let key = russh_keys::load_secret_key(path, None).map_err(|err| {
                TransportError::from_error(FailureKind::AuthenticationFailed, &err)
            })?;
            session.authenticate_publickey(username, Arc::new(key)).await
        }
        AuthMethod::KeyMaterial(material) => {
            let key = russh_keys::decode_secret_key(material, None).map_err(|err| {
                TransportError::from_error(FailureKind::AuthenticationFailed, &err)
            })?;
            session.authenticate_publickey(username, Arc::new(key)).await
        }
        AuthMethod::Password(password) => session.authenticate_password(username, password).await,
    };
    outcome.map_err(|err| classify(&err))
}

fn classify(err: &russh::Error) -> TransportError {
    let kind = match err {
        russh::Error::IO(_)
        | russh::Error::Disconnect
        | russh::Error::HUP
        | russh::Error::ConnectionTimeout => FailureKind::ConnectionFailed,
        russh::Error::NotAuthenticated => FailureKind::AuthenticationFailed,
        _ => FailureKind::TransportProtocolError,
    };
    TransportError::from_error(kind, err)
}

async fn collect(channel: &mut russh::Channel<client::Msg>) -> RawResponse {
    let mut response = RawResponse {
        exit_code: -1,
        ..RawResponse::default()
    };
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => response.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => response.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => {
                response.exit_code = i32::try_from(exit_status).unwrap_or(-1);
            }
            _ => {}
        }
    }
    response
}

/// The parts of an exec channel needed to stop what runs on it.
#[async_trait]
trait RemoteCommand: Send {
    async fn kill(&mut self) -> Result<(), russh::Error>;
    async fn shut(&mut self) -> Result<(), russh::Error>;
}

#[async_trait]
impl RemoteCommand for russh::Channel<client::Msg> {
    async fn kill(&mut self) -> Result<(), russh::Error> {
        self.signal(Sig::KILL).await
    }

    async fn shut(&mut self) -> Result<(), russh::Error> {
        self.close().await
    }
}

// Closing an exec channel without a pty leaves the remote process running,
// so it is killed first.
async fn stop_remote<C: RemoteCommand>(channel: &mut C, host: &str, interrupt: Interrupt) {
    warn!(host, reason = ?interrupt, "killing remote command");
    match channel.kill().await {
        Ok(()) => debug!(host, "sent KILL to remote command"),
        Err(err) => warn!(host, error = %err, "failed to signal remote command"),
    }
    if let Err(err) = channel.shut().await {
        debug!(host, error = %err, "channel already closed");
    }
}

fn upload_command(destination: &str, elevated: bool) -> String {
    let directory = match destination.rfind('/') {
        Some(0) => "/",
        Some(index) => &destination[..index],
        None => ".",
    };
    let script = format!(
        "mkdir -p {} && cat > {}",
        shell_words::quote(directory),
        shell_words::quote(destination)
    );
    if elevated {
        format!("sudo sh -c {}", shell_words::quote(&script))
    } else {
        script
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn channel(&self) -> Channel {
        Channel::Ssh
    }

    async fn upload(
        &mut self,
        source: &Path,
        destination: &str,
        elevated: bool,
    ) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|err| TransportError::unknown(&err))?;
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, upload_command(destination, elevated))
            .await
            .map_err(|err| classify(&err))?;
        channel
            .data(&bytes[..])
            .await
            .map_err(|err| classify(&err))?;
        channel.eof().await.map_err(|err| classify(&err))?;

        let response = match tokio::time::timeout(UPLOAD_TIMEOUT, collect(&mut channel)).await {
            Ok(response) => response,
            Err(_) => {
                stop_remote(&mut channel, &self.host, Interrupt::TimedOut).await;
                return Err(TransportError::timeout(UPLOAD_TIMEOUT.as_secs()));
            }
        };
        if response.exit_code != 0 {
            return Err(TransportError::protocol(format!(
                "copy to {}:{destination} exited with {}: {}",
                self.host,
                response.exit_code,
                String::from_utf8_lossy(&response.stderr).trim()
            )));
        }
        debug!(host = %self.host, destination, bytes = bytes.len(), "uploaded supporting file");
        Ok(())
    }

    async fn execute(&mut self, invocation: Invocation<'_>) -> Result<RawResponse, TransportError> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, invocation.command)
            .await
            .map_err(|err| classify(&err))?;

        match guarded(collect(&mut channel), invocation.timeout, invocation.cancel).await {
            Ok(response) => Ok(response),
            Err(interrupt) => {
                stop_remote(&mut channel, &self.host, interrupt).await;
                Err(interrupt.into_error(invocation.timeout))
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.host, error = %err, "ssh disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_command_quotes_paths() {
        assert_eq!(
            upload_command("/tmp/T1003/src/my file.txt", false),
            "mkdir -p /tmp/T1003/src && cat > '/tmp/T1003/src/my file.txt'"
        );
    }

    #[test]
    fn elevated_upload_wraps_whole_script() {
        let command = upload_command("/tmp/a.sh", true);
        assert!(command.starts_with("sudo sh -c "));
        assert!(command.contains("mkdir -p /tmp"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_fast() {
        let mut host = Host::new("192.0.2.1");
        host.username = Some("root".to_string());
        let err = match SshTransport::connect(&host).await {
            Ok(_) => panic!("connect should not succeed"),
            Err(err) => err,
        };
        assert_eq!(err.kind, FailureKind::AuthenticationFailed);
    }

    #[derive(Default)]
    struct RecordingChannel {
        calls: Vec<&'static str>,
        refuse_signal: bool,
    }

    #[async_trait]
    impl RemoteCommand for RecordingChannel {
        async fn kill(&mut self) -> Result<(), russh::Error> {
            self.calls.push("kill");
            if self.refuse_signal {
                return Err(russh::Error::SendError);
            }
            Ok(())
        }

        async fn shut(&mut self) -> Result<(), russh::Error> {
            self.calls.push("close");
            Ok(())
        }
    }

    #[tokio::test]
    async fn interrupted_command_is_killed_before_close() {
        let mut channel = RecordingChannel::default();
        stop_remote(&mut channel, "10.0.0.7", Interrupt::TimedOut).await;
        assert_eq!(channel.calls, vec!["kill", "close"]);
    }

    #[tokio::test]
    async fn channel_closes_even_when_signal_fails() {
        let mut channel = RecordingChannel {
            refuse_signal: true,
            ..RecordingChannel::default()
        };
        stop_remote(&mut channel, "10.0.0.7", Interrupt::Cancelled).await;
        assert_eq!(channel.calls, vec!["kill", "close"]);
    }
}
