//! WS-Management remote shell client. Speaks the subset of the protocol needed
//! to open a cmd shell, run one command, stream its output and tear it down.

use super::ntlm::{self, Credentials, NtlmError, SessionSecurity};
use super::{guarded, missing_credentials, Channel, Invocation, RawResponse, Transport};
use crate::error::{FailureKind, TransportError};
use crate::model::{ExecutorKind, Host, WinRmAuth};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const OPERATION_TIMEOUT_SECS: u64 = 20;
const MAX_ENVELOPE_SIZE: u32 = 153_600;
const UPLOAD_CHUNK_BYTES: usize = 1500;
const UPLOAD_STEP_TIMEOUT: Duration = Duration::from_secs(60);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const SHELL_RESOURCE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const ENCRYPTED_CONTENT_TYPE: &str = "multipart/encrypted;\
     protocol=\"application/HTTP-SPNEGO-session-encrypted\";boundary=\"Encrypted Boundary\"";
const BOUNDARY: &str = "--Encrypted Boundary";
const ENCRYPTED_PROTOCOL: &str = "application/HTTP-SPNEGO-session-encrypted";
const OCTET_STREAM_HEADER: &str = "\tContent-Type: application/octet-stream\r\n";

enum Auth {
    Basic {
        username: String,
        password: String,
    },
    /// NTLM context established once per transport. Over plain HTTP every
    /// envelope is sealed with it.
    Ntlm {
        credentials: Credentials,
        session: Mutex<Option<SessionSecurity>>,
        seal: bool,
    },
}

pub struct WinRmTransport {
    client: reqwest::Client,
    endpoint: String,
    auth: Auth,
    host: String,
}

impl WinRmTransport {
    pub fn new(host: &Host) -> Result<Self, TransportError> {
        let (Some(username), Some(password)) = (host.username.as_ref(), host.password.as_ref())
        else {
            return Err(missing_credentials(host));
        };
        let scheme = if host.verify_ssl { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}:{}/wsman", host.hostname, host.winrm_port());

        // NTLM authenticates the connection, so requests must share one.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(host.timeout.max(1)))
            .timeout(Duration::from_secs(OPERATION_TIMEOUT_SECS + 30))
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|err| TransportError::unknown(&err))?;

        let auth = match host.winrm_auth {
            WinRmAuth::Basic => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            WinRmAuth::Ntlm => Auth::Ntlm {
                credentials: Credentials::new(username, password),
                session: Mutex::new(None),
                seal: !host.verify_ssl,
            },
        };

        Ok(Self {
            client,
            endpoint,
            auth,
            host: host.hostname.clone(),
        })
    }

    async fn post(&self, envelope: String) -> Result<WsResponse, TransportError> {
        let (status, body) = match &self.auth {
            Auth::Basic { username, password } => {
                let response = self
                    .client
                    .post(&self.endpoint)
                    .basic_auth(username, Some(password))
                    .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                    .body(envelope)
                    .send()
                    .await
                    .map_err(|err| classify(&err))?;
                let status = response.status();
                (status, response.text().await.map_err(|err| classify(&err))?)
            }
            Auth::Ntlm {
                credentials,
                session,
                seal,
            } => {
                self.post_ntlm(credentials, session, *seal, &envelope)
                    .await?
            }
        };

        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::authentication(format!(
                "{} rejected the supplied credentials",
                self.host
            )));
        }
        let parsed = parse_response(&body)?;
        if let Some(fault) = &parsed.fault {
            return Err(TransportError::new(
                FailureKind::TransportProtocolError,
                fault.clone(),
            ));
        }
        if !status.is_success() {
            return Err(TransportError::protocol(format!(
                "{} answered with HTTP {status}",
                self.host
            )));
        }
        Ok(parsed)
    }

    /// Sends one envelope inside the NTLM context, establishing it first when
    /// needed. A 401 means the server dropped the context; the handshake is
    /// retried once before the credentials are reported as rejected.
    async fn post_ntlm(
        &self,
        credentials: &Credentials,
        session: &Mutex<Option<SessionSecurity>>,
        seal: bool,
        envelope: &str,
    ) -> Result<(StatusCode, String), TransportError> {
        let mut context = session.lock().await;
        let mut retried = false;
        loop {
            let mut security = match context.take() {
                Some(security) => security,
                None => self.handshake(credentials).await?,
            };

            let request = self.client.post(&self.endpoint);
            let request = if seal {
                let body = wrap_encrypted(&mut security, envelope.as_bytes())
                    .map_err(|err| ntlm_failure(&self.host, err))?;
                request.header(CONTENT_TYPE, ENCRYPTED_CONTENT_TYPE).body(body)
            } else {
                request
                    .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                    .body(envelope.to_string())
            };
            let response = request.send().await.map_err(|err| classify(&err))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                let _ = response.bytes().await;
                if retried {
                    return Ok((status, String::new()));
                }
                retried = true;
                debug!(host = %self.host, "NTLM context expired, authenticating again");
                continue;
            }

            let encrypted = is_encrypted(response.headers());
            let bytes = response.bytes().await.map_err(|err| classify(&err))?;
            let body = if encrypted {
                unwrap_encrypted(&mut security, &bytes)?
            } else {
                bytes.to_vec()
            };
            *context = Some(security);
            return Ok((status, String::from_utf8_lossy(&body).into_owned()));
        }
    }

    async fn handshake(
        &self,
        credentials: &Credentials,
    ) -> Result<SessionSecurity, TransportError> {
        let negotiate = format!("Negotiate {}", STANDARD.encode(ntlm::negotiate_message()));
        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, negotiate)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|err| classify(&err))?;
        let status = response.status();
        let challenge = negotiate_token(response.headers()).ok_or_else(|| {
            TransportError::authentication(format!(
                "{} offered no NTLM challenge (HTTP {status})",
                self.host
            ))
        })?;
        let _ = response.bytes().await;

        let (authenticate, security) = ntlm::authenticate(credentials, &challenge)
            .map_err(|err| ntlm_failure(&self.host, err))?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(
                AUTHORIZATION,
                format!("Negotiate {}", STANDARD.encode(authenticate)),
            )
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|err| classify(&err))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::authentication(format!(
                "{} rejected the supplied credentials",
                self.host
            )));
        }
        let _ = response.bytes().await;
        debug!(host = %self.host, user = %credentials.user, "NTLM context established");
        Ok(security)
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &[(&str, &str)],
        body: &str,
    ) -> String {
        build_envelope(
            &self.endpoint,
            action,
            shell_id,
            options,
            body,
            OPERATION_TIMEOUT_SECS,
        )
    }

    async fn open_shell(&self) -> Result<String, TransportError> {
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
                    <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let envelope = self.envelope(
            ACTION_CREATE,
            None,
            &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
            body,
        );
        self.post(envelope)
            .await?
            .shell_id
            .ok_or_else(|| TransportError::protocol("create response carried no shell id"))
    }

    async fn start_command(
        &self,
        shell_id: &str,
        command_line: &str,
    ) -> Result<String, TransportError> {
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            quick_xml::escape::escape(command_line)
        );
        let envelope = self.envelope(
            ACTION_COMMAND,
            Some(shell_id),
            &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
            &body,
        );
        self.post(envelope)
            .await?
            .command_id
            .ok_or_else(|| TransportError::protocol("command response carried no command id"))
    }

    async fn receive_all(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> Result<RawResponse, TransportError> {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{command_id}\">stdout stderr</rsp:DesiredStream></rsp:Receive>"
        );
        let mut response = RawResponse::default();
        loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), &[], &body);
            let chunk = match self.post(envelope).await {
                Ok(chunk) => chunk,
                // The service answers an idle receive with a timeout fault.
                Err(err) if err.message.contains("TimedOut") => continue,
                Err(err) => return Err(err),
            };
            response.stdout.extend(chunk.stdout);
            response.stderr.extend(chunk.stderr);
            if chunk.done {
                response.exit_code = chunk.exit_code.unwrap_or(-1);
                return Ok(response);
            }
        }
    }

    async fn terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
        );
        let envelope = self.envelope(ACTION_SIGNAL, Some(shell_id), &[], &body);
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.post(envelope)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(host = %self.host, error = %err, "terminate signal failed"),
            Err(_) => debug!(host = %self.host, "terminate signal timed out"),
        }
    }

    async fn delete_shell(&self, shell_id: &str) {
        let envelope = self.envelope(ACTION_DELETE, Some(shell_id), &[], "");
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.post(envelope)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(host = %self.host, error = %err, "shell delete failed"),
            Err(_) => debug!(host = %self.host, "shell delete timed out"),
        }
    }

    async fn run(
        &self,
        command_line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        let shell_id = self.open_shell().await?;
        let command_id = match self.start_command(&shell_id, command_line).await {
            Ok(command_id) => command_id,
            Err(err) => {
                self.delete_shell(&shell_id).await;
                return Err(err);
            }
        };

        let outcome = guarded(self.receive_all(&shell_id, &command_id), timeout, cancel).await;
        let result = match outcome {
            Ok(result) => result,
            Err(interrupt) => {
                warn!(host = %self.host, reason = ?interrupt, "terminating remote command");
                self.terminate(&shell_id, &command_id).await;
                Err(interrupt.into_error(timeout))
            }
        };
        self.delete_shell(&shell_id).await;
        result
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::connection(err)
    } else if err.status() == Some(StatusCode::UNAUTHORIZED) {
        TransportError::from_error(FailureKind::AuthenticationFailed, err)
    } else {
        TransportError::unknown(err)
    }
}

fn ntlm_failure(host: &str, err: NtlmError) -> TransportError {
    match err {
        NtlmError::BadSignature => TransportError::protocol(format!("{host}: {err}")),
        _ => TransportError::authentication(format!("{host}: {err}")),
    }
}

fn negotiate_token(headers: &HeaderMap) -> Option<Vec<u8>> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            let known =
                scheme.eq_ignore_ascii_case("Negotiate") || scheme.eq_ignore_ascii_case("NTLM");
            known.then(|| STANDARD.decode(token.trim()).ok()).flatten()
        })
}

fn is_encrypted(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/encrypted"))
}

/// Frames a sealed envelope as a `multipart/encrypted` body.
fn wrap_encrypted(
    security: &mut SessionSecurity,
    envelope: &[u8],
) -> Result<Vec<u8>, NtlmError> {
    let (signature, sealed) = security.seal(envelope)?;
    let mut body = format!(
        "{BOUNDARY}\r\n\
         \tContent-Type: {ENCRYPTED_PROTOCOL}\r\n\
         \tOriginalContent: type={SOAP_CONTENT_TYPE};Length={}\r\n\
         {BOUNDARY}\r\n\
         {OCTET_STREAM_HEADER}",
        envelope.len()
    )
    .into_bytes();
    body.extend_from_slice(&(signature.len() as u32).to_le_bytes());
    body.extend_from_slice(&signature);
    body.extend_from_slice(&sealed);
    body.extend_from_slice(format!("{BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

fn unwrap_encrypted(
    security: &mut SessionSecurity,
    body: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let malformed = |what: &str| TransportError::protocol(format!("encrypted response {what}"));

    let length_at = find(body, b"Length=").ok_or_else(|| malformed("has no length"))? + 7;
    let length_end = body[length_at..]
        .iter()
        .position(|byte| !byte.is_ascii_digit())
        .map_or(body.len(), |offset| length_at + offset);
    let expected: usize = std::str::from_utf8(&body[length_at..length_end])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| malformed("has an invalid length"))?;

    let stream_at = find(&body[length_end..], OCTET_STREAM_HEADER.as_bytes())
        .map(|offset| length_end + offset + OCTET_STREAM_HEADER.len())
        .ok_or_else(|| malformed("has no payload"))?;
    let mut stream = &body[stream_at..];
    let trailer = format!("{BOUNDARY}--\r\n");
    if let Some(rest) = stream.strip_suffix(trailer.as_bytes()) {
        stream = rest;
    }

    let signature_len = stream
        .get(..4)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
        .ok_or_else(|| malformed("is truncated"))?;
    let signature = stream
        .get(4..4 + signature_len)
        .ok_or_else(|| malformed("is truncated"))?;
    let sealed = &stream[4 + signature_len..];

    let plain = security
        .unseal(sealed, signature)
        .map_err(|err| TransportError::protocol(format!("encrypted response rejected: {err}")))?;
    if plain.len() != expected {
        return Err(malformed("length does not match its header"));
    }
    Ok(plain)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `powershell.exe -EncodedCommand` takes base64 of the UTF-16LE script.
pub fn encode_powershell(script: &str) -> String {
    let prefixed = format!("$ProgressPreference='SilentlyContinue';{script}");
    let utf16: Vec<u8> = prefixed
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    format!(
        "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}",
        STANDARD.encode(utf16)
    )
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn parent_dir(destination: &str) -> &str {
    match destination.rfind(['\\', '/']) {
        Some(index) => &destination[..index],
        None => ".",
    }
}

/// PowerShell snippets that recreate a file from base64 chunks.
pub fn upload_scripts(bytes: &[u8], destination: &str, elevated: bool) -> Vec<String> {
    let mut mkdir = format!(
        "New-Item -ItemType Directory -Force -Path {} | Out-Null",
        ps_quote(parent_dir(destination))
    );
    if elevated {
        mkdir = format!("Start-Process PowerShell -Verb RunAs; {mkdir}");
    }
    let mut scripts = vec![mkdir];

    let target = ps_quote(destination);
    if bytes.is_empty() {
        scripts.push(format!("[IO.File]::WriteAllBytes({target}, [byte[]]@())"));
        return scripts;
    }
    for (index, chunk) in bytes.chunks(UPLOAD_CHUNK_BYTES).enumerate() {
        let mode = if index == 0 { "Create" } else { "Append" };
        scripts.push(format!(
            "$bytes=[Convert]::FromBase64String('{}');\
             $stream=[IO.File]::Open({target}, [IO.FileMode]::{mode});\
             $stream.Write($bytes, 0, $bytes.Length);$stream.Close()",
            STANDARD.encode(chunk)
        ));
    }
    scripts
}

#[async_trait]
impl Transport for WinRmTransport {
    fn channel(&self) -> Channel {
        Channel::WinRm
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
        let cancel = CancellationToken::new();
        for script in upload_scripts(&bytes, destination, elevated) {
            let response = self
                .run(&encode_powershell(&script), UPLOAD_STEP_TIMEOUT, &cancel)
                .await?;
            if response.exit_code != 0 {
                return Err(TransportError::protocol(format!(
                    "copy to {}:{destination} exited with {}",
                    self.host, response.exit_code
                )));
            }
        }
        debug!(host = %self.host, destination, bytes = bytes.len(), "uploaded supporting file");
        Ok(())
    }

    async fn execute(
        &mut self,
        invocation: Invocation<'_>,
    ) -> Result<RawResponse, TransportError> {
        let command_line = match invocation.executor {
            ExecutorKind::PowerShell => encode_powershell(invocation.command),
            ExecutorKind::CommandPrompt => invocation.command.to_string(),
            other => {
                return Err(TransportError::new(
                    FailureKind::UnsupportedExecutor,
                    format!("executor '{other}' cannot run over winrm"),
                ))
            }
        };
        self.run(&command_line, invocation.timeout, invocation.cancel)
            .await
    }
}

pub fn build_envelope(
    endpoint: &str,
    action: &str,
    shell_id: Option<&str>,
    options: &[(&str, &str)],
    body: &str,
    operation_timeout_secs: u64,
) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                quick_xml::escape::escape(id)
            )
        })
        .unwrap_or_default();
    let option_set = if options.is_empty() {
        String::new()
    } else {
        let rendered: String = options
            .iter()
            .map(|(name, value)| format!("<w:Option Name=\"{name}\">{value}</w:Option>"))
            .collect();
        format!("<w:OptionSet>{rendered}</w:OptionSet>")
    };
    let body = if body.is_empty() {
        "<s:Body/>".to_string()
    } else {
        format!("<s:Body>{body}</s:Body>")
    };

    format!(
        "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\" \
         xmlns:a=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" \
         xmlns:w=\"http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd\" \
         xmlns:rsp=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell\">\
         <s:Header>\
         <a:To>{endpoint}</a:To>\
         <a:ReplyTo><a:Address s:mustUnderstand=\"true\">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>\
         <w:ResourceURI s:mustUnderstand=\"true\">{SHELL_RESOURCE}</w:ResourceURI>\
         <a:Action s:mustUnderstand=\"true\">{action}</a:Action>\
         <w:MaxEnvelopeSize s:mustUnderstand=\"true\">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>\
         <a:MessageID>uuid:{message_id}</a:MessageID>\
         <w:Locale xml:lang=\"en-US\" s:mustUnderstand=\"false\"/>\
         <w:OperationTimeout>PT{operation_timeout_secs}S</w:OperationTimeout>\
         {selector}{option_set}\
         </s:Header>{body}</s:Envelope>",
        message_id = Uuid::new_v4().to_string().to_uppercase(),
    )
}

/// The fields of any WS-Man shell response this client cares about.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WsResponse {
    pub shell_id: Option<String>,
    pub command_id: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
    pub fault: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    ShellId,
    CommandId,
    Stdout,
    Stderr,
    ExitCode,
    FaultText,
}

pub fn parse_response(xml: &str) -> Result<WsResponse, TransportError> {
    let mut parsed = WsResponse::default();
    if xml.trim().is_empty() {
        return Ok(parsed);
    }

    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut target: Option<TextTarget> = None;
    let mut in_fault = false;
    let mut fault_parts: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => {
                let attribute = |key: &[u8]| {
                    element
                        .attributes()
                        .flatten()
                        .find(|attr| attr.key.local_name().as_ref() == key)
                        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
                };
                target = match element.local_name().as_ref() {
                    b"Fault" => {
                        in_fault = true;
                        None
                    }
                    b"Selector" if attribute(b"Name").as_deref() == Some("ShellId") => {
                        Some(TextTarget::ShellId)
                    }
                    b"ShellId" => Some(TextTarget::ShellId),
                    b"CommandId" => Some(TextTarget::CommandId),
                    b"Stream" => match attribute(b"Name").as_deref() {
                        Some("stdout") => Some(TextTarget::Stdout),
                        Some("stderr") => Some(TextTarget::Stderr),
                        _ => None,
                    },
                    b"CommandState" => {
                        if attribute(b"State").as_deref() == Some(STATE_DONE) {
                            parsed.done = true;
                        }
                        None
                    }
                    b"ExitCode" => Some(TextTarget::ExitCode),
                    b"Text" | b"Message" | b"Value" if in_fault => Some(TextTarget::FaultText),
                    _ => None,
                };
            }
            Ok(Event::Empty(element)) => {
                if element.local_name().as_ref() == b"CommandState" {
                    let done = element
                        .attributes()
                        .flatten()
                        .any(|attr| {
                            attr.key.local_name().as_ref() == b"State"
                                && attr.value.as_ref() == STATE_DONE.as_bytes()
                        });
                    parsed.done |= done;
                }
            }
            Ok(Event::Text(text)) => {
                let Some(current) = target else {
                    buf.clear();
                    continue;
                };
                let value = text
                    .unescape()
                    .map_err(|err| {
                        TransportError::protocol(format!("invalid response text: {err}"))
                    })?
                    .to_string();
                match current {
                    TextTarget::ShellId => parsed.shell_id = Some(value),
                    TextTarget::CommandId => parsed.command_id = Some(value),
                    TextTarget::Stdout => parsed.stdout.extend(decode_stream(&value)?),
                    TextTarget::Stderr => parsed.stderr.extend(decode_stream(&value)?),
                    TextTarget::ExitCode => parsed.exit_code = value.trim().parse().ok(),
                    TextTarget::FaultText => fault_parts.push(value),
                }
            }
            Ok(Event::End(element)) => {
                if element.local_name().as_ref() == b"Fault" {
                    in_fault = false;
                }
                target = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(TransportError::protocol(format!(
                    "malformed WS-Management response: {err}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !fault_parts.is_empty() {
        parsed.fault = Some(fault_parts.join(": "));
    }
    Ok(parsed)
}

fn decode_stream(value: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD
        .decode(value.trim())
        .map_err(|err| TransportError::from_error(FailureKind::TransportProtocolError, &err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ntlm::Role;

    #[test]
    fn envelope_carries_selector_and_options() {
        let envelope = build_envelope(
            "http://win:5985/wsman",
            ACTION_COMMAND,
            Some("ABC-123"),
            &[("WINRS_SKIP_CMD_SHELL", "FALSE")],
            "<rsp:CommandLine/>",
            20,
        );
        assert!(envelope.contains("<a:To>http://win:5985/wsman</a:To>"));
        assert!(envelope.contains("<w:Selector Name=\"ShellId\">ABC-123</w:Selector>"));
        assert!(envelope.contains("<w:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</w:Option>"));
        assert!(envelope.contains("<w:OperationTimeout>PT20S</w:OperationTimeout>"));
    }

    #[test]
    fn parses_receive_streams_and_exit_code() {
        let xml = format!(
            "<s:Envelope xmlns:s=\"s\" xmlns:rsp=\"r\"><s:Body><rsp:ReceiveResponse>\
             <rsp:Stream Name=\"stdout\" CommandId=\"C\">{}</rsp:Stream>\
             <rsp:Stream Name=\"stderr\" CommandId=\"C\">{}</rsp:Stream>\
             <rsp:Stream Name=\"stdout\" CommandId=\"C\" End=\"true\"></rsp:Stream>\
             <rsp:CommandState CommandId=\"C\" State=\"{STATE_DONE}\"><rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>\
             </rsp:ReceiveResponse></s:Body></s:Envelope>",
            STANDARD.encode("hello\r\n"),
            STANDARD.encode("oops"),
        );
        let parsed = parse_response(&xml).expect("valid response");
        assert_eq!(parsed.stdout, b"hello\r\n");
        assert_eq!(parsed.stderr, b"oops");
        assert!(parsed.done);
        assert_eq!(parsed.exit_code, Some(3));
    }

    #[test]
    fn parses_shell_id_from_selector() {
        let xml = "<s:Envelope xmlns:s=\"s\" xmlns:w=\"w\"><s:Header>\
                   <w:SelectorSet><w:Selector Name=\"ShellId\">11-22</w:Selector></w:SelectorSet>\
                   </s:Header><s:Body/></s:Envelope>";
        assert_eq!(
            parse_response(xml).expect("valid").shell_id.as_deref(),
            Some("11-22")
        );
    }

    #[test]
    fn faults_are_collected() {
        let xml = "<s:Envelope xmlns:s=\"s\"><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value>\
                   </s:Code><s:Reason><s:Text xml:lang=\"en-US\">Access is denied.</s:Text></s:Reason>\
                   </s:Fault></s:Body></s:Envelope>";
        let parsed = parse_response(xml).expect("valid");
        assert_eq!(parsed.fault.as_deref(), Some("s:Receiver: Access is denied."));
    }

    #[test]
    fn powershell_is_utf16_encoded() {
        let line = encode_powershell("whoami");
        let encoded = line.rsplit(' ').next().expect("has payload");
        let bytes = STANDARD.decode(encoded).expect("base64");
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let script = String::from_utf16(&units).expect("utf16");
        assert_eq!(script, "$ProgressPreference='SilentlyContinue';whoami");
    }

    #[test]
    fn upload_is_chunked() {
        let bytes = vec![7u8; UPLOAD_CHUNK_BYTES * 2 + 10];
        let scripts = upload_scripts(&bytes, "C:\\Windows\\Temp\\T1003\\bin\\tool.exe", false);
        assert_eq!(scripts.len(), 4);
        assert!(scripts[0].contains("-Path 'C:\\Windows\\Temp\\T1003\\bin'"));
        assert!(scripts[1].contains("[IO.FileMode]::Create"));
        assert!(scripts[3].contains("[IO.FileMode]::Append"));
    }

    fn sessions() -> (SessionSecurity, SessionSecurity) {
        let key = [0x42; 16];
        (
            SessionSecurity::new(&key, true, Role::Client).expect("client"),
            SessionSecurity::new(&key, true, Role::Server).expect("server"),
        )
    }

    #[test]
    fn sealed_replies_are_unwrapped() {
        let (mut client, mut server) = sessions();
        let reply = "<s:Envelope><s:Body/></s:Envelope>";
        let body = wrap_encrypted(&mut server, reply.as_bytes()).expect("wrap");

        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--Encrypted Boundary\r\n"));
        assert!(text.contains(&format!("Length={}\r\n", reply.len())));
        assert!(text.ends_with("--Encrypted Boundary--\r\n"));
        assert!(!text.contains("s:Envelope"));

        let plain = unwrap_encrypted(&mut client, &body).expect("unwrap");
        assert_eq!(plain, reply.as_bytes());
    }

    #[test]
    fn tampered_replies_are_rejected() {
        let (mut client, mut server) = sessions();
        let mut body = wrap_encrypted(&mut server, b"<s:Envelope/>").expect("wrap");
        let trailer = "--Encrypted Boundary--\r\n".len();
        let last = body.len() - trailer - 1;
        body[last] ^= 0x01;

        let err = unwrap_encrypted(&mut client, &body).expect_err("tampered");
        assert_eq!(err.kind, FailureKind::TransportProtocolError);
    }

    #[test]
    fn challenge_is_read_from_negotiate_header() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, "Basic realm=\"WSMAN\"".parse().expect("header"));
        let token = format!("Negotiate {}", STANDARD.encode(b"NTLMSSP\0"));
        headers.append(WWW_AUTHENTICATE, token.parse().expect("header"));
        assert_eq!(negotiate_token(&headers), Some(b"NTLMSSP\0".to_vec()));

        let mut content = HeaderMap::new();
        content.insert(CONTENT_TYPE, ENCRYPTED_CONTENT_TYPE.parse().expect("header"));
        assert!(is_encrypted(&content));
    }

    #[test]
    fn ntlm_seals_only_plain_http() {
        let mut host = Host::new("win01");
        host.username = Some("CORP\\admin".to_string());
        host.password = Some("pw".to_string());
        let transport = WinRmTransport::new(&host).expect("transport");
        assert!(matches!(transport.auth, Auth::Ntlm { seal: true, .. }));
        assert!(transport.endpoint.starts_with("http://"));

        host.verify_ssl = true;
        let transport = WinRmTransport::new(&host).expect("transport");
        assert!(matches!(transport.auth, Auth::Ntlm { seal: false, .. }));

        host.winrm_auth = WinRmAuth::Basic;
        let transport = WinRmTransport::new(&host).expect("transport");
        assert!(matches!(transport.auth, Auth::Basic { .. }));
    }

    #[test]
    fn winrm_requires_password() {
        let mut host = Host::new("win01");
        host.username = Some("Administrator".to_string());
        let err = match WinRmTransport::new(&host) {
            Ok(_) => panic!("password is required"),
            Err(err) => err,
        };
        assert_eq!(err.kind, FailureKind::AuthenticationFailed);
    }
}
