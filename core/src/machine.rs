//! Per-command execution state machine.
//!
//! Every command a test needs (prerequisite checks, the command itself,
//! cleanup) goes through the same states:
//!
//! `Created -> FileTransfer (remote only) -> Invoked -> ResultParsed`
//!
//! Any state may end the run early with a classified failure. Failures are
//! returned as results and never propagated to the caller.

use crate::config::RunConfiguration;
use crate::error::{FailureKind, TransportError};
use crate::formatter::{format_command, replace_content_root, CONTENT_ROOT_TOKEN};
use crate::model::{ExecutorKind, Host, InputArgument, ShellFlavor, TestDefinition};
use crate::results::{ExecutionResult, Phase, ResultStatus, Timing, LOCAL_HOST_ID};
use crate::transport::local::COMMAND_NOT_FOUND;
use crate::transport::{
    clixml, Channel, Invocation, RawResponse, SessionTarget, Strategy, Transport,
    TransportFactory,
};
use regex::Regex;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SKIPPED_SOURCE_EXTENSIONS: &[&str] = &["yaml", "md"];

/// One command a test needs on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub phase: Phase,
    pub template: String,
    pub executor: ExecutorKind,
    pub elevation: bool,
}

/// The commands a test runs under the current flags, in order.
pub fn planned_commands(config: &RunConfiguration, test: &TestDefinition) -> Vec<CommandRequest> {
    let elevation = test.executor.elevation_required;
    let mut commands = Vec::new();

    if config.check_prereqs() || config.get_prereqs() {
        let executor = test.dependency_executor_kind().clone();
        for dependency in &test.dependencies {
            debug!(test = %test.guid, description = %dependency.description, "dependency");
            let get = dependency
                .get_prereq_command
                .as_deref()
                .filter(|_| config.get_prereqs());
            let check = dependency.prereq_command.as_deref();
            for (phase, template) in [(Phase::GetPrereqs, get), (Phase::Prereq, check)] {
                if let Some(template) = template.filter(|t| !t.trim().is_empty()) {
                    commands.push(CommandRequest {
                        phase,
                        template: template.to_string(),
                        executor: executor.clone(),
                        elevation,
                    });
                }
            }
        }
    }

    commands.push(CommandRequest {
        phase: Phase::Command,
        template: test.executor.command.clone(),
        executor: test.executor.kind.clone(),
        elevation,
    });

    if config.cleanup() {
        if let Some(cleanup) = test
            .executor
            .cleanup_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            commands.push(CommandRequest {
                phase: Phase::Cleanup,
                template: cleanup.to_string(),
                executor: test.executor.kind.clone(),
                elevation,
            });
        }
    }

    commands
}

/// Lazily opened transport sessions for one (test, host) pair, one per
/// channel. A channel that failed to open keeps failing with the same error.
pub struct SessionPool<'a> {
    factory: &'a dyn TransportFactory,
    host: Option<&'a Host>,
    workdir: &'a Path,
    open: HashMap<Channel, Box<dyn Transport>>,
    failed: HashMap<Channel, TransportError>,
}

impl<'a> SessionPool<'a> {
    pub fn new(
        factory: &'a dyn TransportFactory,
        host: Option<&'a Host>,
        workdir: &'a Path,
    ) -> Self {
        Self {
            factory,
            host,
            workdir,
            open: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub async fn session(
        &mut self,
        channel: Channel,
    ) -> Result<&mut Box<dyn Transport>, TransportError> {
        if let Some(err) = self.failed.get(&channel) {
            return Err(err.clone());
        }
        if !self.open.contains_key(&channel) {
            let target = SessionTarget {
                channel,
                host: self.host,
                workdir: self.workdir,
            };
            match self.factory.open(target).await {
                Ok(transport) => {
                    self.open.insert(channel, transport);
                }
                Err(err) => {
                    self.failed.insert(channel, err.clone());
                    return Err(err);
                }
            }
        }
        self.open
            .get_mut(&channel)
            .ok_or_else(|| TransportError::protocol(format!("{channel} session is not open")))
    }

    pub async fn close(&mut self) {
        for (channel, mut transport) in self.open.drain() {
            debug!(%channel, "closing session");
            transport.close().await;
        }
    }
}

enum State {
    Created,
    FileTransfer { strategy: Strategy, channel: Channel },
    Invoked { strategy: Strategy, channel: Channel, command: String },
    ResultParsed { command: String, raw: RawResponse },
    Done(ExecutionResult),
}

pub struct Machine<'a> {
    config: &'a RunConfiguration,
    test: &'a TestDefinition,
    host: Option<&'a Host>,
    host_id: String,
    sessions: SessionPool<'a>,
    staged: HashMap<Channel, Vec<InputArgument>>,
    cancel: &'a CancellationToken,
    warnings: Vec<String>,
}

impl<'a> Machine<'a> {
    pub fn new(
        config: &'a RunConfiguration,
        test: &'a TestDefinition,
        host: Option<&'a Host>,
        factory: &'a dyn TransportFactory,
        workdir: &'a Path,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            test,
            host,
            host_id: host_id(host).to_string(),
            sessions: SessionPool::new(factory, host, workdir),
            staged: HashMap::new(),
            cancel,
            warnings: Vec::new(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Warnings raised since the last call; missing source files and
    /// unsupported executors end up here.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub async fn execute(&mut self, request: &CommandRequest) -> ExecutionResult {
        let timing = Timing::start();
        let mut state = State::Created;
        loop {
            state = match state {
                State::Created => self.on_created(request, &timing),
                State::FileTransfer { strategy, channel } => {
                    self.on_file_transfer(request, strategy, channel, &timing)
                        .await
                }
                State::Invoked {
                    strategy,
                    channel,
                    command,
                } => {
                    self.on_invoked(request, strategy, channel, command, &timing)
                        .await
                }
                State::ResultParsed { command, raw } => {
                    State::Done(parse_result(command, &raw, &request.executor, &timing))
                }
                State::Done(result) => {
                    self.log_result(request, &result);
                    return result;
                }
            };
        }
    }

    pub async fn finish(mut self) {
        self.sessions.close().await;
    }

    fn on_created(&mut self, request: &CommandRequest, timing: &Timing) -> State {
        let strategy = Strategy::select(&request.executor, self.host);
        debug!(
            test = %self.test.guid,
            host = %self.host_id,
            ?strategy,
            phase = %request.phase,
            "strategy selected"
        );

        let channel = strategy.channel();
        match (strategy, channel) {
            (Strategy::Manual, _) => {
                let text = match (request.phase, self.test.executor.steps.as_deref()) {
                    (Phase::Command, Some(steps)) if !steps.trim().is_empty() => steps,
                    _ => request.template.as_str(),
                };
                State::Done(ExecutionResult::manual(text.trim(), timing))
            }
            (Strategy::Unsupported { reason }, _) => {
                self.warnings.push(reason.clone());
                State::Done(self.fail(
                    &request.template,
                    TransportError::new(FailureKind::UnsupportedExecutor, reason),
                    timing,
                ))
            }
            (strategy, Some(channel)) if self.stages_files(channel) => {
                State::FileTransfer { strategy, channel }
            }
            (strategy, Some(channel)) => State::Invoked {
                command: self.format(request, channel),
                strategy,
                channel,
            },
            (_, None) => State::Done(self.fail(
                &request.template,
                TransportError::new(
                    FailureKind::UnsupportedExecutor,
                    format!("no transport for executor '{}'", request.executor),
                ),
                timing,
            )),
        }
    }

    async fn on_file_transfer(
        &mut self,
        request: &CommandRequest,
        strategy: Strategy,
        channel: Channel,
        timing: &Timing,
    ) -> State {
        if !self.staged.contains_key(&channel) {
            match self.stage_inputs(channel).await {
                Ok(inputs) => {
                    self.staged.insert(channel, inputs);
                }
                Err(err) => return State::Done(self.fail(&request.template, err, timing)),
            }
        }
        State::Invoked {
            command: self.format(request, channel),
            strategy,
            channel,
        }
    }

    async fn on_invoked(
        &mut self,
        request: &CommandRequest,
        strategy: Strategy,
        channel: Channel,
        command: String,
        timing: &Timing,
    ) -> State {
        let timeout = self.config.command_timeout();
        let transport = match self.sessions.session(channel).await {
            Ok(transport) => transport,
            Err(err) => {
                return State::Done(ExecutionResult::failed(command, &self.host_id, err, timing))
            }
        };

        if let Strategy::CloudCli { cli } = &strategy {
            let version_check = format!("{cli} --version");
            let shell = ExecutorKind::Shell {
                flavor: ShellFlavor::Sh,
            };
            let outcome = transport
                .execute(Invocation {
                    command: &version_check,
                    executor: &shell,
                    timeout,
                    cancel: self.cancel,
                })
                .await;
            match outcome {
                Ok(raw) if raw.exit_code == 0 => {
                    let version = String::from_utf8_lossy(&raw.stdout);
                    debug!(cli = %cli, version = %version.trim(), "cloud cli available");
                }
                Ok(_) => {
                    warn!(cli = %cli, "cloud cli is not installed or not on PATH");
                    return State::ResultParsed {
                        command,
                        raw: RawResponse {
                            stdout: Vec::new(),
                            stderr: format!("cloud cli '{cli}' is not available").into_bytes(),
                            exit_code: COMMAND_NOT_FOUND,
                        },
                    };
                }
                Err(err) => {
                    return State::Done(ExecutionResult::failed(command, &self.host_id, err, timing))
                }
            }
        }

        info!(
            test = %self.test.name,
            host = %self.host_id,
            phase = %request.phase,
            "running command"
        );
        let outcome = transport
            .execute(Invocation {
                command: &command,
                executor: &request.executor,
                timeout,
                cancel: self.cancel,
            })
            .await;
        match outcome {
            Ok(raw) => State::ResultParsed { command, raw },
            Err(err) => State::Done(ExecutionResult::failed(command, &self.host_id, err, timing)),
        }
    }

    fn stages_files(&self, channel: Channel) -> bool {
        self.config.copy_source_files() && channel.staging_root().is_some()
    }

    fn content_root_for(&self, channel: Channel) -> String {
        match channel.staging_root() {
            Some(root) if self.config.copy_source_files() => root.to_string(),
            _ => self.config.content_root_str(),
        }
    }

    fn format(&self, request: &CommandRequest, channel: Channel) -> String {
        let inputs = self
            .staged
            .get(&channel)
            .unwrap_or(&self.test.input_arguments);
        format_command(
            &request.template,
            inputs,
            &self.content_root_for(channel),
            &request.executor,
            request.elevation,
        )
    }

    /// Copies every input that points into the content root to the
    /// channel's staging root and rewrites the input to the remote path.
    async fn stage_inputs(
        &mut self,
        channel: Channel,
    ) -> Result<Vec<InputArgument>, TransportError> {
        let mut inputs = self.test.input_arguments.clone();
        let Some(staging_root) = channel.staging_root() else {
            return Ok(inputs);
        };
        let content_root = self.config.content_root();
        let local_root = self.config.content_root_str();
        let elevated = self.test.executor.elevation_required;

        for input in &mut inputs {
            let Some(value) = input.resolved_string() else {
                continue;
            };
            if !references_content_root(&value, &local_root) {
                continue;
            }
            let source =
                PathBuf::from(native_separators(&replace_content_root(&value, &local_root)));
            if !source.exists() {
                let message = format!(
                    "source file {} for input '{}' does not exist",
                    source.display(),
                    input.name
                );
                warn!(test = %self.test.guid, host = %self.host_id, "{message}");
                self.warnings.push(message);
                continue;
            }

            let destination = remote_path(&source, content_root, staging_root, channel.separator());
            let files = collect_files(&source, &destination, channel.separator());
            let transport = self.sessions.session(channel).await?;
            for (file, remote) in &files {
                transport.upload(file, remote, elevated).await?;
            }
            info!(
                input = %input.name,
                destination = %destination,
                files = files.len(),
                host = %self.host_id,
                "staged source files"
            );
            input.value = Some(Value::String(destination));
        }
        Ok(inputs)
    }

    fn fail(&self, command: &str, err: TransportError, timing: &Timing) -> ExecutionResult {
        ExecutionResult::failed(command, &self.host_id, err, timing)
    }

    fn log_result(&self, request: &CommandRequest, result: &ExecutionResult) {
        match (&result.failure, result.status) {
            (Some(failure), _) => warn!(
                test = %self.test.name,
                host = %self.host_id,
                phase = %request.phase,
                kind = %failure.kind,
                error = %failure.message,
                "command failed"
            ),
            (None, ResultStatus::CommandNotFound | ResultStatus::NonZeroExit) => warn!(
                test = %self.test.name,
                host = %self.host_id,
                phase = %request.phase,
                return_code = ?result.return_code,
                "command exited unsuccessfully"
            ),
            _ => debug!(
                test = %self.test.name,
                host = %self.host_id,
                phase = %request.phase,
                status = %result.status,
                duration_ms = result.duration_ms,
                "command finished"
            ),
        }
    }
}

pub fn host_id(host: Option<&Host>) -> &str {
    host.map(|host| host.hostname.as_str()).unwrap_or(LOCAL_HOST_ID)
}

/// True when `value` names the content root token or a path under the local
/// content root. A sibling such as `/opt/atomics2` is not under `/opt/atomics`.
fn references_content_root(value: &str, local_root: &str) -> bool {
    if value.contains(CONTENT_ROOT_TOKEN) {
        return true;
    }
    if local_root.is_empty() {
        return false;
    }
    let root = local_root.trim_end_matches(['/', '\\']);
    value
        .strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '\\']))
}

fn native_separators(path: &str) -> String {
    if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.replace('\\', "/")
    }
}

/// Maps a local path under the content root to the same relative path under
/// the staging root, using the target's separator.
fn remote_path(source: &Path, content_root: &Path, staging_root: &str, separator: char) -> String {
    let relative: Vec<String> = match source.strip_prefix(content_root) {
        Ok(relative) => relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect(),
        Err(_) => source
            .file_name()
            .map(|name| vec![name.to_string_lossy().into_owned()])
            .unwrap_or_default(),
    };
    let mut destination = staging_root.to_string();
    for part in relative {
        destination.push(separator);
        destination.push_str(&part);
    }
    destination
}

/// Files to upload for one source path. Directories are walked recursively
/// and definition/documentation files left behind.
fn collect_files(source: &Path, destination: &str, separator: char) -> Vec<(PathBuf, String)> {
    if source.is_file() {
        return vec![(source.to_path_buf(), destination.to_string())];
    }

    WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable source entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let extension = entry
                .path()
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
            !matches!(extension.as_deref(), Some(ext) if SKIPPED_SOURCE_EXTENSIONS.contains(&ext))
        })
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(source).ok()?;
            let mut remote = destination.to_string();
            for component in relative.components() {
                remote.push(separator);
                remote.push_str(&component.as_os_str().to_string_lossy());
            }
            Some((entry.path().to_path_buf(), remote))
        })
        .collect()
}

fn console_noise() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)Microsoft Windows \[version .+\]\r?\nCopyright.*(\r?\n)+[A-Z]:.+?>",
            r"(\r?\n)*[A-Z]:.+?>",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn strip_console_noise(text: &str) -> String {
    console_noise()
        .iter()
        .fold(text.to_string(), |acc, pattern| {
            pattern.replace_all(&acc, "").into_owned()
        })
}

/// Decodes and cleans both streams. Windows executors lose their console
/// banner and prompts; PowerShell CLIXML on stderr becomes `[stream] message`
/// lines, which also stand in for an empty stdout.
pub fn normalize_output(raw: &RawResponse, executor: &ExecutorKind) -> (String, String) {
    let mut output = String::from_utf8_lossy(&raw.stdout).into_owned();
    let mut error = String::from_utf8_lossy(&raw.stderr).into_owned();

    let serialized = matches!(executor, ExecutorKind::PowerShell) && clixml::is_clixml(&error);
    if matches!(executor, ExecutorKind::CommandPrompt | ExecutorKind::PowerShell) {
        output = strip_console_noise(&output);
        if !serialized {
            error = strip_console_noise(&error);
        }
    }

    if serialized {
        match clixml::parse(&error) {
            Ok(records) => {
                error = clixml::render(&records);
                if output.trim().is_empty() {
                    output = error.clone();
                }
            }
            Err(err) => debug!(error = %err, "leaving unparseable CLIXML as-is"),
        }
    }

    (output.trim().to_string(), error.trim().to_string())
}

pub fn parse_result(
    command: String,
    raw: &RawResponse,
    executor: &ExecutorKind,
    timing: &Timing,
) -> ExecutionResult {
    let (output, error) = normalize_output(raw, executor);
    let status = match raw.exit_code {
        0 => ResultStatus::Succeeded,
        COMMAND_NOT_FOUND => ResultStatus::CommandNotFound,
        _ => ResultStatus::NonZeroExit,
    };
    ExecutionResult {
        command,
        output,
        error,
        return_code: Some(raw.exit_code),
        status,
        failure: None,
        started_at: timing.started_at(),
        duration_ms: timing.elapsed_ms(),
    }
}
