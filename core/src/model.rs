use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const CLOUD_PLATFORM_PREFIX: &str = "iaas:";
pub const CLOUD_LOCAL_PLATFORMS: &[&str] = &["linux", "macos"];
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_WINRM_PORT: u16 = 5985;
pub const DEFAULT_WINRM_TLS_PORT: u16 = 5986;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

pub fn local_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellFlavor {
    Sh,
    Bash,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorKind {
    Shell { flavor: ShellFlavor },
    CommandPrompt,
    PowerShell,
    Manual,
    CloudCli { cli: String },
}

impl ExecutorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sh" | "ssh" => Some(ExecutorKind::Shell {
                flavor: ShellFlavor::Sh,
            }),
            "bash" => Some(ExecutorKind::Shell {
                flavor: ShellFlavor::Bash,
            }),
            "command_prompt" | "cmd" => Some(ExecutorKind::CommandPrompt),
            "powershell" | "pwsh" | "psh" => Some(ExecutorKind::PowerShell),
            "manual" => Some(ExecutorKind::Manual),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ExecutorKind::Shell {
                flavor: ShellFlavor::Sh,
            } => "sh",
            ExecutorKind::Shell {
                flavor: ShellFlavor::Bash,
            } => "bash",
            ExecutorKind::CommandPrompt => "command_prompt",
            ExecutorKind::PowerShell => "powershell",
            ExecutorKind::Manual => "manual",
            ExecutorKind::CloudCli { cli } => cli.as_str(),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, ExecutorKind::Manual)
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::CloudCli { cli } => write!(f, "cloud ({cli})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    #[serde(flatten)]
    pub kind: ExecutorKind,
    pub command: String,
    #[serde(default)]
    pub cleanup_command: Option<String>,
    #[serde(default)]
    pub elevation_required: bool,
    #[serde(default)]
    pub steps: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

impl InputArgument {
    pub fn resolved(&self) -> Option<&Value> {
        self.value.as_ref().or(self.default.as_ref())
    }

    pub fn resolved_string(&self) -> Option<String> {
        self.resolved().and_then(stringify_value)
    }
}

pub fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => stringify_value(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prereq_command: Option<String>,
    #[serde(default)]
    pub get_prereq_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub supported_platforms: Vec<String>,
    pub executor: Executor,
    #[serde(default)]
    pub input_arguments: Vec<InputArgument>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub dependency_executor: Option<ExecutorKind>,
}

impl TestDefinition {
    pub fn input(&self, name: &str) -> Option<&InputArgument> {
        self.input_arguments.iter().find(|arg| arg.name == name)
    }

    pub fn cloud_platforms(&self) -> impl Iterator<Item = &str> {
        self.supported_platforms
            .iter()
            .map(String::as_str)
            .filter(|platform| platform.starts_with(CLOUD_PLATFORM_PREFIX))
    }

    pub fn is_cloud(&self) -> bool {
        self.cloud_platforms().next().is_some()
    }

    pub fn supports_platform(&self, platform: &str) -> bool {
        self.supported_platforms
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(platform))
    }

    /// Whether the test may run on the machine identified by `platform`
    /// without a remote host. Cloud tests run through their CLI from any
    /// posix-like workstation.
    pub fn runs_locally_on(&self, platform: &str) -> bool {
        if self.is_cloud() && CLOUD_LOCAL_PLATFORMS.contains(&platform) {
            return true;
        }
        self.supports_platform(platform)
    }

    pub fn dependency_executor_kind(&self) -> &ExecutorKind {
        self.dependency_executor
            .as_ref()
            .unwrap_or(&self.executor.kind)
    }

    /// Applies overrides by argument name and returns the keys that matched
    /// no declared argument.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Vec<String> {
        let mut unmatched = Vec::new();
        for (key, value) in overrides {
            match self
                .input_arguments
                .iter_mut()
                .find(|argument| &argument.name == key)
            {
                Some(argument) => argument.value = Some(value.clone()),
                None => unmatched.push(key.clone()),
            }
        }
        unmatched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Atomic,
    Emulation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniquePlan {
    pub id: String,
    pub display_name: String,
    pub kind: PlanKind,
    pub path: PathBuf,
    pub tests: Vec<TestDefinition>,
}

impl TechniquePlan {
    pub fn test(&self, guid: &str) -> Option<&TestDefinition> {
        self.tests.iter().find(|test| test.guid == guid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    Ssh,
    WinRm,
}

impl RemoteProtocol {
    pub fn from_executor_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ssh" | "sh" | "bash" => Some(RemoteProtocol::Ssh),
            "winrm" | "powershell" | "pwsh" | "cmd" | "command_prompt" => {
                Some(RemoteProtocol::WinRm)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RemoteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteProtocol::Ssh => write!(f, "ssh"),
            RemoteProtocol::WinRm => write!(f, "winrm"),
        }
    }
}

/// How WinRM requests authenticate. NTLM is what a stock listener accepts;
/// Basic has to be enabled on the service explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinRmAuth {
    #[default]
    Ntlm,
    Basic,
}

impl std::str::FromStr for WinRmAuth {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ntlm" | "negotiate" => Ok(WinRmAuth::Ntlm),
            "basic" => Ok(WinRmAuth::Basic),
            other => Err(format!("unknown winrm authentication '{other}'")),
        }
    }
}

impl fmt::Display for WinRmAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WinRmAuth::Ntlm => write!(f, "ntlm"),
            WinRmAuth::Basic => write!(f, "basic"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    pub verify_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<RemoteProtocol>,
    pub winrm_auth: WinRmAuth,
}

pub enum AuthMethod<'a> {
    KeyPath(&'a Path),
    KeyMaterial(&'a str),
    Password(&'a str),
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            password: None,
            ssh_key_path: None,
            private_key: None,
            verify_ssl: false,
            port: None,
            timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            protocol: None,
            winrm_auth: WinRmAuth::default(),
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    pub fn winrm_port(&self) -> u16 {
        match self.port {
            Some(port) if port != DEFAULT_SSH_PORT => port,
            _ if self.verify_ssl => DEFAULT_WINRM_TLS_PORT,
            _ => DEFAULT_WINRM_PORT,
        }
    }

    /// Authentication methods in the order they are attempted: key file,
    /// in-memory key, password.
    pub fn auth_methods(&self) -> Vec<AuthMethod<'_>> {
        let mut methods = Vec::new();
        if let Some(path) = &self.ssh_key_path {
            methods.push(AuthMethod::KeyPath(path.as_path()));
        }
        if let Some(key) = self.private_key.as_deref().filter(|k| !k.is_empty()) {
            methods.push(AuthMethod::KeyMaterial(key));
        }
        if let Some(password) = self.password.as_deref() {
            methods.push(AuthMethod::Password(password));
        }
        methods
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssh_key_path", &self.ssh_key_path)
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("verify_ssl", &self.verify_ssl)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("protocol", &self.protocol)
            .field("winrm_auth", &self.winrm_auth)
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}", user, self.hostname),
            None => write!(f, "{}", self.hostname),
        }
    }
}
