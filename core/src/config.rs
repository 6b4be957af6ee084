use crate::error::{ContentError, InputError, OperatorError};
use crate::model::{Host, RemoteProtocol, WinRmAuth, DEFAULT_CONNECT_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 20;

/// Process-wide settings for one `run` invocation. Built once through
/// [`RunConfigurationBuilder`] and shared read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfiguration {
    content_root: PathBuf,
    check_prereqs: bool,
    get_prereqs: bool,
    cleanup: bool,
    copy_source_files: bool,
    prompt_for_inputs: bool,
    command_timeout: u64,
    max_concurrency: usize,
    input_overrides: BTreeMap<String, Value>,
}

impl RunConfiguration {
    pub fn builder(content_root: impl Into<PathBuf>) -> RunConfigurationBuilder {
        RunConfigurationBuilder {
            content_root: content_root.into(),
            check_prereqs: false,
            get_prereqs: false,
            cleanup: false,
            copy_source_files: true,
            prompt_for_inputs: false,
            command_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
            max_concurrency: 1,
            input_overrides: BTreeMap::new(),
        }
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn content_root_str(&self) -> String {
        self.content_root.to_string_lossy().to_string()
    }

    pub fn check_prereqs(&self) -> bool {
        self.check_prereqs
    }

    pub fn get_prereqs(&self) -> bool {
        self.get_prereqs
    }

    pub fn cleanup(&self) -> bool {
        self.cleanup
    }

    pub fn copy_source_files(&self) -> bool {
        self.copy_source_files
    }

    pub fn prompt_for_inputs(&self) -> bool {
        self.prompt_for_inputs
    }

    pub fn command_timeout_secs(&self) -> u64 {
        self.command_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn input_overrides(&self) -> &BTreeMap<String, Value> {
        &self.input_overrides
    }
}

#[derive(Debug, Clone)]
pub struct RunConfigurationBuilder {
    content_root: PathBuf,
    check_prereqs: bool,
    get_prereqs: bool,
    cleanup: bool,
    copy_source_files: bool,
    prompt_for_inputs: bool,
    command_timeout: u64,
    max_concurrency: usize,
    input_overrides: BTreeMap<String, Value>,
}

impl RunConfigurationBuilder {
    pub fn check_prereqs(mut self, enabled: bool) -> Self {
        self.check_prereqs = enabled;
        self
    }

    pub fn get_prereqs(mut self, enabled: bool) -> Self {
        self.get_prereqs = enabled;
        self
    }

    pub fn cleanup(mut self, enabled: bool) -> Self {
        self.cleanup = enabled;
        self
    }

    pub fn copy_source_files(mut self, enabled: bool) -> Self {
        self.copy_source_files = enabled;
        self
    }

    pub fn prompt_for_inputs(mut self, enabled: bool) -> Self {
        self.prompt_for_inputs = enabled;
        self
    }

    pub fn command_timeout(mut self, seconds: u64) -> Self {
        self.command_timeout = seconds;
        self
    }

    pub fn max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    pub fn input_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_overrides.insert(key.into(), value.into());
        self
    }

    pub fn input_overrides(mut self, overrides: BTreeMap<String, Value>) -> Self {
        self.input_overrides.extend(overrides);
        self
    }

    pub fn build(self) -> Result<RunConfiguration, OperatorError> {
        let mut enabled = Vec::new();
        if self.check_prereqs {
            enabled.push("check_prereqs");
        }
        if self.get_prereqs {
            enabled.push("get_prereqs");
        }
        if self.cleanup {
            enabled.push("cleanup");
        }
        if enabled.len() > 1 {
            return Err(InputError::ConflictingFlags(enabled).into());
        }
        if self.command_timeout == 0 {
            return Err(InputError::ZeroTimeout.into());
        }
        if self.max_concurrency == 0 {
            return Err(InputError::ZeroConcurrency.into());
        }

        let expanded = expand_path(&self.content_root);
        let content_root = fs::canonicalize(&expanded)
            .map_err(|_| ContentError::NotFound { path: expanded })?;

        Ok(RunConfiguration {
            content_root,
            check_prereqs: self.check_prereqs,
            get_prereqs: self.get_prereqs,
            cleanup: self.cleanup,
            copy_source_files: self.copy_source_files,
            prompt_for_inputs: self.prompt_for_inputs,
            command_timeout: self.command_timeout,
            max_concurrency: self.max_concurrency,
            input_overrides: self.input_overrides,
        })
    }
}

pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') {
            if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))
            {
                let mut expanded = PathBuf::from(home);
                let trimmed = rest.trim_start_matches(['/', '\\']);
                if !trimmed.is_empty() {
                    expanded.push(trimmed);
                }
                return expanded;
            }
        }
    }
    path.to_path_buf()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub inventory: BTreeMap<String, InventoryDefinition>,
    #[serde(default)]
    pub atomic_tests: Vec<TestBinding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryDefinition {
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing)]
    pub private_key_string: Option<String>,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub winrm_auth: WinRmAuth,
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authentication")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssh_key_path", &self.ssh_key_path)
            .field(
                "private_key_string",
                &self.private_key_string.as_ref().map(|_| "***"),
            )
            .field("verify_ssl", &self.verify_ssl)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("winrm_auth", &self.winrm_auth)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestBinding {
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub technique: Option<String>,
    #[serde(default)]
    pub input_arguments: BTreeMap<String, InputOverride>,
    #[serde(default)]
    pub inventories: Vec<String>,
}

impl TestBinding {
    fn label(&self) -> String {
        self.guid
            .clone()
            .or_else(|| self.technique.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputOverride {
    Explicit { value: Value },
    Bare(Value),
}

impl InputOverride {
    pub fn value(&self) -> &Value {
        match self {
            InputOverride::Explicit { value } => value,
            InputOverride::Bare(value) => value,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, InputError> {
        let path = expand_path(path);
        if !path.exists() {
            return Err(InputError::ConfigNotFound { path });
        }
        let content = fs::read_to_string(&path).map_err(|source| InputError::ConfigIo {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(source: &str) -> Result<Self, InputError> {
        let config: ConfigFile = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), InputError> {
        if self.atomic_tests.is_empty() {
            return Err(InputError::ConfigEmpty);
        }
        for (name, inventory) in &self.inventory {
            if let Some(executor) = &inventory.executor {
                if RemoteProtocol::from_executor_name(executor).is_none() {
                    return Err(InputError::UnknownInventoryExecutor {
                        name: name.clone(),
                        executor: executor.clone(),
                    });
                }
            }
        }
        for binding in &self.atomic_tests {
            if binding.guid.is_none() && binding.technique.is_none() {
                return Err(InputError::UnboundConfigEntry);
            }
            for inventory in &binding.inventories {
                if !self.inventory.contains_key(inventory) {
                    return Err(InputError::UnknownInventory {
                        entry: binding.label(),
                        inventory: inventory.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn guids(&self) -> impl Iterator<Item = &str> {
        self.atomic_tests
            .iter()
            .filter_map(|binding| binding.guid.as_deref())
    }

    pub fn techniques(&self) -> impl Iterator<Item = &str> {
        self.atomic_tests
            .iter()
            .filter(|binding| binding.guid.is_none())
            .filter_map(|binding| binding.technique.as_deref())
    }

    pub fn inventory_hosts(&self, name: &str) -> Vec<Host> {
        let Some(inventory) = self.inventory.get(name) else {
            return Vec::new();
        };
        let auth = &inventory.authentication;
        let protocol = inventory
            .executor
            .as_deref()
            .and_then(RemoteProtocol::from_executor_name);
        inventory
            .hosts
            .iter()
            .map(|hostname| Host {
                hostname: hostname.clone(),
                username: auth.username.clone(),
                password: auth.password.clone(),
                ssh_key_path: auth.ssh_key_path.as_deref().map(expand_path),
                private_key: auth.private_key_string.clone(),
                verify_ssl: auth.verify_ssl,
                port: auth.port,
                timeout: auth.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
                protocol,
                winrm_auth: auth.winrm_auth,
            })
            .collect()
    }

    /// Hosts bound to a test GUID through its entry's inventories, in
    /// inventory order. Empty when the GUID has no binding.
    pub fn hosts_for_guid(&self, guid: &str) -> Vec<Host> {
        self.bindings_for_guid(guid)
            .flat_map(|binding| binding.inventories.iter())
            .flat_map(|inventory| self.inventory_hosts(inventory))
            .collect()
    }

    pub fn hosts_for_technique(&self, technique: &str) -> Vec<Host> {
        self.bindings_for_technique(technique)
            .flat_map(|binding| binding.inventories.iter())
            .flat_map(|inventory| self.inventory_hosts(inventory))
            .collect()
    }

    pub fn inputs_for_guid(&self, guid: &str) -> BTreeMap<String, Value> {
        collect_inputs(self.bindings_for_guid(guid))
    }

    pub fn inputs_for_technique(&self, technique: &str) -> BTreeMap<String, Value> {
        collect_inputs(self.bindings_for_technique(technique))
    }

    fn bindings_for_guid<'a>(&'a self, guid: &'a str) -> impl Iterator<Item = &'a TestBinding> {
        self.atomic_tests
            .iter()
            .filter(move |binding| binding.guid.as_deref() == Some(guid))
    }

    fn bindings_for_technique<'a>(
        &'a self,
        technique: &'a str,
    ) -> impl Iterator<Item = &'a TestBinding> {
        self.atomic_tests.iter().filter(move |binding| {
            binding.guid.is_none()
                && binding
                    .technique
                    .as_deref()
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(technique))
        })
    }
}

fn collect_inputs<'a>(bindings: impl Iterator<Item = &'a TestBinding>) -> BTreeMap<String, Value> {
    let mut inputs = BTreeMap::new();
    for binding in bindings {
        for (key, value) in &binding.input_arguments {
            inputs.insert(key.clone(), value.value().clone());
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
inventory:
  linux1:
    executor: ssh
    authentication:
      username: root
      password: secret
      port: 2222
      timeout: 3
    hosts:
      - 10.32.100.199
      - 10.32.100.200
atomic_tests:
  - guid: f7e6ec05-c19e-4a80-a7e7-241027992fdb
    input_arguments:
      output_file:
        value: custom_output.txt
      input_file: custom_input.txt
  - guid: 32f90516-4bc9-43bd-b18d-2cbe0b7ca9b2
    inventories:
      - linux1
  - technique: T1003
    inventories:
      - linux1
"#;

    #[test]
    fn parses_inventories_and_bindings() {
        let config = ConfigFile::from_yaml(SAMPLE).expect("config parses");

        let hosts = config.hosts_for_guid("32f90516-4bc9-43bd-b18d-2cbe0b7ca9b2");
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].hostname, "10.32.100.199");
        assert_eq!(hosts[0].username.as_deref(), Some("root"));
        assert_eq!(hosts[0].port, Some(2222));
        assert_eq!(hosts[0].timeout, 3);
        assert_eq!(hosts[0].protocol, Some(RemoteProtocol::Ssh));

        assert_eq!(config.hosts_for_technique("t1003").len(), 2);
        assert!(config
            .hosts_for_guid("f7e6ec05-c19e-4a80-a7e7-241027992fdb")
            .is_empty());
    }

    #[test]
    fn winrm_inventories_default_to_ntlm() {
        let config = ConfigFile::from_yaml(
            r#"
inventory:
  windows_ntlm:
    executor: winrm
    authentication: {username: 'CORP\admin', password: pw}
    hosts: [w1]
  windows_basic:
    executor: winrm
    authentication: {username: admin, password: pw, winrm_auth: basic}
    hosts: [w2]
atomic_tests:
  - technique: T1059
    inventories: [windows_ntlm, windows_basic]
"#,
        )
        .expect("config parses");

        let hosts = config.hosts_for_technique("T1059");
        assert_eq!(hosts[0].winrm_auth, WinRmAuth::Ntlm);
        assert_eq!(hosts[0].username.as_deref(), Some("CORP\\admin"));
        assert_eq!(hosts[1].winrm_auth, WinRmAuth::Basic);
    }

    #[test]
    fn accepts_explicit_and_bare_input_values() {
        let config = ConfigFile::from_yaml(SAMPLE).expect("config parses");
        let inputs = config.inputs_for_guid("f7e6ec05-c19e-4a80-a7e7-241027992fdb");
        assert_eq!(
            inputs.get("output_file"),
            Some(&Value::String("custom_output.txt".to_string()))
        );
        assert_eq!(
            inputs.get("input_file"),
            Some(&Value::String("custom_input.txt".to_string()))
        );
    }

    #[test]
    fn rejects_undefined_inventory_reference() {
        let source = r#"
atomic_tests:
  - guid: abc
    inventories: [missing]
"#;
        let err = ConfigFile::from_yaml(source).expect_err("inventory is undefined");
        assert!(matches!(err, InputError::UnknownInventory { .. }));
    }

    #[test]
    fn rejects_config_without_tests() {
        let err = ConfigFile::from_yaml("inventory: {}\n").expect_err("no tests");
        assert!(matches!(err, InputError::ConfigEmpty));
    }

    #[test]
    fn builder_rejects_conflicting_modes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunConfiguration::builder(dir.path())
            .check_prereqs(true)
            .cleanup(true)
            .build()
            .expect_err("flags conflict");
        assert!(matches!(
            err,
            OperatorError::Input(InputError::ConflictingFlags(_))
        ));
    }

    #[test]
    fn builder_requires_existing_content_root() {
        let err = RunConfiguration::builder("/definitely/not/here")
            .build()
            .expect_err("missing root");
        assert!(matches!(
            err,
            OperatorError::Content(ContentError::NotFound { .. })
        ));
    }

    #[test]
    fn builder_produces_absolute_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RunConfiguration::builder(dir.path())
            .command_timeout(5)
            .input_override("output_file", "/tmp/x")
            .build()
            .expect("valid configuration");
        assert!(config.content_root().is_absolute());
        assert_eq!(config.command_timeout_secs(), 5);
        assert!(config.copy_source_files());
        assert_eq!(config.input_overrides().len(), 1);
    }
}
