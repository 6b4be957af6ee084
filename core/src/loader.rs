//! Discovers technique and emulation plan files under a content root and
//! normalizes both formats into [`TechniquePlan`]s.

use crate::error::ContentError;
use crate::model::{
    Dependency, Executor, ExecutorKind, InputArgument, PlanKind, ShellFlavor, TechniquePlan,
    TestDefinition, CLOUD_PLATFORM_PREFIX,
};
use crate::validation::{validate_plan, Diagnostic};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const EMULATION_PLAN_DIR: &str = "Emulation_Plan";
const EMULATION_YAML_DIR: &str = "yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ContentFile {
    Atomic,
    Emulation,
}

/// Loads every plan under `content_root`, keyed by identifier. The first file
/// seen for an identifier wins.
pub fn load_all(content_root: &Path) -> Result<BTreeMap<String, TechniquePlan>, ContentError> {
    if !content_root.is_dir() {
        return Err(ContentError::NotFound {
            path: content_root.to_path_buf(),
        });
    }

    let files = discover(content_root);
    if files.is_empty() {
        return Err(ContentError::NotFound {
            path: content_root.to_path_buf(),
        });
    }

    let mut plans = BTreeMap::new();
    for (path, kind) in files {
        let plan = match kind {
            ContentFile::Atomic => load_atomic_file(&path)?,
            ContentFile::Emulation => load_emulation_file(&path)?,
        };
        if plans.contains_key(&plan.id) {
            debug!(id = %plan.id, path = %path.display(), "skipping duplicate definition");
            continue;
        }
        plans.insert(plan.id.clone(), plan);
    }

    debug!(count = plans.len(), root = %content_root.display(), "loaded content");
    Ok(plans)
}

fn discover(root: &Path) -> Vec<(PathBuf, ContentFile)> {
    let mut found: Vec<(PathBuf, ContentFile)> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "unable to read content entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            classify(&path).map(|kind| (path, kind))
        })
        .collect();
    found.sort();
    found
}

fn classify(path: &Path) -> Option<ContentFile> {
    let extension = path.extension()?.to_str()?;
    if !extension.eq_ignore_ascii_case("yaml") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let parent = path.parent()?;
    let parent_name = parent.file_name()?.to_str()?;

    if parent_name == EMULATION_YAML_DIR
        && parent
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            == Some(EMULATION_PLAN_DIR)
    {
        return Some(ContentFile::Emulation);
    }
    if stem.starts_with('T') && parent_name.starts_with('T') {
        return Some(ContentFile::Atomic);
    }
    None
}

fn read_yaml<T>(path: &Path) -> Result<T, ContentError>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path).map_err(|source| ContentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ContentError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn finish_plan(plan: TechniquePlan, path: &Path) -> Result<TechniquePlan, ContentError> {
    let diagnostics = validate_plan(&plan);
    let (errors, warnings): (Vec<Diagnostic>, Vec<Diagnostic>) =
        diagnostics.into_iter().partition(Diagnostic::is_error);
    for warning in &warnings {
        debug!(path = %path.display(), "{warning}");
    }
    if !errors.is_empty() {
        return Err(ContentError::Invalid {
            path: path.to_path_buf(),
            messages: errors.iter().map(ToString::to_string).collect(),
        });
    }
    Ok(plan)
}

fn invalid(path: &Path, message: impl Into<String>) -> ContentError {
    ContentError::Invalid {
        path: path.to_path_buf(),
        messages: vec![message.into()],
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn supporting_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RawAtomicFile {
    #[serde(default)]
    attack_technique: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    atomic_tests: Vec<RawAtomicTest>,
}

#[derive(Debug, Deserialize)]
struct RawAtomicTest {
    name: String,
    #[serde(default)]
    auto_generated_guid: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    supported_platforms: Vec<String>,
    #[serde(default)]
    input_arguments: Option<Mapping>,
    #[serde(default)]
    dependency_executor_name: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    executor: RawExecutor,
}

#[derive(Debug, Deserialize)]
struct RawExecutor {
    name: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    cleanup_command: Option<String>,
    #[serde(default)]
    elevation_required: bool,
    #[serde(default)]
    steps: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    #[serde(default)]
    description: String,
    #[serde(default)]
    prereq_command: Option<String>,
    #[serde(default)]
    get_prereq_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInput {
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    destination: Option<String>,
}

pub fn load_atomic_file(path: &Path) -> Result<TechniquePlan, ContentError> {
    let raw: RawAtomicFile = read_yaml(path)?;
    let id = file_stem(path);

    let mut tests = Vec::with_capacity(raw.atomic_tests.len());
    for test in raw.atomic_tests {
        tests.push(normalize_atomic_test(test, path)?);
    }

    let display_name = raw
        .display_name
        .or(raw.attack_technique)
        .unwrap_or_else(|| id.clone());
    let plan = TechniquePlan {
        id,
        display_name,
        kind: PlanKind::Atomic,
        path: supporting_dir(path),
        tests,
    };
    finish_plan(plan, path)
}

fn normalize_atomic_test(raw: RawAtomicTest, path: &Path) -> Result<TestDefinition, ContentError> {
    let mut kind = ExecutorKind::from_name(&raw.executor.name).ok_or_else(|| {
        invalid(
            path,
            format!(
                "test '{}' uses unsupported executor '{}'",
                raw.name, raw.executor.name
            ),
        )
    })?;
    if let Some(cli) = cloud_cli(&raw.supported_platforms, &kind) {
        kind = ExecutorKind::CloudCli { cli };
    }

    let dependency_executor = match raw.dependency_executor_name.as_deref() {
        Some(name) => Some(ExecutorKind::from_name(name).ok_or_else(|| {
            invalid(
                path,
                format!("test '{}' uses unsupported dependency executor '{name}'", raw.name),
            )
        })?),
        None => None,
    };

    Ok(TestDefinition {
        guid: raw.auto_generated_guid.unwrap_or_default(),
        name: raw.name,
        description: raw.description,
        supported_platforms: raw.supported_platforms,
        executor: Executor {
            kind,
            command: raw.executor.command.unwrap_or_default(),
            cleanup_command: raw.executor.cleanup_command.filter(|c| !c.trim().is_empty()),
            elevation_required: raw.executor.elevation_required,
            steps: raw.executor.steps,
        },
        input_arguments: normalize_inputs(raw.input_arguments, path)?,
        dependencies: raw
            .dependencies
            .into_iter()
            .map(|dependency| Dependency {
                description: dependency.description,
                prereq_command: dependency.prereq_command,
                get_prereq_command: dependency.get_prereq_command,
            })
            .collect(),
        dependency_executor,
    })
}

/// Maps a shell test whose platforms are all cloud tags onto the matching
/// provider CLI.
fn cloud_cli(platforms: &[String], kind: &ExecutorKind) -> Option<String> {
    if !matches!(kind, ExecutorKind::Shell { .. }) || platforms.is_empty() {
        return None;
    }
    if !platforms
        .iter()
        .all(|platform| platform.starts_with(CLOUD_PLATFORM_PREFIX))
    {
        return None;
    }
    let provider = platforms[0].trim_start_matches(CLOUD_PLATFORM_PREFIX);
    let cli = match provider {
        "aws" => "aws",
        "azure" => "az",
        "gcp" => "gcloud",
        other => other,
    };
    Some(cli.to_string())
}

// Declaration order of the mapping is preserved; substitution follows it.
fn normalize_inputs(
    raw: Option<Mapping>,
    path: &Path,
) -> Result<Vec<InputArgument>, ContentError> {
    let Some(mapping) = raw else {
        return Ok(Vec::new());
    };
    let mut arguments = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            Value::String(name) => name,
            other => crate::model::stringify_value(&other)
                .ok_or_else(|| invalid(path, "input argument names must be scalars"))?,
        };
        let input: RawInput = if value.is_null() {
            RawInput::default()
        } else {
            serde_yaml::from_value(value).map_err(|source| ContentError::Malformed {
                path: path.to_path_buf(),
                source,
            })?
        };
        arguments.push(InputArgument {
            name,
            description: input.description,
            kind: input.kind,
            default: input.default,
            value: None,
            source: input.source,
            destination: input.destination,
        });
    }
    Ok(arguments)
}

#[derive(Debug, Default, Deserialize)]
struct RawPlanDetails {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    adversary_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tactic: Option<String>,
    #[serde(default)]
    technique: Option<RawTechniqueRef>,
    #[serde(default)]
    platforms: Mapping,
    #[serde(default)]
    input_arguments: Option<Mapping>,
    #[serde(default)]
    dependency_executor_name: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
struct RawTechniqueRef {
    #[serde(default)]
    attack_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPhaseCommand {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    cleanup: Option<String>,
}

pub fn load_emulation_file(path: &Path) -> Result<TechniquePlan, ContentError> {
    let entries: Vec<Value> = read_yaml(path)?;

    let mut details = RawPlanDetails::default();
    let mut phases = Vec::new();
    for entry in entries {
        let Value::Mapping(mut mapping) = entry else {
            continue;
        };
        if let Some(raw_details) = mapping.remove("emulation_plan_details") {
            details = serde_yaml::from_value(raw_details).map_err(|source| {
                ContentError::Malformed {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            continue;
        }
        if !mapping.contains_key("id") {
            continue;
        }
        let phase: RawPhase =
            serde_yaml::from_value(Value::Mapping(mapping)).map_err(|source| {
                ContentError::Malformed {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        phases.push(normalize_phase(phase, path)?);
    }

    let id = details.id.unwrap_or_else(|| file_stem(path));
    let plan = TechniquePlan {
        display_name: details.adversary_name.unwrap_or_else(|| id.clone()),
        id,
        kind: PlanKind::Emulation,
        path: supporting_dir(path),
        tests: phases,
    };
    finish_plan(plan, path)
}

fn normalize_phase(raw: RawPhase, path: &Path) -> Result<TestDefinition, ContentError> {
    let mut supported_platforms = Vec::new();
    let mut selected: Option<(ExecutorKind, RawPhaseCommand)> = None;

    for (platform, executors) in raw.platforms {
        let Some(platform) = platform.as_str().map(normalize_platform) else {
            continue;
        };
        supported_platforms.push(platform);
        if selected.is_some() {
            continue;
        }
        let Value::Mapping(executors) = executors else {
            continue;
        };
        for (key, command) in executors {
            let Some(kind) = key.as_str().and_then(phase_executor) else {
                continue;
            };
            let command: RawPhaseCommand =
                serde_yaml::from_value(command).map_err(|source| ContentError::Malformed {
                    path: path.to_path_buf(),
                    source,
                })?;
            selected = Some((kind, command));
            break;
        }
    }

    let (kind, command) = selected.ok_or_else(|| {
        invalid(
            path,
            format!("phase '{}' defines no supported executor", raw.id),
        )
    })?;

    let mut description = raw.description;
    if let Some(technique) = raw.technique {
        let label = [technique.attack_id, technique.name, raw.tactic]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" / ");
        if !label.is_empty() {
            if !description.is_empty() {
                description.push('\n');
            }
            description.push_str(&label);
        }
    }

    let dependency_executor = raw
        .dependency_executor_name
        .as_deref()
        .and_then(ExecutorKind::from_name);

    Ok(TestDefinition {
        name: if raw.name.is_empty() {
            raw.id.clone()
        } else {
            raw.name
        },
        guid: raw.id,
        description,
        supported_platforms,
        executor: Executor {
            kind,
            command: command.command.unwrap_or_default(),
            cleanup_command: command.cleanup.filter(|c| !c.trim().is_empty()),
            elevation_required: false,
            steps: None,
        },
        input_arguments: normalize_inputs(raw.input_arguments, path)?,
        dependencies: raw
            .dependencies
            .into_iter()
            .map(|dependency| Dependency {
                description: dependency.description,
                prereq_command: dependency.prereq_command,
                get_prereq_command: dependency.get_prereq_command,
            })
            .collect(),
        dependency_executor,
    })
}

fn normalize_platform(platform: &str) -> String {
    match platform.to_ascii_lowercase().as_str() {
        "darwin" | "osx" => "macos".to_string(),
        other => other.to_string(),
    }
}

// Phase executor keys may list aliases, e.g. `psh,pwsh`.
fn phase_executor(key: &str) -> Option<ExecutorKind> {
    key.split(',').map(str::trim).find_map(|alias| match alias {
        "proc" => Some(ExecutorKind::Shell {
            flavor: ShellFlavor::Sh,
        }),
        other => ExecutorKind::from_name(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ATOMIC: &str = r#"
attack_technique: T1003
display_name: OS Credential Dumping
atomic_tests:
  - name: Dump with custom output
    auto_generated_guid: 11111111-aaaa-bbbb-cccc-000000000001
    description: Writes a file
    supported_platforms: [linux]
    input_arguments:
      output_file:
        description: Where to write
        type: path
        default: /tmp/out.txt
      input_file:
        description: What to read
        type: path
        default: PathToAtomicsFolder/T1003/src/input.txt
    executor:
      name: sh
      command: cat #{input_file} > #{output_file}
      cleanup_command: rm -f #{output_file}
  - name: Cloud listing
    auto_generated_guid: 11111111-aaaa-bbbb-cccc-000000000002
    supported_platforms: [iaas:aws]
    executor:
      name: sh
      command: aws s3 ls
"#;

    const EMULATION: &str = r#"
- emulation_plan_details:
    id: apt3
    adversary_name: APT3
- id: phase-1
  name: Discovery
  tactic: discovery
  technique:
    attack_id: T1082
    name: System Information Discovery
  platforms:
    windows:
      psh,pwsh:
        command: Get-ComputerInfo
        cleanup: ''
"#;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("has parent")).expect("create dirs");
        fs::write(path, content).expect("write fixture");
    }

    #[test]
    fn loads_atomic_file_preserving_input_order() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "atomics/T1003/T1003.yaml", ATOMIC);

        let plans = load_all(dir.path()).expect("content loads");
        let plan = plans.get("T1003").expect("plan present");
        assert_eq!(plan.display_name, "OS Credential Dumping");
        assert_eq!(plan.tests.len(), 2);

        let names: Vec<_> = plan.tests[0]
            .input_arguments
            .iter()
            .map(|arg| arg.name.as_str())
            .collect();
        assert_eq!(names, vec!["output_file", "input_file"]);
        assert_eq!(
            plan.tests[1].executor.kind,
            ExecutorKind::CloudCli {
                cli: "aws".to_string()
            }
        );
    }

    #[test]
    fn discovery_is_sorted_and_first_definition_wins() {
        let dir = TempDir::new().expect("tempdir");
        let shadow = ATOMIC.replace("OS Credential Dumping", "Shadow Copy");
        write(dir.path(), "zz_mirror/T1003/T1003.yaml", &shadow);
        write(dir.path(), "atomics/T1003/T1003.yaml", ATOMIC);
        write(dir.path(), "apt3/Emulation_Plan/yaml/APT3.yaml", EMULATION);

        let found: Vec<ContentFile> = discover(dir.path())
            .into_iter()
            .map(|(_, kind)| kind)
            .collect();
        assert_eq!(
            found,
            vec![ContentFile::Emulation, ContentFile::Atomic, ContentFile::Atomic]
        );

        let plans = load_all(dir.path()).expect("content loads");
        assert_eq!(plans["T1003"].display_name, "OS Credential Dumping");
    }

    #[test]
    fn loads_emulation_phases_as_tests() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "apt3/Emulation_Plan/yaml/APT3.yaml", EMULATION);

        let plans = load_all(dir.path()).expect("content loads");
        let plan = plans.get("apt3").expect("plan present");
        assert_eq!(plan.kind, PlanKind::Emulation);
        assert_eq!(plan.display_name, "APT3");
        let phase = &plan.tests[0];
        assert_eq!(phase.guid, "phase-1");
        assert_eq!(phase.executor.kind, ExecutorKind::PowerShell);
        assert_eq!(phase.supported_platforms, vec!["windows".to_string()]);
        assert!(phase.executor.cleanup_command.is_none());
    }

    #[test]
    fn empty_root_reports_missing_content() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "README.md", "nothing here");
        let err = load_all(dir.path()).expect_err("no content");
        assert!(matches!(err, ContentError::NotFound { .. }));
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "T1001/T1001.yaml", "atomic_tests: [unclosed");
        let err = load_all(dir.path()).expect_err("malformed");
        match err {
            ContentError::Malformed { path, .. } => assert!(path.ends_with("T1001.yaml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_input_names_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let source = r#"
atomic_tests:
  - name: dup
    auto_generated_guid: 22222222-0000-0000-0000-000000000000
    supported_platforms: [linux]
    dependencies:
      - description: needs #{a}
        prereq_command: test -f #{a}
        get_prereq_command: touch #{a}
    input_arguments:
      a: {default: one}
      b: {default: two}
    executor: {name: bash, command: "echo #{a} #{b}"}
"#;
        write(dir.path(), "T1002/T1002.yaml", source);
        let plans = load_all(dir.path()).expect("valid content");
        assert_eq!(plans["T1002"].tests[0].dependencies.len(), 1);

        // serde_yaml rejects duplicate mapping keys before validation runs.
        let duplicated = source.replace("b: {default: two}", "a: {default: two}");
        write(dir.path(), "T1002/T1002.yaml", &duplicated);
        assert!(load_all(dir.path()).is_err());
    }
}
