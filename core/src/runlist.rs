use crate::config::ConfigFile;
use crate::error::InputError;
use crate::model::{Host, TechniquePlan, TestDefinition};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

pub const ALL_TECHNIQUES: &str = "all";

/// What the caller asked for, before any content is consulted.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub techniques: Vec<String>,
    pub test_guids: Vec<String>,
    pub hosts: Vec<Host>,
    /// Ignore caller techniques, GUIDs and hosts; only config entries count.
    pub config_file_only: bool,
}

impl Selection {
    pub fn all() -> Self {
        Self {
            techniques: vec![ALL_TECHNIQUES.to_string()],
            ..Self::default()
        }
    }
}

/// One plan with its retained tests, merged inputs and the hosts each test
/// targets. A test with no entry in `targets` runs locally.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub plan: TechniquePlan,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, Vec<Host>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unmatched_overrides: BTreeMap<String, Vec<String>>,
}

impl WorkItem {
    pub fn id(&self) -> &str {
        &self.plan.id
    }

    pub fn tests(&self) -> &[TestDefinition] {
        &self.plan.tests
    }

    pub fn hosts_for(&self, guid: &str) -> &[Host] {
        self.targets.get(guid).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every host any retained test targets, first appearance first.
    pub fn all_hosts(&self) -> Vec<&Host> {
        let mut seen = HashSet::new();
        self.plan
            .tests
            .iter()
            .flat_map(|test| self.hosts_for(&test.guid))
            .filter(|host| seen.insert(host.hostname.as_str()))
            .collect()
    }
}

pub struct RunListBuilder<'a> {
    content: &'a BTreeMap<String, TechniquePlan>,
    config: Option<&'a ConfigFile>,
    overrides: &'a BTreeMap<String, Value>,
}

impl<'a> RunListBuilder<'a> {
    pub fn new(
        content: &'a BTreeMap<String, TechniquePlan>,
        overrides: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            content,
            config: None,
            overrides,
        }
    }

    pub fn config(mut self, config: Option<&'a ConfigFile>) -> Self {
        self.config = config;
        self
    }

    pub fn build(&self, selection: &Selection) -> Result<Vec<WorkItem>, InputError> {
        let caller_counts = !selection.config_file_only;

        let mut guids: BTreeSet<String> = BTreeSet::new();
        let mut explicit: Vec<String> = Vec::new();
        let mut select_all = false;

        if caller_counts {
            guids.extend(selection.test_guids.iter().map(|g| g.trim().to_string()));
            for technique in &selection.techniques {
                let technique = technique.trim();
                if technique.eq_ignore_ascii_case(ALL_TECHNIQUES) {
                    select_all = true;
                } else if !technique.is_empty() {
                    explicit.push(technique.to_string());
                }
            }
        }
        if let Some(config) = self.config {
            guids.extend(config.guids().map(str::to_string));
            explicit.extend(config.techniques().map(str::to_string));
        }
        guids.retain(|guid| !guid.is_empty());

        if guids.is_empty() && explicit.is_empty() && !select_all {
            return Err(InputError::EmptySelection);
        }

        let explicit_ids = self.resolve_techniques(&explicit)?;

        let mut items = Vec::new();
        let mut matched_guids = HashSet::new();
        for (id, plan) in self.content {
            let whole_plan = explicit_ids.contains(id.as_str()) || (select_all && guids.is_empty());
            let tests: Vec<TestDefinition> = if whole_plan {
                plan.tests.clone()
            } else if !guids.is_empty() {
                plan.tests
                    .iter()
                    .filter(|test| guids.contains(&test.guid))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            if tests.is_empty() && !whole_plan {
                continue;
            }
            matched_guids.extend(tests.iter().map(|test| test.guid.clone()));
            items.push(self.work_item(plan, tests, selection));
        }

        for guid in guids.iter().filter(|guid| !matched_guids.contains(*guid)) {
            warn!(guid = %guid, "no loaded test matches the requested identifier");
        }

        Ok(items)
    }

    fn resolve_techniques(&self, requested: &[String]) -> Result<HashSet<&'a str>, InputError> {
        let mut resolved = HashSet::new();
        let mut unknown = Vec::new();
        for technique in requested {
            match self
                .content
                .keys()
                .find(|id| id.eq_ignore_ascii_case(technique))
            {
                Some(id) => {
                    resolved.insert(id.as_str());
                }
                None => {
                    if !unknown.contains(technique) {
                        unknown.push(technique.clone());
                    }
                }
            }
        }
        if unknown.is_empty() {
            Ok(resolved)
        } else {
            Err(InputError::UnknownTechniques(unknown))
        }
    }

    fn work_item(
        &self,
        plan: &TechniquePlan,
        tests: Vec<TestDefinition>,
        selection: &Selection,
    ) -> WorkItem {
        let mut unmatched_overrides = BTreeMap::new();
        let mut targets = BTreeMap::new();
        let mut merged_tests = Vec::with_capacity(tests.len());
        for mut test in tests {
            let inputs = self.inputs_for(&plan.id, &test.guid);
            let unmatched = test.apply_overrides(&inputs);
            if !unmatched.is_empty() {
                debug!(
                    technique = %plan.id,
                    guid = %test.guid,
                    keys = ?unmatched,
                    "input overrides did not match any declared argument"
                );
                unmatched_overrides.insert(test.guid.clone(), unmatched);
            }
            let hosts = self.hosts_for(&plan.id, &test.guid, selection);
            if !hosts.is_empty() {
                targets.insert(test.guid.clone(), hosts);
            }
            merged_tests.push(test);
        }

        WorkItem {
            plan: TechniquePlan {
                id: plan.id.clone(),
                display_name: plan.display_name.clone(),
                kind: plan.kind,
                path: plan.path.clone(),
                tests: merged_tests,
            },
            targets,
            unmatched_overrides,
        }
    }

    // Caller overrides first, then config technique inputs, then config GUID
    // inputs; later layers win.
    fn inputs_for(&self, technique: &str, guid: &str) -> BTreeMap<String, Value> {
        let mut inputs = self.overrides.clone();
        if let Some(config) = self.config {
            inputs.extend(config.inputs_for_technique(technique));
            inputs.extend(config.inputs_for_guid(guid));
        }
        inputs
    }

    // Bindings are per test: a technique entry applies to all of its tests,
    // a GUID entry only to that test. Direct hosts fill in when neither
    // binds the test.
    fn hosts_for(&self, technique: &str, guid: &str, selection: &Selection) -> Vec<Host> {
        let mut bound = Vec::new();
        if let Some(config) = self.config {
            bound.extend(config.hosts_for_technique(technique));
            bound.extend(config.hosts_for_guid(guid));
        }

        let candidates = if !bound.is_empty() {
            bound
        } else if selection.config_file_only {
            Vec::new()
        } else {
            selection.hosts.clone()
        };
        dedup_hosts(candidates)
    }
}

fn dedup_hosts(hosts: Vec<Host>) -> Vec<Host> {
    let mut seen = HashSet::new();
    hosts
        .into_iter()
        .filter(|host| seen.insert(host.hostname.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Executor, ExecutorKind, InputArgument, PlanKind, ShellFlavor};
    use std::path::PathBuf;

    fn test_def(guid: &str) -> TestDefinition {
        TestDefinition {
            guid: guid.to_string(),
            name: format!("test {guid}"),
            description: String::new(),
            supported_platforms: vec!["linux".to_string()],
            executor: Executor {
                kind: ExecutorKind::Shell {
                    flavor: ShellFlavor::Sh,
                },
                command: "cat #{output_file}".to_string(),
                cleanup_command: None,
                elevation_required: false,
                steps: None,
            },
            input_arguments: vec![InputArgument {
                name: "output_file".to_string(),
                description: String::new(),
                kind: "path".to_string(),
                default: Some(Value::String("/tmp/default.txt".to_string())),
                value: None,
                source: None,
                destination: None,
            }],
            dependencies: Vec::new(),
            dependency_executor: None,
        }
    }

    fn content() -> BTreeMap<String, TechniquePlan> {
        let mut content = BTreeMap::new();
        for (id, guids) in [("T1003", vec!["g1", "g2"]), ("T1059", vec!["g3"])] {
            content.insert(
                id.to_string(),
                TechniquePlan {
                    id: id.to_string(),
                    display_name: id.to_string(),
                    kind: PlanKind::Atomic,
                    path: PathBuf::from(format!("/atomics/{id}")),
                    tests: guids.into_iter().map(test_def).collect(),
                },
            );
        }
        content
    }

    #[test]
    fn all_selects_every_plan_without_hosts() {
        let content = content();
        let overrides = BTreeMap::new();
        let items = RunListBuilder::new(&content, &overrides)
            .build(&Selection::all())
            .expect("run list");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.targets.is_empty()));
        assert_eq!(items[0].id(), "T1003");
        assert_eq!(items[0].tests().len(), 2);
    }

    #[test]
    fn guids_filter_tests_and_drop_empty_plans() {
        let content = content();
        let overrides = BTreeMap::new();
        let selection = Selection {
            test_guids: vec!["g2".to_string()],
            ..Selection::all()
        };
        let items = RunListBuilder::new(&content, &overrides)
            .build(&selection)
            .expect("run list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tests().len(), 1);
        assert_eq!(items[0].tests()[0].guid, "g2");
    }

    #[test]
    fn unknown_techniques_are_reported_together() {
        let content = content();
        let overrides = BTreeMap::new();
        let selection = Selection {
            techniques: vec!["T9999".to_string(), "t1003".to_string(), "T8888".to_string()],
            ..Selection::default()
        };
        let err = RunListBuilder::new(&content, &overrides)
            .build(&selection)
            .expect_err("unknown ids");
        match err {
            InputError::UnknownTechniques(ids) => assert_eq!(ids, vec!["T9999", "T8888"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_selection_is_rejected() {
        let content = content();
        let overrides = BTreeMap::new();
        let err = RunListBuilder::new(&content, &overrides)
            .build(&Selection::default())
            .expect_err("nothing selected");
        assert!(matches!(err, InputError::EmptySelection));
    }

    #[test]
    fn config_binding_overrides_direct_hosts() {
        let content = content();
        let overrides = BTreeMap::new();
        let config = ConfigFile::from_yaml(
            r#"
inventory:
  lab:
    executor: ssh
    authentication: {username: root, password: pw}
    hosts: [h1, h2, h1]
atomic_tests:
  - guid: g3
    inventories: [lab]
    input_arguments:
      output_file: {value: /tmp/from-config.txt}
"#,
        )
        .expect("config");
        let selection = Selection {
            test_guids: Vec::new(),
            techniques: Vec::new(),
            hosts: vec![Host::new("direct")],
            config_file_only: false,
        };
        let items = RunListBuilder::new(&content, &overrides)
            .config(Some(&config))
            .build(&selection)
            .expect("run list");

        assert_eq!(items.len(), 1);
        let hostnames: Vec<_> = items[0]
            .hosts_for("g3")
            .iter()
            .map(|h| h.hostname.as_str())
            .collect();
        assert_eq!(hostnames, vec!["h1", "h2"]);
        assert_eq!(
            items[0].tests()[0]
                .input("output_file")
                .and_then(InputArgument::resolved_string),
            Some("/tmp/from-config.txt".to_string())
        );
    }

    #[test]
    fn caller_overrides_apply_and_unmatched_keys_are_kept() {
        let content = content();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "output_file".to_string(),
            Value::String("/tmp/custom.txt".to_string()),
        );
        overrides.insert("bogus".to_string(), Value::Bool(true));
        let selection = Selection {
            techniques: vec!["T1059".to_string()],
            hosts: vec![Host::new("a"), Host::new("a"), Host::new("b")],
            ..Selection::default()
        };
        let items = RunListBuilder::new(&content, &overrides)
            .build(&selection)
            .expect("run list");

        assert_eq!(items[0].hosts_for("g3").len(), 2);
        assert_eq!(
            items[0].unmatched_overrides.get("g3"),
            Some(&vec!["bogus".to_string()])
        );
        assert_eq!(
            items[0].tests()[0]
                .input("output_file")
                .and_then(InputArgument::resolved_string),
            Some("/tmp/custom.txt".to_string())
        );
    }

    fn hostnames(hosts: &[Host]) -> Vec<&str> {
        hosts.iter().map(|h| h.hostname.as_str()).collect()
    }

    #[test]
    fn bindings_stay_with_their_own_test() {
        let content = content();
        let overrides = BTreeMap::new();
        let config = ConfigFile::from_yaml(
            r#"
inventory:
  a:
    authentication: {username: root, password: pw}
    hosts: [h1]
  b:
    authentication: {username: root, password: pw}
    hosts: [h2]
atomic_tests:
  - guid: g1
    inventories: [a]
  - guid: g2
    inventories: [b]
"#,
        )
        .expect("config");
        let items = RunListBuilder::new(&content, &overrides)
            .config(Some(&config))
            .build(&Selection::default())
            .expect("run list");

        assert_eq!(items.len(), 1);
        assert_eq!(hostnames(items[0].hosts_for("g1")), vec!["h1"]);
        assert_eq!(hostnames(items[0].hosts_for("g2")), vec!["h2"]);
        let all: Vec<&str> = items[0]
            .all_hosts()
            .into_iter()
            .map(|h| h.hostname.as_str())
            .collect();
        assert_eq!(all, vec!["h1", "h2"]);
    }

    #[test]
    fn unbound_sibling_uses_direct_hosts() {
        let content = content();
        let overrides = BTreeMap::new();
        let config = ConfigFile::from_yaml(
            r#"
inventory:
  a:
    authentication: {username: root, password: pw}
    hosts: [h1]
atomic_tests:
  - guid: g1
    inventories: [a]
"#,
        )
        .expect("config");
        let selection = Selection {
            techniques: vec!["T1003".to_string()],
            hosts: vec![Host::new("direct")],
            ..Selection::default()
        };
        let items = RunListBuilder::new(&content, &overrides)
            .config(Some(&config))
            .build(&selection)
            .expect("run list");

        assert_eq!(items[0].tests().len(), 2);
        assert_eq!(hostnames(items[0].hosts_for("g1")), vec!["h1"]);
        assert_eq!(hostnames(items[0].hosts_for("g2")), vec!["direct"]);
    }

    #[test]
    fn config_file_only_ignores_caller_selection() {
        let content = content();
        let overrides = BTreeMap::new();
        let config = ConfigFile::from_yaml(
            r#"
atomic_tests:
  - guid: g2
"#,
        )
        .expect("config");
        let selection = Selection {
            techniques: vec!["T1059".to_string()],
            test_guids: vec!["g1".to_string()],
            hosts: vec![Host::new("direct")],
            config_file_only: true,
        };
        let items = RunListBuilder::new(&content, &overrides)
            .config(Some(&config))
            .build(&selection)
            .expect("run list");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id(), "T1003");
        let guids: Vec<&str> = items[0].tests().iter().map(|t| t.guid.as_str()).collect();
        assert_eq!(guids, vec!["g2"]);
        assert!(items[0].hosts_for("g2").is_empty());
    }
}
