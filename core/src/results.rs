use crate::error::{FailureKind, TransportError};
use comfy_table::{presets::ASCII_FULL, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use time::OffsetDateTime;

pub const LOCAL_HOST_ID: &str = "localhost";

const TABLE_OUTPUT_LIMIT: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prereq,
    GetPrereqs,
    Command,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Prereq => "prereq",
            Phase::GetPrereqs => "get_prereqs",
            Phase::Command => "command",
            Phase::Cleanup => "cleanup",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    NonZeroExit,
    CommandNotFound,
    Manual,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResultStatus::Succeeded => "succeeded",
            ResultStatus::NonZeroExit => "non-zero exit",
            ResultStatus::CommandNotFound => "command not found",
            ResultStatus::Manual => "manual",
            ResultStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Why a command did not complete, with the host it was aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub output: String,
    pub error: String,
    pub return_code: Option<i32>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<FailureDetail>,
    pub started_at: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn failed(
        command: impl Into<String>,
        host: &str,
        err: TransportError,
        timing: &Timing,
    ) -> Self {
        Self {
            command: command.into(),
            output: String::new(),
            error: err.message.clone(),
            return_code: None,
            status: ResultStatus::Failed,
            failure: Some(FailureDetail {
                kind: err.kind,
                host: host.to_string(),
                error_type: err.error_type,
                message: err.message,
            }),
            started_at: timing.started_at(),
            duration_ms: timing.elapsed_ms(),
        }
    }

    pub fn manual(steps: impl Into<String>, timing: &Timing) -> Self {
        Self {
            command: String::new(),
            output: steps.into(),
            error: String::new(),
            return_code: None,
            status: ResultStatus::Manual,
            failure: None,
            started_at: timing.started_at(),
            duration_ms: timing.elapsed_ms(),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|failure| failure.kind)
    }

    pub fn is_problem(&self) -> bool {
        matches!(
            self.status,
            ResultStatus::Failed | ResultStatus::NonZeroExit | ResultStatus::CommandNotFound
        )
    }
}

/// Wall clock start plus a monotonic timer for one command.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    started_at: OffsetDateTime,
    timer: Instant,
}

impl Timing {
    pub fn start() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            timer: Instant::now(),
        }
    }

    pub fn started_at(&self) -> String {
        self.started_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.timer.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

pub type HostResults = BTreeMap<String, Vec<ExecutionResult>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub technique_id: String,
    pub technique_name: String,
    pub test_name: String,
    pub phases: BTreeMap<Phase, HostResults>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub diagnostics: Vec<String>,
}

impl TestRecord {
    pub fn results(&self, phase: Phase, host: &str) -> &[ExecutionResult] {
        self.phases
            .get(&phase)
            .and_then(|hosts| hosts.get(host))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Results of one run keyed by test GUID. Recording only ever appends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub tests: BTreeMap<String, TestRecord>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record for a test if it is not known yet.
    pub fn register(
        &mut self,
        test_id: &str,
        technique_id: &str,
        technique_name: &str,
        test_name: &str,
    ) -> &mut TestRecord {
        self.tests
            .entry(test_id.to_string())
            .or_insert_with(|| TestRecord {
                technique_id: technique_id.to_string(),
                technique_name: technique_name.to_string(),
                test_name: test_name.to_string(),
                ..TestRecord::default()
            })
    }

    pub fn record(&mut self, test_id: &str, host_id: &str, phase: Phase, result: ExecutionResult) {
        self.tests
            .entry(test_id.to_string())
            .or_default()
            .phases
            .entry(phase)
            .or_default()
            .entry(host_id.to_string())
            .or_default()
            .push(result);
    }

    pub fn diagnose(&mut self, test_id: &str, message: impl Into<String>) {
        self.tests
            .entry(test_id.to_string())
            .or_default()
            .diagnostics
            .push(message.into());
    }

    pub fn test(&self, test_id: &str) -> Option<&TestRecord> {
        self.tests.get(test_id)
    }

    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.tests
            .values()
            .flat_map(|record| record.phases.values())
            .flat_map(|hosts| hosts.values())
            .flatten()
    }

    pub fn has_failures(&self) -> bool {
        self.results().any(ExecutionResult::is_problem)
    }

    pub fn render_table(&self) -> String {
        let mut display = Table::new();
        display.load_preset(ASCII_FULL);
        display.set_header(vec![
            "Technique", "Test", "Phase", "Host", "Status", "Code", "Output",
        ]);

        for record in self.tests.values() {
            for (phase, hosts) in &record.phases {
                for (host, results) in hosts {
                    for result in results {
                        display.add_row(vec![
                            record.technique_id.clone(),
                            record.test_name.clone(),
                            phase.to_string(),
                            host.clone(),
                            result.status.to_string(),
                            result
                                .return_code
                                .map(|code| code.to_string())
                                .unwrap_or_default(),
                            summarize(result),
                        ]);
                    }
                }
            }
        }

        display.to_string()
    }
}

fn summarize(result: &ExecutionResult) -> String {
    let text = match &result.failure {
        Some(failure) => format!("{}: {}", failure.kind, failure.message),
        None if result.output.is_empty() => result.error.clone(),
        None => result.output.clone(),
    };
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() > TABLE_OUTPUT_LIMIT {
        let truncated: String = first_line.chars().take(TABLE_OUTPUT_LIMIT).collect();
        format!("{truncated}…")
    } else {
        first_line.to_string()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tests.is_empty() {
            return writeln!(f, "No tests were executed.");
        }
        writeln!(f, "{}", self.render_table())?;
        for (guid, record) in &self.tests {
            for diagnostic in &record.diagnostics {
                writeln!(f, "  - [{}] {guid}: {diagnostic}", record.technique_id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn succeeded(command: &str) -> ExecutionResult {
        ExecutionResult {
            command: command.to_string(),
            output: "ok".to_string(),
            error: String::new(),
            return_code: Some(0),
            status: ResultStatus::Succeeded,
            failure: None,
            started_at: "2024-01-01T00:00:00Z".to_string(),
            duration_ms: 3,
        }
    }

    #[test]
    fn cleanup_is_recorded_beside_command() {
        let mut report = RunReport::new();
        report.register("guid-1", "T1000", "Example", "first test");
        report.record("guid-1", LOCAL_HOST_ID, Phase::Command, succeeded("whoami"));
        let before = report.test("guid-1").cloned().expect("registered");

        report.record("guid-1", LOCAL_HOST_ID, Phase::Cleanup, succeeded("rm -f x"));

        let record = report.test("guid-1").expect("registered");
        assert_eq!(
            record.results(Phase::Command, LOCAL_HOST_ID),
            before.results(Phase::Command, LOCAL_HOST_ID)
        );
        assert_eq!(record.results(Phase::Cleanup, LOCAL_HOST_ID).len(), 1);
        assert_eq!(record.technique_name, "Example");
    }

    #[test]
    fn repeated_records_append() {
        let mut report = RunReport::new();
        report.record("guid-1", "h1", Phase::Prereq, succeeded("a"));
        report.record("guid-1", "h1", Phase::Prereq, succeeded("b"));
        let commands: Vec<_> = report
            .test("guid-1")
            .expect("created on record")
            .results(Phase::Prereq, "h1")
            .iter()
            .map(|result| result.command.as_str())
            .collect();
        assert_eq!(commands, vec!["a", "b"]);
    }

    #[test]
    fn failures_are_detected() {
        let mut report = RunReport::new();
        report.record("guid-1", "h1", Phase::Command, succeeded("a"));
        assert!(!report.has_failures());

        let timing = Timing::start();
        let failed = ExecutionResult::failed(
            "a",
            "h2",
            TransportError::timeout(1),
            &timing,
        );
        report.record("guid-1", "h2", Phase::Command, failed);
        assert!(report.has_failures());
        assert!(report.render_table().contains("failed"));
    }

    #[test]
    fn phases_serialize_in_snake_case() {
        let json = serde_json::to_string(&Phase::GetPrereqs).expect("serializes");
        assert_eq!(json, "\"get_prereqs\"");
    }
}
