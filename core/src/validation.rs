use crate::model::{PlanKind, TechniquePlan, TestDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    pub fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warning",
        };
        match &self.location {
            Some(location) => write!(f, "{level} [{location}]: {}", self.message),
            None => write!(f, "{level}: {}", self.message),
        }
    }
}

/// Checks a freshly loaded plan. Errors make the plan unusable, warnings
/// are informational.
pub fn validate_plan(plan: &TechniquePlan) -> Vec<Diagnostic> {
    let mut ctx = ValidationContext::new();
    ctx.push(plan.id.clone());

    if plan.tests.is_empty() {
        ctx.warning("plan does not define any tests");
    }

    let mut guids = HashSet::new();
    for (index, test) in plan.tests.iter().enumerate() {
        ctx.push(format!("test #{} ({})", index + 1, test.name));
        if !test.guid.is_empty() && !guids.insert(test.guid.as_str()) {
            ctx.error(format!("duplicate test identifier '{}'", test.guid));
        }
        validate_test(test, plan.kind, &mut ctx);
        ctx.pop();
    }

    ctx.pop();
    ctx.finish()
}

struct ValidationContext {
    stack: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn push(&mut self, label: String) {
        self.stack.push(label);
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn location(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(self.stack.join(" > "))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::error(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn warning(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::warning(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

fn validate_test(test: &TestDefinition, kind: PlanKind, ctx: &mut ValidationContext) {
    if test.guid.trim().is_empty() {
        ctx.error("test has no identifier");
    }
    if kind == PlanKind::Atomic && test.supported_platforms.is_empty() {
        ctx.error("supported_platforms cannot be empty");
    }

    let mut names = HashSet::new();
    for argument in &test.input_arguments {
        if !names.insert(argument.name.as_str()) {
            ctx.error(format!(
                "input argument '{}' is declared more than once",
                argument.name
            ));
        }
    }

    if !test.executor.kind.is_manual() && test.executor.command.trim().is_empty() {
        ctx.error(format!(
            "executor '{}' requires a non-empty command",
            test.executor.kind
        ));
    }

    let templates = std::iter::once(test.executor.command.as_str())
        .chain(test.executor.cleanup_command.as_deref())
        .chain(test.dependencies.iter().flat_map(|dependency| {
            dependency
                .prereq_command
                .as_deref()
                .into_iter()
                .chain(dependency.get_prereq_command.as_deref())
        }));
    let mut reported = HashSet::new();
    for template in templates {
        for placeholder in placeholders(template) {
            if !names.contains(placeholder) && reported.insert(placeholder.to_string()) {
                ctx.warning(format!(
                    "placeholder '#{{{placeholder}}}' has no matching input argument"
                ));
            }
        }
    }
}

/// Names referenced as `#{name}` in a command template.
pub fn placeholders(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut cursor = 0;

    while let Some(start_offset) = template[cursor..].find("#{") {
        let start_idx = cursor + start_offset + 2;
        let Some(end_offset) = template[start_idx..].find('}') else {
            break;
        };
        let token = template[start_idx..start_idx + end_offset].trim();
        if !token.is_empty() {
            names.push(token);
        }
        cursor = start_idx + end_offset + 1;
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Executor, ExecutorKind, InputArgument, ShellFlavor};
    use std::path::PathBuf;

    fn argument(name: &str) -> InputArgument {
        InputArgument {
            name: name.to_string(),
            description: String::new(),
            kind: "string".to_string(),
            default: None,
            value: None,
            source: None,
            destination: None,
        }
    }

    fn plan_with(test: TestDefinition) -> TechniquePlan {
        TechniquePlan {
            id: "T1000".to_string(),
            display_name: "Example".to_string(),
            kind: PlanKind::Atomic,
            path: PathBuf::from("/atomics/T1000"),
            tests: vec![test],
        }
    }

    fn shell_test(command: &str, arguments: Vec<InputArgument>) -> TestDefinition {
        TestDefinition {
            guid: "0c2d1a1b".to_string(),
            name: "first".to_string(),
            description: String::new(),
            supported_platforms: vec!["linux".to_string()],
            executor: Executor {
                kind: ExecutorKind::Shell {
                    flavor: ShellFlavor::Sh,
                },
                command: command.to_string(),
                cleanup_command: None,
                elevation_required: false,
                steps: None,
            },
            input_arguments: arguments,
            dependencies: Vec::new(),
            dependency_executor: None,
        }
    }

    #[test]
    fn finds_placeholders_in_order() {
        assert_eq!(
            placeholders("cp #{src} #{ dst } && echo #{"),
            vec!["src", "dst"]
        );
    }

    #[test]
    fn duplicate_inputs_are_errors() {
        let test = shell_test("echo #{a}", vec![argument("a"), argument("a")]);
        let diagnostics = validate_plan(&plan_with(test));
        assert!(diagnostics.iter().any(Diagnostic::is_error));
        assert!(diagnostics[0].message.contains("declared more than once"));
    }

    #[test]
    fn undeclared_placeholders_are_warnings() {
        let test = shell_test("echo #{missing}", Vec::new());
        let diagnostics = validate_plan(&plan_with(test));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].level, DiagnosticLevel::Warning);
        assert_eq!(
            diagnostics[0].location.as_deref(),
            Some("T1000 > test #1 (first)")
        );
    }

    #[test]
    fn empty_platforms_rejected_for_atomics() {
        let mut test = shell_test("whoami", Vec::new());
        test.supported_platforms.clear();
        let diagnostics = validate_plan(&plan_with(test));
        assert!(diagnostics.iter().any(Diagnostic::is_error));
    }
}
