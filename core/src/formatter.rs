use crate::model::{ExecutorKind, InputArgument};

pub const CONTENT_ROOT_VARIABLE: &str = "$PathToAtomicsFolder";
pub const CONTENT_ROOT_TOKEN: &str = "PathToAtomicsFolder";

const COMMAND_PROMPT_REPLACEMENTS: &[(&str, &str)] = &[("%temp%", "$env:TEMP")];

/// Renders a command template for one executor. `content_root` is the root as
/// the target machine sees it.
pub fn format_command(
    template: &str,
    inputs: &[InputArgument],
    content_root: &str,
    executor: &ExecutorKind,
    elevation: bool,
) -> String {
    let mut command = if elevation {
        elevate(template, executor)
    } else {
        template.to_string()
    };

    command = replace_content_root(&command, content_root);

    for input in inputs {
        let Some(value) = input.resolved_string() else {
            continue;
        };
        for placeholder in [format!("#{{{}}}", input.name), format!("${{{}}}", input.name)] {
            command = command.replace(&placeholder, &value);
        }
    }

    if matches!(executor, ExecutorKind::CommandPrompt) {
        for (from, to) in COMMAND_PROMPT_REPLACEMENTS {
            command = command.replace(from, to);
        }
    }

    // Input values may themselves reference the content root.
    replace_content_root(&command, content_root)
}

pub fn elevate(command: &str, executor: &ExecutorKind) -> String {
    match executor {
        ExecutorKind::PowerShell => format!("Start-Process PowerShell -Verb RunAs; {command}"),
        ExecutorKind::CommandPrompt => format!("cmd.exe /c \"{command}\""),
        ExecutorKind::Shell { .. } | ExecutorKind::CloudCli { .. } => format!("sudo {command}"),
        ExecutorKind::Manual => command.to_string(),
    }
}

pub fn replace_content_root(command: &str, content_root: &str) -> String {
    command
        .replace(CONTENT_ROOT_VARIABLE, content_root)
        .replace(CONTENT_ROOT_TOKEN, content_root)
}
