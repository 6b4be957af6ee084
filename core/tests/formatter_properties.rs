//! Property tests for command template rendering.

use atomic_runner_core::formatter::format_command;
use atomic_runner_core::model::{ExecutorKind, InputArgument, ShellFlavor};
use proptest::prelude::*;
use serde_yaml::Value;

fn executor() -> impl Strategy<Value = ExecutorKind> {
    prop_oneof![
        Just(ExecutorKind::Shell {
            flavor: ShellFlavor::Sh
        }),
        Just(ExecutorKind::Shell {
            flavor: ShellFlavor::Bash
        }),
        Just(ExecutorKind::CommandPrompt),
        Just(ExecutorKind::PowerShell),
        Just(ExecutorKind::Manual),
    ]
}

fn argument(name: String, default: String) -> InputArgument {
    InputArgument {
        name,
        description: String::new(),
        kind: "string".to_string(),
        default: Some(Value::String(default)),
        value: None,
        source: None,
        destination: None,
    }
}

proptest! {
    /// Templates without placeholders pass through untouched.
    #[test]
    fn placeholder_free_templates_are_unchanged(
        template in "[a-z0-9 ./_|&-]{0,64}",
        executor in executor(),
    ) {
        let formatted = format_command(&template, &[], "/opt/atomics", &executor, false);
        prop_assert_eq!(formatted, template);
    }

    /// Every declared argument with a default is substituted.
    #[test]
    fn declared_placeholders_are_fully_replaced(
        names in proptest::collection::btree_set("[a-z][a-z_]{0,11}", 1..5),
        value in "[a-zA-Z0-9/._-]{1,24}",
        executor in executor(),
    ) {
        let inputs: Vec<InputArgument> = names
            .iter()
            .map(|name| argument(name.clone(), value.clone()))
            .collect();
        let template = names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                if index % 2 == 0 {
                    format!("#{{{name}}}")
                } else {
                    format!("${{{name}}}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        let formatted = format_command(&template, &inputs, "/opt/atomics", &executor, false);
        for name in &names {
            let hash_placeholder = format!("#{{{name}}}");
            let dollar_placeholder = format!("${{{name}}}");
            prop_assert!(!formatted.contains(&hash_placeholder));
            prop_assert!(!formatted.contains(&dollar_placeholder));
        }
    }
}
