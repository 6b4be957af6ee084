use anyhow::{anyhow, Context};
use atomic_runner_core::config::expand_path;
use atomic_runner_core::model::{WinRmAuth, DEFAULT_SSH_PORT};
use atomic_runner_core::{
    ConfigFile, Host, InputArgument, InputPrompter, Operator, RunConfiguration, RunOutcome,
    RunRequest, TestDefinition, WorkItem,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_yaml::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run atomic security tests locally or on remote hosts")]
struct AtomicCli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the run list and print it without executing anything
    Plan(RunArgs),
    /// Execute the selected tests and print their results
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Directory containing atomic technique folders or emulation plans
    #[arg(long, value_name = "DIR")]
    content_path: PathBuf,
    /// Techniques to run (comma separated); `all` selects everything
    #[arg(long, value_delimiter = ',', default_value = "all")]
    techniques: Vec<String>,
    /// Individual test GUIDs to run (comma separated)
    #[arg(long, value_delimiter = ',')]
    test_guids: Vec<String>,
    /// Remote hosts to run against (comma separated)
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, value_name = "PATH")]
    ssh_key_path: Option<PathBuf>,
    #[arg(long, value_name = "KEY")]
    private_key_string: Option<String>,
    /// Use HTTPS with certificate validation for WinRM
    #[arg(long)]
    verify_ssl: bool,
    /// WinRM authentication scheme: ntlm (sealed on plain HTTP) or basic
    #[arg(long, value_name = "SCHEME", default_value = "ntlm", value_parser = parse_winrm_auth)]
    winrm_auth: WinRmAuth,
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,
    /// Connection timeout for remote hosts, in seconds
    #[arg(long, default_value_t = 5)]
    ssh_timeout: u64,
    /// YAML file with inventories and per-test bindings
    #[arg(long, value_name = "PATH")]
    config_file: Option<PathBuf>,
    /// Only run what the config file selects
    #[arg(long)]
    config_file_only: bool,
    /// Override an input argument (format: key=value). Repeat for multiple overrides.
    #[arg(
        long = "input",
        value_parser = parse_key_val,
        value_name = "KEY=VALUE",
        action = ArgAction::Append
    )]
    inputs: Vec<(String, String)>,
    #[arg(long)]
    check_prereqs: bool,
    #[arg(long)]
    get_prereqs: bool,
    #[arg(long)]
    cleanup: bool,
    /// Do not copy supporting files to remote hosts
    #[arg(long)]
    no_copy_source_files: bool,
    /// Per-command timeout in seconds
    #[arg(long, default_value_t = atomic_runner_core::config::DEFAULT_COMMAND_TIMEOUT_SECS)]
    command_timeout: u64,
    /// Ask for every input argument before running
    #[arg(long)]
    prompt_for_inputs: bool,
    /// Number of (test, host) pairs to run at once
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Output JSON instead of a human-readable summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = AtomicCli::parse();
    init_logging(cli.debug, cli.log_file.as_ref())?;

    match cli.command {
        Command::Plan(args) => {
            let json = args.json;
            let (operator, request) = prepare(args, true)?;
            output_outcome(operator.run(request).await?, json)?;
        }
        Command::Run(args) => {
            let json = args.json;
            let (operator, request) = prepare(args, false)?;

            let cancel = operator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling run");
                    cancel.cancel();
                }
            });

            output_outcome(operator.run(request).await?, json)?;
        }
    }

    Ok(())
}

fn init_logging(debug: bool, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(expand_path(path))
                .with_context(|| format!("unable to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|err| anyhow!("failed to initialise logging: {err}"))
}

fn parse_winrm_auth(raw: &str) -> Result<WinRmAuth, String> {
    raw.parse()
}

fn prepare(args: RunArgs, return_only: bool) -> anyhow::Result<(Operator, RunRequest)> {
    let mut builder = RunConfiguration::builder(&args.content_path)
        .check_prereqs(args.check_prereqs)
        .get_prereqs(args.get_prereqs)
        .cleanup(args.cleanup)
        .copy_source_files(!args.no_copy_source_files)
        .prompt_for_inputs(args.prompt_for_inputs)
        .command_timeout(args.command_timeout)
        .max_concurrency(args.concurrency);
    for (key, raw) in &args.inputs {
        builder = builder.input_override(key.clone(), parse_input_value(raw));
    }
    let config = builder.build()?;

    let config_file = args
        .config_file
        .as_deref()
        .map(ConfigFile::load)
        .transpose()?;

    let hosts = args
        .hosts
        .iter()
        .map(|hostname| hostname.trim())
        .filter(|hostname| !hostname.is_empty())
        .map(|hostname| {
            let mut host = Host::new(hostname);
            host.username = args.username.clone();
            host.password = args.password.clone();
            host.ssh_key_path = args.ssh_key_path.as_deref().map(expand_path);
            host.private_key = args.private_key_string.clone();
            host.verify_ssl = args.verify_ssl;
            host.winrm_auth = args.winrm_auth;
            host.port = Some(args.ssh_port);
            host.timeout = args.ssh_timeout;
            host
        })
        .collect();

    info!(content = %config.content_root().display(), "configuration ready");
    let mut operator = Operator::new(Arc::new(config));
    if args.prompt_for_inputs {
        operator = operator.with_prompter(Arc::new(StdinPrompter));
    }

    let request = RunRequest {
        techniques: args.techniques,
        test_guids: args.test_guids,
        hosts,
        config_file,
        return_only,
        config_file_only: args.config_file_only,
    };
    Ok((operator, request))
}

/// Input values are read as YAML scalars so numbers and booleans keep
/// their type; anything unparseable stays a string.
fn parse_input_value(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() {
        return Err(format!("expected KEY=VALUE, got '{s}'"));
    }
    Ok((parts[0].trim().to_string(), parts[1].to_string()))
}

fn output_outcome(outcome: RunOutcome, json: bool) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Planned(items) => output_plan(&items, json),
        RunOutcome::Executed(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
                if report.has_failures() {
                    println!("\n[warn] some commands failed");
                }
            }
            Ok(())
        }
    }
}

fn output_plan(items: &[WorkItem], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No tests selected.");
        return Ok(());
    }

    println!("Run list:");
    for item in items {
        println!("  - {} {}", item.id(), item.plan.display_name);
        for test in item.tests() {
            let hosts: Vec<String> = item
                .hosts_for(&test.guid)
                .iter()
                .map(ToString::to_string)
                .collect();
            let target = if hosts.is_empty() {
                "local".to_string()
            } else {
                hosts.join(", ")
            };
            println!(
                "      * {} ({}) via {} [{}]",
                test.name, test.guid, test.executor.kind, target
            );
        }
        for (guid, keys) in &item.unmatched_overrides {
            println!("      ! {guid}: unused inputs {}", keys.join(", "));
        }
    }
    Ok(())
}

struct StdinPrompter;

impl InputPrompter for StdinPrompter {
    fn prompt(&self, test: &TestDefinition, argument: &InputArgument) -> Option<String> {
        let current = argument.resolved_string().unwrap_or_default();
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "[{}] {} ({}) [{}]: ",
            test.name, argument.name, argument.description, current
        );
        let _ = stderr.flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(_) => {
                let answer = line.trim();
                (!answer.is_empty()).then(|| answer.to_string())
            }
            Err(err) => {
                warn!(error = %err, "failed to read input; keeping current value");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_inputs_and_host_lists() {
        let cli = AtomicCli::parse_from([
            "atomic-runner",
            "plan",
            "--content-path",
            "/opt/atomics",
            "--hosts",
            "10.0.0.1,10.0.0.2",
            "--input",
            "output_file=/tmp/x=y",
            "--input",
            "count=3",
        ]);
        let Command::Plan(args) = cli.command else {
            panic!("plan subcommand expected");
        };
        assert_eq!(args.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(args.techniques, vec!["all"]);
        assert_eq!(
            args.inputs,
            vec![
                ("output_file".to_string(), "/tmp/x=y".to_string()),
                ("count".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn input_values_keep_scalar_types() {
        assert_eq!(parse_input_value("3"), Value::Number(3.into()));
        assert_eq!(parse_input_value("true"), Value::Bool(true));
        assert_eq!(
            parse_input_value("[unclosed"),
            Value::String("[unclosed".to_string())
        );
        assert_eq!(
            parse_input_value("/tmp/out.txt"),
            Value::String("/tmp/out.txt".to_string())
        );
    }

    #[test]
    fn rejects_inputs_without_key() {
        assert!(parse_key_val("=value").is_err());
        assert!(parse_key_val("novalue").is_err());
    }
}
