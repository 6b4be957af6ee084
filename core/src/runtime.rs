use crate::config::{ConfigFile, RunConfiguration};
use crate::error::{OperatorError, TransportError};
use crate::loader;
use crate::machine::{host_id, planned_commands, Machine};
use crate::model::{local_platform, Host, InputArgument, TestDefinition};
use crate::results::{ExecutionResult, RunReport, Timing};
use crate::runlist::{RunListBuilder, Selection, WorkItem, ALL_TECHNIQUES};
use crate::transport::{DefaultTransportFactory, TransportFactory};
use serde::Serialize;
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Asks the operator for an input value. `None` keeps the current value.
pub trait InputPrompter: Send + Sync {
    fn prompt(&self, test: &TestDefinition, argument: &InputArgument) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub techniques: Vec<String>,
    pub test_guids: Vec<String>,
    pub hosts: Vec<Host>,
    pub config_file: Option<ConfigFile>,
    /// Build the run list and return it without executing anything.
    pub return_only: bool,
    pub config_file_only: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            techniques: vec![ALL_TECHNIQUES.to_string()],
            test_guids: Vec::new(),
            hosts: Vec::new(),
            config_file: None,
            return_only: false,
            config_file_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum RunOutcome {
    Planned(Vec<WorkItem>),
    Executed(RunReport),
}

/// One test aimed at one target.
struct Job {
    technique_id: String,
    technique_name: String,
    test: TestDefinition,
    host: Option<Host>,
    workdir: PathBuf,
}

pub struct Operator {
    config: Arc<RunConfiguration>,
    factory: Arc<dyn TransportFactory>,
    prompter: Option<Arc<dyn InputPrompter>>,
    cancel: CancellationToken,
    platform: String,
}

impl Operator {
    pub fn new(config: Arc<RunConfiguration>) -> Self {
        Self {
            config,
            factory: Arc::new(DefaultTransportFactory),
            prompter: None,
            cancel: CancellationToken::new(),
            platform: local_platform().to_string(),
        }
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn InputPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Overrides the platform local runs are checked against.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Cancelling this token stops in-flight commands and skips the rest.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, OperatorError> {
        let content = loader::load_all(self.config.content_root())?;
        info!(
            techniques = content.len(),
            root = %self.config.content_root().display(),
            "loaded content"
        );

        let selection = Selection {
            techniques: request.techniques,
            test_guids: request.test_guids,
            hosts: request.hosts,
            config_file_only: request.config_file_only,
        };
        let mut items = RunListBuilder::new(&content, self.config.input_overrides())
            .config(request.config_file.as_ref())
            .build(&selection)?;

        if request.return_only {
            return Ok(RunOutcome::Planned(items));
        }

        if self.config.prompt_for_inputs() {
            self.prompt_inputs(&mut items);
        }

        Ok(RunOutcome::Executed(self.execute(items).await))
    }

    fn prompt_inputs(&self, items: &mut [WorkItem]) {
        let Some(prompter) = &self.prompter else {
            warn!("input prompting requested but no prompter is configured");
            return;
        };
        for item in items.iter_mut() {
            for test in item.plan.tests.iter_mut() {
                let current: &TestDefinition = test;
                let answers: Vec<(usize, String)> = current
                    .input_arguments
                    .iter()
                    .enumerate()
                    .filter_map(|(index, argument)| {
                        prompter.prompt(current, argument).map(|answer| (index, answer))
                    })
                    .collect();
                for (index, answer) in answers {
                    if let Some(argument) = test.input_arguments.get_mut(index) {
                        argument.value = Some(Value::String(answer));
                    }
                }
            }
        }
    }

    /// Runs every work item and collects the results. Host failures end up in
    /// the report; nothing here aborts the run.
    pub async fn execute(&self, items: Vec<WorkItem>) -> RunReport {
        let report = Arc::new(Mutex::new(RunReport::new()));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency()));
        let mut tasks = JoinSet::new();

        for job in self.jobs(items, &report).await {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                warn!(test = %job.test.name, "run cancelled; skipping remaining tests");
                break;
            };

            let config = self.config.clone();
            let factory = self.factory.clone();
            let cancel = self.cancel.clone();
            let report = report.clone();
            tasks.spawn(async move {
                run_job(job, config, factory, cancel, report).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "test task panicked");
            }
        }

        let report = report.lock().await;
        report.clone()
    }

    /// Expands work items into (test, target) jobs in run order, recording
    /// tests that cannot run anywhere as diagnostics.
    async fn jobs(&self, items: Vec<WorkItem>, report: &Mutex<RunReport>) -> Vec<Job> {
        let mut jobs = Vec::new();
        let mut report = report.lock().await;

        for item in items {
            info!(
                technique = %item.plan.id,
                tests = item.plan.tests.len(),
                hosts = item.all_hosts().len(),
                "scheduling technique"
            );
            for (guid, keys) in &item.unmatched_overrides {
                debug!(test = %guid, keys = ?keys, "overrides matched no input argument");
            }

            let plan = &item.plan;
            for test in &plan.tests {
                report.register(&test.guid, &plan.id, &plan.display_name, &test.name);

                let hosts = item.hosts_for(&test.guid);
                if hosts.is_empty() {
                    if !test.runs_locally_on(&self.platform) {
                        let message = format!(
                            "unsupported platform: test supports [{}], local platform is {}",
                            test.supported_platforms.join(", "),
                            self.platform
                        );
                        warn!(technique = %plan.id, test = %test.name, "{message}");
                        report.diagnose(&test.guid, message);
                        continue;
                    }
                    jobs.push(Job {
                        technique_id: plan.id.clone(),
                        technique_name: plan.display_name.clone(),
                        test: test.clone(),
                        host: None,
                        workdir: plan.path.clone(),
                    });
                    continue;
                }

                for host in hosts {
                    jobs.push(Job {
                        technique_id: plan.id.clone(),
                        technique_name: plan.display_name.clone(),
                        test: test.clone(),
                        host: Some(host.clone()),
                        workdir: plan.path.clone(),
                    });
                }
            }
        }
        jobs
    }
}

async fn run_job(
    job: Job,
    config: Arc<RunConfiguration>,
    factory: Arc<dyn TransportFactory>,
    cancel: CancellationToken,
    report: Arc<Mutex<RunReport>>,
) {
    debug!(
        technique = %job.technique_id,
        name = %job.technique_name,
        test = %job.test.guid,
        host = %host_id(job.host.as_ref()),
        "starting test"
    );
    let mut machine = Machine::new(
        &config,
        &job.test,
        job.host.as_ref(),
        factory.as_ref(),
        &job.workdir,
        &cancel,
    );

    for request in planned_commands(&config, &job.test) {
        let result = if cancel.is_cancelled() {
            ExecutionResult::failed(
                request.template.as_str(),
                machine.host_id(),
                TransportError::cancelled(),
                &Timing::start(),
            )
        } else {
            machine.execute(&request).await
        };

        let warnings = machine.take_warnings();
        let mut report = report.lock().await;
        report.record(&job.test.guid, machine.host_id(), request.phase, result);
        for warning in warnings {
            report.diagnose(&job.test.guid, warning);
        }
    }

    machine.finish().await;
}
