//! Execution of a single (task, model, sample) attempt.
//!
//! An [`AttemptExecutor`] owns exactly one [`Attempt`] and walks it through
//! `pending → prompting → awaiting_model → applying_patch → testing` to a
//! terminal status. Every failure is captured on the attempt; nothing here
//! aborts the run.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::result::{Attempt, AttemptKey, AttemptStatus, TokenUsage};
use super::sandbox::{Sandbox, REQUIREMENTS_FILE};
use super::test_runner::{TestResult, TestRunner};
use crate::catalog::{EvalCommand, TaskDefinition};
use crate::llm::{CompletionParams, ModelGateway};
use crate::metrics::MetricsCollector;
use crate::patch::{PatchApplier, PatchReport};
use crate::progress::{ProgressDispatcher, ProgressEvent};
use crate::prompts::PromptBuilder;
use crate::storage::ArtifactWriter;

/// Wall-clock limit for the dependency install step.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Pip invocation used when a run enables dependency installs.
pub fn pip_install_command() -> EvalCommand {
    EvalCommand::new(["python3", "-m", "pip", "install", "-r", REQUIREMENTS_FILE])
}

/// Where an attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Pending,
    Prompting,
    AwaitingModel,
    ApplyingPatch,
    Testing,
    Finished(AttemptStatus),
}

impl AttemptPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptPhase::Finished(_))
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptPhase::Pending => f.write_str("pending"),
            AttemptPhase::Prompting => f.write_str("prompting"),
            AttemptPhase::AwaitingModel => f.write_str("awaiting_model"),
            AttemptPhase::ApplyingPatch => f.write_str("applying_patch"),
            AttemptPhase::Testing => f.write_str("testing"),
            AttemptPhase::Finished(status) => write!(f, "{}", status),
        }
    }
}

/// Collaborators shared by every attempt of a run.
pub struct ExecutionContext {
    pub gateway: Arc<dyn ModelGateway>,
    pub prompts: PromptBuilder,
    pub patches: PatchApplier,
    pub tests: TestRunner,
    pub params: CompletionParams,
    pub dispatcher: Option<ProgressDispatcher>,
    pub metrics: MetricsCollector,
    /// Run in the sandbox before the patch when the task has requirements.
    pub install_command: Option<EvalCommand>,
    pub install_timeout: Duration,
}

impl ExecutionContext {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        prompts: PromptBuilder,
        patches: PatchApplier,
        tests: TestRunner,
        params: CompletionParams,
    ) -> Self {
        Self {
            gateway,
            prompts,
            patches,
            tests,
            params,
            dispatcher: None,
            metrics: MetricsCollector::new(),
            install_command: None,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    /// Install task requirements with `command` before each patch.
    pub fn with_install_command(mut self, command: EvalCommand, timeout: Duration) -> Self {
        self.install_command = Some(command);
        self.install_timeout = timeout;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: ProgressDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}

/// Attempt record plus the phase guard around it.
#[derive(Debug)]
struct AttemptState {
    attempt: Attempt,
    phase: AttemptPhase,
    dispatched: Instant,
}

impl AttemptState {
    fn new(key: AttemptKey) -> Self {
        Self {
            attempt: Attempt::pending(key),
            phase: AttemptPhase::Pending,
            dispatched: Instant::now(),
        }
    }

    /// Move to `next`; returns false (and changes nothing) once terminal.
    fn advance(&mut self, next: AttemptPhase) -> bool {
        if self.phase.is_terminal() {
            warn!(
                attempt = %self.attempt.key,
                from = %self.phase,
                to = %next,
                "Ignoring transition out of terminal state"
            );
            return false;
        }
        debug!(attempt = %self.attempt.key, from = %self.phase, to = %next, "Attempt transition");
        self.phase = next;
        self.attempt.status = match next {
            AttemptPhase::Pending => AttemptStatus::Pending,
            AttemptPhase::Finished(status) => status,
            _ => AttemptStatus::Running,
        };
        self.attempt.duration_seconds = self.dispatched.elapsed().as_secs_f64();
        true
    }

    fn finish(&mut self, status: AttemptStatus, error: Option<String>) {
        if self.advance(AttemptPhase::Finished(status)) {
            self.attempt.error = error;
        }
    }

    fn fail_with(&mut self, error: String) {
        self.finish(AttemptStatus::Error, Some(error));
    }
}

/// Runs one attempt to completion.
pub struct AttemptExecutor {
    ctx: Arc<ExecutionContext>,
    task: Arc<TaskDefinition>,
    artifacts: Option<ArtifactWriter>,
    state: AttemptState,
}

impl AttemptExecutor {
    pub fn new(ctx: Arc<ExecutionContext>, task: Arc<TaskDefinition>, key: AttemptKey) -> Self {
        Self {
            ctx,
            task,
            artifacts: None,
            state: AttemptState::new(key),
        }
    }

    /// Write per-attempt files through `writer`.
    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.state.attempt.artifact_dir = Some(writer.rel_dir().to_string());
        self.artifacts = Some(writer);
        self
    }

    pub fn key(&self) -> &AttemptKey {
        &self.state.attempt.key
    }

    /// Drive the attempt to a terminal status and publish it.
    ///
    /// Always returns a terminal attempt; the only event published is the
    /// final `attempt` snapshot.
    pub async fn run(mut self) -> Attempt {
        self.ctx.metrics.attempt_started();
        self.execute().await;

        if let Some(error) = self.state.attempt.error.clone() {
            self.write_artifact("error.log", &error).await;
        }

        let attempt = self.state.attempt;
        info!(
            task_id = %attempt.key.task_id,
            model = %attempt.key.model,
            sample_index = attempt.key.sample_index,
            status = %attempt.status,
            duration_secs = attempt.duration_seconds,
            "Attempt finished"
        );
        self.ctx
            .metrics
            .record_attempt(attempt.status, &attempt.key.model, attempt.duration_seconds);
        if let Some(dispatcher) = &self.ctx.dispatcher {
            dispatcher.publish(ProgressEvent::from(&attempt));
        }
        attempt
    }

    async fn execute(&mut self) {
        self.state.advance(AttemptPhase::Prompting);
        let prompt = match self.ctx.prompts.build(&self.task) {
            Ok(prompt) => prompt,
            Err(e) => return self.state.fail_with(format!("Prompt error: {}", e)),
        };
        self.write_artifact("prompt.txt", &prompt).await;

        self.state.advance(AttemptPhase::AwaitingModel);
        let model = self.state.attempt.key.model.clone();
        let completion = match self.ctx.gateway.complete(&prompt, &model, self.ctx.params).await {
            Ok(completion) => completion,
            Err(e) => return self.state.fail_with(format!("Model error: {}", e)),
        };
        let usage = completion.usage.map(TokenUsage::from);
        let latency = completion.latency.as_secs_f64();
        self.state.attempt.usage = usage;
        self.state.attempt.cost_usd = completion.cost_usd;
        self.state.attempt.api_latency_seconds = Some(latency);
        self.ctx.metrics.record_llm_call(&model, latency, usage, completion.cost_usd);
        self.write_artifact("response.txt", &completion.text).await;

        self.state.advance(AttemptPhase::ApplyingPatch);
        let sandbox = match Sandbox::acquire(&self.task).await {
            Ok(sandbox) => sandbox,
            Err(e) => return self.state.fail_with(format!("Sandbox error: {}", e)),
        };
        self.run_in_sandbox(&sandbox, completion.text).await;
        if let Err(e) = sandbox.release().await {
            warn!(attempt = %self.state.attempt.key, error = %e, "Sandbox cleanup failed");
        }
    }

    /// Install dependencies, apply the patch and run the eval in `sandbox`.
    async fn run_in_sandbox(&mut self, sandbox: &Sandbox, response: String) {
        if let Err(e) = self.install_dependencies(sandbox).await {
            return self.state.fail_with(e);
        }

        let report = match self.apply_patch(sandbox, response).await {
            Ok(report) => report,
            Err(e) => return self.state.fail_with(e),
        };
        self.ctx.metrics.record_patch_outcome(report.outcome);
        self.state.attempt.patch_outcome = Some(report.outcome);
        self.state.attempt.patch_strategy = report.strategy.clone();
        if let Some(diff) = &report.diff {
            self.write_artifact("patch.diff", diff).await;
        }
        if report.is_rejected() {
            let reason = report.reason.unwrap_or_else(|| "no strategy succeeded".to_string());
            return self.state.fail_with(format!("Patch rejected: {}", reason));
        }

        self.state.advance(AttemptPhase::Testing);
        match self
            .ctx
            .tests
            .run(sandbox, self.task.eval_command(), self.task.timeout())
            .await
        {
            Ok(result) => self.record_test_result(result).await,
            Err(e) => self.state.fail_with(format!("Test runner error: {}", e)),
        }
    }

    /// Run the install command when enabled and the task ships a
    /// `requirements.txt`.
    async fn install_dependencies(&self, sandbox: &Sandbox) -> Result<(), String> {
        let Some(command) = &self.ctx.install_command else {
            return Ok(());
        };
        if !sandbox.root().join(REQUIREMENTS_FILE).is_file() {
            return Ok(());
        }

        debug!(attempt = %self.state.attempt.key, command = %command.display(), "Installing dependencies");
        let result = self
            .ctx
            .tests
            .run(sandbox, command, self.ctx.install_timeout)
            .await
            .map_err(|e| format!("Dependency install failed: {}", e))?;
        let log = format!("STDOUT:\n{}\nSTDERR:\n{}", result.stdout, result.stderr);
        self.write_artifact("install.log", &log).await;

        if result.timed_out {
            return Err(format!(
                "Dependency install failed: timed out after {}s",
                self.ctx.install_timeout.as_secs()
            ));
        }
        match result.exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(format!("Dependency install failed with code {}:\n{}", code, log)),
            None => Err(format!("Dependency install was terminated by a signal:\n{}", log)),
        }
    }

    async fn apply_patch(&self, sandbox: &Sandbox, text: String) -> Result<PatchReport, String> {
        let applier = self.ctx.patches.clone();
        let root = sandbox.root().to_path_buf();
        tokio::task::spawn_blocking(move || applier.apply(&text, &root))
            .await
            .map_err(|e| format!("Patch task failed: {}", e))
    }

    async fn record_test_result(&mut self, result: TestResult) {
        self.write_artifact("stdout.log", &result.stdout).await;
        self.write_artifact("stderr.log", &result.stderr).await;
        self.state.attempt.return_code = result.exit_code;
        self.state.attempt.timed_out = result.timed_out;

        if result.timed_out {
            self.state.fail_with(format!(
                "Eval command timed out after {}s",
                self.task.timeout_seconds
            ));
        } else if result.exit_code == Some(0) {
            self.state.finish(AttemptStatus::Pass, None);
        } else {
            let detail = match result.exit_code {
                Some(code) => format!("Eval command exited with code {}", code),
                None => "Eval command was terminated by a signal".to_string(),
            };
            self.state.finish(AttemptStatus::Fail, Some(detail));
        }
    }

    async fn write_artifact(&self, name: &str, contents: &str) {
        if let Some(writer) = &self.artifacts {
            writer.write(name, contents).await;
        }
    }
}
