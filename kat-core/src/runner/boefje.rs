use std::{panic::AssertUnwindSafe, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use kat_model::Ooi;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{info, warn};

use crate::{
    config::{BackendConfig, BoefjeRunnerConfig},
    error::{PipelineError, Result, panic_message},
    job::{BoefjeJob, RawResult},
    plugin::ScanError,
    registry::{StaticPluginRegistry, boefje_content_tag},
};

/// Execution strategy for Boefjes.
#[async_trait]
pub trait BoefjeBackend: Send + Sync {
    async fn execute(
        &self,
        job: &BoefjeJob,
        input: &Ooi,
    ) -> std::result::Result<RawResult, ScanError>;
}

/// Calls the implementation compiled into the registry.
#[derive(Debug)]
pub struct InProcessBackend {
    registry: Arc<StaticPluginRegistry>,
}

impl InProcessBackend {
    pub fn new(registry: Arc<StaticPluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BoefjeBackend for InProcessBackend {
    async fn execute(
        &self,
        job: &BoefjeJob,
        input: &Ooi,
    ) -> std::result::Result<RawResult, ScanError> {
        let registered = self.registry.boefje(&job.boefje.id).ok_or_else(|| {
            ScanError::Infrastructure(format!(
                "unknown boefje {}",
                job.boefje.id
            ))
        })?;
        let body = registered.body.as_ref().ok_or_else(|| {
            ScanError::Infrastructure(format!(
                "boefje {} has no in-process implementation",
                job.boefje.id
            ))
        })?;
        body.scan(job, input).await
    }
}

/// Runs each job in a child process: the job JSON goes to stdin, stdout is
/// the raw output. A non-zero exit is an expected scan failure.
#[derive(Clone, Debug)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl BoefjeBackend for CommandBackend {
    async fn execute(
        &self,
        job: &BoefjeJob,
        _input: &Ooi,
    ) -> std::result::Result<RawResult, ScanError> {
        let payload = serde_json::to_vec(job)
            .map_err(|err| ScanError::Infrastructure(err.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(job.boefje.id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ScanError::Infrastructure(format!(
                    "failed to spawn {}: {err}",
                    self.program
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|err| ScanError::Infrastructure(err.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ScanError::Infrastructure(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("{} exited with {}", self.program, output.status),
                trimmed => trimmed.to_string(),
            };
            return Err(ScanError::Expected(message));
        }

        Ok(RawResult::new(output.stdout))
    }
}

pub struct BoefjeRunner {
    backend: Arc<dyn BoefjeBackend>,
    timeout: Duration,
}

impl std::fmt::Debug for BoefjeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoefjeRunner")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BoefjeRunner {
    pub fn new(backend: Arc<dyn BoefjeBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn from_config(
        config: &BoefjeRunnerConfig,
        registry: Arc<StaticPluginRegistry>,
    ) -> Self {
        let backend: Arc<dyn BoefjeBackend> = match &config.backend {
            BackendConfig::InProcess => {
                Arc::new(InProcessBackend::new(registry))
            }
            BackendConfig::Command { program, args } => {
                Arc::new(CommandBackend::new(program.clone(), args.clone()))
            }
        };
        Self::new(backend, Duration::from_secs(config.timeout_secs))
    }

    /// Run one scan. Expected failures and timeouts come back as raw output
    /// tagged `error/boefje`; only runner breakage is an `Err`.
    pub async fn run(&self, job: &mut BoefjeJob) -> Result<RawResult> {
        job.lifecycle.start();
        let input = match job.input_snapshot() {
            Ok(input) => input,
            Err(err) => {
                job.lifecycle.fail(err.to_string());
                return Err(err);
            }
        };

        let scan = AssertUnwindSafe(self.backend.execute(job, &input))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|payload| {
                    Err(ScanError::Infrastructure(format!(
                        "boefje panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                })
            });
        let outcome = tokio::time::timeout(self.timeout, scan).await;

        let failure = match outcome {
            Ok(Ok(raw)) => {
                job.lifecycle.complete();
                info!(
                    target: "kat::boefje",
                    boefje = %job.boefje.id,
                    job_id = %job.id,
                    bytes = raw.bytes.len(),
                    "boefje finished"
                );
                return Ok(raw.with_tag(boefje_content_tag(&job.boefje.id)));
            }
            Ok(Err(ScanError::Infrastructure(message))) => {
                warn!(
                    target: "kat::boefje",
                    boefje = %job.boefje.id,
                    job_id = %job.id,
                    error = %message,
                    "boefje runner failed"
                );
                job.lifecycle.fail(message.clone());
                return Err(PipelineError::TransientRunner(message));
            }
            Ok(Err(ScanError::Expected(message))) => message,
            Err(_) => {
                format!("scan timed out after {}s", self.timeout.as_secs())
            }
        };

        info!(
            target: "kat::boefje",
            boefje = %job.boefje.id,
            job_id = %job.id,
            error = %failure,
            "boefje reported an error"
        );
        job.lifecycle.complete_with_error(failure.clone());
        Ok(RawResult::error(failure))
    }
}
