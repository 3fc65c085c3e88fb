//! Stages backed by external commands.
//!
//! A command stage runs a program once per stage call. The job is written to
//! the program's stdin as JSON, and the stage context is passed through
//! environment variables:
//!
//! - `CONTENTFORGE_STAGE`: `produce`, `assemble` or `publish`
//! - `CONTENTFORGE_JOB_ID`, `CONTENTFORGE_ATTEMPT`
//! - `CONTENTFORGE_WORK_DIR`: the job's work directory (also the working directory)
//! - `CONTENTFORGE_INPUT_ARTIFACT`: the artifact handed to assemble and publish
//!
//! The last non-empty stdout line is the result: an artifact path (relative
//! paths resolve against the work directory) for produce and assemble, and
//! for publish either a JSON receipt `{"external_id": .., "url": ..}` or a
//! bare external id. Exit codes 64 to 78 (sysexits usage and data errors)
//! are permanent failures; any other failure is transient.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::StageError;
use crate::scheduler::job::ContentJob;

use super::stages::{
    ArtifactRef, Assembler, MediaProducer, PublishReceipt, Publisher, Stage, StageContext,
};

/// Exit codes treated as permanent failures.
const PERMANENT_EXIT_CODES: std::ops::RangeInclusive<i32> = 64..=78;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 512;

/// A stage implemented by an external program.
#[derive(Debug, Clone)]
pub struct CommandStage {
    stage: Stage,
    program: String,
    args: Vec<String>,
}

impl CommandStage {
    /// Creates a stage running `program` with `args`.
    pub fn new(stage: Stage, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
        }
    }

    /// Parses a whitespace separated command line.
    ///
    /// No shell quoting is applied: quotes are passed through literally and
    /// an argument or program path cannot contain spaces. Wrap such a command
    /// in a script, or build the stage with [`CommandStage::new`].
    pub fn from_command_line(stage: Stage, command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(stage, program, parts.collect()))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs the command and returns the last non-empty stdout line.
    async fn invoke(
        &self,
        job: &ContentJob,
        input: Option<&ArtifactRef>,
        ctx: &StageContext,
    ) -> Result<String, StageError> {
        let payload = serde_json::to_vec(job)
            .map_err(|e| StageError::permanent(format!("failed to encode job: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&ctx.work_dir)
            .env("CONTENTFORGE_STAGE", self.stage.as_str())
            .env("CONTENTFORGE_JOB_ID", ctx.job_id.to_string())
            .env("CONTENTFORGE_ATTEMPT", ctx.attempt.to_string())
            .env("CONTENTFORGE_WORK_DIR", &ctx.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(artifact) = input {
            command.env("CONTENTFORGE_INPUT_ARTIFACT", artifact.path());
        }

        let mut child = command.spawn().map_err(|e| {
            StageError::permanent(format!("failed to start {} command '{}': {}", self.stage, self.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // The program may exit without reading its input.
                let _ = stdin.write_all(&payload).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("{} command failed: {}", self.stage, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(match output.status.code() {
                Some(code) if PERMANENT_EXIT_CODES.contains(&code) => StageError::permanent(format!(
                    "{} command exited with code {}: {}",
                    self.stage, code, excerpt
                )),
                Some(code) => StageError::transient(format!(
                    "{} command exited with code {}: {}",
                    self.stage, code, excerpt
                )),
                None => StageError::transient(format!(
                    "{} command terminated by signal: {}",
                    self.stage, excerpt
                )),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StageError::permanent(format!("{} command printed no result", self.stage)))
    }

    fn resolve_artifact(&self, line: &str, ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        let path = Path::new(line);
        let path: PathBuf = if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.work_dir.join(path)
        };
        if !path.exists() {
            return Err(StageError::permanent(format!(
                "{} command reported missing artifact {}",
                self.stage,
                path.display()
            )));
        }
        Ok(ArtifactRef::new(path))
    }
}

#[async_trait]
impl MediaProducer for CommandStage {
    async fn produce(&self, job: &ContentJob, ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        let line = self.invoke(job, None, ctx).await?;
        self.resolve_artifact(&line, ctx)
    }
}

#[async_trait]
impl Assembler for CommandStage {
    async fn assemble(
        &self,
        job: &ContentJob,
        artifact: &ArtifactRef,
        ctx: &StageContext,
    ) -> Result<ArtifactRef, StageError> {
        let line = self.invoke(job, Some(artifact), ctx).await?;
        self.resolve_artifact(&line, ctx)
    }
}

#[async_trait]
impl Publisher for CommandStage {
    async fn publish(
        &self,
        job: &ContentJob,
        artifact: &ArtifactRef,
        ctx: &StageContext,
    ) -> Result<PublishReceipt, StageError> {
        let line = self.invoke(job, Some(artifact), ctx).await?;
        parse_receipt(&line)
    }
}

fn parse_receipt(line: &str) -> Result<PublishReceipt, StageError> {
    if line.starts_with('{') {
        let receipt: PublishReceipt = serde_json::from_str(line)
            .map_err(|e| StageError::permanent(format!("invalid publish receipt: {}", e)))?;
        if receipt.external_id.trim().is_empty() {
            return Err(StageError::permanent("publish receipt has an empty external_id"));
        }
        return Ok(receipt);
    }
    Ok(PublishReceipt::new(line))
}

/// Stand-in for a stage with no configured command; every call fails permanently.
#[derive(Debug, Clone, Copy)]
pub struct UnconfiguredStage(pub Stage);

impl UnconfiguredStage {
    fn error(&self) -> StageError {
        StageError::permanent(format!("no {} command configured", self.0))
    }
}

#[async_trait]
impl MediaProducer for UnconfiguredStage {
    async fn produce(&self, _job: &ContentJob, _ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        Err(self.error())
    }
}

#[async_trait]
impl Assembler for UnconfiguredStage {
    async fn assemble(
        &self,
        _job: &ContentJob,
        _artifact: &ArtifactRef,
        _ctx: &StageContext,
    ) -> Result<ArtifactRef, StageError> {
        Err(self.error())
    }
}

#[async_trait]
impl Publisher for UnconfiguredStage {
    async fn publish(
        &self,
        _job: &ContentJob,
        _artifact: &ArtifactRef,
        _ctx: &StageContext,
    ) -> Result<PublishReceipt, StageError> {
        Err(self.error())
    }
}
