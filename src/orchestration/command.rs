//! External command adapters for workers, the validator, and councillors.
//!
//! Each adapter spawns a configured program, writes one JSON request to its
//! stdin, and reads one JSON reply from its stdout. The program is resolved
//! with `which` when the adapter is built, so a missing binary is reported
//! at startup instead of on first dispatch.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{Config, DEFAULT_PERSPECTIVES};
use crate::orchestration::council::{ConsensusCouncil, Councillor, DiagnosisBrief, Draft, Proposal, Ranking};
use crate::orchestration::registry::{CapabilityRegistry, CapabilityWorker, WorkOutput, WorkRequest, WorkerFailure};
use crate::orchestration::validation::{PresenceGate, ValidationGate, ValidationRequest, Verdict};
use crate::workspace::Artifact;
use crate::{clog_debug, clog_trace, Error, Result};

/// Council command id that serves every member without its own entry.
pub const ANY_MEMBER: &str = "*";

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Split on whitespace and resolve the program on `PATH`.
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("empty command".into()))?;
        let program = which::which(program)
            .map_err(|_| Error::Config(format!("command not found: {}", program)))?;
        Ok(Self {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }

    /// Run with `input` as JSON on stdin and return stdout.
    ///
    /// The child is killed if the returned future is dropped, which is how
    /// caller-side timeouts stop it.
    pub async fn run_json<T: Serialize>(
        &self,
        input: &T,
        cwd: Option<&Path>,
        limit: Option<Duration>,
    ) -> Result<String> {
        let payload = serde_json::to_vec(input)?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        clog_debug!("Spawning {}", self.program.display());
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = match limit {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        clog_trace!("{} replied: {}", self.program.display(), stdout.trim());
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.program.display(),
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Worker(message));
        }
        Ok(stdout)
    }
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// A capability worker backed by an external command.
///
/// Reply: `{"path": ..., "content": ..., "confidence": ...}` or `{"error": ...}`.
/// `path` defaults to the output name.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    spec: CommandSpec,
}

impl CommandWorker {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl CapabilityWorker for CommandWorker {
    async fn execute(&self, request: &WorkRequest) -> std::result::Result<WorkOutput, WorkerFailure> {
        let stdout = self
            .spec
            .run_json(request, request.workspace.as_deref(), None)
            .await
            .map_err(|e| WorkerFailure::new(e.to_string()))?;
        let reply: WorkerReply = serde_json::from_str(stdout.trim())
            .map_err(|e| WorkerFailure::new(format!("unreadable worker reply: {}", e)))?;

        if let Some(error) = reply.error {
            return Err(WorkerFailure::new(error));
        }
        let content = reply
            .content
            .ok_or_else(|| WorkerFailure::new("worker reply has no content"))?;
        let path = reply.path.unwrap_or_else(|| request.output.clone());
        Ok(WorkOutput {
            artifact: Artifact::new(&path, &content),
            confidence: reply.confidence.unwrap_or(0.5),
        })
    }
}

/// A validation gate backed by an external command.
///
/// Reply: `{"verdict": "pass"}` or `{"verdict": "fail", "gaps": [...]}`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    spec: CommandSpec,
    limit: Option<Duration>,
}

impl CommandValidator {
    pub fn new(spec: CommandSpec, limit: Option<Duration>) -> Self {
        Self { spec, limit }
    }
}

#[async_trait]
impl ValidationGate for CommandValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict> {
        let stdout = self.spec.run_json(request, None, self.limit).await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum CouncilRequest<'a> {
    Propose {
        member: &'a str,
        brief: &'a DiagnosisBrief,
    },
    Rank {
        member: &'a str,
        brief: &'a DiagnosisBrief,
        proposals: &'a [Proposal],
    },
}

#[derive(Debug, Deserialize)]
struct RankReply {
    ranking: Vec<String>,
    #[serde(default)]
    confidence: std::collections::BTreeMap<String, f64>,
}

/// A council member backed by an external command.
///
/// The same command can serve several members; the member id is part of
/// every request.
#[derive(Debug, Clone)]
pub struct CommandCouncillor {
    id: String,
    spec: CommandSpec,
}

impl CommandCouncillor {
    pub fn new(id: &str, spec: CommandSpec) -> Self {
        Self {
            id: id.to_string(),
            spec,
        }
    }
}

#[async_trait]
impl Councillor for CommandCouncillor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, brief: &DiagnosisBrief) -> Result<Draft> {
        let request = CouncilRequest::Propose {
            member: &self.id,
            brief,
        };
        let stdout = self.spec.run_json(&request, None, None).await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }

    async fn rank(&self, brief: &DiagnosisBrief, proposals: &[Proposal]) -> Result<Ranking> {
        let request = CouncilRequest::Rank {
            member: &self.id,
            brief,
            proposals,
        };
        let stdout = self.spec.run_json(&request, None, None).await?;
        let reply: RankReply = serde_json::from_str(stdout.trim())?;
        Ok(Ranking {
            order: reply.ranking,
            confidence: reply.confidence,
        })
    }
}

// ========== Construction from Config ==========

pub fn registry_from_config(config: &Config) -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    for entry in &config.workers {
        let worker: Arc<dyn CapabilityWorker> =
            Arc::new(CommandWorker::new(CommandSpec::parse(&entry.command)?));
        if entry.fixed {
            registry.register_fixed(entry.kind, entry.tier, worker);
        } else {
            registry.register(entry.kind, entry.tier, worker);
        }
    }
    Ok(registry)
}

/// The configured validator, or a presence check when none is set.
pub fn validator_from_config(config: &Config) -> Result<Arc<dyn ValidationGate>> {
    match &config.validator {
        Some(validator) => Ok(Arc::new(CommandValidator::new(
            CommandSpec::parse(&validator.command)?,
            validator.timeout_secs.map(Duration::from_secs),
        ))),
        None => Ok(Arc::new(PresenceGate::new())),
    }
}

/// The configured council, or `None` when no council commands are set.
///
/// Members are taken in order up to `council.size`. Each uses the command
/// with its own id, falling back to the `*` command.
pub fn council_from_config(config: &Config) -> Result<Option<ConsensusCouncil>> {
    let council = &config.council;
    if council.commands.is_empty() {
        return Ok(None);
    }

    let names: Vec<String> = if council.members.is_empty() {
        DEFAULT_PERSPECTIVES.iter().map(|s| s.to_string()).collect()
    } else {
        council.members.clone()
    };

    let mut members: Vec<Arc<dyn Councillor>> = Vec::new();
    for name in names.iter().take(council.size) {
        let command = council
            .commands
            .iter()
            .find(|c| c.id == *name)
            .or_else(|| council.commands.iter().find(|c| c.id == ANY_MEMBER))
            .ok_or_else(|| Error::Config(format!("no council command for member {}", name)))?;
        members.push(Arc::new(CommandCouncillor::new(
            name,
            CommandSpec::parse(&command.command)?,
        )));
    }
    Ok(Some(ConsensusCouncil::new(members, council.timeout())?))
}
