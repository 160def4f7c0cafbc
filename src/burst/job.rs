//! Jobs handed to the plugin by the scheduler being bursted from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::errors::{BurstError, Result};

/// Flux job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-job resource overrides; take precedence over the plugin-wide limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// A command given either as an argv list or as a single shell-quoted line
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Argv(Vec<String>),
    Line(String),
}

/// A queued job. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(alias = "nnodes")]
    pub nodes: u32,
    #[serde(alias = "ntasks")]
    pub tasks: u32,
    #[serde(deserialize_with = "deserialize_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub resources: JobResources,
    /// Set when the job was submitted asking to be bursted
    #[serde(default)]
    pub burstable: bool,
}

fn deserialize_command<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match CommandSpec::deserialize(deserializer)? {
        CommandSpec::Argv(argv) => Ok(argv),
        CommandSpec::Line(line) => shell_words::split(&line).map_err(serde::de::Error::custom),
    }
}

impl Job {
    pub fn new(id: u64, nodes: u32, tasks: u32, command: &[&str]) -> Self {
        Self {
            id: JobId(id),
            nodes,
            tasks,
            command: command.iter().map(|s| s.to_string()).collect(),
            resources: JobResources::default(),
            burstable: false,
        }
    }

    pub fn burstable(mut self) -> Self {
        self.burstable = true;
        self
    }

    /// The command as one shell-quoted line, the form the container expects
    pub fn command_line(&self) -> String {
        shell_words::join(&self.command)
    }
}

/// Pull interface over the scheduler's pending jobs
pub trait JobSource {
    fn pending_jobs(&self) -> Result<Vec<Job>>;
}

/// Jobs read from a JSON array on disk
pub struct JobFile {
    path: PathBuf,
}

impl JobFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobSource for JobFile {
    fn pending_jobs(&self) -> Result<Vec<Job>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            BurstError::JobSource(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        let jobs: Vec<Job> = serde_json::from_str(&content).map_err(|e| {
            BurstError::JobSource(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        for job in &jobs {
            if job.nodes == 0 {
                return Err(BurstError::JobSource(format!(
                    "job {} requests zero nodes",
                    job.id
                )));
            }
            if job.command.is_empty() {
                return Err(BurstError::JobSource(format!(
                    "job {} has an empty command",
                    job.id
                )));
            }
        }

        tracing::debug!(path = %self.path.display(), count = jobs.len(), "Loaded pending jobs");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn job_file(json: &str) -> tempfile::NamedTempFile {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(json.as_bytes()).unwrap();
        temp
    }

    #[test]
    fn test_parse_jobs_argv_and_line() {
        let temp = job_file(
            r#"[
                {"id": 1, "nnodes": 4, "ntasks": 16, "command": ["lmp", "-in", "in.reaxc.hns"]},
                {"id": 2, "nodes": 2, "tasks": 2, "command": "echo 'hello world'",
                 "resources": {"memory": "8Gi"}, "burstable": true}
            ]"#,
        );

        let jobs = JobFile::new(temp.path()).pending_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, JobId(1));
        assert_eq!(jobs[0].nodes, 4);
        assert_eq!(jobs[0].command_line(), "lmp -in in.reaxc.hns");
        assert_eq!(jobs[1].command, vec!["echo", "hello world"]);
        assert_eq!(jobs[1].command_line(), "echo 'hello world'");
        assert_eq!(jobs[1].resources.memory.as_deref(), Some("8Gi"));
        assert!(!jobs[0].burstable);
        assert!(jobs[1].burstable);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let temp = job_file(r#"[{"id": 9, "nodes": 0, "tasks": 1, "command": "hostname"}]"#);
        let err = JobFile::new(temp.path()).pending_jobs().unwrap_err();
        assert!(err.to_string().contains("zero nodes"));
    }

    #[test]
    fn test_missing_file() {
        let err = JobFile::new("/nonexistent/jobs.json").pending_jobs().unwrap_err();
        assert!(matches!(err, BurstError::JobSource(_)));
    }
}
