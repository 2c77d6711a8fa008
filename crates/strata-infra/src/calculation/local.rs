//! Runs calculations as local subprocesses.
//!
//! Each calculation code maps to a [`CalculationCommand`]. On submit the
//! command is spawned on a background task with the serialized
//! [`CalculationRequest`] on stdin; the JSON object it prints on stdout
//! becomes the job's outputs. Job states live in memory only, so a restarted
//! engine sees its old jobs as lost.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use strata_core::calculation::{
    CalculationBackend, CalculationError, CalculationRequest, JobId, JobState,
};
use strata_types::config::{CalculationCommand, GlobalConfig};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Longest stderr excerpt kept in a failure message.
const MAX_STDERR_CHARS: usize = 2_000;

pub struct LocalProcessBackend {
    commands: BTreeMap<String, CalculationCommand>,
    jobs: Arc<DashMap<String, JobState>>,
    /// Parent of the per-job scratch directories.
    work_dir: Option<PathBuf>,
}

impl LocalProcessBackend {
    pub fn new(commands: BTreeMap<String, CalculationCommand>) -> Self {
        Self {
            commands,
            jobs: Arc::new(DashMap::new()),
            work_dir: None,
        }
    }

    /// Run each job inside its own directory under `dir`.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Backend for every code under `[calculations]` in the config file.
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.calculations.clone())
    }

    pub fn register(mut self, code: impl Into<String>, command: CalculationCommand) -> Self {
        self.commands.insert(code.into(), command);
        self
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

impl CalculationBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, request: &CalculationRequest) -> Result<JobId, CalculationError> {
        let command = self
            .commands
            .get(&request.code)
            .cloned()
            .ok_or_else(|| CalculationError::UnknownCode(request.code.clone()))?;
        let payload =
            serde_json::to_vec(request).map_err(|e| CalculationError::Submit(e.to_string()))?;

        let line = command_line(&command);
        let job = format!("local-{}", uuid::Uuid::now_v7());
        self.jobs.insert(job.clone(), JobState::Queued);

        let jobs = Arc::clone(&self.jobs);
        let job_key = job.clone();
        let process_id = request.process_id;
        let job_dir = self.work_dir.as_ref().map(|dir| dir.join(&job));
        tokio::spawn(async move {
            jobs.insert(job_key.clone(), JobState::Running);
            let state = execute(&command, payload, job_dir).await;
            match &state {
                JobState::Failed { message } => {
                    tracing::warn!(job = %job_key, process_id = %process_id, error = %message, "local calculation failed")
                }
                _ => tracing::debug!(job = %job_key, process_id = %process_id, "local calculation finished"),
            }
            jobs.insert(job_key, state);
        });

        tracing::debug!(
            job = %job,
            code = %request.code,
            command = %line,
            "submitted local calculation"
        );
        Ok(JobId(job))
    }

    async fn poll(&self, job: &JobId) -> Result<JobState, CalculationError> {
        self.jobs
            .get(&job.0)
            .map(|state| state.value().clone())
            .ok_or_else(|| CalculationError::JobNotFound(job.0.clone()))
    }
}

fn command_line(command: &CalculationCommand) -> String {
    if command.args.is_empty() {
        command.command.clone()
    } else {
        format!("{} {}", command.command, command.args.join(" "))
    }
}

/// Run `command` to completion with `payload` on stdin.
async fn execute(
    command: &CalculationCommand,
    payload: Vec<u8>,
    job_dir: Option<PathBuf>,
) -> JobState {
    let mut cmd = Command::new(&command.command);
    if let Some(dir) = job_dir {
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            return JobState::Failed {
                message: format!("could not create {}: {err}", dir.display()),
            };
        }
        cmd.current_dir(dir);
    }
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return JobState::Failed {
                message: format!("could not start '{}': {err}", command.command),
            };
        }
    };

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A program that ignores its input closes the pipe early.
            if let Err(err) = stdin.write_all(&payload).await {
                tracing::debug!(error = %err, "calculation did not read its request");
            }
        }
    };
    // Feed stdin while collecting output so neither pipe can fill up and stall.
    let run = async move {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    let output = match command.timeout() {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(output) => output,
            Err(_) => {
                return JobState::Failed {
                    message: format!("timed out after {}s", limit.as_secs()),
                };
            }
        },
        None => run.await,
    };

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            return JobState::Failed {
                message: format!("could not collect output: {err}"),
            };
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!(
                "exited with {}: {}",
                output.status,
                tail(stderr, MAX_STDERR_CHARS)
            )
        };
        return JobState::Failed { message };
    }

    match parse_outputs(&output.stdout) {
        Ok(outputs) => JobState::Finished { outputs },
        Err(message) => JobState::Failed { message },
    }
}

fn parse_outputs(stdout: &[u8]) -> Result<BTreeMap<String, Value>, String> {
    let value: Value =
        serde_json::from_slice(stdout).map_err(|e| format!("stdout is not JSON: {e}"))?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(format!("expected a JSON object of outputs, got {other}")),
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use strata_core::calculation::CalculationSpec;
    use strata_core::engine::Engine;
    use strata_core::repository::InMemoryProvenanceRepository;
    use strata_types::config::EngineConfig;
    use strata_types::node::NodeId;
    use strata_types::process::{ErrorKind, ProcessStatus};

    use super::*;

    fn shell(script: &str) -> CalculationCommand {
        CalculationCommand {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs: None,
        }
    }

    fn request(code: &str) -> CalculationRequest {
        CalculationRequest {
            process_id: NodeId::new(),
            code: code.to_string(),
            inputs: [("x".to_string(), json!(2))].into(),
            options: Value::Null,
        }
    }

    async fn finish(backend: &LocalProcessBackend, job: &JobId) -> JobState {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = backend.poll(job).await.unwrap();
                if state.is_terminal() {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_is_fed_on_stdin() {
        let backend = LocalProcessBackend::new(BTreeMap::new()).register("echo", shell("cat"));
        let job = backend.submit(&request("echo")).await.unwrap();
        assert!(job.0.starts_with("local-"));

        match finish(&backend, &job).await {
            JobState::Finished { outputs } => {
                assert_eq!(outputs["code"], json!("echo"));
                assert_eq!(outputs["inputs"], json!({ "x": 2 }));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_program_may_ignore_stdin() {
        let backend = LocalProcessBackend::new(BTreeMap::new())
            .register("const", shell(r#"echo '{"energy": -1.5}'"#));
        let job = backend.submit(&request("const")).await.unwrap();
        assert_eq!(
            finish(&backend, &job).await,
            JobState::Finished {
                outputs: [("energy".to_string(), json!(-1.5))].into()
            }
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let backend = LocalProcessBackend::new(BTreeMap::new())
            .register("bad", shell("echo 'scf did not converge' >&2; exit 3"));
        let job = backend.submit(&request("bad")).await.unwrap();
        match finish(&backend, &job).await {
            JobState::Failed { message } => {
                assert!(message.contains("scf did not converge"), "{message}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_object_stdout_fails() {
        let backend = LocalProcessBackend::new(BTreeMap::new())
            .register("text", shell("echo hello"))
            .register("list", shell("echo '[1, 2]'"));

        let job = backend.submit(&request("text")).await.unwrap();
        match finish(&backend, &job).await {
            JobState::Failed { message } => assert!(message.contains("not JSON"), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }

        let job = backend.submit(&request("list")).await.unwrap();
        match finish(&backend, &job).await {
            JobState::Failed { message } => assert!(message.contains("JSON object"), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_the_job() {
        let mut slow = shell("sleep 30");
        slow.timeout_secs = Some(1);
        let backend = LocalProcessBackend::new(BTreeMap::new()).register("slow", slow);
        let job = backend.submit(&request("slow")).await.unwrap();
        assert_eq!(
            finish(&backend, &job).await,
            JobState::Failed {
                message: "timed out after 1s".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_the_job() {
        let backend = LocalProcessBackend::new(BTreeMap::new()).register(
            "ghost",
            CalculationCommand::new("/nonexistent/strata-calculation"),
        );
        let job = backend.submit(&request("ghost")).await.unwrap();
        match finish(&backend, &job).await {
            JobState::Failed { message } => assert!(message.contains("could not start")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_code_and_job() {
        let backend = LocalProcessBackend::new(BTreeMap::new());
        let err = backend.submit(&request("relax")).await.unwrap_err();
        assert!(matches!(err, CalculationError::UnknownCode(code) if code == "relax"));

        let err = backend.poll(&JobId("local-missing".into())).await.unwrap_err();
        assert!(matches!(err, CalculationError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_jobs_run_in_their_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalProcessBackend::new(BTreeMap::new())
            .register("touch", shell(r#"touch marker; echo '{}'"#))
            .with_work_dir(dir.path());
        let job = backend.submit(&request("touch")).await.unwrap();
        assert!(matches!(finish(&backend, &job).await, JobState::Finished { .. }));
        assert!(dir.path().join(&job.0).join("marker").exists());
    }

    #[test]
    fn test_from_config_registers_codes() {
        let mut config = GlobalConfig::default();
        config
            .calculations
            .insert("relax".to_string(), CalculationCommand::new("relax.sh"));
        let backend = LocalProcessBackend::from_config(&config);
        assert_eq!(backend.codes().collect::<Vec<_>>(), vec!["relax"]);
    }

    #[test]
    fn test_tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_engine_runs_local_calculation() {
        let backend = LocalProcessBackend::new(BTreeMap::new())
            .register("const", shell(r#"echo '{"energy": -1.5, "steps": 12}'"#))
            .register("bad", shell("exit 1"));
        let engine = Engine::new(
            InMemoryProvenanceRepository::new(),
            EngineConfig {
                poll_interval_ms: 5,
                max_poll_interval_ms: 20,
                ..Default::default()
            },
        )
        .with_backend(backend);

        let structure = engine.graph().store(json!({ "cell": [1.0] })).await.unwrap();
        let future = engine
            .submit_calculation(CalculationSpec::new("const").input("structure", structure))
            .await
            .unwrap();
        let result = engine.wait(&future).await.unwrap();
        let energy = result.outputs.get("energy").unwrap();
        assert_eq!(engine.graph().value(energy).await.unwrap(), json!(-1.5));
        assert_eq!(result.outputs.len(), 2);

        let failed = engine
            .submit_calculation(CalculationSpec::new("bad"))
            .await
            .unwrap();
        let _ = engine.wait(&failed).await;
        let record = engine.checkpoints().load(failed.process_id).await.unwrap();
        assert_eq!(record.status, ProcessStatus::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::ExternalExecution);
    }
}
