//! `lxc` CLI adapter
//!
//! Every call shells out to the `lxc` binary. Targets are addressed as
//! `remote:name` except for power actions, which take the bare name.

use crate::{
    find_record, parse_list_output, ContainerName, ContainerRecord, ContainerSession,
    ContainerStatus, FilePushOptions, Hypervisor, LaunchSpec, OutputSink, ProviderError, Result,
    RunResult,
};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Power state transitions that share one invocation shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Hypervisor adapter backed by the `lxc` command line client
#[derive(Debug, Clone)]
pub struct LxcCli {
    binary: String,
    remote: String,
}

impl LxcCli {
    pub fn new(binary: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn target(&self, name: &ContainerName) -> String {
        format!("{}:{}", self.remote, name)
    }

    fn describe(&self, args: &[String]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 1);
        parts.push(self.binary.as_str());
        parts.extend(args.iter().map(String::as_str));
        parts.join(" ")
    }

    pub(crate) fn list_args(&self, filter: Option<&str>) -> Vec<String> {
        let mut args = vec!["list".to_string(), format!("{}:", self.remote)];
        if let Some(filter) = filter {
            args.push(filter.to_string());
        }
        args.push("--format".to_string());
        args.push("json".to_string());
        args
    }

    pub(crate) fn launch_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "launch".to_string(),
            spec.image.clone(),
            self.target(&ContainerName::new(spec.name.as_str())),
        ];

        if spec.ephemeral {
            args.push("--ephemeral".to_string());
        }

        for profile in &spec.profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }

        for (key, value) in &spec.config {
            args.push("--config".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    pub(crate) fn power_args(action: PowerAction, name: &ContainerName) -> Vec<String> {
        vec![action.as_str().to_string(), name.0.clone()]
    }

    pub(crate) fn delete_args(&self, name: &ContainerName, snapshot: Option<&str>) -> Vec<String> {
        let target = match snapshot {
            Some(snapshot) => format!("{}/{}", self.target(name), snapshot),
            None => self.target(name),
        };
        vec!["delete".to_string(), target]
    }

    pub(crate) fn exec_args(&self, name: &ContainerName, command: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            self.target(name),
            "--mode=non-interactive".to_string(),
            "--".to_string(),
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]
    }

    pub(crate) fn file_push_args(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Vec<String> {
        let mut args = vec!["file".to_string(), "push".to_string()];

        if let Some(uid) = options.uid {
            args.push("--uid".to_string());
            args.push(uid.to_string());
        }
        if let Some(gid) = options.gid {
            args.push("--gid".to_string());
            args.push(gid.to_string());
        }
        if let Some(ref mode) = options.mode {
            args.push("--mode".to_string());
            args.push(mode.clone());
        }

        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}{}", self.target(name), remote));
        args
    }

    pub(crate) fn file_pull_args(&self, name: &ContainerName, remote: &str, local: &Path) -> Vec<String> {
        vec![
            "file".to_string(),
            "pull".to_string(),
            format!("{}{}", self.target(name), remote),
            local.to_string_lossy().to_string(),
        ]
    }

    /// Arguments that open an interactive shell in the container
    pub fn login_args(&self, name: &ContainerName) -> Vec<String> {
        vec![
            "exec".to_string(),
            self.target(name),
            "--".to_string(),
            "/bin/bash".to_string(),
        ]
    }

    /// Run a command and get stdout, failing on a non-zero exit
    async fn run_cmd(&self, args: &[String]) -> Result<String> {
        let command = self.describe(args);
        tracing::debug!("Running {}", command);

        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProviderError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProviderError::AdapterFailure {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command, forwarding each output line to `output` as it arrives
    async fn run_streaming(&self, args: &[String], output: Option<&OutputSink>) -> Result<RunResult> {
        let command = self.describe(args);
        tracing::debug!("Running {}", command);

        let spawn_err = |e: std::io::Error| ProviderError::Spawn {
            command: command.clone(),
            source: e,
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Parse("missing child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Parse("missing child stderr".to_string()))?;

        let stdout_task = tokio::spawn(read_stream_lines(stdout, output.cloned()));
        let stderr_task = tokio::spawn(read_stream_lines(stderr, output.cloned()));

        let status = child.wait().await.map_err(spawn_err)?;

        let join_err =
            |e: tokio::task::JoinError| ProviderError::Parse(format!("output reader failed: {}", e));
        let stdout = stdout_task.await.map_err(join_err)??;
        let stderr = stderr_task.await.map_err(join_err)??;

        Ok(RunResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn check(&self, args: &[String], result: RunResult) -> Result<RunResult> {
        if result.success() {
            Ok(result)
        } else {
            Err(ProviderError::AdapterFailure {
                command: self.describe(args),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }

    async fn power(&self, action: PowerAction, name: &ContainerName) -> Result<()> {
        let args = Self::power_args(action, name);
        let out = self.run_cmd(&args).await?;
        if !out.trim().is_empty() {
            tracing::debug!("{} {}: {}", action.as_str(), name, out.trim());
        }
        Ok(())
    }
}

async fn read_stream_lines<R>(stream: R, sink: Option<OutputSink>) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    // Output is not guaranteed to be UTF-8; decode each line lossily
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut collected = String::new();

    while reader.read_until(b'\n', &mut buf).await? > 0 {
        let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw).into_owned();
        if let Some(ref tx) = sink {
            let _ = tx.send(line.clone());
        }
        collected.push_str(&line);
        collected.push('\n');
        buf.clear();
    }

    Ok(collected)
}

#[async_trait]
impl Hypervisor for LxcCli {
    async fn list(&self, filter: Option<&str>) -> Result<Vec<ContainerRecord>> {
        let output = self.run_cmd(&self.list_args(filter)).await?;
        parse_list_output(&output)
    }

    async fn launch(&self, spec: &LaunchSpec, output: Option<&OutputSink>) -> Result<()> {
        let args = self.launch_args(spec);
        let result = self.run_streaming(&args, output).await?;
        self.check(&args, result)?;
        Ok(())
    }

    async fn start(&self, name: &ContainerName) -> Result<()> {
        self.power(PowerAction::Start, name).await
    }

    async fn stop(&self, name: &ContainerName) -> Result<()> {
        self.power(PowerAction::Stop, name).await
    }

    async fn restart(&self, name: &ContainerName) -> Result<()> {
        self.power(PowerAction::Restart, name).await
    }

    async fn delete(&self, name: &ContainerName, snapshot: Option<&str>) -> Result<()> {
        self.run_cmd(&self.delete_args(name, snapshot)).await?;
        Ok(())
    }

    async fn exec(
        &self,
        name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<String> {
        let args = self.exec_args(name, command);
        let result = self.run_streaming(&args, output).await?;
        Ok(self.check(&args, result)?.stdout)
    }

    async fn file_push(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()> {
        self.run_cmd(&self.file_push_args(name, local, remote, options))
            .await?;
        Ok(())
    }

    async fn file_pull(&self, name: &ContainerName, remote: &str, local: &Path) -> Result<()> {
        self.run_cmd(&self.file_pull_args(name, remote, local)).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerSession for LxcCli {
    async fn execute_command(
        &self,
        name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<RunResult> {
        self.run_streaming(&self.exec_args(name, command), output)
            .await
    }

    async fn container_status(&self, name: &ContainerName) -> Result<ContainerStatus> {
        let records = Hypervisor::list(self, Some(name.as_str())).await?;
        find_record(&records, name.as_str())
            .map(|r| r.status.clone())
            .ok_or_else(|| ProviderError::ContainerNotFound(name.to_string()))
    }

    async fn write_file(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()> {
        Hypervisor::file_push(self, name, local, remote, options).await
    }
}
