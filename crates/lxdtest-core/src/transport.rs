//! Remote execution transport
//!
//! A [`Transport`] hands out [`Connection`]s built from instance state. A
//! connection runs commands, uploads files and confirms readiness through a
//! [`ContainerSession`], which is established lazily and dropped on
//! [`Connection::close`].

use crate::{CoreError, InstanceState, Result};
use async_trait::async_trait;
use lxdtest_config::{DriverConfig, SessionKind, TransportConfig};
use lxdtest_provider::{
    ApiOptions, ContainerName, ContainerSession, ContainerStatus, FilePushOptions, LxcCli, LxdApi,
    OutputSink, ProviderError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When `execute_with_retry` tries again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable_exit_codes: Vec<i32>,
    pub max_retries: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_exit_codes: Vec::new(),
            max_retries: 1,
            wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(retryable_exit_codes: Vec<i32>, max_retries: u32, wait: Duration) -> Self {
        Self {
            retryable_exit_codes,
            max_retries,
            wait,
        }
    }

    /// `attempt` is 1-based
    pub fn should_retry(&self, attempt: u32, exit_code: i32) -> bool {
        attempt <= self.max_retries
            && !self.retryable_exit_codes.is_empty()
            && self.retryable_exit_codes.contains(&exit_code)
    }
}

/// Bounded status polling for `wait_until_ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub iterations: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            iterations: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Argv for an interactive login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for LoginCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Builds connections from instance state
pub trait Transport: Send + Sync {
    fn connection(&self, state: &InstanceState) -> Result<Box<dyn Connection>>;
}

/// An open line to one container
#[async_trait]
pub trait Connection: Send {
    /// Run `command`, failing with `TransportFailed` on a non-zero exit
    async fn execute(&mut self, command: &str) -> Result<()>;

    /// Copy each local file into `remote_dir`; the first failure aborts
    async fn upload(&mut self, locals: &[PathBuf], remote_dir: &str) -> Result<()>;

    /// Return once the container reports running
    async fn wait_until_ready(&mut self) -> Result<()>;

    /// Release the session; a no-op when none is open
    async fn close(&mut self);

    fn login_command(&self) -> Result<LoginCommand>;

    /// Run `command`, retrying exit codes the policy marks as retryable.
    ///
    /// Between attempts the connection is closed so the next one starts
    /// on a fresh session. The last failure is always returned.
    async fn execute_with_retry(&mut self, command: &str, policy: &RetryPolicy) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!(
                "Attempting to execute command - try {} of {}",
                attempt,
                policy.max_retries + 1
            );

            let err = match self.execute(command).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let retryable = matches!(err, CoreError::TransportFailed { .. })
                && err
                    .exit_code()
                    .is_some_and(|code| policy.should_retry(attempt, code));
            if !retryable {
                return Err(err);
            }

            tracing::warn!(
                "{}; retrying in {}s ({} of {} retries)",
                err,
                policy.wait.as_secs(),
                attempt,
                policy.max_retries
            );
            self.close().await;
            tokio::time::sleep(policy.wait).await;
        }
    }
}

/// Session data owned by one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub name: ContainerName,
    pub hostname: Option<String>,
    pub port: u16,
    pub verify_ssl: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub api_endpoint: String,
}

impl ConnectionState {
    pub fn new(state: &InstanceState, config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            name: ContainerName::new(state.require_name()?),
            hostname: state.hostname.clone(),
            port: 22,
            verify_ssl: config.verify_ssl,
            client_cert: config.client_cert_path(),
            client_key: config.client_key_path(),
            api_endpoint: config.api_endpoint.clone(),
        })
    }
}

/// Opens hypervisor sessions for connections
pub trait SessionFactory: Send + Sync {
    fn establish(&self, state: &ConnectionState) -> Result<Arc<dyn ContainerSession>>;
}

/// Opens either an `lxc` CLI session or an LXD REST session
pub struct LxdSessionFactory {
    kind: SessionKind,
    cli: LxcCli,
}

impl LxdSessionFactory {
    pub fn new(kind: SessionKind, cli: LxcCli) -> Self {
        Self { kind, cli }
    }
}

impl SessionFactory for LxdSessionFactory {
    fn establish(&self, state: &ConnectionState) -> Result<Arc<dyn ContainerSession>> {
        match self.kind {
            SessionKind::Cli => Ok(Arc::new(self.cli.clone())),
            SessionKind::Api => {
                let api = LxdApi::new(&ApiOptions {
                    endpoint: state.api_endpoint.clone(),
                    verify_ssl: state.verify_ssl,
                    client_cert: state.client_cert.clone(),
                    client_key: state.client_key.clone(),
                })?;
                Ok(Arc::new(api))
            }
        }
    }
}

/// Transport for LXD containers
pub struct LxdTransport {
    config: TransportConfig,
    cli: LxcCli,
    factory: Arc<dyn SessionFactory>,
    output: Option<OutputSink>,
}

impl LxdTransport {
    pub fn new(config: TransportConfig, driver: &DriverConfig) -> Self {
        let cli = LxcCli::new(driver.lxc_binary.clone(), driver.remote.clone());
        let factory = Arc::new(LxdSessionFactory::new(config.session, cli.clone()));
        Self {
            config,
            cli,
            factory,
            output: None,
        }
    }

    /// Replace how sessions are opened
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Forward command output to `output`
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    /// Retry behaviour configured for callers that don't choose their own
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.retryable_exit_codes.clone(),
            self.config.max_retries,
            self.config.retry_wait(),
        )
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            iterations: self.config.ready_iterations,
            interval: self.config.ready_interval(),
        }
    }
}

impl Transport for LxdTransport {
    fn connection(&self, state: &InstanceState) -> Result<Box<dyn Connection>> {
        let connection_state = ConnectionState::new(state, &self.config)?;
        Ok(Box::new(LxdConnection {
            state: connection_state,
            factory: Arc::clone(&self.factory),
            session: None,
            readiness: self.readiness_policy(),
            cli: self.cli.clone(),
            output: self.output.clone(),
        }))
    }
}

/// Connection to one LXD container
pub struct LxdConnection {
    state: ConnectionState,
    factory: Arc<dyn SessionFactory>,
    session: Option<Arc<dyn ContainerSession>>,
    readiness: ReadinessPolicy,
    cli: LxcCli,
    output: Option<OutputSink>,
}

impl LxdConnection {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn session(&mut self) -> Result<Arc<dyn ContainerSession>> {
        if let Some(session) = &self.session {
            return Ok(Arc::clone(session));
        }
        tracing::debug!("Establishing session for {}", self.state.name);
        let session = self.factory.establish(&self.state)?;
        self.session = Some(Arc::clone(&session));
        Ok(session)
    }
}

/// Files land in the container as mode 0644, owned by uid/gid 1000
fn upload_options() -> FilePushOptions {
    FilePushOptions {
        uid: Some(1000),
        gid: Some(1000),
        mode: Some("0644".to_string()),
    }
}

fn remote_path_for(local: &Path, remote_dir: &str) -> Result<String> {
    let file_name = local.file_name().ok_or_else(|| {
        CoreError::InvalidState(format!("cannot upload {}: no file name", local.display()))
    })?;
    Ok(format!(
        "{}/{}",
        remote_dir.trim_end_matches('/'),
        file_name.to_string_lossy()
    ))
}

#[async_trait]
impl Connection for LxdConnection {
    async fn execute(&mut self, command: &str) -> Result<()> {
        tracing::debug!("[{}] ({})", self.state.name, command);
        let session = self.session()?;
        let result = session
            .execute_command(&self.state.name, command, self.output.as_ref())
            .await?;

        if !result.success() {
            return Err(CoreError::TransportFailed {
                command: command.to_string(),
                exit_code: Some(result.exit_code),
            });
        }
        Ok(())
    }

    async fn upload(&mut self, locals: &[PathBuf], remote_dir: &str) -> Result<()> {
        let session = self.session()?;
        let options = upload_options();

        for local in locals {
            let remote = remote_path_for(local, remote_dir)?;
            tracing::debug!("Uploading {:?} to {}:{}", local, self.state.name, remote);
            session
                .write_file(&self.state.name, local, &remote, &options)
                .await
                .map_err(|e| {
                    tracing::debug!("Upload of {:?} failed: {}", local, e);
                    CoreError::TransportFailed {
                        command: format!("upload {} {}", local.display(), remote),
                        exit_code: e.exit_code(),
                    }
                })?;
        }
        Ok(())
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        tracing::info!("Waiting for container {} to be ready...", self.state.name);
        let started = Instant::now();
        let session = self.session()?;
        let mut remaining = self.readiness.iterations;

        loop {
            let status = match session.container_status(&self.state.name).await {
                Ok(status) => status,
                // Counts as not running, like the lifecycle wait
                Err(ProviderError::ContainerNotFound(_)) => ContainerStatus::Unknown,
                Err(e) => return Err(e.into()),
            };
            if status.indicates_running() {
                break;
            }
            if remaining == 0 {
                return Err(CoreError::TransportFailed {
                    command: format!("wait_until_ready {} (status: {})", self.state.name, status),
                    exit_code: None,
                });
            }
            remaining -= 1;
            tokio::time::sleep(self.readiness.interval).await;
        }

        tracing::debug!(
            "[{}] wait_until_ready {:.2}s",
            self.state.name,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn close(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!("Closed session for {}", self.state.name);
        }
    }

    fn login_command(&self) -> Result<LoginCommand> {
        Ok(LoginCommand {
            program: self.cli.binary().to_string(),
            args: self.cli.login_args(&self.state.name),
        })
    }
}
