//! Container lifecycle controller
//!
//! Drives a named container from absent to ready (launched, running, SSH
//! access installed, transport confirmed) and back to absent. Status is
//! re-fetched from the hypervisor on every check.

use crate::{AccessCredentials, AccessProvisioner, CoreError, InstanceState, Result, TestInstance, Transport};
use lxdtest_config::DriverConfig;
use lxdtest_provider::{
    find_record, ContainerName, ContainerRecord, Hypervisor, LaunchSpec, OutputSink,
};
use std::sync::Arc;
use std::time::Duration;

/// Bounded wait for a container to report running: one immediate check,
/// then up to `retries` more, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_secs(6),
        }
    }
}

/// What `destroy` did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyOutcome {
    pub stopped: bool,
    pub deleted: bool,
}

/// Creates and destroys containers for test instances
pub struct LifecycleController {
    hypervisor: Arc<dyn Hypervisor>,
    config: DriverConfig,
    output: Option<OutputSink>,
}

impl LifecycleController {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, config: DriverConfig) -> Self {
        Self {
            hypervisor,
            config,
            output: None,
        }
    }

    /// Forward launch and provisioning output to `output`
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            retries: self.config.wait_retries,
            interval: self.config.wait_interval(),
        }
    }

    pub fn launch_spec(&self, instance: &TestInstance) -> LaunchSpec {
        LaunchSpec {
            name: instance.name.clone(),
            image: instance.image.clone(),
            ephemeral: self.config.ephemeral,
            profiles: self.config.profiles.clone(),
            config: self.config.config.clone(),
        }
    }

    /// Fresh record for `name`, if the container exists
    async fn find(&self, name: &ContainerName) -> Result<Option<ContainerRecord>> {
        let records = self.hypervisor.list(Some(name.as_str())).await?;
        Ok(find_record(&records, name.as_str()).cloned())
    }

    async fn is_running(&self, name: &ContainerName) -> Result<bool> {
        Ok(self
            .find(name)
            .await?
            .is_some_and(|r| r.status.indicates_running()))
    }

    async fn wait_for_container(&self, name: &ContainerName) -> Result<()> {
        let policy = self.wait_policy();
        let mut checks = 1;
        if self.is_running(name).await? {
            return Ok(());
        }

        for _ in 0..policy.retries {
            tokio::time::sleep(policy.interval).await;
            checks += 1;
            if self.is_running(name).await? {
                tracing::debug!("{} running after {} status checks", name, checks);
                return Ok(());
            }
        }

        Err(CoreError::Timeout {
            name: name.to_string(),
            checks,
        })
    }

    fn update_state(&self, state: InstanceState, record: &ContainerRecord) -> InstanceState {
        let hostname = record.first_ipv4_address().map(str::to_string);
        match &hostname {
            Some(address) => tracing::debug!("Found {} for {}", address, record.name),
            None => tracing::warn!("No IPv4 address found for {}", record.name),
        }

        InstanceState {
            name: Some(record.name.clone()),
            hostname,
            ssh_key: state.ssh_key.or_else(|| self.config.ssh_key.clone()),
            username: state.username.or_else(|| Some(self.config.username.clone())),
        }
    }

    /// Bring the instance's container to a ready state.
    ///
    /// An existing container is reused as is. The returned state carries the
    /// container name, its first IPv4 address, and the ssh key and username
    /// (values already in `state` win over configured ones).
    pub async fn create(
        &self,
        instance: &TestInstance,
        state: InstanceState,
        transport: &dyn Transport,
    ) -> Result<InstanceState> {
        let name = ContainerName::new(instance.name.as_str());

        let existing = match self.find(&name).await? {
            Some(record) => {
                tracing::info!("Reusing existing container {}", name);
                record
            }
            None => {
                let spec = self.launch_spec(instance);
                tracing::info!("Launching {} from {}", name, spec.image);
                self.hypervisor.launch(&spec, self.output.as_ref()).await?;
                self.find(&name).await?.ok_or_else(|| {
                    CoreError::InvalidState(format!("{} missing right after launch", name))
                })?
            }
        };

        if !existing.status.indicates_running() {
            tracing::info!("Starting {} (status: {})", name, existing.status);
            self.hypervisor.start(&name).await?;
        }

        tracing::info!("Waiting for {} to report running", name);
        self.wait_for_container(&name).await?;

        AccessProvisioner::new(self.hypervisor.as_ref(), self.output.as_ref())
            .provision(&name, &AccessCredentials::from_driver(&self.config))
            .await?;

        let record = self
            .find(&name)
            .await?
            .ok_or_else(|| CoreError::InvalidState(format!("{} disappeared during create", name)))?;
        let state = self.update_state(state, &record);

        let mut connection = transport.connection(&state)?;
        let ready = connection.wait_until_ready().await;
        connection.close().await;
        ready?;

        tracing::info!("Container {} is ready", name);
        Ok(state)
    }

    /// Stop and delete the container; absent containers are left alone
    pub async fn destroy(&self, instance_name: &str) -> Result<DestroyOutcome> {
        let name = ContainerName::new(instance_name);
        let mut outcome = DestroyOutcome::default();

        if self.is_running(&name).await? {
            tracing::info!("Stopping {}", name);
            self.hypervisor.stop(&name).await?;
            outcome.stopped = true;
        }

        if self.find(&name).await?.is_some() {
            tracing::info!("Deleting {}", name);
            self.hypervisor.delete(&name, None).await?;
            outcome.deleted = true;
        }

        if !outcome.stopped && !outcome.deleted {
            tracing::debug!("{} does not exist, nothing to destroy", name);
        }
        Ok(outcome)
    }

    /// Run an ad-hoc command in the container, returning stdout
    pub async fn run(&self, instance_name: &str, command: &str) -> Result<String> {
        let name = ContainerName::new(instance_name);
        Ok(self
            .hypervisor
            .exec(&name, command, self.output.as_ref())
            .await?)
    }
}
