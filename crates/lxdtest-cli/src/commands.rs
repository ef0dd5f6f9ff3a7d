//! CLI command implementations

use anyhow::{bail, Context, Result};
use lxdtest_config::Config;
use lxdtest_core::{
    DestroyOutcome, InstanceState, InstanceStore, LifecycleController, LoginCommand, LxdTransport,
    TestInstance, Transport,
};
use lxdtest_provider::{ContainerRecord, Hypervisor, LxcCli, OutputSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs, wired from one configuration
pub struct App {
    hypervisor: Arc<dyn Hypervisor>,
    controller: LifecycleController,
    transport: LxdTransport,
    store: InstanceStore,
}

impl App {
    /// Use the `lxc` adapter and LXD transport described by `config`
    pub fn new(config: &Config, store: InstanceStore, output: Option<OutputSink>) -> Self {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(LxcCli::new(
            config.driver.lxc_binary.clone(),
            config.driver.remote.clone(),
        ));
        let transport = LxdTransport::new(config.transport.clone(), &config.driver);
        Self::from_parts(config, hypervisor, transport, store, output)
    }

    pub fn from_parts(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
        transport: LxdTransport,
        store: InstanceStore,
        output: Option<OutputSink>,
    ) -> Self {
        let mut controller = LifecycleController::new(Arc::clone(&hypervisor), config.driver.clone());
        let mut transport = transport;
        if let Some(tx) = output {
            controller = controller.with_output(tx.clone());
            transport = transport.with_output(tx);
        }

        Self {
            hypervisor,
            controller,
            transport,
            store,
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }
}

/// Create (or reuse) the container for `name` and save its state
pub async fn create(app: &App, name: &str, image: &str) -> Result<InstanceState> {
    let prior = app.store.load(name)?;
    let state = app
        .controller
        .create(&TestInstance::new(name, image), prior, &app.transport)
        .await?;
    app.store.save(name, &state)?;

    println!(
        "Created {} ({})",
        name,
        state.hostname.as_deref().unwrap_or("no IPv4 address")
    );
    Ok(state)
}

/// Stop and delete the container for `name`, then forget its state
pub async fn destroy(app: &App, name: &str) -> Result<DestroyOutcome> {
    let outcome = app.controller.destroy(name).await?;
    app.store.remove(name)?;

    if outcome.deleted {
        println!("Destroyed {}", name);
    } else {
        println!("{} does not exist", name);
    }
    Ok(outcome)
}

/// Run a command through the transport, retrying configured exit codes
pub async fn exec(app: &App, name: &str, cmd: Vec<String>) -> Result<()> {
    let command = match cmd.as_slice() {
        [] => bail!("No command specified"),
        [single] => single.clone(),
        _ => shell_words::join(&cmd),
    };

    let state = app.store.load(name)?;
    let mut connection = app.transport.connection(&state)?;
    let result = connection
        .execute_with_retry(&command, &app.transport.retry_policy())
        .await;
    connection.close().await;
    Ok(result?)
}

/// Copy local files into `dest` inside the container
pub async fn upload(app: &App, name: &str, dest: &str, files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        bail!("No files specified");
    }
    if let Some(missing) = files.iter().find(|f| !f.is_file()) {
        bail!("{} is not a file", missing.display());
    }

    let state = app.store.load(name)?;
    let mut connection = app.transport.connection(&state)?;
    let result = connection.upload(files, dest).await;
    connection.close().await;
    result?;

    println!("Uploaded {} file(s) to {}:{}", files.len(), name, dest);
    Ok(())
}

/// List containers known to the hypervisor
pub async fn list(app: &App, filter: Option<&str>) -> Result<Vec<ContainerRecord>> {
    let records = app.hypervisor.list(filter).await?;

    if records.is_empty() {
        println!("No containers found");
        return Ok(records);
    }

    println!("{:<30} {:<12} IPV4", "NAME", "STATUS");
    for record in &records {
        println!(
            "{:<30} {:<12} {}",
            record.name,
            record.status.to_string(),
            record.first_ipv4_address().unwrap_or("-")
        );
    }
    Ok(records)
}

/// Print the command that opens a shell in the container
pub fn login(app: &App, name: &str) -> Result<LoginCommand> {
    let state = app.store.load(name)?;
    let login = app.transport.connection(&state)?.login_command()?;
    println!("{}", login);
    Ok(login)
}

/// Show the effective configuration
pub fn config(config: &Config, path: &Path) -> Result<()> {
    if path.exists() {
        println!("# Config file: {:?}\n", path);
    } else {
        println!("# Config file: {:?} (not created yet, showing defaults)\n", path);
    }
    let content = config.to_toml().context("Failed to render configuration")?;
    println!("{}", content);
    Ok(())
}
