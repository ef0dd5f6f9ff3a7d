//! Hypervisor adapter trait and implementations for lxdtest
//!
//! This crate maps container lifecycle intents (launch, start, stop, delete,
//! list, exec, file transfer) onto an LXD host, either through the `lxc`
//! binary or through the LXD REST API.

mod api;
mod error;
mod lxc;
mod types;

pub use api::{ApiOptions, LxdApi};
pub use error::*;
pub use lxc::{LxcCli, PowerAction};
pub use types::*;

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

/// Receives live command output line by line
pub type OutputSink = mpsc::UnboundedSender<String>;

/// Lifecycle and file operations against the container hypervisor.
///
/// Every method issues exactly one external call and never retries.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// List containers whose name matches `filter` (all when `None`)
    async fn list(&self, filter: Option<&str>) -> Result<Vec<ContainerRecord>>;

    /// Create a new container; it is not necessarily running afterwards
    async fn launch(&self, spec: &LaunchSpec, output: Option<&OutputSink>) -> Result<()>;

    /// Request a start; does not wait for the transition
    async fn start(&self, name: &ContainerName) -> Result<()>;

    /// Request a stop; does not wait for the transition
    async fn stop(&self, name: &ContainerName) -> Result<()>;

    /// Request a restart; does not wait for the transition
    async fn restart(&self, name: &ContainerName) -> Result<()>;

    /// Delete a stopped container, or one of its snapshots
    async fn delete(&self, name: &ContainerName, snapshot: Option<&str>) -> Result<()>;

    /// Run a non-interactive shell command, returning stdout
    async fn exec(
        &self,
        name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<String>;

    /// Copy a local file into the container
    async fn file_push(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()>;

    /// Copy a file out of the container
    async fn file_pull(&self, name: &ContainerName, remote: &str, local: &Path) -> Result<()>;
}

/// The narrower surface a transport connection needs from the hypervisor
#[async_trait]
pub trait ContainerSession: Send + Sync {
    /// Run a command; a non-zero exit is reported in the result, not as an error
    async fn execute_command(
        &self,
        name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<RunResult>;

    /// Fresh status of the named container
    async fn container_status(&self, name: &ContainerName) -> Result<ContainerStatus>;

    /// Write a local file to `remote` inside the container
    async fn write_file(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()>;
}

/// Find the record whose name matches exactly.
///
/// `lxc list` filters by prefix/regex, so a filtered listing may include
/// neighbours sharing a prefix.
pub fn find_record<'a>(records: &'a [ContainerRecord], name: &str) -> Option<&'a ContainerRecord> {
    records.iter().find(|r| r.name == name)
}
