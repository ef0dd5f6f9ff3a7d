//! Test support utilities for lxdtest-core
//!
//! Provides `MockHypervisor` and `MockSession` for exercising the lifecycle
//! controller and transport without an LXD host.

use crate::{ConnectionState, SessionFactory};
use async_trait::async_trait;
use lxdtest_provider::*;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    List { filter: Option<String> },
    Launch { name: String, image: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Delete { name: String, snapshot: Option<String> },
    Exec { name: String, command: String },
    FilePush { name: String, remote: String },
    FilePull { name: String, remote: String },
}

/// A running/stopped record with an `eth0` (optionally addressed) and `lo`
pub fn mock_record(name: &str, status: ContainerStatus, ipv4: Option<&str>) -> ContainerRecord {
    let mut eth0 = vec![InterfaceAddress {
        family: AddressFamily::Inet6,
        address: "fd42:7a1b::5".to_string(),
    }];
    if let Some(ip) = ipv4 {
        eth0.push(InterfaceAddress {
            family: AddressFamily::Inet,
            address: ip.to_string(),
        });
    }

    ContainerRecord {
        name: name.to_string(),
        status,
        interfaces: vec![
            NetworkInterface {
                name: "eth0".to_string(),
                kind: InterfaceKind::Other("broadcast".to_string()),
                addresses: eth0,
            },
            NetworkInterface {
                name: "lo".to_string(),
                kind: InterfaceKind::Loopback,
                addresses: vec![InterfaceAddress {
                    family: AddressFamily::Inet,
                    address: "127.0.0.1".to_string(),
                }],
            },
        ],
    }
}

/// Hypervisor holding at most one container, with scripted transitions
pub struct MockHypervisor {
    calls: Mutex<Vec<MockCall>>,
    container: Mutex<Option<ContainerRecord>>,
    after_launch: Mutex<ContainerStatus>,
    after_start: Mutex<ContainerStatus>,
    address: Mutex<Option<String>>,
    exec_failures: Mutex<HashMap<usize, i32>>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// No container; launch yields a stopped one, start makes it running
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            container: Mutex::new(None),
            after_launch: Mutex::new(ContainerStatus::Stopped),
            after_start: Mutex::new(ContainerStatus::Running),
            address: Mutex::new(Some("10.0.0.5".to_string())),
            exec_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Seed an existing container named `name`
    pub fn with_container(self, name: &str, status: ContainerStatus) -> Self {
        let address = self.address.lock().unwrap().clone();
        *self.container.lock().unwrap() = Some(mock_record(name, status, address.as_deref()));
        self
    }

    pub fn status_after_launch(self, status: ContainerStatus) -> Self {
        *self.after_launch.lock().unwrap() = status;
        self
    }

    pub fn status_after_start(self, status: ContainerStatus) -> Self {
        *self.after_start.lock().unwrap() = status;
        self
    }

    /// IPv4 reported on eth0 for containers created from now on
    pub fn with_address(self, address: Option<&str>) -> Self {
        *self.address.lock().unwrap() = address.map(str::to_string);
        self
    }

    /// Make the `nth` exec call (1-based) exit with `exit_code`
    pub fn fail_exec(self, nth: usize, exit_code: i32) -> Self {
        self.exec_failures.lock().unwrap().insert(nth, exit_code);
        self
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Get all recorded calls
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Count recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Commands passed to exec, in order
    pub fn exec_commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                MockCall::Exec { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn current(&self) -> Option<ContainerRecord> {
        self.container.lock().unwrap().clone()
    }

    fn set_status(&self, name: &ContainerName, status: ContainerStatus) -> Result<()> {
        let mut container = self.container.lock().unwrap();
        match container.as_mut() {
            Some(record) if record.name == name.as_str() => {
                record.status = status;
                Ok(())
            }
            _ => Err(not_found(name)),
        }
    }
}

fn not_found(name: &ContainerName) -> ProviderError {
    ProviderError::AdapterFailure {
        command: format!("lxc {}", name),
        exit_code: 1,
        stderr: "Error: not found".to_string(),
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list(&self, filter: Option<&str>) -> Result<Vec<ContainerRecord>> {
        self.record(MockCall::List {
            filter: filter.map(str::to_string),
        });
        let container = self.container.lock().unwrap().clone();
        Ok(container
            .into_iter()
            .filter(|r| filter.map_or(true, |f| r.name.starts_with(f)))
            .collect())
    }

    async fn launch(&self, spec: &LaunchSpec, _output: Option<&OutputSink>) -> Result<()> {
        self.record(MockCall::Launch {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        let status = self.after_launch.lock().unwrap().clone();
        let address = self.address.lock().unwrap().clone();
        *self.container.lock().unwrap() = Some(mock_record(&spec.name, status, address.as_deref()));
        Ok(())
    }

    async fn start(&self, name: &ContainerName) -> Result<()> {
        self.record(MockCall::Start {
            name: name.to_string(),
        });
        let status = self.after_start.lock().unwrap().clone();
        self.set_status(name, status)
    }

    async fn stop(&self, name: &ContainerName) -> Result<()> {
        self.record(MockCall::Stop {
            name: name.to_string(),
        });
        self.set_status(name, ContainerStatus::Stopped)
    }

    async fn restart(&self, name: &ContainerName) -> Result<()> {
        self.record(MockCall::Restart {
            name: name.to_string(),
        });
        self.set_status(name, ContainerStatus::Running)
    }

    async fn delete(&self, name: &ContainerName, snapshot: Option<&str>) -> Result<()> {
        self.record(MockCall::Delete {
            name: name.to_string(),
            snapshot: snapshot.map(str::to_string),
        });
        let mut container = self.container.lock().unwrap();
        match container.as_ref() {
            Some(record) if record.name == name.as_str() => {
                if record.status.indicates_running() {
                    return Err(ProviderError::AdapterFailure {
                        command: format!("lxc delete {}", name),
                        exit_code: 1,
                        stderr: "Error: The container is currently running, stop it first".into(),
                    });
                }
                *container = None;
                Ok(())
            }
            _ => Err(not_found(name)),
        }
    }

    async fn exec(
        &self,
        name: &ContainerName,
        command: &str,
        _output: Option<&OutputSink>,
    ) -> Result<String> {
        self.record(MockCall::Exec {
            name: name.to_string(),
            command: command.to_string(),
        });
        let nth = self.exec_commands().len();
        match self.exec_failures.lock().unwrap().get(&nth) {
            Some(&exit_code) => Err(ProviderError::AdapterFailure {
                command: command.to_string(),
                exit_code,
                stderr: String::new(),
            }),
            None => Ok(String::new()),
        }
    }

    async fn file_push(
        &self,
        name: &ContainerName,
        _local: &Path,
        remote: &str,
        _options: &FilePushOptions,
    ) -> Result<()> {
        self.record(MockCall::FilePush {
            name: name.to_string(),
            remote: remote.to_string(),
        });
        Ok(())
    }

    async fn file_pull(&self, name: &ContainerName, remote: &str, _local: &Path) -> Result<()> {
        self.record(MockCall::FilePull {
            name: name.to_string(),
            remote: remote.to_string(),
        });
        Ok(())
    }
}

/// Session with scripted exit codes and statuses
pub struct MockSession {
    commands: Mutex<Vec<String>>,
    exit_codes: Mutex<VecDeque<i32>>,
    default_exit_code: Mutex<i32>,
    status: Mutex<ContainerStatus>,
    status_script: Mutex<VecDeque<ContainerStatus>>,
    status_checks: AtomicU32,
    missing_checks: AtomicU32,
    writes: Mutex<Vec<(String, FilePushOptions)>>,
    fail_writes_after: Mutex<Option<usize>>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Commands succeed and the container reports running
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            exit_codes: Mutex::new(VecDeque::new()),
            default_exit_code: Mutex::new(0),
            status: Mutex::new(ContainerStatus::Running),
            status_script: Mutex::new(VecDeque::new()),
            status_checks: AtomicU32::new(0),
            missing_checks: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
            fail_writes_after: Mutex::new(None),
        }
    }

    /// Queue the exit code for the next unscripted command
    pub fn push_exit_code(&self, code: i32) {
        self.exit_codes.lock().unwrap().push_back(code);
    }

    /// Exit code used once the queue is empty
    pub fn set_default_exit_code(&self, code: i32) {
        *self.default_exit_code.lock().unwrap() = code;
    }

    /// Status reported once the script is exhausted
    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Statuses reported by successive checks, before falling back to `set_status`
    pub fn script_statuses(&self, statuses: Vec<ContainerStatus>) {
        self.status_script.lock().unwrap().extend(statuses);
    }

    /// The first `checks` status checks report the container as not found
    pub fn set_missing(&self, checks: u32) {
        self.missing_checks.store(checks, Ordering::SeqCst);
    }

    /// Writes beyond the first `n` fail
    pub fn fail_writes_after(&self, n: usize) {
        *self.fail_writes_after.lock().unwrap() = Some(n);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn status_checks(&self) -> u32 {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(String, FilePushOptions)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerSession for MockSession {
    async fn execute_command(
        &self,
        _name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<RunResult> {
        self.commands.lock().unwrap().push(command.to_string());
        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_exit_code.lock().unwrap());
        if let Some(tx) = output {
            let _ = tx.send(format!("ran {}", command));
        }
        Ok(RunResult {
            exit_code,
            ..Default::default()
        })
    }

    async fn container_status(&self, name: &ContainerName) -> Result<ContainerStatus> {
        let checks = self.status_checks.fetch_add(1, Ordering::SeqCst);
        if checks < self.missing_checks.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerNotFound(name.to_string()));
        }
        let scripted = self.status_script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.status.lock().unwrap().clone()))
    }

    async fn write_file(
        &self,
        _name: &ContainerName,
        _local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()> {
        let mut writes = self.writes.lock().unwrap();
        writes.push((remote.to_string(), options.clone()));
        match *self.fail_writes_after.lock().unwrap() {
            Some(n) if writes.len() > n => Err(ProviderError::AdapterFailure {
                command: format!("file push {}", remote),
                exit_code: 1,
                stderr: "mock write failure".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Hands out the same `MockSession` and counts establishments
pub struct MockSessionFactory {
    session: Arc<MockSession>,
    established: AtomicU32,
}

impl MockSessionFactory {
    pub fn new(session: Arc<MockSession>) -> Self {
        Self {
            session,
            established: AtomicU32::new(0),
        }
    }

    pub fn established(&self) -> u32 {
        self.established.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockSessionFactory {
    fn establish(&self, _state: &ConnectionState) -> crate::Result<Arc<dyn ContainerSession>> {
        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }
}
