//! LXD REST API session
//!
//! Talks to `/1.0` on the configured endpoint. Exec runs with recorded output
//! and no websockets; the operation is awaited and its stdout/stderr logs are
//! fetched afterwards.

use crate::{
    types::parse_state, ContainerName, ContainerSession, ContainerStatus, FilePushOptions,
    OutputSink, ProviderError, Result, RunResult,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Connection options for the REST session
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub endpoint: String,
    pub verify_ssl: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Hypervisor session over the LXD REST API
#[derive(Debug, Clone)]
pub struct LxdApi {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    metadata: Value,
}

impl Envelope {
    fn parse(body: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(body)?;
        if envelope.kind == "error" {
            return Err(ProviderError::Api {
                code: envelope.error_code.unwrap_or(0),
                message: envelope.error.unwrap_or_default(),
            });
        }
        Ok(envelope)
    }
}

/// Exit code and log paths from a finished exec operation
#[derive(Debug, PartialEq, Eq)]
struct ExecOutcome {
    exit_code: i32,
    stdout_log: Option<String>,
    stderr_log: Option<String>,
}

fn parse_exec_outcome(operation: &Value) -> Result<ExecOutcome> {
    let metadata = operation
        .get("metadata")
        .ok_or_else(|| ProviderError::Parse("exec operation has no metadata".into()))?;
    let exit_code = metadata
        .get("return")
        .and_then(Value::as_i64)
        .ok_or_else(|| ProviderError::Parse("exec operation has no return code".into()))?;
    let exit_code = i32::try_from(exit_code).map_err(|_| {
        ProviderError::Parse(format!("exec return code {} out of range", exit_code))
    })?;
    let log = |fd: &str| {
        metadata
            .get("output")
            .and_then(|o| o.get(fd))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Ok(ExecOutcome {
        exit_code,
        stdout_log: log("1"),
        stderr_log: log("2"),
    })
}

impl LxdApi {
    pub fn new(options: &ApiOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(!options.verify_ssl)
            .use_rustls_tls();

        if let (Some(cert), Some(key)) = (&options.client_cert, &options.client_key) {
            let mut pem = std::fs::read(cert)?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: options.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn read_envelope(response: reqwest::Response) -> Result<Envelope> {
        let body = response.text().await?;
        Envelope::parse(&body)
    }

    async fn get(&self, path: &str) -> Result<Envelope> {
        tracing::debug!("GET {}", path);
        let response = self.client.get(self.url(path)).send().await?;
        Self::read_envelope(response).await
    }

    async fn wait_operation(&self, operation: &str) -> Result<Value> {
        let envelope = self.get(&format!("{}/wait", operation)).await?;
        Ok(envelope.metadata)
    }

    async fn fetch_log(&self, path: Option<&str>) -> Result<String> {
        match path {
            Some(path) => Ok(self.client.get(self.url(path)).send().await?.text().await?),
            None => Ok(String::new()),
        }
    }

    /// Full record for a container, including its network section
    pub async fn container_record(&self, name: &ContainerName) -> Result<crate::ContainerRecord> {
        let envelope = self
            .get(&format!("/1.0/containers/{}/state", name))
            .await
            .map_err(|e| match e {
                ProviderError::Api { code: 404, .. } => {
                    ProviderError::ContainerNotFound(name.to_string())
                }
                other => other,
            })?;
        parse_state(name.as_str(), envelope.metadata)
    }
}

#[async_trait]
impl ContainerSession for LxdApi {
    async fn execute_command(
        &self,
        name: &ContainerName,
        command: &str,
        output: Option<&OutputSink>,
    ) -> Result<RunResult> {
        let path = format!("/1.0/containers/{}/exec", name);
        tracing::debug!("POST {} ({})", path, command);

        let body = json!({
            "command": ["bash", "-c", command],
            "environment": {},
            "wait-for-websocket": false,
            "interactive": false,
            "record-output": true,
        });
        let response = self.client.post(self.url(&path)).json(&body).send().await?;
        let envelope = Self::read_envelope(response).await?;
        let operation = envelope
            .operation
            .ok_or_else(|| ProviderError::Parse("exec did not return an operation".into()))?;

        let outcome = parse_exec_outcome(&self.wait_operation(&operation).await?)?;
        let stdout = self.fetch_log(outcome.stdout_log.as_deref()).await?;
        let stderr = self.fetch_log(outcome.stderr_log.as_deref()).await?;

        if let Some(tx) = output {
            for line in stdout.lines().chain(stderr.lines()) {
                let _ = tx.send(line.to_string());
            }
        }

        Ok(RunResult {
            exit_code: outcome.exit_code,
            stdout,
            stderr,
        })
    }

    async fn container_status(&self, name: &ContainerName) -> Result<ContainerStatus> {
        Ok(self.container_record(name).await?.status)
    }

    async fn write_file(
        &self,
        name: &ContainerName,
        local: &Path,
        remote: &str,
        options: &FilePushOptions,
    ) -> Result<()> {
        let content = tokio::fs::read(local).await?;
        let path = format!("/1.0/containers/{}/files", name);
        tracing::debug!("POST {}?path={}", path, remote);

        let mut request = self
            .client
            .post(self.url(&path))
            .query(&[("path", remote)])
            .header("X-LXD-type", "file")
            .body(content);
        if let Some(uid) = options.uid {
            request = request.header("X-LXD-uid", uid.to_string());
        }
        if let Some(gid) = options.gid {
            request = request.header("X-LXD-gid", gid.to_string());
        }
        if let Some(ref mode) = options.mode {
            request = request.header("X-LXD-mode", mode.as_str());
        }

        Self::read_envelope(request.send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error() {
        let body = r#"{"type": "error", "error": "not found", "error_code": 404}"#;
        match Envelope::parse(body) {
            Err(ProviderError::Api { code, message }) => {
                assert_eq!(code, 404);
                assert_eq!(message, "not found");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_async_operation() {
        let body = r#"{"type": "async", "status": "Operation created", "status_code": 100,
            "operation": "/1.0/operations/b043d632", "metadata": {"id": "b043d632"}}"#;
        let envelope = Envelope::parse(body).unwrap();
        assert_eq!(envelope.operation.as_deref(), Some("/1.0/operations/b043d632"));
    }

    #[test]
    fn test_exec_outcome() {
        let operation = json!({
            "id": "b043d632",
            "status": "Success",
            "metadata": {
                "return": 255,
                "output": {
                    "1": "/1.0/containers/c1/logs/exec_b043d632.stdout",
                    "2": "/1.0/containers/c1/logs/exec_b043d632.stderr"
                }
            }
        });
        assert_eq!(
            parse_exec_outcome(&operation).unwrap(),
            ExecOutcome {
                exit_code: 255,
                stdout_log: Some("/1.0/containers/c1/logs/exec_b043d632.stdout".into()),
                stderr_log: Some("/1.0/containers/c1/logs/exec_b043d632.stderr".into()),
            }
        );
    }

    #[test]
    fn test_exec_outcome_without_return_is_parse_error() {
        let operation = json!({"metadata": {"output": {}}});
        assert!(matches!(
            parse_exec_outcome(&operation),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn test_exec_outcome_out_of_range_return_is_parse_error() {
        let operation = json!({"metadata": {"return": 4294967296i64, "output": {}}});
        assert!(matches!(
            parse_exec_outcome(&operation),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn test_state_metadata_parse() {
        let metadata = json!({
            "status": "Running",
            "status_code": 103,
            "network": {
                "eth0": {"type": "broadcast", "addresses": [{"family": "inet", "address": "10.0.0.5"}]}
            }
        });
        let record = parse_state("c1", metadata).unwrap();
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.first_ipv4_address(), Some("10.0.0.5"));
    }

    #[test]
    fn test_new_strips_trailing_slash() {
        let api = LxdApi::new(&ApiOptions {
            endpoint: "https://10.0.0.1:8443/".into(),
            verify_ssl: false,
            client_cert: None,
            client_key: None,
        })
        .unwrap();
        assert_eq!(api.url("/1.0"), "https://10.0.0.1:8443/1.0");
    }

    #[test]
    fn test_new_with_missing_client_cert_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let result = LxdApi::new(&ApiOptions {
            endpoint: "https://localhost:8443".into(),
            verify_ssl: true,
            client_cert: Some(tmp.path().join("client.crt")),
            client_key: Some(tmp.path().join("client.key")),
        });
        assert!(matches!(result, Err(ProviderError::IoError(_))));
    }
}
