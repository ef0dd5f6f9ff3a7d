//! SSH access provisioning
//!
//! Writes the public half of the configured private key into the
//! container user's `authorized_keys`, so the instance can be reached over
//! SSH once the driver hands it back.
//!
//! The public key comes from `<private key>.pub` when that file holds a valid
//! key, otherwise from `ssh-keygen -y`.

use crate::{CoreError, Result};
use base64::Engine;
use lxdtest_config::DriverConfig;
use lxdtest_provider::{ContainerName, Hypervisor, OutputSink};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const VALID_KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Who gets access, and with which key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredentials {
    pub username: String,
    pub private_key_path: Option<PathBuf>,
}

impl AccessCredentials {
    pub fn new(username: impl Into<String>, private_key_path: Option<PathBuf>) -> Self {
        Self {
            username: username.into(),
            private_key_path,
        }
    }

    pub fn from_driver(config: &DriverConfig) -> Self {
        Self::new(config.username.clone(), config.ssh_key_path())
    }

    pub fn authorized_keys_path(&self) -> String {
        format!("/home/{}/.ssh/authorized_keys", self.username)
    }

    /// The private key path, if one is configured and present on disk
    pub fn usable_key(&self) -> Result<&Path> {
        match self.private_key_path.as_deref() {
            Some(path) if path.is_file() => Ok(path),
            Some(path) => Err(CoreError::Configuration(format!(
                "No SSH key provided: {} does not exist",
                path.display()
            ))),
            None => Err(CoreError::Configuration("No SSH key provided".into())),
        }
    }
}

/// A decoded SSH public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub key_type: String,
    pub blob: Vec<u8>,
}

impl PublicKey {
    /// Parse `<type> <base64> [comment]`
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let key_type = parts.next().unwrap_or_default();

        if !VALID_KEY_TYPES.contains(&key_type) {
            return Err(CoreError::KeyDerivation(
                "invalid SSH public key format: must start with a valid key type".into(),
            ));
        }

        let data = parts.next().ok_or_else(|| {
            CoreError::KeyDerivation("invalid SSH public key format: missing key data".into())
        })?;

        let blob = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| {
                CoreError::KeyDerivation(
                    "invalid SSH public key format: key data is not valid base64".into(),
                )
            })?;

        Ok(Self {
            key_type: key_type.to_string(),
            blob,
        })
    }

    /// Single `authorized_keys` line, base64 without line wraps
    pub fn authorized_keys_line(&self) -> String {
        format!(
            "{} {}",
            self.key_type,
            base64::engine::general_purpose::STANDARD.encode(&self.blob)
        )
    }
}

fn sibling_public_key_path(private_key: &Path) -> PathBuf {
    // Append, so `id.key` pairs with `id.key.pub`
    let mut path: OsString = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Derive the public key for a private key file
pub async fn derive_public_key(private_key: &Path) -> Result<PublicKey> {
    let sibling = sibling_public_key_path(private_key);
    if let Ok(content) = tokio::fs::read_to_string(&sibling).await {
        match PublicKey::parse(&content) {
            Ok(key) => {
                tracing::debug!("Using public key from {:?}", sibling);
                return Ok(key);
            }
            Err(e) => tracing::warn!("Ignoring {:?}: {}", sibling, e),
        }
    }

    tracing::debug!("Deriving public key from {:?} with ssh-keygen", private_key);
    let output = Command::new("ssh-keygen")
        .arg("-y")
        .arg("-P")
        .arg("")
        .arg("-f")
        .arg(private_key)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CoreError::KeyDerivation(format!("failed to run ssh-keygen: {}", e)))?;

    if !output.status.success() {
        return Err(CoreError::KeyDerivation(format!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    PublicKey::parse(&String::from_utf8_lossy(&output.stdout))
}

/// Validate a username before it is interpolated into shell commands
pub fn validate_username(user: &str) -> Result<()> {
    if user.is_empty() || user.len() > 32 {
        return Err(CoreError::Configuration(format!(
            "Invalid username length: {}",
            user.len()
        )));
    }

    let starts_ok = user
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !starts_ok {
        return Err(CoreError::Configuration(format!(
            "Invalid username '{}': must start with lowercase letter or underscore",
            user
        )));
    }

    if !user
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(CoreError::Configuration(format!(
            "Invalid username '{}': contains invalid characters",
            user
        )));
    }

    Ok(())
}

/// Installs SSH access into a running container
pub struct AccessProvisioner<'a> {
    hypervisor: &'a dyn Hypervisor,
    output: Option<&'a OutputSink>,
}

impl<'a> AccessProvisioner<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor, output: Option<&'a OutputSink>) -> Self {
        Self { hypervisor, output }
    }

    /// The three in-container commands that install `key` for `credentials`
    pub fn commands(credentials: &AccessCredentials, key: &PublicKey) -> [String; 3] {
        let destination = credentials.authorized_keys_path();
        let user = &credentials.username;
        [
            format!(
                "test -f {dest} || (mkdir -p /home/{user}/.ssh && touch {dest})",
                dest = destination,
                user = user
            ),
            format!("echo '{}' > {}", key.authorized_keys_line(), destination),
            format!("chown -R {user}:{user} /home/{user}/.ssh", user = user),
        ]
    }

    /// Install the public key of `credentials` into `name`.
    ///
    /// Fails before touching the container when no usable key is configured.
    /// A failure part way through leaves `authorized_keys` in an unknown
    /// state; the caller must rerun the whole sequence.
    pub async fn provision(&self, name: &ContainerName, credentials: &AccessCredentials) -> Result<()> {
        let key_path = credentials.usable_key()?;
        validate_username(&credentials.username)?;
        let key = derive_public_key(key_path).await?;

        tracing::info!(
            "Configuring SSH access to {} for user {}",
            name,
            credentials.username
        );

        for command in Self::commands(credentials, &key) {
            self.hypervisor.exec(name, &command, self.output).await?;
        }

        tracing::debug!("Installed {} key into {}", key.key_type, credentials.authorized_keys_path());
        Ok(())
    }
}
