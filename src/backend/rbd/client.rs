//! RBD session
//!
//! [`RbdClient`] is the seam between the driver and the Ceph cluster.
//! [`RbdCli`] implements it with the `rbd` and `ceph` command-line tools.
//! Every invocation gets its own process, so concurrent calls for different
//! images never share state.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::RbdConfig;
use crate::error::{Error, Result};

/// EINVAL as reported in `rbd` exit codes and messages.
const EINVAL: i32 = 22;

/// Address of one RBD image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub pool: String,
    pub namespace: Option<String>,
    pub image: String,
}

impl ImageSpec {
    pub fn new(pool: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            namespace: None,
            image: image.into(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into()).filter(|n: &String| !n.is_empty());
        self
    }
}

impl std::fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.pool, ns, self.image),
            None => write!(f, "{}/{}", self.pool, self.image),
        }
    }
}

/// Operations the driver needs from a Ceph session.
#[async_trait]
pub trait RbdClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn shutdown(&self);

    /// All metadata of an image, including non-QoS keys.
    async fn list_metadata(&self, image: &ImageSpec) -> Result<BTreeMap<String, String>>;

    async fn set_metadata(&self, image: &ImageSpec, key: &str, value: &str) -> Result<()>;

    async fn remove_metadata(&self, image: &ImageSpec, key: &str) -> Result<()>;
}

// =============================================================================
// CLI Implementation
// =============================================================================

/// [`RbdClient`] backed by the Ceph command-line tools.
pub struct RbdCli {
    config: RbdConfig,
    connected: AtomicBool,
}

impl RbdCli {
    pub fn new(config: RbdConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// Write the secret key to a private temporary file.
    ///
    /// The file is created with mode 0600 and deleted when the returned
    /// handle is dropped, i.e. as soon as the command using it has exited.
    fn materialize_keyfile(&self) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("keyfile-");
        let mut file = match &self.config.keyfile_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(self.config.key.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn base_command(&self, binary: &str, keyfile: &Path) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("-m")
            .arg(&self.config.monitors)
            .arg("--id")
            .arg(&self.config.user)
            .arg("--keyfile")
            .arg(keyfile)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotConnected(self.config.provisioner.clone()))
        }
    }

    /// Run a Ceph tool with credentials and return its stdout.
    async fn run(&self, binary: &str, args: &[&str]) -> Result<String> {
        let keyfile = self.materialize_keyfile()?;
        let mut cmd = self.base_command(binary, keyfile.path());
        cmd.args(args);

        let description = format!("{} {}", binary, args.join(" "));
        debug!(command = %description, "Running Ceph command");

        let timeout = self.config.command_timeout;
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::CommandTimeout {
                command: description.clone(),
                seconds: timeout.as_secs(),
            })??;
        drop(keyfile);

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(&description, output.status.code(), &stderr))
    }
}

impl std::fmt::Debug for RbdCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbdCli")
            .field("config", &self.config)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

/// Map a failed command to an error kind. The engine reports malformed
/// values as EINVAL; everything else is worth retrying.
fn classify_failure(command: &str, code: Option<i32>, stderr: &str) -> Error {
    let message = format!("{} failed: {}", command, stderr);
    if code == Some(EINVAL) || stderr.contains("Invalid argument") {
        Error::InvalidArgument(message)
    } else {
        Error::Backend(message)
    }
}

/// Parse `rbd image-meta list --format json` output.
fn parse_metadata(stdout: &str) -> Result<BTreeMap<String, String>> {
    if stdout.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(stdout)
        .map_err(|e| Error::Backend(format!("unexpected image-meta output: {}", e)))
}

#[async_trait]
impl RbdClient for RbdCli {
    #[instrument(skip(self), fields(monitors = %self.config.monitors))]
    async fn connect(&self) -> Result<()> {
        if self.config.monitors.is_empty() || self.config.user.is_empty() {
            return Err(Error::Config(
                "Ceph monitors and user must be configured".to_string(),
            ));
        }
        let timeout_secs = self.config.command_timeout.as_secs().max(1).to_string();
        self.run(
            &self.config.ceph_binary,
            &["--connect-timeout", &timeout_secs, "health"],
        )
        .await?;
        self.connected.store(true, Ordering::Release);
        debug!("Connected to Ceph cluster");
        Ok(())
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        debug!("Disconnected from Ceph cluster");
    }

    async fn list_metadata(&self, image: &ImageSpec) -> Result<BTreeMap<String, String>> {
        self.ensure_connected()?;
        let spec = image.to_string();
        let stdout = self
            .run(
                &self.config.rbd_binary,
                &["image-meta", "list", &spec, "--format", "json"],
            )
            .await?;
        parse_metadata(&stdout)
    }

    async fn set_metadata(&self, image: &ImageSpec, key: &str, value: &str) -> Result<()> {
        self.ensure_connected()?;
        let spec = image.to_string();
        self.run(&self.config.rbd_binary, &["image-meta", "set", &spec, key, value])
            .await
            .map(|_| ())
    }

    async fn remove_metadata(&self, image: &ImageSpec, key: &str) -> Result<()> {
        self.ensure_connected()?;
        let spec = image.to_string();
        self.run(&self.config.rbd_binary, &["image-meta", "remove", &spec, key])
            .await
            .map(|_| ())
    }
}
