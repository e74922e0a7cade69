use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use nodeadm_core::image::DockerImage;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::ResourceAllocation;

use crate::container::{
    ContainerRuntime, ContainerStatus, ExecOutput, HOSTNAME_LABEL, RuntimeError, RuntimeResult,
};

/// Mount point of the node's live storage inside the container.
pub const CONTAINER_STORAGE_MOUNT: &str = "/opt/vespa/var";

/// [`ContainerRuntime`] backed by the `docker` command line.
///
/// Talks to whatever engine the binary is configured for; podman works too
/// since only the common subcommands are used.
pub struct DockerCli {
    binary: String,
    timeout: Duration,
    storage_root: Option<PathBuf>,
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            timeout: Duration::from_secs(30),
            storage_root: None,
        }
    }

    /// Bound every docker invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bind-mount `<root>/live/<container>` into created containers.
    pub fn with_storage_root(mut self, root: PathBuf) -> Self {
        self.storage_root = Some(root);
        self
    }

    async fn run(&self, args: &[String]) -> RuntimeResult<Output> {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        debug!(binary = %self.binary, ?args, "Running docker command");

        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Err(_) => Err(RuntimeError::Unavailable(format!(
                "{} {} timed out after {}s",
                self.binary,
                subcommand,
                self.timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(RuntimeError::Unavailable(format!(
                "failed to run {}: {}",
                self.binary, e
            ))),
            Ok(Ok(output)) => Ok(output),
        }
    }

    fn create_args(
        &self,
        image: &DockerImage,
        name: &ContainerName,
        hostname: &str,
        resources: &ResourceAllocation,
    ) -> Vec<String> {
        let memory_mib = (resources.memory_gb * 1024.0).round() as u64;
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--hostname".to_string(),
            hostname.to_string(),
            "--label".to_string(),
            format!("{}={}", HOSTNAME_LABEL, hostname),
            "--cpus".to_string(),
            resources.vcpus.to_string(),
            "--memory".to_string(),
            format!("{}m", memory_mib),
        ];
        if let Some(root) = &self.storage_root {
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{}",
                root.join("live").join(name.as_str()).display(),
                CONTAINER_STORAGE_MOUNT
            ));
        }
        args.push(image.to_string());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_container(
        &self,
        image: &DockerImage,
        name: &ContainerName,
        hostname: &str,
        resources: &ResourceAllocation,
    ) -> RuntimeResult<()> {
        if let Some(existing) = self.inspect(name).await? {
            if existing.image == *image {
                debug!(container = %name, "Container already exists with wanted image");
                return Ok(());
            }
            return Err(RuntimeError::NameInUse(name.to_string()));
        }

        info!(container = %name, image = %image, "Creating container");
        let output = self
            .run(&self.create_args(image, name, hostname, resources))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                name.as_str(),
                image.as_str(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn start(&self, name: &ContainerName) -> RuntimeResult<()> {
        info!(container = %name, "Starting container");
        let output = self
            .run(&["start".to_string(), name.to_string()])
            .await?;
        check(name, &output)
    }

    async fn stop(&self, name: &ContainerName) -> RuntimeResult<()> {
        info!(container = %name, "Stopping container");
        let output = self.run(&["stop".to_string(), name.to_string()]).await?;
        check(name, &output)
    }

    async fn remove(&self, name: &ContainerName) -> RuntimeResult<()> {
        info!(container = %name, "Removing container");
        let output = self
            .run(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        match check(name, &output) {
            Err(RuntimeError::ContainerNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn exec_as_user(
        &self,
        name: &ContainerName,
        user: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutput> {
        let mut args = vec![
            "exec".to_string(),
            "--user".to_string(),
            user.to_string(),
            name.to_string(),
        ];
        args.extend(command.iter().cloned());
        let output = self.run(&args).await?;

        let exec = ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if exec.success() {
            return Ok(exec);
        }
        if is_missing_container(&exec.stderr) {
            return Err(RuntimeError::ContainerNotFound(name.to_string()));
        }
        Err(RuntimeError::ExecFailed {
            name: name.to_string(),
            command: command.join(" "),
            exit_code: exec.exit_code,
            stderr: exec.stderr.trim().to_string(),
        })
    }

    async fn inspect(&self, name: &ContainerName) -> RuntimeResult<Option<ContainerStatus>> {
        let output = self
            .run(&[
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                name.to_string(),
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Ok(None);
            }
            return Err(classify_failure(name.as_str(), "", &stderr));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }
}

fn check(name: &ContainerName, output: &Output) -> RuntimeResult<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(classify_failure(
        name.as_str(),
        "",
        &String::from_utf8_lossy(&output.stderr),
    ))
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
        || stderr.contains("no such container")
        || stderr.contains("is not running")
}

/// Map docker's stderr onto the runtime error taxonomy.
pub(crate) fn classify_failure(name: &str, image: &str, stderr: &str) -> RuntimeError {
    let reason = stderr.trim().to_string();
    if is_missing_container(stderr) {
        return RuntimeError::ContainerNotFound(name.to_string());
    }
    if stderr.contains("is already in use") {
        return RuntimeError::NameInUse(name.to_string());
    }
    let image_markers = [
        "No such image",
        "invalid reference format",
        "pull access denied",
        "manifest unknown",
        "repository does not exist",
    ];
    if image_markers.iter().any(|m| stderr.contains(m)) {
        return RuntimeError::ImageInvalid {
            image: image.to_string(),
            reason,
        };
    }
    let resource_markers = [
        "Minimum memory limit",
        "range of CPUs",
        "cannot allocate memory",
        "no space left on device",
    ];
    if resource_markers.iter().any(|m| stderr.contains(m)) {
        return RuntimeError::ResourceExceeded {
            name: name.to_string(),
            reason,
        };
    }
    RuntimeError::Unavailable(reason)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    nano_cpus: i64,
    #[serde(default)]
    memory: i64,
}

/// Parse `docker inspect` output (a JSON array with one entry).
pub(crate) fn parse_inspect(stdout: &str) -> RuntimeResult<Option<ContainerStatus>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(stdout)
        .map_err(|e| RuntimeError::Unavailable(format!("unparseable inspect output: {}", e)))?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let name = ContainerName::new(entry.name.trim_start_matches('/'))
        .map_err(|e| RuntimeError::Unavailable(format!("unexpected container name: {}", e)))?;
    let image: DockerImage = entry
        .config
        .image
        .parse()
        .map_err(|e| RuntimeError::Unavailable(format!("unexpected image reference: {}", e)))?;
    let hostname = entry
        .config
        .labels
        .and_then(|mut labels| labels.remove(HOSTNAME_LABEL));
    let resources = entry
        .host_config
        .filter(|hc| hc.nano_cpus > 0 && hc.memory > 0)
        .map(|hc| {
            ResourceAllocation::new(
                hc.nano_cpus as f64 / 1e9,
                hc.memory as f64 / (1024.0 * 1024.0 * 1024.0),
                0.0,
            )
        });

    Ok(Some(ContainerStatus {
        name,
        image,
        running: entry.state.running,
        hostname,
        resources,
    }))
}
