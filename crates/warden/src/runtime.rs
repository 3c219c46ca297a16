//! Container runtime collaborator.
//!
//! The governance core only talks to the runtime through the
//! [`ContainerRuntime`] trait; [`DockerCli`] is the production adapter,
//! shelling out to the `docker` binary. Runtime operations are idempotent
//! per container and never run inside a store transaction.

use std::time::Duration;

use api_types::ContainerAction;
use api_types::ContainerInfo;
use api_types::ContainerSpec;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::error::WardenError;

/// Exit code reported when an in-container command hits its wall-clock
/// timeout and is killed.
pub const EXEC_TIMEOUT_EXIT: i32 = -1;

/// Timeout applied to pre/post action commands.
const ACTION_CMD_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its startup log.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Apply a lifecycle verb, optionally running a command inside the
    /// container before and after. Unknown names are `NotFound`.
    async fn action(
        &self,
        name: &str,
        action: ContainerAction,
        pre_cmd: Option<&str>,
        post_cmd: Option<&str>,
    ) -> Result<String>;

    /// Inspect by name or id.
    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo>;

    /// Names of all containers whose name matches `name_filter`.
    async fn list(&self, name_filter: &str) -> Result<Vec<String>>;

    /// Run a shell command inside the container under a hard wall-clock
    /// timeout. On expiry the worker is killed and
    /// `(EXEC_TIMEOUT_EXIT, "timeout")` is returned.
    async fn exec(&self, name: &str, command: &str, timeout: Duration) -> Result<(i32, String)>;

    /// Host ports currently claimed by any container.
    async fn used_ports(&self) -> Result<Vec<u16>>;
}

/// `docker` CLI adapter.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running {}", self.binary);
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if is_not_found(&stderr) {
            return Err(WardenError::NotFound(stderr.trim().to_string()));
        }
        Err(WardenError::Runtime(stderr.trim().to_string()))
    }

    async fn inspect_json(&self, names_or_ids: &[&str]) -> Result<Vec<Value>> {
        let mut args = vec!["inspect"];
        args.extend_from_slice(names_or_ids);
        let stdout = self.docker(&args).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| WardenError::Runtime(format!("unparseable inspect output: {e}")))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Pull `host:container` pairs out of `NetworkSettings.Ports`.
fn port_mappings(inspected: &Value) -> Vec<String> {
    let Some(ports) = inspected
        .pointer("/NetworkSettings/Ports")
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    let mut mappings = Vec::new();
    for (container_port, bindings) in ports {
        let container_port = container_port.split('/').next().unwrap_or(container_port);
        let Some(bindings) = bindings.as_array() else {
            continue;
        };
        for binding in bindings {
            if let Some(host_port) = binding.get("HostPort").and_then(Value::as_str) {
                mappings.push(format!("{host_port}:{container_port}"));
            }
        }
    }
    mappings.sort();
    mappings
}

fn gpu_ids(inspected: &Value) -> Option<Vec<u32>> {
    let requests = inspected
        .pointer("/HostConfig/DeviceRequests")
        .and_then(Value::as_array)?;
    let device_ids = requests.first()?.get("DeviceIDs")?.as_array()?;
    Some(
        device_ids
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|id| id.parse().ok())
            .collect(),
    )
}

fn container_info(inspected: &Value) -> ContainerInfo {
    let name = inspected
        .get("Name")
        .and_then(Value::as_str)
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let status = inspected
        .pointer("/State/Status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let image = inspected
        .pointer("/Config/Image")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let memory_limit = match inspected.pointer("/HostConfig/Memory").and_then(Value::as_i64) {
        Some(0) | None => -1,
        Some(bytes) => bytes,
    };
    ContainerInfo {
        name,
        status,
        image,
        port_mapping: port_mappings(inspected),
        gpu_ids: gpu_ids(inspected),
        memory_limit,
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--tty".into(),
            "--name".into(),
            spec.container_name.clone(),
            "--restart".into(),
            "always".into(),
            "--memory".into(),
            spec.memory_limit.clone(),
            // swap pinned to the memory limit, i.e. disabled
            "--memory-swap".into(),
            spec.memory_limit.clone(),
        ];
        if let Some(shm_size) = &spec.shm_size {
            args.push("--shm-size".into());
            args.push(shm_size.clone());
        }
        match &spec.gpu_ids {
            Some(ids) => {
                let devices: Vec<String> = ids.iter().map(u32::to_string).collect();
                args.push("--gpus".into());
                args.push(format!("device={}", devices.join(",")));
            }
            None => {
                args.push("--gpus".into());
                args.push("all".into());
            }
        }
        for volume in &spec.volumes {
            args.push("--volume".into());
            args.push(volume.clone());
        }
        for mapping in &spec.port_mapping {
            args.push("--publish".into());
            args.push(mapping.clone());
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        args.push(spec.image_name.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&arg_refs).await?;
        self.docker(&["logs", &spec.container_name]).await
    }

    async fn action(
        &self,
        name: &str,
        action: ContainerAction,
        pre_cmd: Option<&str>,
        post_cmd: Option<&str>,
    ) -> Result<String> {
        if let Some(cmd) = pre_cmd {
            self.exec(name, cmd, ACTION_CMD_TIMEOUT).await?;
        }
        match action {
            ContainerAction::Start => self.docker(&["start", name]).await?,
            ContainerAction::Stop => self.docker(&["stop", name]).await?,
            ContainerAction::Restart => self.docker(&["restart", name]).await?,
            ContainerAction::Kill => self.docker(&["kill", name]).await?,
            ContainerAction::Delete => {
                self.docker(&["rm", "--force", name]).await?;
                return Ok(format!("Container {name} deleted"));
            }
        };
        if let Some(cmd) = post_cmd {
            self.exec(name, cmd, ACTION_CMD_TIMEOUT).await?;
        }
        self.docker(&["logs", name]).await
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo> {
        let inspected = self.inspect_json(&[name_or_id]).await?;
        let first = inspected
            .first()
            .ok_or_else(|| WardenError::NotFound(format!("container {name_or_id}")))?;
        Ok(container_info(first))
    }

    async fn list(&self, name_filter: &str) -> Result<Vec<String>> {
        let filter = format!("name={name_filter}");
        let stdout = self
            .docker(&["ps", "--all", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn exec(&self, name: &str, command: &str, timeout: Duration) -> Result<(i32, String)> {
        let mut child = Command::new(&self.binary)
            .args(["exec", name, "/bin/bash", "-c", command])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            // the worker is killed on drop; report the sentinel instead of
            // hanging the caller's cycle
            Err(_elapsed) => return Ok((EXEC_TIMEOUT_EXIT, "timeout".to_string())),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() && is_not_found(&stderr) {
            return Err(WardenError::NotFound(stderr.trim().to_string()));
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&stderr);
        Ok((output.status.code().unwrap_or(EXEC_TIMEOUT_EXIT), combined))
    }

    async fn used_ports(&self) -> Result<Vec<u16>> {
        let stdout = self.docker(&["ps", "--all", "--quiet"]).await?;
        let ids: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let inspected = self.inspect_json(&ids).await?;
        let mut ports = Vec::new();
        for container in &inspected {
            for mapping in port_mappings(container) {
                if let Some(host_port) = mapping.split(':').next() {
                    if let Ok(port) = host_port.parse() {
                        ports.push(port);
                    }
                }
            }
        }
        Ok(ports)
    }
}
