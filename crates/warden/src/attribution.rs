//! Attribution of GPU-resident processes to containers and tenants.
//!
//! Telemetry reports raw host pids; this module walks `/proc` to find the
//! owning container via the cgroup path, then joins with the runtime to
//! recover the container name and, through the naming scheme, the tenant.
//! The cgroup leaf format belongs to one runtime's naming convention, so
//! it hides behind [`CgroupMatcher`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::error::WardenError;
use crate::naming::NamingScheme;
use crate::runtime::ContainerRuntime;

/// Extracts a container id from a cgroup leaf component, or `None` for a
/// host-level process.
pub trait CgroupMatcher: Send + Sync {
    fn container_id(&self, leaf: &str) -> Option<String>;
}

/// Matches systemd-managed scopes named `{engine}-{id}.scope`.
pub struct SystemdScopeMatcher {
    engine: String,
}

impl SystemdScopeMatcher {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }
}

impl Default for SystemdScopeMatcher {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl CgroupMatcher for SystemdScopeMatcher {
    fn container_id(&self, leaf: &str) -> Option<String> {
        let id = leaf
            .strip_prefix(&self.engine)?
            .strip_prefix('-')?
            .strip_suffix(".scope")?;
        (!id.is_empty()).then(|| id.to_string())
    }
}

/// A GPU-resident process successfully attributed to a tenant's pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodProcess {
    pub pid: u32,
    pub container_id: String,
    pub container_name: String,
    pub tenant: String,
    /// Process uptime in seconds, used for victim selection.
    pub uptime_secs: f64,
}

/// Maps one pid to its owning pod, if any. Abstracted so the enforcement
/// daemon can be tested without a `/proc` filesystem.
#[async_trait]
pub trait Attributor: Send + Sync {
    async fn attribute_and_resolve(&self, pid: u32) -> Result<Option<PodProcess>>;
}

pub struct GpuAttribution {
    matcher: Box<dyn CgroupMatcher>,
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingScheme,
    proc_root: PathBuf,
}

impl GpuAttribution {
    pub fn new(
        matcher: Box<dyn CgroupMatcher>,
        runtime: Arc<dyn ContainerRuntime>,
        naming: NamingScheme,
    ) -> Self {
        Self::with_proc_root(matcher, runtime, naming, PathBuf::from("/proc"))
    }

    pub fn with_proc_root(
        matcher: Box<dyn CgroupMatcher>,
        runtime: Arc<dyn ContainerRuntime>,
        naming: NamingScheme,
        proc_root: PathBuf,
    ) -> Self {
        Self {
            matcher,
            runtime,
            naming,
            proc_root,
        }
    }

    fn read_proc(&self, pid: u32, file: &str) -> Result<String> {
        std::fs::read_to_string(self.proc_root.join(pid.to_string()).join(file)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WardenError::NotFound(format!("process {pid}"))
            } else {
                e.into()
            }
        })
    }

    /// Container id for a pid, `None` when it runs outside any container.
    /// A pid that exited since the telemetry snapshot is `NotFound`.
    pub fn attribute(&self, pid: u32) -> Result<Option<String>> {
        let cgroup = self.read_proc(pid, "cgroup")?;
        for line in cgroup.lines() {
            // hierarchy:controllers:path
            let Some(path) = line.splitn(3, ':').nth(2) else {
                continue;
            };
            let Some(leaf) = path.rsplit('/').next() else {
                continue;
            };
            if let Some(id) = self.matcher.container_id(leaf) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Seconds since the process started, from `/proc/{pid}/stat` and the
    /// system uptime.
    pub fn process_uptime(&self, pid: u32) -> Result<f64> {
        let stat = self.read_proc(pid, "stat")?;
        // the comm field may contain spaces, skip past its closing paren
        let after_comm = stat
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or_else(|| WardenError::InvalidInput(format!("malformed stat for pid {pid}")))?;
        // starttime is overall field 22; fields after comm start at 3
        let start_ticks: u64 = after_comm
            .split_whitespace()
            .nth(19)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| WardenError::InvalidInput(format!("malformed stat for pid {pid}")))?;

        let uptime = std::fs::read_to_string(self.proc_root.join("uptime"))?;
        let system_uptime: f64 = uptime
            .split_whitespace()
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| WardenError::InvalidInput("malformed system uptime".to_string()))?;

        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let hz = if hz > 0 { hz as f64 } else { 100.0 };
        Ok((system_uptime - start_ticks as f64 / hz).max(0.0))
    }
}

#[async_trait]
impl Attributor for GpuAttribution {
    async fn attribute_and_resolve(&self, pid: u32) -> Result<Option<PodProcess>> {
        let Some(container_id) = self.attribute(pid)? else {
            return Ok(None);
        };
        let info = self.runtime.inspect(&container_id).await?;
        let Some(components) = self.naming.split(&info.name, true) else {
            debug!(pid, container = %info.name, "container outside naming scheme");
            return Ok(None);
        };
        let Some(tenant) = components.tenant else {
            return Ok(None);
        };
        let uptime_secs = self.process_uptime(pid)?;
        Ok(Some(PodProcess {
            pid,
            container_id,
            container_name: info.name,
            tenant,
            uptime_secs,
        }))
    }
}
