//! Shared API type definitions
//!
//! This crate contains the data-model types shared between the pod-warden
//! governance core and the HTTP/CLI glue that exposes it: tenants, quotas,
//! sanctioned images, container descriptions and GPU process records.

use serde::Deserialize;
use serde::Serialize;

/// Sentinel stored in any quota column that has no explicit value.
/// A field still equal to this after default fallback means unlimited.
pub const QUOTA_UNSET: i64 = -1;

/// An authenticated user of the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Row id in the user table
    pub userid: i64,
    /// Validated tenant name, also the first segment of every pod name
    pub name: String,
    /// Admins may act on other tenants' pods
    pub is_admin: bool,
}

/// Per-tenant resource limits.
///
/// Stored rows use [`QUOTA_UNSET`] for fields the admin never set; an
/// effective quota is obtained with [`Quota::with_defaults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_pods: i64,
    pub gpu_count: i64,
    /// Container memory limit in bytes
    pub memory_limit: i64,
    /// Commit image size limit in bytes
    pub storage_size: i64,
    /// Shared memory size in bytes
    pub shm_size: i64,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_pods: QUOTA_UNSET,
            gpu_count: QUOTA_UNSET,
            memory_limit: QUOTA_UNSET,
            storage_size: QUOTA_UNSET,
            shm_size: QUOTA_UNSET,
        }
    }
}

impl Quota {
    /// Replace every unset field with the corresponding default value.
    pub fn with_defaults(&self, defaults: &Quota) -> Quota {
        fn pick(stored: i64, fallback: i64) -> i64 {
            if stored == QUOTA_UNSET {
                fallback
            } else {
                stored
            }
        }
        Quota {
            max_pods: pick(self.max_pods, defaults.max_pods),
            gpu_count: pick(self.gpu_count, defaults.gpu_count),
            memory_limit: pick(self.memory_limit, defaults.memory_limit),
            storage_size: pick(self.storage_size, defaults.storage_size),
            shm_size: pick(self.shm_size, defaults.shm_size),
        }
    }
}

/// Partial quota update; only `Some` fields are applied, the rest are
/// left untouched by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub max_pods: Option<i64>,
    pub gpu_count: Option<i64>,
    pub memory_limit: Option<i64>,
    pub storage_size: Option<i64>,
    pub shm_size: Option<i64>,
}

impl QuotaUpdate {
    pub fn is_empty(&self) -> bool {
        self.max_pods.is_none()
            && self.gpu_count.is_none()
            && self.memory_limit.is_none()
            && self.storage_size.is_none()
            && self.shm_size.is_none()
    }
}

/// A globally sanctioned base image, visible to every tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image name, e.g. "ubuntu2204-cuda121:latest"
    pub name: String,
    /// Container ports exposed when a pod is created from this image
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub description: String,
}

/// Request to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image_name: String,
    pub container_name: String,
    /// "host:container:mode" mappings
    #[serde(default)]
    pub volumes: Vec<String>,
    /// "host:container" port mappings
    #[serde(default)]
    pub port_mapping: Vec<String>,
    /// `None` grants all GPUs
    pub gpu_ids: Option<Vec<u32>>,
    /// e.g. "8g"; swap is pinned to the same value
    pub memory_limit: String,
    /// Shared memory size, e.g. "8g"
    pub shm_size: Option<String>,
    pub entrypoint: Option<String>,
}

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
    pub image: String,
    /// "host:container" pairs
    pub port_mapping: Vec<String>,
    /// `None` means all GPUs
    pub gpu_ids: Option<Vec<u32>>,
    /// Bytes, -1 when unlimited
    pub memory_limit: i64,
}

/// Verbs accepted by the runtime's `action` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Kill,
    Delete,
}

impl std::fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::Delete => "delete",
        };
        write!(f, "{verb}")
    }
}

/// One GPU-resident process as reported by telemetry. Transient, recomputed
/// on every poll, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    /// Bytes of GPU memory in use
    pub gpu_memory_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_only_unset_fields() {
        let stored = Quota {
            max_pods: 3,
            gpu_count: QUOTA_UNSET,
            memory_limit: QUOTA_UNSET,
            storage_size: 10,
            shm_size: QUOTA_UNSET,
        };
        let defaults = Quota {
            max_pods: 1,
            gpu_count: 2,
            memory_limit: 8 << 30,
            storage_size: 50 << 30,
            shm_size: QUOTA_UNSET,
        };
        let effective = stored.with_defaults(&defaults);
        assert_eq!(effective.max_pods, 3);
        assert_eq!(effective.gpu_count, 2);
        assert_eq!(effective.memory_limit, 8 << 30);
        assert_eq!(effective.storage_size, 10);
        // unset in both: stays unlimited
        assert_eq!(effective.shm_size, QUOTA_UNSET);
    }

    #[test]
    fn empty_update_is_detected() {
        assert!(QuotaUpdate::default().is_empty());
        let update = QuotaUpdate {
            gpu_count: Some(2),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
