//! Multi-tenant resource governance for a shared GPU host.
//!
//! Grants tenants scoped, quota-limited access to containerized pods:
//! tenant-scoped naming and permission checks, quota accounting with
//! default fallback, attribution of GPU-resident processes to owning
//! containers, and a background daemon that enforces GPU quotas.

pub mod attribution;
pub mod config;
pub mod daemon;
pub mod error;
pub mod images;
pub mod logging;
pub mod naming;
pub mod quota;
pub mod runtime;
pub mod telemetry;
