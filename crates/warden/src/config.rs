//! Process configuration: CLI arguments and the YAML config file.

use std::path::PathBuf;

use api_types::ImageConfig;
use api_types::Quota;
use api_types::QUOTA_UNSET;
use clap::Parser;
use clap::Subcommand;
use serde::Deserialize;
use utils::fmt::parse_storage_size;

use crate::error::Result;
use crate::error::WardenError;

#[derive(Parser)]
#[command(name = "pod-warden", about = "Multi-tenant GPU pod governance daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the quota enforcement daemon
    Daemon(DaemonArgs),
    /// Add a tenant to the state database
    #[command(name = "add-user")]
    AddUser(AddUserArgs),
}

#[derive(Parser)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "WARDEN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/pod-warden/config.yaml",
        help = "Path to the YAML configuration file"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "WARDEN_STATE_DB",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/pod-warden/state.db",
        help = "Path to the tenant/quota SQLite database"
    )]
    pub state_db: PathBuf,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds between enforcement cycles, fixed for the process lifetime"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        help = "Comma-separated GPU ids to watch (defaults to every device)"
    )]
    pub gpu_ids: Option<String>,

    #[arg(
        long,
        env = "WARDEN_AUDIT_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Optional rolling file receiving enforcement audit logs"
    )]
    pub audit_log: Option<PathBuf>,
}

#[derive(Parser)]
pub struct AddUserArgs {
    pub username: String,
    pub password: String,
    #[arg(long, help = "Grant admin rights")]
    pub admin: bool,
    #[arg(
        long,
        env = "WARDEN_STATE_DB",
        default_value = "/var/lib/pod-warden/state.db"
    )]
    pub state_db: PathBuf,
}

/// One token of the available-ports grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Single(u16),
    /// Inclusive
    Range(u16, u16),
}

/// Parse a comma-separated port specification: each token is a single port
/// or an inclusive `a-b` range with `0 <= a < b <= 65535`.
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortRange>> {
    fn parse_port(token: &str) -> Result<u16> {
        token
            .trim()
            .parse::<u16>()
            .map_err(|_| WardenError::InvalidInput(format!("invalid port: {token}")))
    }

    let mut ranges = Vec::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(WardenError::InvalidInput(format!(
                "empty token in port spec: {spec}"
            )));
        }
        match token.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_port(start)?, parse_port(end)?);
                if start >= end {
                    return Err(WardenError::InvalidInput(format!(
                        "invalid port range: {token}"
                    )));
                }
                ranges.push(PortRange::Range(start, end));
            }
            None => ranges.push(PortRange::Single(parse_port(token)?)),
        }
    }
    Ok(ranges)
}

/// Flatten ranges into individual ports, preserving order.
pub fn expand_ports(ranges: &[PortRange]) -> Vec<u16> {
    let mut ports = Vec::new();
    for range in ranges {
        match *range {
            PortRange::Single(port) => ports.push(port),
            PortRange::Range(start, end) => ports.extend(start..=end),
        }
    }
    ports
}

/// Default quota section of the config file. The byte-sized fields accept
/// human sizes ("32g") or "-1" for unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultQuotaConfig {
    #[serde(default = "unset")]
    pub max_pods: i64,
    #[serde(default = "unset")]
    pub gpu_count: i64,
    #[serde(default = "unset_size")]
    pub memory_limit: String,
    #[serde(default = "unset_size")]
    pub storage_size: String,
    #[serde(default = "unset_size")]
    pub shm_size: String,
}

fn unset() -> i64 {
    QUOTA_UNSET
}

fn unset_size() -> String {
    QUOTA_UNSET.to_string()
}

impl DefaultQuotaConfig {
    pub fn quota(&self) -> Result<Quota> {
        Ok(Quota {
            max_pods: self.max_pods,
            gpu_count: self.gpu_count,
            memory_limit: parse_size_or_unset(&self.memory_limit)?,
            storage_size: parse_size_or_unset(&self.storage_size)?,
            shm_size: parse_size_or_unset(&self.shm_size)?,
        })
    }
}

fn parse_size_or_unset(s: &str) -> Result<i64> {
    if s.trim() == "-1" {
        return Ok(QUOTA_UNSET);
    }
    let bytes = parse_storage_size(s).map_err(|e| WardenError::InvalidInput(e.to_string()))?;
    i64::try_from(bytes).map_err(|_| WardenError::InvalidInput(format!("size too large: {s}")))
}

/// Configuration file contents, loaded once at startup and treated as
/// immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Leading segment of every pod name; empty disables the prefix
    #[serde(default)]
    pub name_prefix: String,
    /// Port grammar string, e.g. "2200-2299,9000"
    pub available_ports: String,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    pub default_quota: DefaultQuotaConfig,
    /// Repository name for tenant commit images
    #[serde(default = "default_commit_name")]
    pub commit_name: String,
    /// Size ceiling for commit images, e.g. "50g"
    #[serde(default = "unset_size")]
    pub commit_size_limit: String,
    /// Ports exposed by pods created from commit images
    #[serde(default)]
    pub commit_image_ports: Vec<u16>,
    /// "host:container:mode" volume templates, "{user}" substituted
    #[serde(default)]
    pub volume_mappings: Vec<String>,
}

fn default_commit_name() -> String {
    "warden-commit".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)
            .map_err(|e| WardenError::InvalidInput(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name_prefix.contains('-') || self.name_prefix.contains(':') {
            return Err(WardenError::InvalidInput(format!(
                "name_prefix '{}' cannot contain '-' or ':'",
                self.name_prefix
            )));
        }
        parse_port_spec(&self.available_ports)?;
        parse_size_or_unset(&self.commit_size_limit)?;
        self.default_quota.quota()?;
        Ok(())
    }

    pub fn available_port_ranges(&self) -> Vec<PortRange> {
        // validated at load time
        parse_port_spec(&self.available_ports).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn port_spec_parses_ranges_and_singles() {
        let ranges = parse_port_spec("2200-2202,9000").unwrap();
        assert_eq!(
            ranges,
            vec![PortRange::Range(2200, 2202), PortRange::Single(9000)]
        );
        assert_eq!(expand_ports(&ranges), vec![2200, 2201, 2202, 9000]);
    }

    #[test]
    fn port_spec_accepts_whitespace() {
        let ranges = parse_port_spec(" 22 , 80-81 ").unwrap();
        assert_eq!(
            ranges,
            vec![PortRange::Single(22), PortRange::Range(80, 81)]
        );
    }

    #[test]
    fn port_spec_rejects_bad_tokens() {
        assert!(parse_port_spec("").is_err());
        assert!(parse_port_spec("80,").is_err());
        assert!(parse_port_spec("abc").is_err());
        assert!(parse_port_spec("100-90").is_err());
        assert!(parse_port_spec("90-90").is_err());
        assert!(parse_port_spec("0-70000").is_err());
    }

    #[test]
    fn default_quota_parses_sizes_and_sentinels() {
        let config = DefaultQuotaConfig {
            max_pods: 2,
            gpu_count: 1,
            memory_limit: "8g".to_string(),
            storage_size: "-1".to_string(),
            shm_size: "512m".to_string(),
        };
        let quota = config.quota().unwrap();
        assert_eq!(quota.memory_limit, 8 << 30);
        assert_eq!(quota.storage_size, QUOTA_UNSET);
        assert_eq!(quota.shm_size, 512 << 20);
    }

    #[test]
    fn config_round_trips_from_yaml() {
        let yaml = r#"
name_prefix: pod
available_ports: "2200-2299,9000"
images:
  - name: cuda121:latest
    ports: [22]
    description: base image
default_quota:
  max_pods: 2
  gpu_count: 1
  memory_limit: 8g
commit_name: warden-commit
commit_size_limit: 50g
commit_image_ports: [22]
volume_mappings:
  - /data/{user}:/workspace:rw
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name_prefix, "pod");
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].ports, vec![22]);
        assert_eq!(
            config.available_port_ranges(),
            vec![PortRange::Range(2200, 2299), PortRange::Single(9000)]
        );
        // omitted sizes default to unset
        assert_eq!(config.default_quota.quota().unwrap().shm_size, QUOTA_UNSET);
    }

    #[test]
    fn dashed_prefix_is_rejected() {
        let yaml = r#"
name_prefix: po-d
available_ports: "22"
default_quota: {}
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
