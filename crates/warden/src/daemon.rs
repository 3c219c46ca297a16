//! GPU quota enforcement daemon.
//!
//! A single long-lived loop: poll telemetry, attribute every GPU-resident
//! process to a tenant, compare each tenant's distinct-GPU usage against
//! their quota, and stop the youngest offending pod. Every per-process and
//! per-tenant failure is caught and logged; only cancellation stops the
//! loop.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::ContainerAction;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::attribution::Attributor;
use crate::attribution::PodProcess;
use crate::error::Result;
use crate::quota::QuotaStore;
use crate::quota::UserStore;
use crate::runtime::ContainerRuntime;
use crate::runtime::EXEC_TIMEOUT_EXIT;
use crate::telemetry::list_processes;
use crate::telemetry::GpuTelemetry;

/// Directory inside the victim container receiving audit notes.
const NOTE_DIR: &str = "/var/log/pod-warden";
const NOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// One attributed GPU-resident process within a poll snapshot.
#[derive(Debug, Clone)]
struct AttributedProcess {
    gpu_id: u32,
    pod: PodProcess,
}

pub struct EnforcementDaemon {
    telemetry: Arc<dyn GpuTelemetry>,
    runtime: Arc<dyn ContainerRuntime>,
    attributor: Arc<dyn Attributor>,
    users: UserStore,
    quotas: QuotaStore,
    gpu_ids: Vec<u32>,
    poll_interval: Duration,
}

impl EnforcementDaemon {
    pub fn new(
        telemetry: Arc<dyn GpuTelemetry>,
        runtime: Arc<dyn ContainerRuntime>,
        attributor: Arc<dyn Attributor>,
        users: UserStore,
        quotas: QuotaStore,
        gpu_ids: Vec<u32>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            telemetry,
            runtime,
            attributor,
            users,
            quotas,
            gpu_ids,
            poll_interval,
        }
    }

    /// Loop until cancelled. Cycle failures are logged and retried at the
    /// next interval; they never terminate the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            gpu_ids = ?self.gpu_ids,
            interval_secs = self.poll_interval.as_secs(),
            "enforcement daemon started"
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                error!("enforcement cycle failed: {e}");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("enforcement daemon stopping");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One poll → evaluate → enforce pass.
    pub async fn run_cycle(&self) -> Result<()> {
        let attributed = self.poll().await?;
        let by_tenant = group_by_tenant(attributed);
        for (tenant, processes) in &by_tenant {
            if let Err(e) = self.enforce_tenant(tenant, processes).await {
                warn!(tenant = %tenant, "skipping tenant after enforcement error: {e}");
            }
        }
        Ok(())
    }

    /// Snapshot telemetry and attribute each process, discarding host-level
    /// processes and pods outside the naming scheme.
    async fn poll(&self) -> Result<Vec<AttributedProcess>> {
        let snapshot = list_processes(self.telemetry.as_ref(), &self.gpu_ids)?;
        let mut attributed = Vec::new();
        // deterministic GPU order keeps tie-breaking stable across cycles
        let mut gpu_ids: Vec<u32> = snapshot.keys().copied().collect();
        gpu_ids.sort_unstable();
        for gpu_id in gpu_ids {
            for process in &snapshot[&gpu_id] {
                match self.attributor.attribute_and_resolve(process.pid).await {
                    Ok(Some(pod)) => attributed.push(AttributedProcess { gpu_id, pod }),
                    Ok(None) => {}
                    Err(e) if e.is_skippable() => {
                        debug!(pid = process.pid, "skipping process: {e}");
                    }
                    Err(e) => {
                        warn!(pid = process.pid, "attribution failed: {e}");
                    }
                }
            }
        }
        Ok(attributed)
    }

    /// Evaluate one tenant's distinct-GPU usage and stop their youngest pod
    /// when over quota.
    async fn enforce_tenant(&self, tenant: &str, processes: &[AttributedProcess]) -> Result<()> {
        if self.users.get_user(tenant)?.is_none() {
            // the store is only authoritative for tenants it knows
            debug!(tenant, "unknown tenant, skipping");
            return Ok(());
        }
        let gpu_quota = self.quotas.get(tenant)?.gpu_count;
        if gpu_quota < 0 {
            return Ok(());
        }

        let distinct_gpus: BTreeSet<u32> = processes.iter().map(|p| p.gpu_id).collect();
        if distinct_gpus.len() as i64 <= gpu_quota {
            return Ok(());
        }

        // youngest process first, ties broken by encounter order
        let Some(victim) = processes
            .iter()
            .reduce(|best, p| if p.pod.uptime_secs < best.pod.uptime_secs { p } else { best })
        else {
            return Ok(());
        };

        let note = format!(
            "Stopped container with pid-{} due to GPU quota exceeded ({} GPUs in use, quota {}).",
            victim.pod.pid,
            distinct_gpus.len(),
            gpu_quota
        );
        self.leave_note(&victim.pod.container_name, &note).await;

        self.runtime
            .action(&victim.pod.container_name, ContainerAction::Stop, None, None)
            .await?;
        info!(
            tenant,
            container = %victim.pod.container_name,
            pid = victim.pod.pid,
            gpus_in_use = distinct_gpus.len(),
            gpu_quota,
            "stopped container over GPU quota"
        );
        Ok(())
    }

    /// Best-effort audit note inside the victim container. Failure is
    /// logged and never blocks enforcement.
    async fn leave_note(&self, container_name: &str, note: &str) {
        let note = note.replace('\'', "");
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let command =
            format!("mkdir -p {NOTE_DIR} && echo '{note}' > {NOTE_DIR}/{stamp}.critical.log");
        match self.runtime.exec(container_name, &command, NOTE_TIMEOUT).await {
            Ok((EXEC_TIMEOUT_EXIT, output)) if output == "timeout" => {
                warn!(container_name, "audit note timed out");
            }
            Ok((0, _)) => {}
            Ok((code, output)) => {
                warn!(container_name, code, %output, "audit note failed");
            }
            Err(e) => {
                warn!(container_name, "audit note failed: {e}");
            }
        }
    }
}

fn group_by_tenant(processes: Vec<AttributedProcess>) -> BTreeMap<String, Vec<AttributedProcess>> {
    let mut by_tenant: BTreeMap<String, Vec<AttributedProcess>> = BTreeMap::new();
    for process in processes {
        by_tenant
            .entry(process.pod.tenant.clone())
            .or_default()
            .push(process);
    }
    by_tenant
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use api_types::ContainerInfo;
    use api_types::ContainerSpec;
    use api_types::GpuProcess;
    use api_types::Quota;
    use api_types::QuotaUpdate;
    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::error::WardenError;
    use crate::quota::open_state_db;

    struct FakeTelemetry {
        by_gpu: HashMap<u32, Vec<GpuProcess>>,
    }

    impl GpuTelemetry for FakeTelemetry {
        fn device_count(&self) -> Result<u32> {
            Ok(self.by_gpu.len() as u32)
        }
        fn list_compute_processes(&self, gpu_id: u32) -> Result<Vec<GpuProcess>> {
            Ok(self.by_gpu.get(&gpu_id).cloned().unwrap_or_default())
        }
    }

    struct StubAttributor {
        by_pid: HashMap<u32, PodProcess>,
    }

    #[async_trait]
    impl Attributor for StubAttributor {
        async fn attribute_and_resolve(&self, pid: u32) -> Result<Option<PodProcess>> {
            Ok(self.by_pid.get(&pid).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingRuntime {
        actions: Mutex<Vec<(String, ContainerAction)>>,
        execs: Mutex<Vec<String>>,
        fail_exec: bool,
        fail_action_for: Option<String>,
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn create(&self, _spec: &ContainerSpec) -> Result<String> {
            unimplemented!()
        }
        async fn action(
            &self,
            name: &str,
            action: ContainerAction,
            _pre: Option<&str>,
            _post: Option<&str>,
        ) -> Result<String> {
            if self.fail_action_for.as_deref() == Some(name) {
                return Err(WardenError::Runtime("daemon unreachable".to_string()));
            }
            self.actions
                .lock()
                .unwrap()
                .push((name.to_string(), action));
            Ok(String::new())
        }
        async fn inspect(&self, name_or_id: &str) -> Result<ContainerInfo> {
            Err(WardenError::NotFound(name_or_id.to_string()))
        }
        async fn list(&self, _name_filter: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn exec(
            &self,
            name: &str,
            _command: &str,
            _timeout: Duration,
        ) -> Result<(i32, String)> {
            if self.fail_exec {
                return Err(WardenError::Transient("exec timeout".to_string()));
            }
            self.execs.lock().unwrap().push(name.to_string());
            Ok((0, String::new()))
        }
        async fn used_ports(&self) -> Result<Vec<u16>> {
            Ok(vec![])
        }
    }

    fn pod(pid: u32, tenant: &str, tag: &str, uptime_secs: f64) -> PodProcess {
        PodProcess {
            pid,
            container_id: format!("id-{pid}"),
            container_name: format!("{tenant}-{tag}"),
            tenant: tenant.to_string(),
            uptime_secs,
        }
    }

    fn gpu_proc(pid: u32) -> GpuProcess {
        GpuProcess {
            pid,
            gpu_memory_used: 1 << 30,
        }
    }

    struct Fixture {
        daemon: EnforcementDaemon,
        runtime: Arc<RecordingRuntime>,
        _dir: TempDir,
    }

    fn fixture(
        by_gpu: HashMap<u32, Vec<GpuProcess>>,
        by_pid: HashMap<u32, PodProcess>,
        runtime: RecordingRuntime,
        known_tenants: &[(&str, i64)],
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (users, quotas) =
            open_state_db(&dir.path().join("state.db"), Quota::default()).unwrap();
        for (tenant, gpu_count) in known_tenants {
            users.add_user(tenant, "secret", false).unwrap();
            quotas
                .set(
                    tenant,
                    &QuotaUpdate {
                        gpu_count: Some(*gpu_count),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let gpu_ids: Vec<u32> = by_gpu.keys().copied().collect();
        let runtime = Arc::new(runtime);
        let daemon = EnforcementDaemon::new(
            Arc::new(FakeTelemetry { by_gpu }),
            runtime.clone(),
            Arc::new(StubAttributor { by_pid }),
            users,
            quotas,
            gpu_ids,
            Duration::from_secs(60),
        );
        Fixture {
            daemon,
            runtime,
            _dir: dir,
        }
    }

    #[test_log::test(tokio::test)]
    async fn stops_youngest_pod_when_over_quota() {
        // alice has gpu_count = 1 but runs pods on two distinct GPUs
        let by_gpu = HashMap::from([(0, vec![gpu_proc(10)]), (1, vec![gpu_proc(20)])]);
        let by_pid = HashMap::from([
            (10, pod(10, "alice", "young", 10.0)),
            (20, pod(20, "alice", "old", 300.0)),
        ]);
        let fixture = fixture(by_gpu, by_pid, RecordingRuntime::default(), &[("alice", 1)]);

        fixture.daemon.run_cycle().await.unwrap();

        let actions = fixture.runtime.actions.lock().unwrap().clone();
        assert_eq!(
            actions,
            vec![("alice-young".to_string(), ContainerAction::Stop)]
        );
        // the audit note landed in the victim before the stop
        assert_eq!(
            fixture.runtime.execs.lock().unwrap().clone(),
            vec!["alice-young".to_string()]
        );
    }

    #[test_log::test(tokio::test)]
    async fn within_quota_usage_is_untouched() {
        // two processes, one distinct GPU
        let by_gpu = HashMap::from([(0, vec![gpu_proc(10), gpu_proc(11)])]);
        let by_pid = HashMap::from([
            (10, pod(10, "alice", "a", 10.0)),
            (11, pod(11, "alice", "b", 20.0)),
        ]);
        let fixture = fixture(by_gpu, by_pid, RecordingRuntime::default(), &[("alice", 1)]);

        fixture.daemon.run_cycle().await.unwrap();
        assert!(fixture.runtime.actions.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn unknown_tenants_are_skipped() {
        let by_gpu = HashMap::from([(0, vec![gpu_proc(10)]), (1, vec![gpu_proc(20)])]);
        let by_pid = HashMap::from([
            (10, pod(10, "ghost", "a", 10.0)),
            (20, pod(20, "ghost", "b", 20.0)),
        ]);
        let fixture = fixture(by_gpu, by_pid, RecordingRuntime::default(), &[]);

        fixture.daemon.run_cycle().await.unwrap();
        assert!(fixture.runtime.actions.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn unlimited_quota_is_never_enforced() {
        let by_gpu = HashMap::from([(0, vec![gpu_proc(10)]), (1, vec![gpu_proc(20)])]);
        let by_pid = HashMap::from([
            (10, pod(10, "alice", "a", 10.0)),
            (20, pod(20, "alice", "b", 20.0)),
        ]);
        // stored and default quota both unset: unlimited after fallback
        let fixture = fixture(by_gpu, by_pid, RecordingRuntime::default(), &[("alice", -1)]);

        fixture.daemon.run_cycle().await.unwrap();
        assert!(fixture.runtime.actions.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn audit_note_failure_does_not_block_enforcement() {
        let by_gpu = HashMap::from([(0, vec![gpu_proc(10)]), (1, vec![gpu_proc(20)])]);
        let by_pid = HashMap::from([
            (10, pod(10, "alice", "young", 10.0)),
            (20, pod(20, "alice", "old", 300.0)),
        ]);
        let runtime = RecordingRuntime {
            fail_exec: true,
            ..Default::default()
        };
        let fixture = fixture(by_gpu, by_pid, runtime, &[("alice", 1)]);

        fixture.daemon.run_cycle().await.unwrap();
        let actions = fixture.runtime.actions.lock().unwrap().clone();
        assert_eq!(
            actions,
            vec![("alice-young".to_string(), ContainerAction::Stop)]
        );
    }

    #[test_log::test(tokio::test)]
    async fn one_tenant_failure_does_not_starve_others() {
        // both tenants over quota; stopping alice's pod fails
        let by_gpu = HashMap::from([
            (0, vec![gpu_proc(10), gpu_proc(30)]),
            (1, vec![gpu_proc(20), gpu_proc(40)]),
        ]);
        let by_pid = HashMap::from([
            (10, pod(10, "alice", "a", 10.0)),
            (20, pod(20, "alice", "b", 20.0)),
            (30, pod(30, "bob", "a", 10.0)),
            (40, pod(40, "bob", "b", 20.0)),
        ]);
        let runtime = RecordingRuntime {
            fail_action_for: Some("alice-a".to_string()),
            ..Default::default()
        };
        let fixture = fixture(by_gpu, by_pid, runtime, &[("alice", 1), ("bob", 1)]);

        fixture.daemon.run_cycle().await.unwrap();
        let actions = fixture.runtime.actions.lock().unwrap().clone();
        assert_eq!(actions, vec![("bob-a".to_string(), ContainerAction::Stop)]);
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_stops_the_loop() {
        let fixture = fixture(
            HashMap::new(),
            HashMap::new(),
            RecordingRuntime::default(),
            &[],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        // returns immediately instead of sleeping out the interval
        tokio::time::timeout(Duration::from_secs(1), fixture.daemon.run(cancel))
            .await
            .expect("daemon should exit on cancellation");
    }
}
