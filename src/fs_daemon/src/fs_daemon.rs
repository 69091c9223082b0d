use fs_master::{MasterConfig, MasterService};
use fs_worker::{run_heartbeat_loop, HeartbeatConfig, WorkerStorage, WorkerStorageConfig};
use log::{info, warn};
use memfs_lib::{
    MemFsError, MemFsResult, NetAddress, TO_MASTER_HEARTBEAT_INTERVAL_MS, USER_TIMEOUT_MS,
    WORKER_TIMEOUT_MS,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Notify;

pub const DEFAULT_DAEMON_CONFIG_PATH: &str = "/opt/memfs/etc/fs_daemon.json";

#[derive(Debug, Clone)]
pub struct DaemonRunOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub master: MasterSection,
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterSection {
    #[serde(alias = "ufs_address")]
    pub underfs_address: String,
    pub pinlist: Vec<String>,
    pub whitelist: Vec<String>,
    pub worker_timeout_ms: i64,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            underfs_address: String::new(),
            pinlist: Vec::new(),
            whitelist: vec!["/".to_string()],
            worker_timeout_ms: WORKER_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub host: String,
    pub port: u16,
    #[serde(alias = "ramdisk_dir")]
    pub data_dir: PathBuf,
    #[serde(alias = "ufs_dir")]
    pub underfs_dir: PathBuf,
    #[serde(alias = "memory_size")]
    pub capacity_bytes: i64,
    pub user_timeout_ms: i64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 29998,
            data_dir: PathBuf::from("/dev/shm/memfs/data"),
            underfs_dir: PathBuf::from("/opt/memfs/var/underfs"),
            capacity_bytes: 1 << 30,
            user_timeout_ms: USER_TIMEOUT_MS,
            heartbeat_interval_ms: TO_MASTER_HEARTBEAT_INTERVAL_MS,
        }
    }
}

pub fn load_config(path: &Path) -> MemFsResult<DaemonConfig> {
    if !path.exists() {
        info!("config {} not found, running with defaults", path.display());
        return Ok(DaemonConfig::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| MemFsError::Internal(format!("bad config {}: {}", path.display(), e)))
}

impl DaemonConfig {
    fn master_config(&self) -> MasterConfig {
        MasterConfig {
            underfs_address: self.master.underfs_address.clone(),
            pinlist: self.master.pinlist.clone(),
            whitelist: self.master.whitelist.clone(),
            worker_timeout_ms: self.master.worker_timeout_ms,
        }
    }

    fn worker_config(&self) -> WorkerStorageConfig {
        let mut config = WorkerStorageConfig::new(
            NetAddress::new(self.worker.host.clone(), self.worker.port),
            self.worker.data_dir.clone(),
            self.worker.underfs_dir.clone(),
            self.worker.capacity_bytes,
        );
        config.user_timeout_ms = self.worker.user_timeout_ms;
        config
    }
}

/// Runs master and worker in one process, wired in-process behind the
/// service traits, until a termination signal arrives.
pub fn run_daemon(options: DaemonRunOptions) -> MemFsResult<()> {
    let config = load_config(&options.config_path)?;
    let runtime = Runtime::new()?;
    runtime.block_on(run_node(config))
}

async fn run_node(config: DaemonConfig) -> MemFsResult<()> {
    let master = Arc::new(MasterService::new(config.master_config()));
    let sweep_interval =
        Duration::from_millis((config.master.worker_timeout_ms.max(10) as u64) / 10);
    let sweeper = MasterService::spawn_lost_worker_sweeper(master.clone(), sweep_interval);
    info!(
        "master up (started at {} ms, worker timeout {} ms)",
        master.start_time_ms(),
        config.master.worker_timeout_ms
    );

    let storage = Arc::new(WorkerStorage::new(config.worker_config(), master.clone())?);
    let shutdown = Arc::new(Notify::new());
    let heartbeat = tokio::spawn(run_heartbeat_loop(
        storage.clone(),
        HeartbeatConfig {
            interval: Duration::from_millis(config.worker.heartbeat_interval_ms),
            ..Default::default()
        },
        shutdown.clone(),
    ));
    info!(
        "worker up at {}:{} ({} bytes of cache)",
        config.worker.host, config.worker.port, config.worker.capacity_bytes
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MemFsError::Internal(format!("signal handler failed: {}", e)))?;
    info!("termination signal received, shutting down");

    shutdown.notify_one();
    match heartbeat.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("heartbeat loop ended with error: {}", e),
        Err(e) => warn!("heartbeat task panicked: {}", e),
    }
    sweeper.abort();
    Ok(())
}
