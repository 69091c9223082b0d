use crate::worker_storage::WorkerStorage;
use log::{debug, error, info, warn};
use memfs_lib::{
    CommandType, MemFsError, MemFsResult, HEARTBEAT_TIMEOUT_MS, TO_MASTER_HEARTBEAT_INTERVAL_MS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    pub interval: Duration,
    /// Pause after a failed heartbeat before retrying.
    pub retry_backoff: Duration,
    /// The loop gives up after this long without a successful heartbeat.
    pub give_up_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(TO_MASTER_HEARTBEAT_INTERVAL_MS),
            retry_backoff: Duration::from_secs(1),
            give_up_after: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Drives the master↔worker membership protocol: registers, then
/// heartbeats on a timer and executes whatever command comes back. Returns
/// when `shutdown` fires; returns an error when the master has been
/// unreachable past the configured timeout or violates the protocol, at
/// which point the daemon is expected to exit and restart.
pub async fn run_heartbeat_loop(
    storage: Arc<WorkerStorage>,
    config: HeartbeatConfig,
    shutdown: Arc<Notify>,
) -> MemFsResult<()> {
    storage.register().await?;
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("heartbeat loop shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(config.interval) => {}
        }

        let command = match storage.heartbeat().await {
            Ok(command) => command,
            Err(e) => {
                warn!("heartbeat failed: {}", e);
                storage.reset_master_client();
                if last_ok.elapsed() >= config.give_up_after {
                    error!(
                        "no successful heartbeat for {:?}, giving up",
                        last_ok.elapsed()
                    );
                    return Err(MemFsError::RemoteError(
                        "master unreachable past heartbeat timeout".to_string(),
                    ));
                }
                tokio::select! {
                    _ = shutdown.notified() => return Ok(()),
                    _ = tokio::time::sleep(config.retry_backoff) => {}
                }
                continue;
            }
        };
        last_ok = Instant::now();

        match command.command_type {
            CommandType::Nothing => debug!("heartbeat: nothing to do"),
            CommandType::Register => {
                info!("master requested re-registration");
                storage.register().await?;
            }
            CommandType::Free => {
                info!("master requested free of {} file(s)", command.data.len());
                storage.free_files(&command.data).await?;
            }
            CommandType::Delete => {
                info!("master requested delete of {} file(s)", command.data.len());
                storage.delete_files(&command.data).await?;
            }
            CommandType::Unknown => {
                error!("protocol violation: unknown command from master");
                return Err(MemFsError::Internal(
                    "unknown command from master".to_string(),
                ));
            }
        }

        if let Err(e) = storage.check_status().await {
            warn!("status sweep failed: {}", e);
        }
    }
}
