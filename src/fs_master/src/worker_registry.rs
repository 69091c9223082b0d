use log::{info, warn};
use memfs_lib::{Command, ClientWorkerInfo, FileId, NetAddress, WorkerId};
use std::collections::{HashMap, HashSet, VecDeque};

pub const WORKER_STATE_ACTIVE: &str = "ACTIVE";
pub const WORKER_STATE_LOST: &str = "LOST";

pub struct WorkerRecord {
    pub id: WorkerId,
    pub address: NetAddress,
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub last_contact_ms: i64,
    pub start_time_ms: i64,
    pub resident: HashSet<FileId>,
    commands: VecDeque<Command>,
}

impl WorkerRecord {
    fn info(&self, now: i64, state: &str) -> ClientWorkerInfo {
        ClientWorkerInfo {
            id: self.id,
            address: self.address.clone(),
            last_contact_sec: (now - self.last_contact_ms).max(0) / 1000,
            state: state.to_string(),
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes,
            start_time_ms: self.start_time_ms,
        }
    }
}

/// The set of live workers. Ids are dense from 1 and never reused; a worker
/// that re-registers from the same address gets a fresh id and the old
/// record is dropped.
pub struct WorkerRegistry {
    next_worker_id: WorkerId,
    workers: HashMap<WorkerId, WorkerRecord>,
    lost: Vec<ClientWorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            next_worker_id: 1,
            workers: HashMap::new(),
            lost: Vec::new(),
        }
    }

    /// Registers a worker. Returns the new worker id together with the id
    /// of any replaced record at the same address (whose placement
    /// contributions the caller must scrub).
    pub fn register(
        &mut self,
        address: NetAddress,
        total_bytes: i64,
        used_bytes: i64,
        current_files: &[FileId],
        now: i64,
    ) -> (WorkerId, Option<WorkerId>) {
        let replaced = self
            .workers
            .values()
            .find(|w| w.address == address)
            .map(|w| w.id);
        if let Some(old_id) = replaced {
            info!(
                "worker at {} re-registered, dropping stale record {}",
                address, old_id
            );
            self.workers.remove(&old_id);
        }

        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                address,
                capacity_bytes: total_bytes,
                used_bytes,
                last_contact_ms: now,
                start_time_ms: now,
                resident: current_files.iter().copied().collect(),
                commands: VecDeque::new(),
            },
        );
        (id, replaced)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    /// Applies a heartbeat and pops the next queued command (FIFO, one per
    /// heartbeat). `None` means the worker id is unknown.
    pub fn heartbeat(
        &mut self,
        id: WorkerId,
        used_bytes: i64,
        removed_files: &[FileId],
        now: i64,
    ) -> Option<Command> {
        let worker = self.workers.get_mut(&id)?;
        worker.last_contact_ms = now;
        worker.used_bytes = used_bytes;
        for fid in removed_files {
            worker.resident.remove(fid);
        }
        Some(worker.commands.pop_front().unwrap_or_else(Command::nothing))
    }

    pub fn enqueue_command(&mut self, id: WorkerId, command: Command) {
        match self.workers.get_mut(&id) {
            Some(worker) => worker.commands.push_back(command),
            None => warn!("dropping command for unknown worker {}", id),
        }
    }

    /// Records that `id` now holds `file_id`, refreshing contact and usage.
    pub fn add_resident(
        &mut self,
        id: WorkerId,
        file_id: FileId,
        used_bytes: i64,
        now: i64,
    ) -> bool {
        match self.workers.get_mut(&id) {
            Some(worker) => {
                worker.resident.insert(file_id);
                worker.used_bytes = used_bytes;
                worker.last_contact_ms = now;
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: WorkerId, now: i64) {
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.last_contact_ms = now;
        }
    }

    /// Drops workers silent for longer than `timeout_ms` and returns their
    /// ids with the resident sets they contributed.
    pub fn sweep_lost(&mut self, timeout_ms: i64, now: i64) -> Vec<(WorkerId, HashSet<FileId>)> {
        let stale: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| now - w.last_contact_ms > timeout_ms)
            .map(|w| w.id)
            .collect();
        let mut dropped = Vec::new();
        for id in stale {
            if let Some(mut worker) = self.workers.remove(&id) {
                warn!(
                    "worker {} at {} lost (last contact {} ms ago)",
                    id,
                    worker.address,
                    now - worker.last_contact_ms
                );
                worker.used_bytes = 0;
                self.lost.push(worker.info(now, WORKER_STATE_LOST));
                dropped.push((id, worker.resident));
            }
        }
        dropped
    }

    pub fn live_workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn infos(&self, now: i64) -> Vec<ClientWorkerInfo> {
        let mut out: Vec<ClientWorkerInfo> = self
            .workers
            .values()
            .map(|w| w.info(now, WORKER_STATE_ACTIVE))
            .collect();
        out.extend(self.lost.iter().cloned());
        out.sort_by_key(|info| info.id);
        out
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
