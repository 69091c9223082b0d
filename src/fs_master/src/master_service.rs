use crate::inode_store::{Inode, InodeStore};
use crate::placement::PlacementIndex;
use crate::worker_registry::WorkerRegistry;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use memfs_lib::{
    encode_registration, now_ms, CachePath, ClientFileInfo, ClientRawTableInfo, ClientWorkerInfo,
    Command, FileId, MasterHandler, MemFsError, MemFsResult, NetAddress, UserId, WorkerId,
    WORKER_TIMEOUT_MS,
};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address of the under file system, handed to clients verbatim.
    pub underfs_address: String,
    /// Path prefixes whose files must stay resident on workers.
    pub pinlist: Vec<String>,
    /// Path prefixes whose files the cache layer may hold at all.
    pub whitelist: Vec<String>,
    /// A worker silent for longer than this is dropped.
    pub worker_timeout_ms: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            underfs_address: String::new(),
            pinlist: Vec::new(),
            whitelist: vec!["/".to_string()],
            worker_timeout_ms: WORKER_TIMEOUT_MS,
        }
    }
}

struct MasterState {
    inodes: InodeStore,
    workers: WorkerRegistry,
    placement: PlacementIndex,
    pinned: HashSet<FileId>,
    next_user_id: UserId,
}

/// The master: namespace, file ids and placement under one mutator lock.
/// Reads and writes both go through the same critical section; nothing
/// that blocks on I/O ever runs under it.
pub struct MasterService {
    start_time_ms: i64,
    pinlist: Vec<CachePath>,
    whitelist: Vec<CachePath>,
    underfs_address: String,
    worker_timeout_ms: i64,
    state: Mutex<MasterState>,
}

fn parse_prefixes(raw: &[String], what: &str) -> Vec<CachePath> {
    let mut out = Vec::new();
    for prefix in raw {
        match CachePath::new(prefix) {
            Ok(path) => out.push(path),
            Err(e) => warn!("ignoring bad {} entry {:?}: {}", what, prefix, e),
        }
    }
    out
}

fn under_any(prefixes: &[CachePath], path: &CachePath) -> bool {
    prefixes
        .iter()
        .any(|prefix| prefix == path || prefix.is_ancestor_of(path))
}

impl MasterService {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            start_time_ms: now_ms(),
            pinlist: parse_prefixes(&config.pinlist, "pinlist"),
            whitelist: parse_prefixes(&config.whitelist, "whitelist"),
            underfs_address: config.underfs_address,
            worker_timeout_ms: config.worker_timeout_ms,
            state: Mutex::new(MasterState {
                inodes: InodeStore::new(),
                workers: WorkerRegistry::new(),
                placement: PlacementIndex::new(),
                pinned: HashSet::new(),
                next_user_id: 0,
            }),
        }
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    fn state(&self) -> MemFsResult<MutexGuard<'_, MasterState>> {
        self.state
            .lock()
            .map_err(|_| MemFsError::Internal("master state lock poisoned".to_string()))
    }

    fn file_info(state: &MasterState, inode: &Inode) -> ClientFileInfo {
        ClientFileInfo {
            id: inode.id,
            name: inode.name.clone(),
            path: inode.path.to_string(),
            checkpoint_path: inode.checkpoint_path.clone(),
            size_bytes: inode.size_bytes,
            creation_time_ms: inode.creation_time_ms,
            ready: inode.ready,
            folder: inode.is_folder,
            in_memory: !inode.is_folder && state.placement.is_in_memory(inode.id),
            need_pin: inode.pinned,
            need_cache: inode.cacheable,
        }
    }

    fn locations(state: &MasterState, file_id: FileId) -> Vec<NetAddress> {
        state
            .placement
            .holders(file_id)
            .filter_map(|worker_id| state.workers.get(worker_id))
            .map(|worker| worker.address.clone())
            .collect()
    }

    fn delete_inner(
        state: &mut MasterState,
        path: &CachePath,
        recursive: bool,
    ) -> MemFsResult<bool> {
        if !state.inodes.exists(path) {
            return Ok(true);
        }
        let removed = state.inodes.delete(path, recursive)?;
        let mut per_worker: HashMap<WorkerId, Vec<FileId>> = HashMap::new();
        for file_id in &removed {
            state.pinned.remove(file_id);
            for worker_id in state.placement.remove_file(*file_id) {
                per_worker.entry(worker_id).or_default().push(*file_id);
            }
        }
        for (worker_id, file_ids) in per_worker {
            state.workers.enqueue_command(worker_id, Command::free(file_ids));
        }
        info!("deleted {} ({} inodes)", path, removed.len());
        Ok(true)
    }

    /// Drops workers that have been silent past the timeout, together with
    /// their placement contributions.
    pub fn sweep_lost_workers(&self) -> MemFsResult<usize> {
        let mut state = self.state()?;
        let dropped = state.workers.sweep_lost(self.worker_timeout_ms, now_ms());
        for (worker_id, _) in &dropped {
            state.placement.remove_worker(*worker_id);
        }
        Ok(dropped.len())
    }

    /// Periodic lost-worker sweep as a background task.
    pub fn spawn_lost_worker_sweeper(
        service: Arc<MasterService>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match service.sweep_lost_workers() {
                    Ok(0) => {}
                    Ok(n) => info!("dropped {} lost worker(s)", n),
                    Err(e) => error!("lost-worker sweep failed: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl MasterHandler for MasterService {
    async fn worker_register(
        &self,
        addr: NetAddress,
        total_bytes: i64,
        used_bytes: i64,
        current_files: Vec<FileId>,
    ) -> MemFsResult<i64> {
        let now = now_ms();
        let mut state = self.state()?;
        let st = &mut *state;
        let (worker_id, replaced) =
            st.workers
                .register(addr.clone(), total_bytes, used_bytes, &current_files, now);
        if let Some(old_id) = replaced {
            st.placement.remove_worker(old_id);
        }

        // The declared list becomes this worker's exact placement
        // contribution; ids the namespace no longer knows go straight back
        // as a Free command.
        let mut stale = Vec::new();
        for file_id in current_files {
            match st.inodes.inode(file_id) {
                Some(inode) if !inode.is_folder => st.placement.add(file_id, worker_id),
                _ => stale.push(file_id),
            }
        }
        if !stale.is_empty() {
            warn!(
                "worker {} declared {} unknown file(s), scheduling free",
                worker_id,
                stale.len()
            );
            st.workers.enqueue_command(worker_id, Command::free(stale));
        }

        info!("registered worker {} at {}", worker_id, addr);
        Ok(encode_registration(self.start_time_ms, worker_id))
    }

    async fn worker_heartbeat(
        &self,
        worker_id: WorkerId,
        used_bytes: i64,
        removed_files: Vec<FileId>,
    ) -> MemFsResult<Command> {
        let mut state = self.state()?;
        if !state.workers.contains(worker_id) {
            debug!("heartbeat from unknown worker {}", worker_id);
            return Ok(Command::register());
        }
        for file_id in &removed_files {
            state.placement.remove(*file_id, worker_id);
        }
        let command = state
            .workers
            .heartbeat(worker_id, used_bytes, &removed_files, now_ms())
            .unwrap_or_else(Command::register);
        Ok(command)
    }

    async fn worker_cache_file(
        &self,
        worker_id: WorkerId,
        worker_used_bytes: i64,
        file_id: FileId,
        file_size_bytes: i64,
    ) -> MemFsResult<()> {
        let now = now_ms();
        let mut state = self.state()?;
        if !state.workers.contains(worker_id) {
            return Err(MemFsError::RemoteError(format!(
                "cache report from unknown worker {}",
                worker_id
            )));
        }
        state.inodes.commit_size(file_id, file_size_bytes)?;
        state
            .workers
            .add_resident(worker_id, file_id, worker_used_bytes, now);
        state.placement.add(file_id, worker_id);
        debug!(
            "worker {} cached file {} ({} bytes)",
            worker_id, file_id, file_size_bytes
        );
        Ok(())
    }

    async fn worker_get_pin_id_list(&self) -> MemFsResult<HashSet<FileId>> {
        Ok(self.state()?.pinned.clone())
    }

    async fn add_checkpoint(
        &self,
        worker_id: WorkerId,
        file_id: FileId,
        file_size_bytes: i64,
        checkpoint_path: String,
    ) -> MemFsResult<bool> {
        let mut state = self.state()?;
        state
            .inodes
            .add_checkpoint(file_id, file_size_bytes, &checkpoint_path)?;
        if worker_id > 0 {
            state.workers.touch(worker_id, now_ms());
        }
        info!("file {} checkpointed at {}", file_id, checkpoint_path);
        Ok(true)
    }

    async fn user_create_file(&self, path: String) -> MemFsResult<FileId> {
        let path = CachePath::new(&path)?;
        let pinned = under_any(&self.pinlist, &path);
        let cacheable = under_any(&self.whitelist, &path);
        let mut state = self.state()?;
        let file_id = state.inodes.create(&path, false, pinned, cacheable)?;
        if pinned {
            state.pinned.insert(file_id);
        }
        debug!("created file {} at {}", file_id, path);
        Ok(file_id)
    }

    async fn user_get_file_id(&self, path: String) -> MemFsResult<FileId> {
        let path = CachePath::new(&path)?;
        Ok(self.state()?.inodes.file_id(&path))
    }

    async fn user_mkdir(&self, path: String) -> MemFsResult<bool> {
        let path = CachePath::new(&path)?;
        let mut state = self.state()?;
        state.inodes.create(&path, true, false, false)?;
        Ok(true)
    }

    async fn user_rename_file(&self, src_path: String, dst_path: String) -> MemFsResult<()> {
        let src = CachePath::new(&src_path)?;
        let dst = CachePath::new(&dst_path)?;
        let mut state = self.state()?;
        state.inodes.rename(&src, &dst)?;
        info!("renamed {} -> {}", src, dst);
        Ok(())
    }

    async fn user_delete_by_id(&self, file_id: FileId, recursive: bool) -> MemFsResult<bool> {
        let mut state = self.state()?;
        let path = match state.inodes.inode(file_id) {
            Some(inode) => inode.path.clone(),
            None => return Ok(true),
        };
        Self::delete_inner(&mut state, &path, recursive)
    }

    async fn user_delete_by_path(&self, path: String, recursive: bool) -> MemFsResult<bool> {
        let path = CachePath::new(&path)?;
        let mut state = self.state()?;
        Self::delete_inner(&mut state, &path, recursive)
    }

    async fn user_get_client_file_info_by_id(
        &self,
        file_id: FileId,
    ) -> MemFsResult<ClientFileInfo> {
        let state = self.state()?;
        let inode = state
            .inodes
            .inode(file_id)
            .ok_or_else(|| MemFsError::FileDoesNotExist(format!("file {}", file_id)))?;
        Ok(Self::file_info(&state, inode))
    }

    async fn user_get_client_file_info_by_path(
        &self,
        path: String,
    ) -> MemFsResult<ClientFileInfo> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        Ok(Self::file_info(&state, inode))
    }

    async fn liststatus(&self, path: String) -> MemFsResult<Vec<ClientFileInfo>> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        if inode.is_folder {
            Ok(state
                .inodes
                .children(&path)?
                .into_iter()
                .map(|child| Self::file_info(&state, child))
                .collect())
        } else {
            Ok(vec![Self::file_info(&state, inode)])
        }
    }

    async fn user_list_files(&self, path: String, recursive: bool) -> MemFsResult<Vec<FileId>> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        if !inode.is_folder {
            return Ok(vec![inode.id]);
        }
        if recursive {
            let mut ids: Vec<FileId> = state
                .inodes
                .subtree(&path)?
                .into_iter()
                .skip(1)
                .map(|node| node.id)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        } else {
            Ok(state
                .inodes
                .children(&path)?
                .into_iter()
                .map(|node| node.id)
                .collect())
        }
    }

    async fn user_ls(&self, path: String, recursive: bool) -> MemFsResult<Vec<String>> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        if !inode.is_folder {
            return Ok(vec![inode.path.to_string()]);
        }
        if recursive {
            Ok(state
                .inodes
                .subtree(&path)?
                .into_iter()
                .skip(1)
                .map(|node| node.path.to_string())
                .collect())
        } else {
            Ok(state
                .inodes
                .children(&path)?
                .into_iter()
                .map(|node| node.path.to_string())
                .collect())
        }
    }

    async fn user_get_number_of_files(&self, path: String) -> MemFsResult<i32> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        if inode.is_folder {
            Ok(state.inodes.children(&path)?.len() as i32)
        } else {
            Ok(1)
        }
    }

    async fn user_get_worker(&self, random: bool, host: String) -> MemFsResult<NetAddress> {
        let state = self.state()?;
        let live: Vec<&NetAddress> = state
            .workers
            .live_workers()
            .map(|worker| &worker.address)
            .collect();
        if live.is_empty() {
            return Err(MemFsError::NoLocalWorker("no live workers".to_string()));
        }
        if random || host.is_empty() {
            let chosen = live
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| MemFsError::NoLocalWorker("no live workers".to_string()))?;
            return Ok((*chosen).clone());
        }
        live.iter()
            .find(|addr| addr.host == host)
            .map(|addr| (*addr).clone())
            .ok_or_else(|| MemFsError::NoLocalWorker(format!("no worker on host {}", host)))
    }

    async fn user_get_file_locations_by_id(
        &self,
        file_id: FileId,
    ) -> MemFsResult<Vec<NetAddress>> {
        let state = self.state()?;
        if state.inodes.inode(file_id).is_none() {
            return Err(MemFsError::FileDoesNotExist(format!("file {}", file_id)));
        }
        Ok(Self::locations(&state, file_id))
    }

    async fn user_get_file_locations_by_path(
        &self,
        path: String,
    ) -> MemFsResult<Vec<NetAddress>> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let inode = state
            .inodes
            .inode_by_path(&path)
            .ok_or_else(|| MemFsError::FileDoesNotExist(path.to_string()))?;
        Ok(Self::locations(&state, inode.id))
    }

    async fn get_workers_info(&self) -> MemFsResult<Vec<ClientWorkerInfo>> {
        Ok(self.state()?.workers.infos(now_ms()))
    }

    async fn user_get_user_id(&self) -> MemFsResult<UserId> {
        let mut state = self.state()?;
        state.next_user_id += 1;
        Ok(state.next_user_id)
    }

    async fn user_unpin_file(&self, file_id: FileId) -> MemFsResult<()> {
        let mut state = self.state()?;
        state.inodes.set_pinned(file_id, false)?;
        state.pinned.remove(&file_id);
        info!("unpinned file {}", file_id);
        Ok(())
    }

    async fn user_out_of_memory_for_pin_file(&self, file_id: FileId) -> MemFsResult<()> {
        error!("out of memory while admitting pinned file {}", file_id);
        Ok(())
    }

    async fn user_create_raw_table(
        &self,
        path: String,
        columns: i32,
        metadata: Vec<u8>,
    ) -> MemFsResult<FileId> {
        let path = CachePath::new(&path)?;
        let mut state = self.state()?;
        let table_id = state.inodes.create_raw_table(&path, columns, metadata)?;
        info!("created raw table {} at {} ({} columns)", table_id, path, columns);
        Ok(table_id)
    }

    async fn user_get_raw_table_id(&self, path: String) -> MemFsResult<FileId> {
        let path = CachePath::new(&path)?;
        Ok(self.state()?.inodes.raw_table_id(&path))
    }

    async fn user_get_client_raw_table_info_by_id(
        &self,
        table_id: FileId,
    ) -> MemFsResult<ClientRawTableInfo> {
        let state = self.state()?;
        let (inode, record) = state.inodes.raw_table(table_id)?;
        Ok(ClientRawTableInfo {
            id: inode.id,
            name: inode.name.clone(),
            path: inode.path.to_string(),
            columns: record.columns,
            metadata: record.metadata.clone(),
        })
    }

    async fn user_get_client_raw_table_info_by_path(
        &self,
        path: String,
    ) -> MemFsResult<ClientRawTableInfo> {
        let path = CachePath::new(&path)?;
        let state = self.state()?;
        let table_id = state.inodes.raw_table_id(&path);
        if table_id == memfs_lib::INVALID_RAW_TABLE_ID {
            return Err(MemFsError::TableDoesNotExist(path.to_string()));
        }
        let (inode, record) = state.inodes.raw_table(table_id)?;
        Ok(ClientRawTableInfo {
            id: inode.id,
            name: inode.name.clone(),
            path: inode.path.to_string(),
            columns: record.columns,
            metadata: record.metadata.clone(),
        })
    }

    async fn user_update_raw_table_metadata(
        &self,
        table_id: FileId,
        metadata: Vec<u8>,
    ) -> MemFsResult<()> {
        let mut state = self.state()?;
        state.inodes.update_raw_table_metadata(table_id, metadata)
    }

    async fn user_get_underfs_address(&self) -> MemFsResult<String> {
        Ok(self.underfs_address.clone())
    }
}
