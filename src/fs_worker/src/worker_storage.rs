use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, info, warn};
use memfs_lib::{
    now_ms, registered_worker_id, Command, FileId, MasterHandler, MemFsError, MemFsResult,
    NetAddress, UserId, WorkerHandler, WorkerId, USER_TIMEOUT_MS,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

const USERS_DIR_NAME: &str = "users";
const UNDERFS_DATA_DIR_NAME: &str = "data";
const UNDERFS_TMP_DIR_NAME: &str = "tmp";
const DIR_LOCK_FILE: &str = ".lock";

#[derive(Debug)]
struct ResidentFile {
    size_bytes: i64,
    last_access_ms: i64,
    lock_count: u32,
    pinned: bool,
}

#[derive(Debug, Default)]
struct UserRecord {
    last_heartbeat_ms: i64,
    reserved_bytes: i64,
    /// Lock counts this user contributed, released if the user times out.
    locked: HashMap<FileId, u32>,
}

#[derive(Default)]
struct StorageState {
    worker_id: WorkerId,
    used_bytes: i64,
    resident: HashMap<FileId, ResidentFile>,
    users: HashMap<UserId, UserRecord>,
    /// Files the master asked to free while a reader still held them.
    pending_free: HashSet<FileId>,
    /// Locally evicted files not yet reported on a heartbeat.
    removed_files: Vec<FileId>,
    pinned: HashSet<FileId>,
}

#[derive(Debug, Clone)]
pub struct WorkerStorageConfig {
    pub address: NetAddress,
    /// RAM-backed folder holding whole cached files.
    pub data_dir: PathBuf,
    /// Root of the under file system as mounted on this host.
    pub underfs_dir: PathBuf,
    pub capacity_bytes: i64,
    pub user_timeout_ms: i64,
}

impl WorkerStorageConfig {
    pub fn new(
        address: NetAddress,
        data_dir: impl Into<PathBuf>,
        underfs_dir: impl Into<PathBuf>,
        capacity_bytes: i64,
    ) -> Self {
        Self {
            address,
            data_dir: data_dir.into(),
            underfs_dir: underfs_dir.into(),
            capacity_bytes,
            user_timeout_ms: USER_TIMEOUT_MS,
        }
    }
}

/// Worker-local storage manager: bounded space accounting, resident-file
/// lifecycle, LRU eviction honoring locks and pins, and user temp-folder
/// lifecycle. One mutator lock guards the accounting state; file I/O always
/// happens outside of it.
pub struct WorkerStorage {
    address: NetAddress,
    data_dir: PathBuf,
    underfs_dir: PathBuf,
    capacity_bytes: i64,
    user_timeout_ms: i64,
    master: Arc<dyn MasterHandler>,
    _dir_lock: std::fs::File,
    state: Mutex<StorageState>,
}

impl WorkerStorage {
    /// Opens (and exclusively locks) the data folder, then rebuilds the
    /// resident set from the files already present in it.
    pub fn new(config: WorkerStorageConfig, master: Arc<dyn MasterHandler>) -> MemFsResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.data_dir.join(USERS_DIR_NAME))?;
        std::fs::create_dir_all(config.underfs_dir.join(UNDERFS_DATA_DIR_NAME))?;
        std::fs::create_dir_all(
            config
                .underfs_dir
                .join(UNDERFS_TMP_DIR_NAME)
                .join(USERS_DIR_NAME),
        )?;

        let dir_lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(config.data_dir.join(DIR_LOCK_FILE))?;
        dir_lock.try_lock_exclusive().map_err(|e| {
            MemFsError::IoError(format!(
                "data folder {} already in use: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        let mut state = StorageState::default();
        let now = now_ms();
        for entry in std::fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(file_id) = name.to_str().and_then(|s| s.parse::<FileId>().ok()) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let size = meta.len() as i64;
            state.used_bytes += size;
            state.resident.insert(
                file_id,
                ResidentFile {
                    size_bytes: size,
                    last_access_ms: now,
                    lock_count: 0,
                    pinned: false,
                },
            );
        }
        if !state.resident.is_empty() {
            info!(
                "recovered {} resident file(s), {} bytes",
                state.resident.len(),
                state.used_bytes
            );
        }

        Ok(Self {
            address: config.address,
            data_dir: config.data_dir,
            underfs_dir: config.underfs_dir,
            capacity_bytes: config.capacity_bytes,
            user_timeout_ms: config.user_timeout_ms,
            master,
            _dir_lock: dir_lock,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MemFsResult<MutexGuard<'_, StorageState>> {
        self.state
            .lock()
            .map_err(|_| MemFsError::Internal("worker state lock poisoned".to_string()))
    }

    fn data_file_path(&self, file_id: FileId) -> PathBuf {
        self.data_dir.join(file_id.to_string())
    }

    fn user_temp_dir(&self, user_id: UserId) -> PathBuf {
        self.data_dir.join(USERS_DIR_NAME).join(user_id.to_string())
    }

    fn user_underfs_tmp_dir(&self, user_id: UserId) -> PathBuf {
        self.underfs_dir
            .join(UNDERFS_TMP_DIR_NAME)
            .join(USERS_DIR_NAME)
            .join(user_id.to_string())
    }

    fn underfs_data_path(&self, file_id: FileId) -> PathBuf {
        self.underfs_dir
            .join(UNDERFS_DATA_DIR_NAME)
            .join(file_id.to_string())
    }

    pub fn worker_id(&self) -> MemFsResult<WorkerId> {
        Ok(self.state()?.worker_id)
    }

    pub fn used_bytes(&self) -> MemFsResult<i64> {
        Ok(self.state()?.used_bytes)
    }

    fn touch_user(state: &mut StorageState, user_id: UserId, now: i64) {
        state.users.entry(user_id).or_default().last_heartbeat_ms = now;
    }

    /// Evicts the least recently used eligible file, updating the
    /// accounting only. Returns the id and size so the caller can delete
    /// the backing file outside the lock.
    fn evict_one_lru(state: &mut StorageState, exclude: Option<FileId>) -> Option<(FileId, i64)> {
        let victim = state
            .resident
            .iter()
            .filter(|(fid, f)| {
                f.lock_count == 0 && !f.pinned && Some(**fid) != exclude
            })
            .min_by_key(|(_, f)| f.last_access_ms)
            .map(|(fid, _)| *fid)?;
        Self::drop_resident(state, victim)
    }

    fn drop_resident(state: &mut StorageState, file_id: FileId) -> Option<(FileId, i64)> {
        let file = state.resident.remove(&file_id)?;
        state.used_bytes -= file.size_bytes;
        state.removed_files.push(file_id);
        state.pending_free.remove(&file_id);
        Some((file_id, file.size_bytes))
    }

    /// Evicts until `needed` more bytes fit under the capacity. Appends the
    /// victims to `victims` and reports whether the request now fits.
    fn make_room(
        state: &mut StorageState,
        capacity: i64,
        needed: i64,
        exclude: Option<FileId>,
        victims: &mut Vec<FileId>,
    ) -> bool {
        while state.used_bytes + needed > capacity {
            match Self::evict_one_lru(state, exclude) {
                Some((fid, size)) => {
                    debug!("evicting file {} ({} bytes)", fid, size);
                    victims.push(fid);
                }
                None => return false,
            }
        }
        true
    }

    async fn delete_backing_files(&self, victims: &[FileId]) {
        for fid in victims {
            let path = self.data_file_path(*fid);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("failed to delete evicted file {}: {}", path.display(), e);
            }
        }
    }

    /// Re-examines files the master asked to free; called after every
    /// unlock and every successful cache.
    async fn drain_pending_free(&self) -> MemFsResult<()> {
        let victims = {
            let mut state = self.state()?;
            let st = &mut *state;
            let mut victims = Vec::new();
            for fid in st.pending_free.clone() {
                let eligible = match st.resident.get(&fid) {
                    Some(file) => file.lock_count == 0 && !file.pinned,
                    None => {
                        st.pending_free.remove(&fid);
                        continue;
                    }
                };
                if eligible && Self::drop_resident(st, fid).is_some() {
                    victims.push(fid);
                }
            }
            victims
        };
        self.delete_backing_files(&victims).await;
        Ok(())
    }

    // ========== Master-facing driver ==========

    /// (Re-)registers with the master, declaring the current resident set,
    /// then refreshes the pin list.
    pub async fn register(&self) -> MemFsResult<()> {
        let (used, current_files) = {
            let state = self.state()?;
            (
                state.used_bytes,
                state.resident.keys().copied().collect::<Vec<_>>(),
            )
        };
        let rv = self
            .master
            .worker_register(self.address.clone(), self.capacity_bytes, used, current_files)
            .await?;
        let worker_id = registered_worker_id(rv);
        self.state()?.worker_id = worker_id;
        info!("registered as worker {} at {}", worker_id, self.address);
        self.refresh_pins().await
    }

    async fn refresh_pins(&self) -> MemFsResult<()> {
        let pins = self.master.worker_get_pin_id_list().await?;
        let mut state = self.state()?;
        let st = &mut *state;
        for (fid, file) in st.resident.iter_mut() {
            file.pinned = pins.contains(fid);
        }
        st.pinned = pins;
        Ok(())
    }

    /// One heartbeat: report usage and locally removed files, receive one
    /// command. Removed files go back on the report list if the call
    /// fails.
    pub async fn heartbeat(&self) -> MemFsResult<Command> {
        let (worker_id, used, removed) = {
            let mut state = self.state()?;
            let removed = std::mem::take(&mut state.removed_files);
            (state.worker_id, state.used_bytes, removed)
        };
        match self
            .master
            .worker_heartbeat(worker_id, used, removed.clone())
            .await
        {
            Ok(command) => Ok(command),
            Err(e) => {
                let mut state = self.state()?;
                let mut restored = removed;
                restored.append(&mut state.removed_files);
                state.removed_files = restored;
                Err(e)
            }
        }
    }

    /// Hook for transport-backed master clients to rebuild their
    /// connection after a failure; the in-process backend has nothing to
    /// rebuild.
    pub fn reset_master_client(&self) {
        debug!("resetting master client");
    }

    /// Free command: best-effort eviction. Locked or pinned residents park
    /// in the pending set and are retried on unlock and after each cache.
    pub async fn free_files(&self, file_ids: &[FileId]) -> MemFsResult<()> {
        let victims = {
            let mut state = self.state()?;
            let st = &mut *state;
            let mut victims = Vec::new();
            for fid in file_ids {
                match st.resident.get(fid) {
                    Some(file) if file.lock_count == 0 && !file.pinned => {
                        if Self::drop_resident(st, *fid).is_some() {
                            victims.push(*fid);
                        }
                    }
                    Some(_) => {
                        debug!("file {} busy, deferring free", fid);
                        st.pending_free.insert(*fid);
                    }
                    None => {}
                }
            }
            victims
        };
        self.delete_backing_files(&victims).await;
        Ok(())
    }

    /// Delete command: the files no longer exist, so locks and pins do not
    /// protect them.
    pub async fn delete_files(&self, file_ids: &[FileId]) -> MemFsResult<()> {
        let victims = {
            let mut state = self.state()?;
            let st = &mut *state;
            let mut victims = Vec::new();
            for fid in file_ids {
                st.pinned.remove(fid);
                if Self::drop_resident(st, *fid).is_some() {
                    victims.push(*fid);
                }
            }
            victims
        };
        self.delete_backing_files(&victims).await;
        Ok(())
    }

    /// Post-heartbeat upkeep: drop users that stopped heartbeating and
    /// refresh the pin list.
    pub async fn check_status(&self) -> MemFsResult<()> {
        let now = now_ms();
        let stale: Vec<UserId> = {
            let mut state = self.state()?;
            let st = &mut *state;
            let stale: Vec<UserId> = st
                .users
                .iter()
                .filter(|(_, user)| now - user.last_heartbeat_ms > self.user_timeout_ms)
                .map(|(uid, _)| *uid)
                .collect();
            for uid in &stale {
                if let Some(user) = st.users.remove(uid) {
                    if user.reserved_bytes > 0 {
                        warn!(
                            "user {} timed out holding {} reserved bytes",
                            uid, user.reserved_bytes
                        );
                        st.used_bytes -= user.reserved_bytes;
                    }
                    for (fid, count) in user.locked {
                        if let Some(file) = st.resident.get_mut(&fid) {
                            file.lock_count = file.lock_count.saturating_sub(count);
                        }
                    }
                }
            }
            stale
        };

        for uid in &stale {
            info!("removing temp folders of timed-out user {}", uid);
            let local = self.user_temp_dir(*uid);
            if let Err(e) = tokio::fs::remove_dir_all(&local).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", local.display(), e);
                }
            }
            let remote = self.user_underfs_tmp_dir(*uid);
            if let Err(e) = tokio::fs::remove_dir_all(&remote).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", remote.display(), e);
                }
            }
        }
        if !stale.is_empty() {
            self.drain_pending_free().await?;
        }

        self.refresh_pins().await
    }
}

#[async_trait]
impl WorkerHandler for WorkerStorage {
    async fn request_space(&self, user_id: UserId, request_bytes: i64) -> MemFsResult<bool> {
        if request_bytes < 0 {
            return Err(MemFsError::Internal(format!(
                "negative space request: {}",
                request_bytes
            )));
        }
        let now = now_ms();
        let (granted, victims) = {
            let mut state = self.state()?;
            let st = &mut *state;
            Self::touch_user(st, user_id, now);
            let mut victims = Vec::new();
            let fits = st.used_bytes + request_bytes <= self.capacity_bytes
                || Self::make_room(st, self.capacity_bytes, request_bytes, None, &mut victims);
            if fits {
                st.used_bytes += request_bytes;
                if let Some(user) = st.users.get_mut(&user_id) {
                    user.reserved_bytes += request_bytes;
                }
            }
            (fits, victims)
        };
        self.delete_backing_files(&victims).await;
        if !granted {
            info!(
                "denied {} bytes for user {}: no evictable space",
                request_bytes, user_id
            );
        }
        Ok(granted)
    }

    async fn return_space(&self, user_id: UserId, returned_bytes: i64) -> MemFsResult<()> {
        let now = now_ms();
        let mut state = self.state()?;
        let st = &mut *state;
        Self::touch_user(st, user_id, now);
        let user = st.users.entry(user_id).or_default();
        let released = returned_bytes.clamp(0, user.reserved_bytes);
        if released != returned_bytes {
            warn!(
                "user {} returned {} bytes but reserved only {}, clamping",
                user_id, returned_bytes, user.reserved_bytes
            );
        }
        user.reserved_bytes -= released;
        st.used_bytes -= released;
        Ok(())
    }

    async fn cache_file(&self, user_id: UserId, file_id: FileId) -> MemFsResult<()> {
        let src = self.user_temp_dir(user_id).join(file_id.to_string());
        let meta = tokio::fs::metadata(&src).await.map_err(|_| {
            MemFsError::FileDoesNotExist(format!("no temp file for {} at {}", file_id, src.display()))
        })?;
        let size = meta.len() as i64;
        let now = now_ms();

        // Admit under the lock: debit the user's reservation, account any
        // excess, and make room for it if the reservation fell short.
        let (victims, used_snapshot, worker_id) = {
            let mut state = self.state()?;
            let st = &mut *state;
            Self::touch_user(st, user_id, now);
            if st.resident.contains_key(&file_id) {
                warn!("file {} is already cached, ignoring", file_id);
                return Ok(());
            }
            let user = st.users.entry(user_id).or_default();
            let debit = size.min(user.reserved_bytes);
            let excess = size - debit;
            let mut victims = Vec::new();
            if excess > 0
                && st.used_bytes + excess > self.capacity_bytes
                && !Self::make_room(st, self.capacity_bytes, excess, Some(file_id), &mut victims)
            {
                return Err(MemFsError::Internal(format!(
                    "no space left to cache file {} ({} bytes beyond reservation)",
                    file_id, excess
                )));
            }
            let user = st.users.entry(user_id).or_default();
            user.reserved_bytes -= debit;
            st.used_bytes += excess;
            st.resident.insert(
                file_id,
                ResidentFile {
                    size_bytes: size,
                    last_access_ms: now,
                    lock_count: 0,
                    pinned: st.pinned.contains(&file_id),
                },
            );
            (victims, st.used_bytes, st.worker_id)
        };
        self.delete_backing_files(&victims).await;

        let dst = self.data_file_path(file_id);
        if let Err(e) = tokio::fs::rename(&src, &dst).await {
            let mut state = self.state()?;
            Self::drop_resident(&mut state, file_id);
            // The file never made it in; nothing to report on a heartbeat.
            state.removed_files.retain(|fid| *fid != file_id);
            return Err(MemFsError::IoError(format!(
                "failed to promote {}: {}",
                src.display(),
                e
            )));
        }
        info!("cached file {} ({} bytes)", file_id, size);

        self.master
            .worker_cache_file(worker_id, used_snapshot, file_id, size)
            .await?;
        self.drain_pending_free().await
    }

    async fn add_checkpoint(&self, user_id: UserId, file_id: FileId) -> MemFsResult<()> {
        let src = self.user_underfs_tmp_dir(user_id).join(file_id.to_string());
        let meta = tokio::fs::metadata(&src).await.map_err(|_| {
            MemFsError::FileDoesNotExist(format!(
                "no checkpoint temp for {} at {}",
                file_id,
                src.display()
            ))
        })?;
        let size = meta.len() as i64;
        let dst = self.underfs_data_path(file_id);
        tokio::fs::rename(&src, &dst).await.map_err(|e| {
            MemFsError::FailedToCheckpoint(format!(
                "move {} -> {}: {}",
                src.display(),
                dst.display(),
                e
            ))
        })?;

        let worker_id = self.worker_id()?;
        self.master
            .add_checkpoint(worker_id, file_id, size, dst.to_string_lossy().into_owned())
            .await?;
        let now = now_ms();
        let mut state = self.state()?;
        Self::touch_user(&mut state, user_id, now);
        info!("checkpointed file {} ({} bytes)", file_id, size);
        Ok(())
    }

    async fn lock_file(&self, file_id: FileId, user_id: UserId) -> MemFsResult<()> {
        let now = now_ms();
        let mut state = self.state()?;
        let st = &mut *state;
        Self::touch_user(st, user_id, now);
        match st.resident.get_mut(&file_id) {
            Some(file) => {
                file.lock_count += 1;
                file.last_access_ms = now;
                if let Some(user) = st.users.get_mut(&user_id) {
                    *user.locked.entry(file_id).or_insert(0) += 1;
                }
            }
            None => warn!("lock request for non-resident file {}", file_id),
        }
        Ok(())
    }

    async fn unlock_file(&self, file_id: FileId, user_id: UserId) -> MemFsResult<()> {
        let now = now_ms();
        {
            let mut state = self.state()?;
            let st = &mut *state;
            Self::touch_user(st, user_id, now);
            match st.resident.get_mut(&file_id) {
                Some(file) if file.lock_count > 0 => {
                    file.lock_count -= 1;
                    if let Some(user) = st.users.get_mut(&user_id) {
                        if let Some(count) = user.locked.get_mut(&file_id) {
                            *count -= 1;
                            if *count == 0 {
                                user.locked.remove(&file_id);
                            }
                        }
                    }
                }
                _ => warn!("unmatched unlock for file {}", file_id),
            }
        }
        self.drain_pending_free().await
    }

    async fn access_file(&self, file_id: FileId) -> MemFsResult<()> {
        let now = now_ms();
        let mut state = self.state()?;
        if let Some(file) = state.resident.get_mut(&file_id) {
            file.last_access_ms = now;
        }
        Ok(())
    }

    async fn get_data_folder(&self) -> MemFsResult<String> {
        Ok(self.data_dir.to_string_lossy().into_owned())
    }

    async fn get_user_temp_folder(&self, user_id: UserId) -> MemFsResult<String> {
        let dir = self.user_temp_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        let now = now_ms();
        let mut state = self.state()?;
        Self::touch_user(&mut state, user_id, now);
        Ok(dir.to_string_lossy().into_owned())
    }

    async fn get_user_underfs_temp_folder(&self, user_id: UserId) -> MemFsResult<String> {
        let dir = self.user_underfs_tmp_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        let now = now_ms();
        let mut state = self.state()?;
        Self::touch_user(&mut state, user_id, now);
        Ok(dir.to_string_lossy().into_owned())
    }

    async fn user_heartbeat(&self, user_id: UserId) -> MemFsResult<()> {
        let now = now_ms();
        let mut state = self.state()?;
        Self::touch_user(&mut state, user_id, now);
        Ok(())
    }
}
