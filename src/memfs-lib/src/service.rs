use crate::{
    ClientFileInfo, ClientRawTableInfo, ClientWorkerInfo, Command, FileId, MemFsResult,
    NetAddress, UserId, WorkerId,
};
use async_trait::async_trait;
use std::collections::HashSet;

/// Method contract of the master service. The transport is an external
/// concern: in-process callers hold the service directly behind this trait,
/// remote transports implement it on a client stub.
#[async_trait]
pub trait MasterHandler: Send + Sync {
    // ---- worker-facing ----

    /// Registers a worker and returns the packed registration value
    /// (see `encode_registration`). The declared resident file list
    /// replaces whatever placement state the master held for this worker.
    async fn worker_register(
        &self,
        addr: NetAddress,
        total_bytes: i64,
        used_bytes: i64,
        current_files: Vec<FileId>,
    ) -> MemFsResult<i64>;

    /// Reports liveness and locally removed files; returns exactly one
    /// command. An unknown worker id is answered with `Register`.
    async fn worker_heartbeat(
        &self,
        worker_id: WorkerId,
        used_bytes: i64,
        removed_files: Vec<FileId>,
    ) -> MemFsResult<Command>;

    /// Records that `worker_id` now holds `file_id` with the given size.
    async fn worker_cache_file(
        &self,
        worker_id: WorkerId,
        worker_used_bytes: i64,
        file_id: FileId,
        file_size_bytes: i64,
    ) -> MemFsResult<()>;

    async fn worker_get_pin_id_list(&self) -> MemFsResult<HashSet<FileId>>;

    /// Registers a durable checkpoint for `file_id` at `checkpoint_path`.
    async fn add_checkpoint(
        &self,
        worker_id: WorkerId,
        file_id: FileId,
        file_size_bytes: i64,
        checkpoint_path: String,
    ) -> MemFsResult<bool>;

    // ---- client-facing: namespace ----

    async fn user_create_file(&self, path: String) -> MemFsResult<FileId>;
    async fn user_get_file_id(&self, path: String) -> MemFsResult<FileId>;
    async fn user_mkdir(&self, path: String) -> MemFsResult<bool>;
    async fn user_rename_file(&self, src_path: String, dst_path: String) -> MemFsResult<()>;
    async fn user_delete_by_id(&self, file_id: FileId, recursive: bool) -> MemFsResult<bool>;
    async fn user_delete_by_path(&self, path: String, recursive: bool) -> MemFsResult<bool>;

    async fn user_get_client_file_info_by_id(&self, file_id: FileId)
        -> MemFsResult<ClientFileInfo>;
    async fn user_get_client_file_info_by_path(&self, path: String)
        -> MemFsResult<ClientFileInfo>;
    async fn liststatus(&self, path: String) -> MemFsResult<Vec<ClientFileInfo>>;
    async fn user_list_files(&self, path: String, recursive: bool) -> MemFsResult<Vec<FileId>>;
    async fn user_ls(&self, path: String, recursive: bool) -> MemFsResult<Vec<String>>;
    async fn user_get_number_of_files(&self, path: String) -> MemFsResult<i32>;

    // ---- client-facing: placement ----

    async fn user_get_worker(&self, random: bool, host: String) -> MemFsResult<NetAddress>;
    async fn user_get_file_locations_by_id(&self, file_id: FileId)
        -> MemFsResult<Vec<NetAddress>>;
    async fn user_get_file_locations_by_path(&self, path: String)
        -> MemFsResult<Vec<NetAddress>>;
    async fn get_workers_info(&self) -> MemFsResult<Vec<ClientWorkerInfo>>;

    // ---- client-facing: pins, sessions, raw tables ----

    async fn user_get_user_id(&self) -> MemFsResult<UserId>;
    async fn user_unpin_file(&self, file_id: FileId) -> MemFsResult<()>;
    async fn user_out_of_memory_for_pin_file(&self, file_id: FileId) -> MemFsResult<()>;

    async fn user_create_raw_table(
        &self,
        path: String,
        columns: i32,
        metadata: Vec<u8>,
    ) -> MemFsResult<FileId>;
    async fn user_get_raw_table_id(&self, path: String) -> MemFsResult<FileId>;
    async fn user_get_client_raw_table_info_by_id(
        &self,
        table_id: FileId,
    ) -> MemFsResult<ClientRawTableInfo>;
    async fn user_get_client_raw_table_info_by_path(
        &self,
        path: String,
    ) -> MemFsResult<ClientRawTableInfo>;
    async fn user_update_raw_table_metadata(
        &self,
        table_id: FileId,
        metadata: Vec<u8>,
    ) -> MemFsResult<()>;

    async fn user_get_underfs_address(&self) -> MemFsResult<String>;
}

/// Method contract of the worker service, exposed to clients on the same
/// host as the worker.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Atomically reserves `request_bytes` for `user_id`. Returns false if
    /// the space cannot be made available even after eviction.
    async fn request_space(&self, user_id: UserId, request_bytes: i64) -> MemFsResult<bool>;

    /// Returns unused reserved bytes. Amounts beyond the reservation are
    /// clamped.
    async fn return_space(&self, user_id: UserId, returned_bytes: i64) -> MemFsResult<()>;

    /// Promotes a file from the user's local temp folder into the resident
    /// set and notifies the master.
    async fn cache_file(&self, user_id: UserId, file_id: FileId) -> MemFsResult<()>;

    /// Moves the user's UFS temp copy into the UFS data area and registers
    /// the checkpoint with the master.
    async fn add_checkpoint(&self, user_id: UserId, file_id: FileId) -> MemFsResult<()>;

    async fn lock_file(&self, file_id: FileId, user_id: UserId) -> MemFsResult<()>;
    async fn unlock_file(&self, file_id: FileId, user_id: UserId) -> MemFsResult<()>;
    async fn access_file(&self, file_id: FileId) -> MemFsResult<()>;

    async fn get_data_folder(&self) -> MemFsResult<String>;
    async fn get_user_temp_folder(&self, user_id: UserId) -> MemFsResult<String>;
    async fn get_user_underfs_temp_folder(&self, user_id: UserId) -> MemFsResult<String>;

    async fn user_heartbeat(&self, user_id: UserId) -> MemFsResult<()>;
}
