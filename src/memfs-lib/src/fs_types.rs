use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Dense positive file id issued by the master, never reused.
pub type FileId = i32;
/// Master-issued monotone user id.
pub type UserId = i64;
/// Registry-issued worker id, dense from 1.
pub type WorkerId = i64;

/// Value returned by `user_getFileId` when the path does not exist.
pub const INVALID_FILE_ID: FileId = -1;
/// Value returned by `user_getRawTableId` when the path is not a raw table.
pub const INVALID_RAW_TABLE_ID: FileId = 0;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Command carried on a heartbeat reply. The numeric values are part of the
/// wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum CommandType {
    Unknown = 0,
    Nothing = 1,
    Register = 2,
    Free = 3,
    Delete = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_type: CommandType,
    pub data: Vec<FileId>,
}

impl Command {
    pub fn nothing() -> Self {
        Self {
            command_type: CommandType::Nothing,
            data: Vec::new(),
        }
    }

    pub fn register() -> Self {
        Self {
            command_type: CommandType::Register,
            data: Vec::new(),
        }
    }

    pub fn free(data: Vec<FileId>) -> Self {
        Self {
            command_type: CommandType::Free,
            data,
        }
    }

    pub fn delete(data: Vec<FileId>) -> Self {
        Self {
            command_type: CommandType::Delete,
            data,
        }
    }
}

// ========== Registration encoding ==========
//
// `worker_register` replies with a single i64 that packs the worker id
// together with the master's start time. This is a historical wire format:
// the low decimal digits carry the worker id, the value divided by one
// million recovers the master start-time in ms. Callers go through the
// accessors below instead of repeating the arithmetic.

const REGISTRATION_ID_MODULUS: i64 = 100_000;
const REGISTRATION_START_DIVISOR: i64 = 1_000_000;

pub fn encode_registration(master_start_ms: i64, worker_id: WorkerId) -> i64 {
    master_start_ms * REGISTRATION_START_DIVISOR + worker_id
}

pub fn registered_worker_id(rv: i64) -> WorkerId {
    rv % REGISTRATION_ID_MODULUS
}

pub fn registered_master_start_ms(rv: i64) -> i64 {
    rv / REGISTRATION_START_DIVISOR
}

// ========== Client-visible record shapes ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFileInfo {
    pub id: FileId,
    pub name: String,
    pub path: String,
    pub checkpoint_path: String,
    pub size_bytes: i64,
    pub creation_time_ms: i64,
    pub ready: bool,
    pub folder: bool,
    /// True iff at least one live worker currently holds the file.
    pub in_memory: bool,
    pub need_pin: bool,
    pub need_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientWorkerInfo {
    pub id: WorkerId,
    pub address: NetAddress,
    pub last_contact_sec: i64,
    pub state: String,
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub start_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRawTableInfo {
    pub id: FileId,
    pub name: String,
    pub path: String,
    pub columns: i32,
    pub metadata: Vec<u8>,
}
