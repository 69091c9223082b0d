pub mod heartbeat;
pub mod worker_storage;

pub use heartbeat::{run_heartbeat_loop, HeartbeatConfig};
pub use worker_storage::{WorkerStorage, WorkerStorageConfig};
