pub mod master_service;

mod inode_store;
mod path_trie;
mod placement;
mod worker_registry;

pub use inode_store::{Inode, InodeStore};
pub use master_service::{MasterConfig, MasterService};
pub use path_trie::{PathTrie, ROOT_FILE_ID};
pub use placement::PlacementIndex;
pub use worker_registry::{WorkerRegistry, WORKER_STATE_ACTIVE, WORKER_STATE_LOST};

#[cfg(test)]
mod master_service_tests;
