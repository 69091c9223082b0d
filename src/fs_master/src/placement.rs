use memfs_lib::{FileId, WorkerId};
use std::collections::{HashMap, HashSet};

/// Reverse index from file id to the workers currently holding it. Holds
/// non-owning relations only; the inode store and worker registry own the
/// records, and every update here happens inside their critical section.
pub struct PlacementIndex {
    by_file: HashMap<FileId, HashSet<WorkerId>>,
}

impl PlacementIndex {
    pub fn new() -> Self {
        Self {
            by_file: HashMap::new(),
        }
    }

    pub fn add(&mut self, file_id: FileId, worker_id: WorkerId) {
        self.by_file.entry(file_id).or_default().insert(worker_id);
    }

    pub fn remove(&mut self, file_id: FileId, worker_id: WorkerId) {
        if let Some(workers) = self.by_file.get_mut(&file_id) {
            workers.remove(&worker_id);
            if workers.is_empty() {
                self.by_file.remove(&file_id);
            }
        }
    }

    /// Forgets a file entirely (deletion).
    pub fn remove_file(&mut self, file_id: FileId) -> HashSet<WorkerId> {
        self.by_file.remove(&file_id).unwrap_or_default()
    }

    /// Drops every contribution of one worker (loss or re-registration).
    pub fn remove_worker(&mut self, worker_id: WorkerId) {
        self.by_file.retain(|_, workers| {
            workers.remove(&worker_id);
            !workers.is_empty()
        });
    }

    pub fn holders(&self, file_id: FileId) -> impl Iterator<Item = WorkerId> + '_ {
        self.by_file
            .get(&file_id)
            .into_iter()
            .flat_map(|workers| workers.iter().copied())
    }

    pub fn is_in_memory(&self, file_id: FileId) -> bool {
        self.by_file
            .get(&file_id)
            .map(|workers| !workers.is_empty())
            .unwrap_or(false)
    }
}

impl Default for PlacementIndex {
    fn default() -> Self {
        Self::new()
    }
}
