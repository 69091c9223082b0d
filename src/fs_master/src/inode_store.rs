use crate::path_trie::{PathTrie, ROOT_FILE_ID};
use memfs_lib::{now_ms, CachePath, FileId, MemFsError, MemFsResult, INVALID_FILE_ID, INVALID_RAW_TABLE_ID, MAX_COLUMNS};
use std::collections::HashMap;

/// Authoritative record of one file or folder.
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: FileId,
    pub name: String,
    pub path: CachePath,
    pub is_folder: bool,
    pub size_bytes: i64,
    pub creation_time_ms: i64,
    pub ready: bool,
    pub pinned: bool,
    pub cacheable: bool,
    pub checkpoint_path: String,
}

impl Inode {
    fn new(id: FileId, path: CachePath, is_folder: bool, pinned: bool, cacheable: bool) -> Self {
        Self {
            id,
            name: path.name().to_string(),
            path,
            is_folder,
            size_bytes: 0,
            creation_time_ms: now_ms(),
            ready: is_folder,
            pinned,
            cacheable,
            checkpoint_path: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawTableRecord {
    pub columns: i32,
    pub metadata: Vec<u8>,
}

/// Inode table plus the raw-table overlay. Owns the file-id counter and the
/// path trie; every mutation updates both under the caller's critical
/// section.
pub struct InodeStore {
    next_file_id: FileId,
    inodes: HashMap<FileId, Inode>,
    raw_tables: HashMap<FileId, RawTableRecord>,
    trie: PathTrie,
}

impl InodeStore {
    pub fn new() -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_FILE_ID,
            Inode::new(ROOT_FILE_ID, CachePath::root(), true, false, false),
        );
        Self {
            next_file_id: 1,
            inodes,
            raw_tables: HashMap::new(),
            trie: PathTrie::new(),
        }
    }

    fn alloc_id(&mut self) -> FileId {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    pub fn inode(&self, id: FileId) -> Option<&Inode> {
        self.inodes.get(&id)
    }

    pub fn inode_by_path(&self, path: &CachePath) -> Option<&Inode> {
        self.trie.lookup(path).and_then(|id| self.inodes.get(&id))
    }

    /// `-1` when the path does not exist.
    pub fn file_id(&self, path: &CachePath) -> FileId {
        self.trie.lookup(path).unwrap_or(INVALID_FILE_ID)
    }

    /// Creates missing ancestor folders of `path`, bottom of the existing
    /// tree downward. The deepest existing ancestor must be a folder.
    fn ensure_ancestors(&mut self, path: &CachePath) -> MemFsResult<()> {
        let mut missing = Vec::new();
        let mut cur = path.parent();
        while let Some(ancestor) = cur {
            match self.trie.lookup(&ancestor) {
                Some(id) => {
                    let node = self.inodes.get(&id).ok_or_else(|| {
                        MemFsError::Internal(format!("dangling trie entry for {}", ancestor))
                    })?;
                    if !node.is_folder {
                        return Err(MemFsError::InvalidPath(format!(
                            "{} is not a folder",
                            ancestor
                        )));
                    }
                    break;
                }
                None => {
                    missing.push(ancestor.clone());
                    cur = ancestor.parent();
                }
            }
        }
        for folder in missing.into_iter().rev() {
            let id = self.alloc_id();
            self.trie.insert(&folder, id, true)?;
            self.inodes
                .insert(id, Inode::new(id, folder, true, false, false));
        }
        Ok(())
    }

    /// Creates a file or folder. The created node takes the next file id
    /// before any missing ancestors are materialized, so the first node
    /// created in an empty namespace always gets id 1.
    pub fn create(
        &mut self,
        path: &CachePath,
        is_folder: bool,
        pinned: bool,
        cacheable: bool,
    ) -> MemFsResult<FileId> {
        if path.is_root() || self.trie.lookup(path).is_some() {
            return Err(MemFsError::FileAlreadyExist(path.to_string()));
        }
        let id = self.alloc_id();
        self.ensure_ancestors(path)?;
        self.trie.insert(path, id, is_folder)?;
        self.inodes
            .insert(id, Inode::new(id, path.clone(), is_folder, pinned, cacheable));
        Ok(id)
    }

    /// Creates a raw table: a folder at `path` plus one child folder per
    /// column, named `"0"` .. `columns - 1`.
    pub fn create_raw_table(
        &mut self,
        path: &CachePath,
        columns: i32,
        metadata: Vec<u8>,
    ) -> MemFsResult<FileId> {
        if columns < 1 || columns > MAX_COLUMNS {
            return Err(MemFsError::TableColumn(format!(
                "columns must be in [1, {}], got {}",
                MAX_COLUMNS, columns
            )));
        }
        let table_id = self.create(path, true, false, false)?;
        for column in 0..columns {
            let column_path = path.join(&column.to_string())?;
            self.create(&column_path, true, false, false)?;
        }
        self.raw_tables
            .insert(table_id, RawTableRecord { columns, metadata });
        Ok(table_id)
    }

    /// `0` when the path is absent or not a raw table.
    pub fn raw_table_id(&self, path: &CachePath) -> FileId {
        match self.trie.lookup(path) {
            Some(id) if self.raw_tables.contains_key(&id) => id,
            _ => INVALID_RAW_TABLE_ID,
        }
    }

    pub fn raw_table(&self, table_id: FileId) -> MemFsResult<(&Inode, &RawTableRecord)> {
        let record = self
            .raw_tables
            .get(&table_id)
            .ok_or_else(|| MemFsError::TableDoesNotExist(format!("table {}", table_id)))?;
        let inode = self
            .inodes
            .get(&table_id)
            .ok_or_else(|| MemFsError::Internal(format!("raw table {} has no inode", table_id)))?;
        Ok((inode, record))
    }

    pub fn update_raw_table_metadata(
        &mut self,
        table_id: FileId,
        metadata: Vec<u8>,
    ) -> MemFsResult<()> {
        let record = self
            .raw_tables
            .get_mut(&table_id)
            .ok_or_else(|| MemFsError::TableDoesNotExist(format!("table {}", table_id)))?;
        record.metadata = metadata;
        Ok(())
    }

    /// Atomic namespace move; file ids are stable, inode paths are
    /// refreshed for the whole moved subtree.
    pub fn rename(&mut self, src: &CachePath, dst: &CachePath) -> MemFsResult<()> {
        self.trie.rename(src, dst)?;
        for (path, id) in self.trie.subtree(dst)? {
            if let Some(inode) = self.inodes.get_mut(&id) {
                inode.name = path.name().to_string();
                inode.path = path;
            }
        }
        Ok(())
    }

    /// Removes the subtree at `path` and returns the removed file ids
    /// (folders included). A non-empty folder needs `recursive`.
    pub fn delete(&mut self, path: &CachePath, recursive: bool) -> MemFsResult<Vec<FileId>> {
        let removed = self.trie.remove(path, recursive)?;
        for id in &removed {
            self.inodes.remove(id);
            self.raw_tables.remove(id);
        }
        Ok(removed)
    }

    /// Commits the size reported by a worker cache. The size is set at most
    /// once; a later disagreement is a `SuspectedFileSize` failure.
    pub fn commit_size(&mut self, file_id: FileId, size_bytes: i64) -> MemFsResult<()> {
        let inode = self
            .inodes
            .get_mut(&file_id)
            .filter(|inode| !inode.is_folder)
            .ok_or_else(|| MemFsError::FileDoesNotExist(format!("file {}", file_id)))?;
        if inode.ready {
            if inode.size_bytes != size_bytes {
                return Err(MemFsError::SuspectedFileSize(format!(
                    "file {} has size {}, reported {}",
                    file_id, inode.size_bytes, size_bytes
                )));
            }
            return Ok(());
        }
        inode.size_bytes = size_bytes;
        inode.ready = true;
        Ok(())
    }

    /// Registers a checkpoint path, committing the size on first sight.
    pub fn add_checkpoint(
        &mut self,
        file_id: FileId,
        size_bytes: i64,
        checkpoint_path: &str,
    ) -> MemFsResult<()> {
        self.commit_size(file_id, size_bytes)?;
        let inode = self
            .inodes
            .get_mut(&file_id)
            .ok_or_else(|| MemFsError::FileDoesNotExist(format!("file {}", file_id)))?;
        if inode.checkpoint_path.is_empty() {
            inode.checkpoint_path = checkpoint_path.to_string();
        }
        Ok(())
    }

    pub fn set_pinned(&mut self, file_id: FileId, pinned: bool) -> MemFsResult<()> {
        let inode = self
            .inodes
            .get_mut(&file_id)
            .ok_or_else(|| MemFsError::FileDoesNotExist(format!("file {}", file_id)))?;
        inode.pinned = pinned;
        Ok(())
    }

    /// Direct children of a folder as inode refs, lexicographic by name.
    pub fn children(&self, path: &CachePath) -> MemFsResult<Vec<&Inode>> {
        let mut out = Vec::new();
        for (_, id) in self.trie.children(path)? {
            let inode = self
                .inodes
                .get(&id)
                .ok_or_else(|| MemFsError::Internal(format!("dangling trie entry {}", id)))?;
            out.push(inode);
        }
        Ok(out)
    }

    /// The whole subtree at `path` (self first), for recursive listings.
    pub fn subtree(&self, path: &CachePath) -> MemFsResult<Vec<&Inode>> {
        let mut out = Vec::new();
        for (_, id) in self.trie.subtree(path)? {
            let inode = self
                .inodes
                .get(&id)
                .ok_or_else(|| MemFsError::Internal(format!("dangling trie entry {}", id)))?;
            out.push(inode);
        }
        Ok(out)
    }

    pub fn exists(&self, path: &CachePath) -> bool {
        self.trie.lookup(path).is_some()
    }
}

impl Default for InodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> CachePath {
        CachePath::new(s).unwrap()
    }

    #[test]
    fn test_first_file_gets_id_one() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a/b.dat"), false, false, true).unwrap();
        assert_eq!(id, 1);
        // The auto-created ancestor folder got a later id.
        let folder = store.inode_by_path(&p("/a")).unwrap();
        assert!(folder.is_folder);
        assert!(folder.id > id);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut store = InodeStore::new();
        let a = store.create(&p("/a"), false, false, true).unwrap();
        let b = store.create(&p("/b"), false, false, true).unwrap();
        let c = store.create(&p("/c"), false, false, true).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let mut store = InodeStore::new();
        store.create(&p("/a"), false, false, true).unwrap();
        assert!(matches!(
            store.create(&p("/a"), false, false, true),
            Err(MemFsError::FileAlreadyExist(_))
        ));
    }

    #[test]
    fn test_create_under_file_fails() {
        let mut store = InodeStore::new();
        store.create(&p("/f"), false, false, true).unwrap();
        assert!(matches!(
            store.create(&p("/f/x"), false, false, true),
            Err(MemFsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_file_id_lookup() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a"), false, false, true).unwrap();
        assert_eq!(store.file_id(&p("/a")), id);
        assert_eq!(store.file_id(&p("/nope")), INVALID_FILE_ID);
    }

    #[test]
    fn test_commit_size_once() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a"), false, false, true).unwrap();
        store.commit_size(id, 4096).unwrap();
        let inode = store.inode(id).unwrap();
        assert!(inode.ready);
        assert_eq!(inode.size_bytes, 4096);

        // Same size is idempotent, a different size is suspect.
        store.commit_size(id, 4096).unwrap();
        assert!(matches!(
            store.commit_size(id, 8192),
            Err(MemFsError::SuspectedFileSize(_))
        ));
        assert_eq!(store.inode(id).unwrap().size_bytes, 4096);
    }

    #[test]
    fn test_add_checkpoint_sets_path_and_size() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a"), false, false, true).unwrap();
        store.add_checkpoint(id, 100, "/ufs/data/1").unwrap();
        let inode = store.inode(id).unwrap();
        assert!(inode.ready);
        assert_eq!(inode.checkpoint_path, "/ufs/data/1");
        // The first checkpoint path sticks.
        store.add_checkpoint(id, 100, "/ufs/data/other").unwrap();
        assert_eq!(store.inode(id).unwrap().checkpoint_path, "/ufs/data/1");
    }

    #[test]
    fn test_raw_table_create_and_columns() {
        let mut store = InodeStore::new();
        let id = store
            .create_raw_table(&p("/tables/t1"), 3, vec![1, 2, 3])
            .unwrap();
        assert_eq!(store.raw_table_id(&p("/tables/t1")), id);
        assert_eq!(store.raw_table_id(&p("/tables")), INVALID_RAW_TABLE_ID);

        let children = store.children(&p("/tables/t1")).unwrap();
        let names: Vec<&str> = children.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["0", "1", "2"]);

        let (_, record) = store.raw_table(id).unwrap();
        assert_eq!(record.columns, 3);
        assert_eq!(record.metadata, vec![1, 2, 3]);
    }

    #[test]
    fn test_raw_table_bad_columns() {
        let mut store = InodeStore::new();
        assert!(matches!(
            store.create_raw_table(&p("/t"), 0, Vec::new()),
            Err(MemFsError::TableColumn(_))
        ));
        assert!(matches!(
            store.create_raw_table(&p("/t"), MAX_COLUMNS + 1, Vec::new()),
            Err(MemFsError::TableColumn(_))
        ));
    }

    #[test]
    fn test_update_raw_table_metadata() {
        let mut store = InodeStore::new();
        let id = store.create_raw_table(&p("/t"), 1, Vec::new()).unwrap();
        store.update_raw_table_metadata(id, vec![9]).unwrap();
        assert_eq!(store.raw_table(id).unwrap().1.metadata, vec![9]);

        let plain = store.create(&p("/plain"), true, false, false).unwrap();
        assert!(matches!(
            store.update_raw_table_metadata(plain, vec![1]),
            Err(MemFsError::TableDoesNotExist(_))
        ));
    }

    #[test]
    fn test_rename_refreshes_paths() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a/b"), false, false, true).unwrap();
        store.rename(&p("/a"), &p("/x")).unwrap();
        let inode = store.inode(id).unwrap();
        assert_eq!(inode.path.as_str(), "/x/b");
        assert_eq!(inode.name, "b");
        assert_eq!(store.file_id(&p("/x/b")), id);
        assert_eq!(store.file_id(&p("/a/b")), INVALID_FILE_ID);
    }

    #[test]
    fn test_rename_round_trip_preserves_id() {
        let mut store = InodeStore::new();
        let id = store.create(&p("/a"), false, false, true).unwrap();
        store.rename(&p("/a"), &p("/b")).unwrap();
        store.rename(&p("/b"), &p("/a")).unwrap();
        assert_eq!(store.file_id(&p("/a")), id);
    }

    #[test]
    fn test_delete_subtree_drops_raw_tables() {
        let mut store = InodeStore::new();
        let table = store.create_raw_table(&p("/t"), 2, Vec::new()).unwrap();
        let removed = store.delete(&p("/t"), true).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(removed.contains(&table));
        assert!(store.raw_table(table).is_err());
        assert!(!store.exists(&p("/t")));
    }
}
