use crate::{MemFsError, MemFsResult};
use serde::{Deserialize, Serialize};

/// An absolute, normalized path inside the cache namespace.
///
/// Normalization collapses repeated `/` and strips a trailing `/` (except
/// for the root itself). Relative paths and `.` / `..` segments are
/// rejected. Two `CachePath` values compare equal iff they address the same
/// node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachePath(String);

pub const PATH_SEPARATOR: char = '/';

impl CachePath {
    pub fn new(raw: &str) -> MemFsResult<Self> {
        if raw.is_empty() {
            return Err(MemFsError::InvalidPath("empty path".to_string()));
        }
        if !raw.starts_with(PATH_SEPARATOR) {
            return Err(MemFsError::InvalidPath(format!(
                "path is not absolute: {}",
                raw
            )));
        }

        let mut parts: Vec<&str> = Vec::new();
        for part in raw.split(PATH_SEPARATOR) {
            match part {
                "" => continue,
                "." | ".." => {
                    return Err(MemFsError::InvalidPath(format!(
                        "path contains '{}': {}",
                        part, raw
                    )));
                }
                _ => parts.push(part),
            }
        }

        if parts.is_empty() {
            return Ok(Self::root());
        }
        Ok(CachePath(format!("/{}", parts.join("/"))))
    }

    pub fn root() -> Self {
        CachePath("/".to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components, leaf last. Empty for the root.
    pub fn components(&self) -> Vec<&str> {
        if self.is_root() {
            Vec::new()
        } else {
            self.0[1..].split(PATH_SEPARATOR).collect()
        }
    }

    /// The leaf name; empty string for the root.
    pub fn name(&self) -> &str {
        if self.is_root() {
            ""
        } else {
            match self.0.rfind(PATH_SEPARATOR) {
                Some(idx) => &self.0[idx + 1..],
                None => &self.0,
            }
        }
    }

    pub fn parent(&self) -> Option<CachePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(PATH_SEPARATOR) {
            Some(0) => Some(CachePath::root()),
            Some(idx) => Some(CachePath(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn join(&self, name: &str) -> MemFsResult<CachePath> {
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            return Err(MemFsError::InvalidPath(format!(
                "bad path component: {:?}",
                name
            )));
        }
        if self.is_root() {
            CachePath::new(&format!("/{}", name))
        } else {
            CachePath::new(&format!("{}/{}", self.0, name))
        }
    }

    /// True if `other` lies strictly below `self`.
    pub fn is_ancestor_of(&self, other: &CachePath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0)
            && other.0.as_bytes().get(self.0.len()) == Some(&(PATH_SEPARATOR as u8))
    }
}

impl std::fmt::Display for CachePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
