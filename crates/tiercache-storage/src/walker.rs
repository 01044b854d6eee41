//! Cache Directory Walker
//!
//! Enumerates every regular file below a cache root as a lazy sequence of
//! `(relative_path, size_bytes, last_modified)` entries. The cache service uses it
//! at startup to rebuild its index and occupancy from what is actually on disk.
//!
//! ## Traversal
//!
//! ```text
//! root/
//! ├── kafka/orders/0/00000000000000000000.seg   → WalkEntry
//! ├── kafka/orders/0/.00000000000000000100.seg.7.partial → WalkEntry
//! └── locked/ (EACCES)                          → WalkError, walk continues
//! ```
//!
//! The walk is depth-first over an explicit stack of open directory handles, so
//! deeply nested trees never grow the native call stack. Within one directory the
//! order is whatever the filesystem returns; callers may only rely on every regular
//! file being reported exactly once.
//!
//! Symlinks are reported neither as files nor followed as directories.
//!
//! Each call to [`DirectoryWalker::walk`] re-reads the filesystem; nothing is cached.

use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A regular file found under the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walk root
    pub relative_path: PathBuf,
    /// File length in bytes
    pub size_bytes: u64,
    /// Last modification time reported by the filesystem
    pub last_modified: SystemTime,
}

/// A path that could not be read. The walk continues past it.
#[derive(Debug)]
pub struct WalkError {
    pub path: PathBuf,
    pub source: io::Error,
}

impl std::fmt::Display for WalkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot read {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for WalkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Walks a cache root.
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    root: PathBuf,
}

impl DirectoryWalker {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh walk over the current filesystem state.
    ///
    /// A root that does not exist produces an empty walk; any other failure to
    /// open the root is reported as the first item.
    pub fn walk(&self) -> Walk {
        let mut walk = Walk {
            root: self.root.clone(),
            stack: Vec::new(),
            pending_error: None,
        };

        match fs::read_dir(&self.root) {
            Ok(read_dir) => walk.stack.push(read_dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                walk.pending_error = Some(WalkError {
                    path: self.root.clone(),
                    source: e,
                })
            }
        }

        walk
    }
}

/// Lazy iterator over the files below a root.
pub struct Walk {
    root: PathBuf,
    /// Open directories, innermost last
    stack: Vec<ReadDir>,
    pending_error: Option<WalkError>,
}

impl Walk {
    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

impl Iterator for Walk {
    type Item = Result<WalkEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }

        loop {
            let read_dir = self.stack.last_mut()?;

            let dir_entry = match read_dir.next() {
                None => {
                    self.stack.pop();
                    continue;
                }
                Some(Err(e)) => {
                    // A failing step inside one directory: report it and abandon
                    // that directory, the parent keeps going.
                    self.stack.pop();
                    return Some(Err(WalkError {
                        path: self.root.clone(),
                        source: e,
                    }));
                }
                Some(Ok(entry)) => entry,
            };

            let path = dir_entry.path();
            let file_type = match dir_entry.file_type() {
                Ok(t) => t,
                Err(e) => return Some(Err(WalkError { path, source: e })),
            };

            if file_type.is_symlink() {
                continue;
            }

            if file_type.is_dir() {
                match fs::read_dir(&path) {
                    Ok(child) => self.stack.push(child),
                    Err(e) => return Some(Err(WalkError { path, source: e })),
                }
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            let metadata = match dir_entry.metadata() {
                Ok(m) => m,
                Err(e) => return Some(Err(WalkError { path, source: e })),
            };

            let last_modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            return Some(Ok(WalkEntry {
                relative_path: self.relative(&path),
                size_bytes: metadata.len(),
                last_modified,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn collect(walker: &DirectoryWalker) -> BTreeMap<PathBuf, u64> {
        walker
            .walk()
            .filter_map(|r| r.ok())
            .map(|e| (e.relative_path, e.size_bytes))
            .collect()
    }

    #[test]
    fn test_walk_missing_root_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let walker = DirectoryWalker::new(temp_dir.path().join("does-not-exist"));
        assert_eq!(walker.walk().count(), 0);
    }

    #[test]
    fn test_walk_nested_files_reported_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("top.seg"), vec![0u8; 10]).unwrap();
        fs::write(root.join("a/one.seg"), vec![0u8; 20]).unwrap();
        fs::write(root.join("a/b/two.seg"), vec![0u8; 30]).unwrap();
        fs::write(root.join("a/b/c/three.seg"), vec![0u8; 40]).unwrap();

        let walker = DirectoryWalker::new(root);
        let entries: Vec<_> = walker.walk().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 4);

        let files = collect(&walker);
        assert_eq!(files.get(Path::new("top.seg")), Some(&10));
        assert_eq!(files.get(Path::new("a/one.seg")), Some(&20));
        assert_eq!(files.get(Path::new("a/b/two.seg")), Some(&30));
        assert_eq!(files.get(Path::new("a/b/c/three.seg")), Some(&40));
    }

    #[test]
    fn test_walk_is_reinvocable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("first.seg"), b"x").unwrap();

        let walker = DirectoryWalker::new(root);
        assert_eq!(collect(&walker).len(), 1);

        fs::write(root.join("second.seg"), b"yy").unwrap();
        assert_eq!(collect(&walker).len(), 2);

        fs::remove_file(root.join("first.seg")).unwrap();
        let files = collect(&walker);
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(Path::new("second.seg")));
    }

    #[test]
    fn test_walk_deep_nesting_uses_explicit_stack() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut dir = temp_dir.path().to_path_buf();
        for i in 0..64 {
            dir = dir.join(format!("d{}", i));
        }
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leaf.seg"), vec![1u8; 7]).unwrap();

        let walker = DirectoryWalker::new(temp_dir.path());
        let entries: Vec<_> = walker.walk().filter_map(|r| r.ok()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size_bytes, 7);
        assert!(entries[0].relative_path.ends_with("leaf.seg"));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_skips_symlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("real")).unwrap();
        fs::write(root.join("real/file.seg"), b"abc").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("loop")).unwrap();
        std::os::unix::fs::symlink(root.join("real/file.seg"), root.join("alias.seg")).unwrap();

        let files = collect(&DirectoryWalker::new(root));
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(Path::new("real/file.seg")));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_unreadable_directory_does_not_stop_siblings() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("locked")).unwrap();
        fs::write(root.join("locked/hidden.seg"), b"h").unwrap();
        fs::create_dir_all(root.join("open")).unwrap();
        fs::write(root.join("open/visible.seg"), b"v").unwrap();
        fs::write(root.join("sibling.seg"), b"s").unwrap();

        fs::set_permissions(root.join("locked"), fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; the permission check is meaningless there.
        let probe = fs::read_dir(root.join("locked"));
        let readable_anyway = probe.is_ok();

        let results: Vec<_> = DirectoryWalker::new(root).walk().collect();
        fs::set_permissions(root.join("locked"), fs::Permissions::from_mode(0o755)).unwrap();

        let ok: Vec<_> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|e| e.relative_path.clone())
            .collect();
        assert!(ok.contains(&PathBuf::from("open/visible.seg")));
        assert!(ok.contains(&PathBuf::from("sibling.seg")));

        if !readable_anyway {
            let errors: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].path.ends_with("locked"));
        }
    }
}
