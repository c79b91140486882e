//! File system abstraction used for plugin discovery, plugin data and static
//! content.
//!
//! Paths handed to a [`FileSystem`] are relative to its root; a leading `/` is
//! ignored, so `/views/a` and `views/a` name the same file.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Metadata for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub last_write_time: DateTime<Utc>,
    pub size: u64,
}

/// Read-only view of a directory tree.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Check whether a file or directory exists.
    fn exists(&self, path: &Path) -> bool;

    /// List files directly inside `dir`.
    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// List directories directly inside `dir`.
    fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Map a path to a real on-disk location, if this file system has one.
    fn local_path(&self, _path: &Path) -> Option<PathBuf> {
        None
    }
}

/// Strip root and current-dir components so every backend sees the same
/// relative path.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
        .collect()
}

/// File system backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct RealFileSystem {
    root: PathBuf,
}

impl RealFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(normalize(path))
    }

    fn list(&self, dir: &Path, want_dirs: bool) -> io::Result<Vec<PathBuf>> {
        let relative = normalize(dir);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root.join(&relative))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() == want_dirs {
                out.push(relative.join(entry.file_name()));
            }
        }
        out.sort();
        Ok(out)
    }
}

impl FileSystem for RealFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        self.list(dir, false)
    }

    fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        self.list(dir, true)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(self.resolve(path))?;
        Ok(FileStat {
            last_write_time: meta.modified()?.into(),
            size: meta.len(),
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn local_path(&self, path: &Path) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    last_write_time: DateTime<Utc>,
}

/// File system held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, MemFile>>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file stamped with the current time.
    pub fn write(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        self.write_at(path, data, Utc::now());
    }

    /// Write a file with an explicit last-write time.
    pub fn write_at(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>, last_write_time: DateTime<Utc>) {
        let file = MemFile {
            data: data.into(),
            last_write_time,
        };
        if let Ok(mut files) = self.files.write() {
            files.insert(normalize(path.as_ref()), file);
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files
            .write()
            .map(|mut files| files.remove(&normalize(path.as_ref())).is_some())
            .unwrap_or(false)
    }

    fn with_file<T>(&self, path: &Path, f: impl FnOnce(&MemFile) -> T) -> io::Result<T> {
        let files = self
            .files
            .read()
            .map_err(|_| io::Error::other("file table lock poisoned"))?;
        files
            .get(&normalize(path))
            .map(f)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display())))
    }
}

impl FileSystem for InMemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        let target = normalize(path);
        self.files
            .read()
            .map(|files| files.keys().any(|k| k.starts_with(&target)))
            .unwrap_or(false)
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let dir = normalize(dir);
        let files = self
            .files
            .read()
            .map_err(|_| io::Error::other("file table lock poisoned"))?;
        Ok(files
            .keys()
            .filter(|k| k.parent() == Some(dir.as_path()))
            .cloned()
            .collect())
    }

    fn list_dirs(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let dir = normalize(dir);
        let files = self
            .files
            .read()
            .map_err(|_| io::Error::other("file table lock poisoned"))?;
        let mut dirs: Vec<PathBuf> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&dir).ok())
            .filter(|rest| rest.components().count() > 1)
            .filter_map(|rest| rest.components().next())
            .map(|first| dir.join(first))
            .collect();
        dirs.dedup();
        Ok(dirs)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.with_file(path, |f| FileStat {
            last_write_time: f.last_write_time,
            size: f.data.len() as u64,
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.with_file(path, |f| f.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_listing() {
        let fs = InMemoryFileSystem::new();
        fs.write("/plugins/a.so", b"a".to_vec());
        fs.write("plugins/nested/b.so", b"b".to_vec());
        fs.write("plugins/nested/deeper/c.so", b"c".to_vec());

        assert_eq!(fs.list_files(Path::new("plugins")).unwrap(), vec![PathBuf::from("plugins/a.so")]);
        assert_eq!(fs.list_dirs(Path::new("/plugins")).unwrap(), vec![PathBuf::from("plugins/nested")]);
        assert_eq!(
            fs.list_dirs(Path::new("plugins/nested")).unwrap(),
            vec![PathBuf::from("plugins/nested/deeper")]
        );
        assert!(fs.exists(Path::new("plugins/nested")));
        assert!(!fs.exists(Path::new("missing")));
        assert_eq!(fs.read(Path::new("/plugins/nested/b.so")).unwrap(), b"b");
    }

    #[test]
    fn test_in_memory_stat_uses_write_time() {
        let fs = InMemoryFileSystem::new();
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        fs.write_at("x.bin", vec![1, 2, 3], t);
        let stat = fs.stat(Path::new("x.bin")).unwrap();
        assert_eq!(stat.last_write_time, t);
        assert_eq!(stat.size, 3);
        assert_eq!(fs.stat(Path::new("y.bin")).unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_real_file_system() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top.so"), b"top").unwrap();
        std::fs::write(dir.path().join("sub/inner.so"), b"inner").unwrap();

        let fs = RealFileSystem::new(dir.path());
        assert_eq!(fs.list_files(Path::new("/")).unwrap(), vec![PathBuf::from("top.so")]);
        assert_eq!(fs.list_dirs(Path::new("")).unwrap(), vec![PathBuf::from("sub")]);
        assert_eq!(fs.read(Path::new("sub/inner.so")).unwrap(), b"inner");
        assert_eq!(fs.local_path(Path::new("/top.so")), Some(dir.path().join("top.so")));
    }
}
