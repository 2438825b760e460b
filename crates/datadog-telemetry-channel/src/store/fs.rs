// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem access used by the persistent store.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub len: u64,
}

pub trait FileSystem: Send + Sync + Debug {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    /// Regular files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<FileEntry>>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            entries.push(FileEntry {
                name,
                len: metadata.len(),
            });
        }
        Ok(entries)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// In-memory filesystem for tests. Wrap it in an `Arc` to hand one instance to
/// several stores.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Paths of every file, in order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        #[allow(clippy::expect_used)]
        self.files.lock().expect("lock poisoned")
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileSystem for MemoryFileSystem {
    fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<FileEntry>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, data)| {
                let name = path.file_name()?.to_str()?.to_string();
                Some(FileEntry {
                    name,
                    len: data.len() as u64,
                })
            })
            .collect())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.lock().get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.lock().insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.lock();
        let data = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(fs: &dyn FileSystem, dir: &Path) {
        fs.create_dir_all(dir).unwrap();
        fs.write(&dir.join("a.tmp"), b"hello").unwrap();
        fs.rename(&dir.join("a.tmp"), &dir.join("a.trn")).unwrap();

        let entries = fs.list(dir).unwrap();
        assert_eq!(
            entries,
            vec![FileEntry {
                name: "a.trn".to_string(),
                len: 5
            }]
        );
        assert_eq!(fs.read(&dir.join("a.trn")).unwrap(), b"hello");

        fs.remove(&dir.join("a.trn")).unwrap();
        assert_eq!(
            fs.remove(&dir.join("a.trn")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            fs.read(&dir.join("a.trn")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert!(fs.list(dir).unwrap().is_empty());
    }

    #[test]
    fn test_local_file_system() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&LocalFileSystem, &dir.path().join("store"));
    }

    #[test]
    fn test_memory_file_system() {
        let fs = MemoryFileSystem::new();
        exercise(&fs, Path::new("/store"));
    }

    #[test]
    fn test_memory_list_is_scoped_to_directory() {
        let fs = MemoryFileSystem::new();
        fs.write(Path::new("/a/one"), b"1").unwrap();
        fs.write(Path::new("/a/b/two"), b"2").unwrap();

        let names: Vec<String> = fs
            .list(Path::new("/a"))
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["one".to_string()]);
    }

    #[test]
    fn test_memory_write_failure() {
        let fs = MemoryFileSystem::new();
        fs.set_fail_writes(true);
        assert!(fs.write(Path::new("/a/one"), b"1").is_err());
        fs.set_fail_writes(false);
        assert!(fs.write(Path::new("/a/one"), b"1").is_ok());
    }
}
