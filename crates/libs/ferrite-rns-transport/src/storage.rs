use std::fs;
use std::path::{Path, PathBuf};

use rns_core::error::RnsError;

/// Key-addressed object store used for table persistence and the packet
/// cache. Paths are relative; the implementation maps them to its own
/// backing medium.
pub trait Storage {
    fn create_directory(&mut self, path: &str) -> Result<(), RnsError>;
    fn directory_exists(&self, path: &str) -> bool;
    fn file_exists(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> Result<Vec<u8>, RnsError>;
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError>;
    fn remove_file(&mut self, path: &str) -> Result<(), RnsError>;
    fn list_directory(&self, path: &str) -> Result<Vec<String>, RnsError>;
}

/// Filesystem-backed store rooted at a base directory. Writes go through a
/// temporary file and a rename so a crash never leaves a half-written
/// object behind.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Storage for FsStorage {
    fn create_directory(&mut self, path: &str) -> Result<(), RnsError> {
        fs::create_dir_all(self.resolve(path)).map_err(|_| RnsError::StorageError)
    }

    fn directory_exists(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn file_exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RnsError> {
        fs::read(self.resolve(path)).map_err(|_| RnsError::StorageError)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|_| RnsError::StorageError)?;
        }
        let tmp_path = target.with_extension("out");
        fs::write(&tmp_path, data).map_err(|_| RnsError::StorageError)?;
        if target.exists() {
            let _ = fs::remove_file(&target);
        }
        fs::rename(&tmp_path, &target).map_err(|_| RnsError::StorageError)
    }

    fn remove_file(&mut self, path: &str) -> Result<(), RnsError> {
        fs::remove_file(self.resolve(path)).map_err(|_| RnsError::StorageError)
    }

    fn list_directory(&self, path: &str) -> Result<Vec<String>, RnsError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(self.resolve(path)).map_err(|_| RnsError::StorageError)?;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// In-memory store for tests and diskless targets.
#[derive(Default)]
pub struct MemoryStorage {
    files: std::collections::BTreeMap<String, Vec<u8>>,
    directories: std::collections::BTreeSet<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn create_directory(&mut self, path: &str) -> Result<(), RnsError> {
        self.directories.insert(path.to_string());
        Ok(())
    }

    fn directory_exists(&self, path: &str) -> bool {
        self.directories.contains(path)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RnsError> {
        self.files.get(path).cloned().ok_or(RnsError::StorageError)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError> {
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<(), RnsError> {
        self.files.remove(path).map(|_| ()).ok_or(RnsError::StorageError)
    }

    fn list_directory(&self, path: &str) -> Result<Vec<String>, RnsError> {
        let prefix = format!("{}/", path);
        Ok(self
            .files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect())
    }
}
