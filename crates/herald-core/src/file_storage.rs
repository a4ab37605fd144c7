use crate::{Result, StorageAdapter};
use std::fs;
use std::path::{Path, PathBuf};

/// File-per-record storage adapter. Key segments map to directories, so
/// `list` round-trips the same keys `put` was given.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a record is always either its previous or its next version on disk.
/// Session persistence relies on this: ratchet state must never be torn.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| crate::Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        for segment in key.split('/') {
            path.push(segment.replace(['\\', ':', '.'], "_"));
        }
        path.set_extension("json");
        path
    }

    fn collect_keys(&self, dir: &Path, rel: &str, keys: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| crate::Error::Storage(format!("Failed to read directory: {}", e)))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| crate::Error::Storage(format!("Failed to read dir entry: {}", e)))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if path.is_dir() {
                let child_rel = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                self.collect_keys(&path, &child_rel, keys)?;
            } else if let Some(stem) = name.strip_suffix(".json") {
                let key = if rel.is_empty() {
                    stem.to_string()
                } else {
                    format!("{}/{}", rel, stem)
                };
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_to_path(key);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                crate::Error::Storage(format!("Failed to create parent dir: {}", e))
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .map_err(|e| crate::Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| crate::Error::Storage(format!("Failed to commit file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::Error::Storage(format!(
                "Failed to delete file: {}",
                e
            ))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.base_path, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
