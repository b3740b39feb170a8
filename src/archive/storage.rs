//! On-disk layout for archived media
//!
//! Files are named `<uuid>.<ext>` and sharded into a subdirectory named after
//! the first two characters of the filename.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create a new storage rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh opaque filename for the given extension
    pub fn generate_filename(extension: &str) -> String {
        format!("{}.{}", Uuid::new_v4(), extension.to_lowercase())
    }

    /// Sharded location of a filename
    pub fn path_for(&self, filename: &str) -> PathBuf {
        let shard: String = filename.chars().take(2).collect();
        self.root.join(shard).join(filename)
    }

    pub async fn write(&self, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Remove a stored file; a file that is already gone is not an error
    pub async fn remove(&self, filename: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(filename)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every regular file under the root, as (filename, path)
    pub fn list_files(&self) -> Vec<(String, PathBuf)> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                Some((name, entry.into_path()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sharded_path() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let path = storage.path_for("ab12cd.png");
        assert_eq!(path, dir.path().join("ab").join("ab12cd.png"));
    }

    #[test]
    fn test_generated_filename_shape() {
        let name = FileStorage::generate_filename("PNG");
        assert!(name.ends_with(".png"));
        let stem = name.trim_end_matches(".png");
        assert!(Uuid::parse_str(stem).is_ok());
    }

    #[tokio::test]
    async fn test_write_list_remove() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let path = storage.write("xy.jpg", b"data").await.unwrap();
        assert!(path.exists());
        assert_eq!(storage.list_files().len(), 1);

        storage.remove("xy.jpg").await.unwrap();
        storage.remove("xy.jpg").await.unwrap();
        assert!(storage.list_files().is_empty());
    }
}
