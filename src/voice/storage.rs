use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// The directory recordings and their intermediate tracks are written to.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir)?;
            info!("Created recording directory {:?}", base_dir);
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn track_path(&self, file_name: &str, speaker: u64) -> PathBuf {
        self.base_dir.join(format!("{}-{}.wav", file_name, speaker))
    }

    pub fn output_path(&self, file_name: &str, extension: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", file_name, extension))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// A file that is already gone counts as deleted.
    pub async fn delete_file(&self, path: &Path) -> bool {
        match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                error!("Failed to delete {:?}: {}", path, e);
                false
            }
        }
    }

    /// Deletes every file, returning whether all of them are gone.
    pub async fn delete_files(&self, paths: &[PathBuf]) -> bool {
        let mut all_deleted = true;
        for path in paths {
            all_deleted &= self.delete_file(path).await;
        }
        all_deleted
    }
}
