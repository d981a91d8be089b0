//! File System Helpers
//!
//! Path resolution and synchronous file access for tile directories and
//! preprocessed terrain caches.

use std::path::{Path, PathBuf};

use crate::PlatformResult;

/// File system rooted at a data directory (source tiles) and a cache
/// directory (preprocessed output)
#[derive(Debug, Clone)]
pub struct FileSystem {
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl FileSystem {
    /// Create a file system rooted at the current directory
    pub fn new() -> Self {
        let data_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cache_dir = data_dir.join("cache");
        Self { data_dir, cache_dir }
    }

    /// Create a file system with custom directories
    pub fn with_dirs(data_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Get the data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve a path relative to the data directory
    pub fn data_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(path)
    }

    /// Resolve a path relative to the cache directory
    pub fn cache_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.cache_dir.join(path)
    }

    /// Check if a file exists
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Check if a path is a regular file
    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Size of a file in bytes
    pub fn file_size(&self, path: impl AsRef<Path>) -> PlatformResult<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Absolute, symlink-resolved form of `path`
    pub fn canonicalize(&self, path: impl AsRef<Path>) -> PlatformResult<PathBuf> {
        Ok(std::fs::canonicalize(path)?)
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> PlatformResult<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    /// Read a file's contents
    pub fn read(&self, path: impl AsRef<Path>) -> PlatformResult<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    /// Read a file as a string
    pub fn read_string(&self, path: impl AsRef<Path>) -> PlatformResult<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    /// Write data to a file
    pub fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> PlatformResult<()> {
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Write a string to a file
    pub fn write_string(&self, path: impl AsRef<Path>, data: &str) -> PlatformResult<()> {
        self.write(path, data.as_bytes())
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_resolution() {
        let fs = FileSystem::with_dirs("/data", "/data/cache");
        assert!(fs.data_path("mip0/tile_0_0.png").ends_with("mip0/tile_0_0.png"));
        assert_eq!(fs.cache_path("terrain_tiles.meta"), PathBuf::from("/data/cache/terrain_tiles.meta"));
    }

    #[test]
    fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::with_dirs(dir.path(), dir.path().join("cache"));

        fs.create_dir_all(fs.cache_dir()).unwrap();
        let file = fs.cache_path("test.txt");

        fs.write_string(&file, "Hello, Strata!").unwrap();
        assert!(fs.exists(&file));
        assert!(fs.is_file(&file));
        assert_eq!(fs.file_size(&file).unwrap(), 14);
        assert_eq!(fs.read_string(&file).unwrap(), "Hello, Strata!");

        let canonical = fs.canonicalize(&file).unwrap();
        assert!(canonical.is_absolute());
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::with_dirs(dir.path(), dir.path());
        assert!(!fs.exists(dir.path().join("missing.raw")));
        assert!(fs.file_size(dir.path().join("missing.raw")).is_err());
    }
}
