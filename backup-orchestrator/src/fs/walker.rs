//! Directory traversal for archiving component directories.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names containing any of these substrings are skipped (with their subtree)
    pub exclude_patterns: Vec<String>,
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Broken symlinks and symlinks to directories are skipped.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let (size, is_dir) = if raw_metadata.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => (resolved.len(), false),
                Err(_) => return Ok(None),
            }
        } else {
            (raw_metadata.len(), raw_metadata.is_dir())
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_dir,
        }))
    }
}

/// Walk a directory tree and collect every entry below `root`, directories
/// included so empty directories survive an archive round-trip.
///
/// Entries come back in a stable (sorted) order so two archives of the same
/// tree list their members identically.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_includes_directories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::create_dir(temp_dir.path().join("empty"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.iter().filter(|f| !f.is_dir).count(), 2);
        assert_eq!(files.iter().filter(|f| f.is_dir).count(), 2);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns_prune_subtrees() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("model.bin"), b"keep")?;
        fs::write(temp_dir.path().join("model.bin.tmp"), b"partial download")?;
        fs::create_dir(temp_dir.path().join(".tmp-cache"))?;
        fs::write(temp_dir.path().join(".tmp-cache/blob"), b"skip")?;

        let options = WalkOptions {
            exclude_patterns: vec![".tmp".to_string()],
            ..WalkOptions::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "model.bin");

        Ok(())
    }
}
