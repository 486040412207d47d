//! Capture directory traversal.
//!
//! Packaging and manifest building both need the capture output in a stable,
//! lexical order so that file-list entries are reproducible between runs.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File names to skip (exact match)
    pub exclude_names: Vec<String>,
}

/// A regular file found under the capture directory
#[derive(Debug, Clone)]
pub struct CaptureFile {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, used as the archive member name
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl CaptureFile {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        // Resolve symlinks; dangling links and links to directories are skipped
        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => return Ok(None),
        };
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
        }))
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Walk `root` and return its regular files in lexical path order.
pub fn walk_sorted(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<CaptureFile>> {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() || should_exclude(&entry, &options.exclude_names) {
            continue;
        }
        if let Some(file) = CaptureFile::from_entry(&entry, root)? {
            files.push(file);
        }
    }
    Ok(files)
}

/// Total size of all regular files under `root`.
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    Ok(walk_sorted(root, &WalkOptions::default())?
        .iter()
        .map(|f| f.size)
        .sum())
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_sorted(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_is_lexical() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("db1.t2.00000.sql"), b"b")?;
        fs::write(temp_dir.path().join("db1.t1-schema.sql"), b"a")?;
        fs::create_dir(temp_dir.path().join("a_sub"))?;
        fs::write(temp_dir.path().join("a_sub/metadata"), b"m")?;
        fs::write(temp_dir.path().join("db1-schema-create.sql"), b"c")?;

        let files = walk_sorted(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<String> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "a_sub/metadata",
                "db1-schema-create.sql",
                "db1.t1-schema.sql",
                "db1.t2.00000.sql"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_exclude_and_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file1.sql"), b"12345")?;
        fs::write(temp_dir.path().join("file2.sql"), b"1234567")?;
        assert_eq!(calculate_total_size(temp_dir.path())?, 12);

        let opts = WalkOptions {
            exclude_names: vec!["file2.sql".to_string()],
            ..Default::default()
        };
        let files = walk_sorted(temp_dir.path(), &opts)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name(), "file1.sql");
        Ok(())
    }
}
