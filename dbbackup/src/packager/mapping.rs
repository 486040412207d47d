//! Logical packaging: capture files mapped into size-bounded tar parts.
//!
//! Files are appended in lexical order to `<target>_<N>.tar`. A part is
//! closed only between files, once it has reached the threshold, so no part
//! ever holds a truncated file. Each source file is deleted as soon as it is
//! archived.

use crate::fs::walker::{walk_sorted, WalkOptions};
use crate::index::TarFileItem;
use crate::utils::errors::{BackupError, Result};
use crate::utils::ratelimit::{remove_file_throttled, RateLimiter, ThrottledWriter};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type PartBuilder<'a> = tar::Builder<ThrottledWriter<'a, File>>;

pub fn part_name(target: &str, n: usize) -> String {
    format!("{}_{}.tar", target, n)
}

struct OpenPart<'a> {
    name: String,
    path: PathBuf,
    builder: PartBuilder<'a>,
}

impl<'a> OpenPart<'a> {
    fn create(out_dir: &Path, target: &str, n: usize, limiter: &'a RateLimiter) -> Result<Self> {
        let name = part_name(target, n);
        let path = out_dir.join(&name);
        let file = File::create(&path)?;
        Ok(Self {
            name,
            path,
            builder: tar::Builder::new(ThrottledWriter::new(file, limiter)),
        })
    }

    fn written(&self) -> u64 {
        self.builder.get_ref().written()
    }

    /// Write the tar trailer and return the entry for the finished part.
    fn close(self) -> Result<TarFileItem> {
        let mut writer = self.builder.into_inner()?;
        writer.flush()?;
        let file = writer.into_inner();
        file.sync_all()?;
        let size = std::fs::metadata(&self.path)?.len();
        info!(part = %self.name, size, "Archive part closed");
        Ok(TarFileItem::standalone(self.name, size))
    }
}

/// Archive `capture_dir` into parts under `out_dir`. Returns the file-list
/// entries in order: each member as it is archived, each part as it closes.
pub fn mapping_package(
    capture_dir: &Path,
    out_dir: &Path,
    target: &str,
    threshold: u64,
    limiter: &RateLimiter,
) -> Result<Vec<TarFileItem>> {
    if threshold == 0 {
        return Err(BackupError::validation("archive part threshold must be positive"));
    }
    let files = walk_sorted(capture_dir, &WalkOptions::default())?;
    let mut items = Vec::with_capacity(files.len() + 1);
    let mut next_part = 0usize;
    let mut current: Option<OpenPart> = None;

    for file in files {
        if current.is_none() {
            current = Some(OpenPart::create(out_dir, target, next_part, limiter)?);
            next_part += 1;
        }
        let Some(part) = current.as_mut() else {
            continue;
        };

        let member = Path::new(target).join(&file.relative_path);
        part.builder
            .append_path_with_name(&file.path, &member)
            .map_err(|e| BackupError::Archive(format!("append {}: {}", file.path.display(), e)))?;
        debug!(file = %file.relative_path.display(), part = %part.name, "Archived");

        items.push(TarFileItem::member(
            file.relative_path.to_string_lossy(),
            file.size,
            &part.name,
        ));
        remove_file_throttled(&file.path, limiter)?;

        if part.written() >= threshold {
            if let Some(done) = current.take() {
                items.push(done.close()?);
            }
        }
    }

    if let Some(done) = current.take() {
        items.push(done.close()?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileType;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn members_of(path: &Path) -> Vec<(String, u64)> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.path().unwrap().to_string_lossy().to_string(), e.size())
            })
            .collect()
    }

    #[test]
    fn test_parts_close_only_between_files() -> anyhow::Result<()> {
        let capture = TempDir::new()?;
        let out = TempDir::new()?;
        let sizes = [("a.t.00000.sql", 6000u64), ("b.t.00000.sql", 6000), ("c.t.00000.sql", 100)];
        for (name, size) in sizes {
            std::fs::write(capture.path().join(name), vec![b'x'; size as usize])?;
        }

        // The first file alone crosses the threshold mid-file
        let items = mapping_package(capture.path(), out.path(), "tgt", 4096, &RateLimiter::unlimited())?;

        let parts: Vec<&TarFileItem> = items.iter().filter(|i| i.is_standalone()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].file_name, "tgt_0.tar");
        assert_eq!(parts[2].file_name, "tgt_2.tar");
        assert!(parts.iter().all(|p| p.file_type == FileType::Tar));

        // Every member is whole inside the part the manifest says
        let expected: HashMap<&str, u64> = sizes.iter().cloned().collect();
        for member in items.iter().filter(|i| !i.is_standalone()) {
            let part = member.tar_file_name.as_deref().unwrap();
            let inside = members_of(&out.path().join(part));
            let wanted = format!("tgt/{}", member.file_name);
            let (_, size) = inside.iter().find(|(n, _)| *n == wanted).unwrap();
            assert_eq!(*size, expected[member.file_name.as_str()]);
            assert_eq!(member.file_type, FileType::Data);
        }

        // Sources are gone
        assert!(walk_sorted(capture.path(), &WalkOptions::default())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_small_capture_fits_one_part() -> anyhow::Result<()> {
        let capture = TempDir::new()?;
        let out = TempDir::new()?;
        std::fs::write(capture.path().join("db1-schema-create.sql"), b"CREATE DATABASE db1;")?;
        std::fs::write(capture.path().join("db1.t1-schema.sql"), b"CREATE TABLE t1(id int);")?;
        std::fs::write(capture.path().join("metadata"), b"[master]\n")?;

        let items = mapping_package(
            capture.path(),
            out.path(),
            "tgt",
            1024 * 1024,
            &RateLimiter::unlimited(),
        )?;
        let types: Vec<FileType> = items.iter().map(|i| i.file_type).collect();
        assert_eq!(
            types,
            vec![FileType::Schema, FileType::Schema, FileType::Metadata, FileType::Tar]
        );
        assert_eq!(items[1].database.as_deref(), Some("db1"));
        assert_eq!(items[1].table.as_deref(), Some("t1"));
        assert_eq!(members_of(&out.path().join("tgt_0.tar")).len(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_capture_produces_nothing() -> anyhow::Result<()> {
        let capture = TempDir::new()?;
        let out = TempDir::new()?;
        let items = mapping_package(capture.path(), out.path(), "tgt", 4096, &RateLimiter::unlimited())?;
        assert!(items.is_empty());
        Ok(())
    }
}
