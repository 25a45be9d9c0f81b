//! On-disk form of the archive layout (`<root>/mappings`, `<root>/__files`)

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::{normalize_entry_path, ArchiveContents, FILES_DIR, MAPPINGS_DIR};
use crate::mapping::Mapping;
use crate::Result;

/// Result of scanning a data directory
#[derive(Debug, Default)]
pub struct DirectoryContents {
    /// Mappings that parsed, in file name order
    pub mappings: Vec<Mapping>,
    /// Body files keyed by path relative to `__files/`
    pub bodies: BTreeMap<String, Vec<u8>>,
    /// Mapping files that could not be read or parsed
    pub skipped: usize,
}

/// Read every mapping and body file below `root`
///
/// Missing sections read as empty. A mapping file that cannot be read or
/// parsed is logged and skipped; it never aborts the scan.
///
/// # Errors
///
/// Returns error if a directory exists but cannot be listed
pub async fn read_from_directory(root: &Path) -> Result<DirectoryContents> {
    let mut contents = DirectoryContents::default();

    for (relative, path) in list_files(&root.join(MAPPINGS_DIR)).await? {
        if !relative.ends_with(".json") {
            continue;
        }

        let parsed = match fs::read(&path).await {
            Ok(data) => Mapping::from_json(&data),
            Err(e) => Err(e.into()),
        };

        match parsed {
            Ok(mapping) => {
                debug!("Loaded mapping from: {}", path.display());
                contents.mappings.push(mapping);
            }
            Err(e) => {
                warn!("Failed to load mapping from {}: {}", path.display(), e);
                contents.skipped += 1;
            }
        }
    }

    for (relative, path) in list_files(&root.join(FILES_DIR)).await? {
        let data = fs::read(&path).await?;
        contents.bodies.insert(relative, data);
    }

    Ok(contents)
}

/// Write archive contents below `root`, creating sections as needed
///
/// # Errors
///
/// Returns error if a file cannot be written
pub async fn write_to_directory(contents: &ArchiveContents, root: &Path) -> Result<()> {
    let mappings_dir = root.join(MAPPINGS_DIR);
    let files_dir = root.join(FILES_DIR);
    fs::create_dir_all(&mappings_dir).await?;
    fs::create_dir_all(&files_dir).await?;

    for mapping in &contents.mappings {
        fs::write(mappings_dir.join(mapping.file_name()), mapping.to_json()?).await?;
    }

    for (name, data) in &contents.bodies {
        // Names were validated by the codec; re-check before touching disk
        let Some(relative) = normalize_entry_path(name) else {
            return Err(crate::StubvaultError::CorruptArchive(format!(
                "Unsafe body file name: {name}"
            )));
        };
        let target = files_dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, data).await?;
    }

    Ok(())
}

/// Remove both sections below `root`
///
/// # Errors
///
/// Returns error if a section exists but cannot be removed
pub async fn clear_directory(root: &Path) -> Result<()> {
    for section in [MAPPINGS_DIR, FILES_DIR] {
        match fs::remove_dir_all(root.join(section)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// List regular files below `dir` recursively, sorted by relative path
async fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![(String::new(), dir.to_path_buf())];

    while let Some((prefix, current)) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((relative, entry.path()));
            } else if file_type.is_file() {
                files.push((relative, entry.path()));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
