//! Snapshot archive codec
//!
//! A snapshot is a zip container with two top-level sections:
//!
//! ```text
//! mappings/<id>.json   one mapping document per entry, sorted by id
//! __files/<name>       one response body per entry, sorted by name
//! ```
//!
//! Entry timestamps are pinned so identical state encodes to identical bytes.

mod directory;
mod reader;
mod writer;

use std::collections::{BTreeMap, BTreeSet};

pub use directory::{clear_directory, read_from_directory, write_to_directory, DirectoryContents};
pub use reader::decode;
pub use writer::encode;

use crate::config::LimitsConfig;
use crate::mapping::Mapping;
use crate::{Result, StubvaultError};

/// Section holding mapping documents
pub const MAPPINGS_DIR: &str = "mappings";

/// Section holding response body files
pub const FILES_DIR: &str = "__files";

/// Logical content of a snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveContents {
    /// Mappings, sorted by id after decoding
    pub mappings: Vec<Mapping>,
    /// Body files keyed by path relative to `__files/`
    pub bodies: BTreeMap<String, Vec<u8>>,
}

impl ArchiveContents {
    /// Check that ids are unique, names are safe and every body reference
    /// resolves to a body in this set
    ///
    /// # Errors
    ///
    /// Returns `CorruptArchive` describing the first inconsistency
    pub fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for mapping in &self.mappings {
            mapping
                .validate()
                .map_err(|e| StubvaultError::CorruptArchive(e.to_string()))?;

            if !ids.insert(mapping.id.as_str()) {
                return Err(StubvaultError::CorruptArchive(format!(
                    "Duplicate mapping id: {}",
                    mapping.id
                )));
            }

            if let Some(file) = mapping.response.body_reference() {
                if !self.bodies.contains_key(file) {
                    return Err(StubvaultError::CorruptArchive(format!(
                        "Mapping {} references missing body file {FILES_DIR}/{file}",
                        mapping.id
                    )));
                }
            }
        }

        for name in self.bodies.keys() {
            if normalize_entry_path(name).as_deref() != Some(name.as_str()) {
                return Err(StubvaultError::CorruptArchive(format!(
                    "Unsafe body file name: {name}"
                )));
            }
        }

        Ok(())
    }
}

/// Bounds applied while decoding untrusted archives
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    /// Maximum size of the compressed archive
    pub max_archive_size: usize,
    /// Maximum uncompressed size of one entry
    pub max_entry_size: usize,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for ArchiveLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_archive_size: limits.max_archive_size,
            max_entry_size: limits.max_entry_size,
            max_entries: limits.max_archive_entries,
        }
    }
}

/// Normalize an archive entry name to a safe relative forward-slash path
///
/// Returns `None` for absolute paths, drive prefixes, `..` components,
/// NUL bytes and names that normalize to nothing.
#[must_use]
pub fn normalize_entry_path(raw: &str) -> Option<String> {
    if raw.contains('\0') {
        return None;
    }

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return None;
    }

    let mut chars = unified.chars();
    if let (Some(first), Some(':')) = (chars.next(), chars.next()) {
        if first.is_ascii_alphabetic() {
            return None;
        }
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return None;
    }

    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_accepts_relative_paths() {
        assert_eq!(
            normalize_entry_path("mappings/a.json").as_deref(),
            Some("mappings/a.json")
        );
        assert_eq!(
            normalize_entry_path("__files\\nested\\b.bin").as_deref(),
            Some("__files/nested/b.bin")
        );
        assert_eq!(
            normalize_entry_path("./mappings//a.json").as_deref(),
            Some("mappings/a.json")
        );
        assert_eq!(normalize_entry_path("mappings/").as_deref(), Some("mappings"));
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert_eq!(normalize_entry_path("../../evil"), None);
        assert_eq!(normalize_entry_path("mappings/../../evil"), None);
        assert_eq!(normalize_entry_path("..\\evil"), None);
        assert_eq!(normalize_entry_path("/etc/passwd"), None);
        assert_eq!(normalize_entry_path("C:\\windows\\evil"), None);
        assert_eq!(normalize_entry_path("a\0b"), None);
        assert_eq!(normalize_entry_path(""), None);
        assert_eq!(normalize_entry_path("./"), None);
    }

    #[test]
    fn test_validate_detects_dangling_reference() {
        let mut mapping = Mapping::get("m1", "/a", 200, "x");
        mapping.response.body = None;
        mapping.response.body_file_name = Some("a.json".to_string());

        let contents = ArchiveContents {
            mappings: vec![mapping],
            bodies: BTreeMap::new(),
        };

        assert!(matches!(
            contents.validate(),
            Err(StubvaultError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_validate_detects_duplicate_ids() {
        let contents = ArchiveContents {
            mappings: vec![
                Mapping::get("m1", "/a", 200, "x"),
                Mapping::get("m1", "/b", 200, "y"),
            ],
            bodies: BTreeMap::new(),
        };

        assert!(contents.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_restores_encoded_contents(
            bodies in proptest::collection::vec("\\PC{0,64}", 0..8),
            files in proptest::collection::btree_map(
                "[a-z]{1,8}(/[a-z]{1,8})?\\.bin",
                proptest::collection::vec(any::<u8>(), 0..256),
                0..4,
            ),
        ) {
            let mappings = bodies
                .iter()
                .enumerate()
                .map(|(i, body)| Mapping::get(format!("m{i:03}"), format!("/items/{i}"), 200, body.clone()))
                .collect();
            let contents = ArchiveContents { mappings, bodies: files };

            let decoded = decode(&encode(&contents).unwrap(), &ArchiveLimits::default()).unwrap();
            prop_assert_eq!(decoded, contents);
        }
    }
}
