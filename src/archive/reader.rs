//! Archive decoder

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use tracing::debug;
use zip::ZipArchive;

use super::{normalize_entry_path, ArchiveContents, ArchiveLimits, FILES_DIR, MAPPINGS_DIR};
use crate::mapping::Mapping;
use crate::{Result, StubvaultError};

/// Decode a snapshot archive entirely in memory
///
/// Either every entry decodes and every body reference resolves, or the
/// call fails and nothing is returned. Nothing is written to disk.
///
/// # Errors
///
/// Returns `CorruptArchive` if the archive exceeds `limits.max_archive_size`,
/// the container cannot be opened, an entry name is unsafe or duplicated, an
/// entry is oversized, a mapping fails to parse or a body reference is
/// dangling
pub fn decode(bytes: &[u8], limits: &ArchiveLimits) -> Result<ArchiveContents> {
    if bytes.len() > limits.max_archive_size {
        return Err(StubvaultError::CorruptArchive(format!(
            "Archive too large: {} > {} bytes",
            bytes.len(),
            limits.max_archive_size
        )));
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| StubvaultError::CorruptArchive(format!("Cannot open archive: {e}")))?;

    if archive.len() > limits.max_entries {
        return Err(StubvaultError::CorruptArchive(format!(
            "Too many entries: {} > {}",
            archive.len(),
            limits.max_entries
        )));
    }

    let mut mappings: BTreeMap<String, Mapping> = BTreeMap::new();
    let mut bodies: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| StubvaultError::CorruptArchive(format!("Cannot read entry {i}: {e}")))?;

        let raw_name = entry.name().to_string();
        let name = normalize_entry_path(&raw_name).ok_or_else(|| {
            StubvaultError::CorruptArchive(format!("Unsafe entry name: {raw_name}"))
        })?;

        if entry.is_dir() {
            continue;
        }

        if entry.size() > limits.max_entry_size as u64 {
            return Err(StubvaultError::CorruptArchive(format!(
                "Entry {name} too large: {} > {}",
                entry.size(),
                limits.max_entry_size
            )));
        }

        let section = name.split_once('/');
        let (section, rest) = match section {
            Some((section, rest)) if section == MAPPINGS_DIR || section == FILES_DIR => {
                (section, rest)
            }
            _ => {
                debug!("Ignoring archive entry outside known sections: {}", name);
                continue;
            }
        };

        if section == MAPPINGS_DIR && !rest.ends_with(".json") {
            debug!("Ignoring non-JSON mapping entry: {}", name);
            continue;
        }

        // The declared size comes from the archive itself, so cap the read too
        let mut data = Vec::new();
        (&mut entry)
            .take(limits.max_entry_size as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|e| StubvaultError::CorruptArchive(format!("Cannot inflate {name}: {e}")))?;
        if data.len() > limits.max_entry_size {
            return Err(StubvaultError::CorruptArchive(format!(
                "Entry {name} inflates beyond {} bytes",
                limits.max_entry_size
            )));
        }

        if section == MAPPINGS_DIR {
            let mapping = Mapping::from_json(&data)
                .map_err(|e| StubvaultError::CorruptArchive(format!("{name}: {e}")))?;
            match mappings.entry(mapping.id.clone()) {
                Entry::Occupied(_) => {
                    return Err(StubvaultError::CorruptArchive(format!(
                        "Duplicate mapping id {} in {name}",
                        mapping.id
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(mapping);
                }
            }
        } else {
            match bodies.entry(rest.to_string()) {
                Entry::Occupied(_) => {
                    return Err(StubvaultError::CorruptArchive(format!(
                        "Duplicate body file {name}"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(data);
                }
            }
        }
    }

    let contents = ArchiveContents {
        mappings: mappings.into_values().collect(),
        bodies,
    };
    contents.validate()?;

    debug!(
        "Decoded archive: {} mappings, {} body files",
        contents.mappings.len(),
        contents.bodies.len()
    );

    Ok(contents)
}
