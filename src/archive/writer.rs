//! Archive encoder

use std::io::{Cursor, Write};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::{ArchiveContents, FILES_DIR, MAPPINGS_DIR};
use crate::{Result, StubvaultError};

/// Encode mappings and bodies into a zip archive
///
/// Mappings are written sorted by id, bodies sorted by name, with a fixed
/// entry timestamp, so encoding the same logical state twice yields the
/// same bytes.
///
/// # Errors
///
/// Returns `CorruptArchive` if the contents are not self-consistent, or an
/// error if the zip stream cannot be written
pub fn encode(contents: &ArchiveContents) -> Result<Vec<u8>> {
    contents.validate()?;

    let mut mappings: Vec<_> = contents.mappings.iter().collect();
    mappings.sort_by(|a, b| a.id.cmp(&b.id));

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for mapping in mappings {
        let name = format!("{MAPPINGS_DIR}/{}", mapping.file_name());
        zip.start_file(name, options).map_err(zip_error)?;
        zip.write_all(&mapping.to_json()?)?;
    }

    // BTreeMap iteration is already sorted by name
    for (name, body) in &contents.bodies {
        zip.start_file(format!("{FILES_DIR}/{name}"), options)
            .map_err(zip_error)?;
        zip.write_all(body)?;
    }

    let bytes = zip.finish().map_err(zip_error)?.into_inner();

    debug!(
        "Encoded archive: {} mappings, {} body files, {} bytes",
        contents.mappings.len(),
        contents.bodies.len(),
        bytes.len()
    );

    Ok(bytes)
}

fn zip_error(e: zip::result::ZipError) -> StubvaultError {
    StubvaultError::Other(format!("Failed to write archive: {e}"))
}
