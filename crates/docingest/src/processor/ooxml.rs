//! Helpers shared by the DOCX and XLSX extractors.

use std::io::{Cursor, Read};

use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesRef, BytesText};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ExtractionFailure;

pub(crate) type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

pub(crate) fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractionFailure> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractionFailure::Corrupt {
        reason: format!("failed to open container: {}", e),
    })
}

/// Reads a part of the package. `Ok(None)` means the part does not exist.
pub(crate) fn read_part(
    archive: &mut Archive<'_>,
    name: &str,
) -> Result<Option<String>, ExtractionFailure> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(ExtractionFailure::Corrupt {
                reason: format!("failed to open {}: {}", name, e),
            })
        }
    };

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| ExtractionFailure::Corrupt {
            reason: format!("failed to read {}: {}", name, e),
        })?;
    Ok(Some(xml))
}

pub(crate) fn push_text(out: &mut String, text: &BytesText<'_>) {
    if let Ok(decoded) = text.decode() {
        out.push_str(&decoded);
    }
}

/// Appends the character behind `&amp;`, `&#65;` and friends.
pub(crate) fn push_reference(out: &mut String, reference: &BytesRef<'_>) {
    if let Ok(Some(ch)) = reference.resolve_char_ref() {
        out.push(ch);
        return;
    }
    if let Ok(name) = reference.decode() {
        if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(&name) {
            out.push_str(resolved);
        }
    }
}

/// Value of the attribute whose local name (namespace prefix ignored) matches.
pub(crate) fn attribute(attributes: Attributes<'_>, local_name: &[u8]) -> Option<String> {
    attributes
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == local_name)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

pub(crate) fn xml_error(part: &str, err: impl std::fmt::Display) -> ExtractionFailure {
    ExtractionFailure::Corrupt {
        reason: format!("malformed XML in {}: {}", part, err),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Packs `(name, contents)` pairs into an in-memory ZIP.
    pub fn build_zip(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in parts {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}
