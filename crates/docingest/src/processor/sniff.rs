//! Content sniffing by magic bytes.
//!
//! The declared type comes from the file extension; the sniffed kind comes
//! from the bytes themselves. Extraction only runs when the two agree.

use std::fmt;

use crate::config::schema::DeclaredType;
use crate::error::ExtractionFailure;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_HEADER_WINDOW: usize = 1024;
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Pdf,
    Png,
    Jpeg,
    /// A ZIP container, which is what OOXML documents are.
    Zip,
    /// An OLE2 compound file: legacy Office formats and encrypted OOXML.
    Ole,
    Unknown,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentKind::Pdf => "pdf",
            ContentKind::Png => "png",
            ContentKind::Jpeg => "jpeg",
            ContentKind::Zip => "zip container",
            ContentKind::Ole => "ole2 container",
            ContentKind::Unknown => "unknown content",
        };
        f.write_str(name)
    }
}

pub fn sniff(bytes: &[u8]) -> ContentKind {
    if bytes.starts_with(PNG_MAGIC) {
        ContentKind::Png
    } else if bytes.starts_with(JPEG_MAGIC) {
        ContentKind::Jpeg
    } else if bytes.starts_with(ZIP_MAGIC) {
        ContentKind::Zip
    } else if bytes.starts_with(OLE_MAGIC) {
        ContentKind::Ole
    } else if has_pdf_header(bytes) {
        ContentKind::Pdf
    } else {
        ContentKind::Unknown
    }
}

// Readers accept junk before the header as long as it sits in the first KiB.
fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window
        .windows(PDF_MAGIC.len())
        .any(|candidate| candidate == PDF_MAGIC)
}

pub fn check_declared(declared: DeclaredType, kind: ContentKind) -> Result<(), ExtractionFailure> {
    let compatible = match declared {
        DeclaredType::Pdf => kind == ContentKind::Pdf,
        DeclaredType::Image => matches!(kind, ContentKind::Png | ContentKind::Jpeg),
        DeclaredType::Docx | DeclaredType::Xlsx => {
            if kind == ContentKind::Ole {
                return Err(ExtractionFailure::Unsupported {
                    reason: "password-protected or legacy container".to_string(),
                });
            }
            kind == ContentKind::Zip
        }
    };

    if compatible {
        Ok(())
    } else {
        Err(ExtractionFailure::TypeMismatch {
            declared: declared.to_string(),
            detected: kind.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_signatures() {
        assert_eq!(sniff(b"%PDF-1.7\n..."), ContentKind::Pdf);
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0"), ContentKind::Png);
        assert_eq!(sniff(b"\xFF\xD8\xFF\xE0JFIF"), ContentKind::Jpeg);
        assert_eq!(sniff(b"PK\x03\x04\x14\0"), ContentKind::Zip);
        assert_eq!(
            sniff(b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1\0\0"),
            ContentKind::Ole
        );
        assert_eq!(sniff(b"plain text"), ContentKind::Unknown);
    }

    #[test]
    fn test_pdf_header_after_leading_junk() {
        let mut bytes = vec![b' '; 100];
        bytes.extend_from_slice(b"%PDF-1.4");
        assert_eq!(sniff(&bytes), ContentKind::Pdf);

        let mut too_late = vec![b' '; 2048];
        too_late.extend_from_slice(b"%PDF-1.4");
        assert_eq!(sniff(&too_late), ContentKind::Unknown);
    }

    #[test]
    fn test_check_declared_accepts_matching_content() {
        assert!(check_declared(DeclaredType::Pdf, ContentKind::Pdf).is_ok());
        assert!(check_declared(DeclaredType::Image, ContentKind::Jpeg).is_ok());
        assert!(check_declared(DeclaredType::Image, ContentKind::Png).is_ok());
        assert!(check_declared(DeclaredType::Docx, ContentKind::Zip).is_ok());
        assert!(check_declared(DeclaredType::Xlsx, ContentKind::Zip).is_ok());
    }

    #[test]
    fn test_check_declared_rejects_mismatch() {
        let err = check_declared(DeclaredType::Pdf, ContentKind::Png).unwrap_err();
        assert_eq!(
            err,
            ExtractionFailure::TypeMismatch {
                declared: "pdf".to_string(),
                detected: "png".to_string(),
            }
        );
    }

    #[test]
    fn test_ole_container_is_protected_or_legacy() {
        let err = check_declared(DeclaredType::Docx, ContentKind::Ole).unwrap_err();
        assert!(matches!(err, ExtractionFailure::Unsupported { .. }));
    }
}
