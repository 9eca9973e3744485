use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use lopdf::Object;

use crate::config::schema::DeclaredType;
use crate::error::{EngineError, ExtractionFailure};
use crate::processor::ocr::OcrEngine;
use crate::processor::rasterizer::PdfRasterizer;
use crate::processor::{
    ExtractionMetadata, ExtractionResult, Extractor, UnitSource, UnitTextBuilder,
};

#[derive(Debug, Clone, Copy)]
pub struct PdfOptions {
    /// Embedded text with fewer non-whitespace characters is treated as absent.
    pub min_page_chars: usize,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self { min_page_chars: 20 }
    }
}

pub struct PdfExtractor {
    ocr: Arc<dyn OcrEngine>,
    rasterizer: Arc<dyn PdfRasterizer>,
    options: PdfOptions,
}

impl PdfExtractor {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        rasterizer: Arc<dyn PdfRasterizer>,
        options: PdfOptions,
    ) -> Self {
        Self {
            ocr,
            rasterizer,
            options,
        }
    }
}

impl Extractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        let _span = tracing::info_span!("processor.pdf", bytes = bytes.len()).entered();

        match lopdf::Document::load_mem(bytes) {
            Ok(doc) => {
                let embedded: Vec<Option<String>> = doc
                    .get_pages()
                    .keys()
                    .map(|page_num| doc.extract_text(&[*page_num]).ok())
                    .collect();
                let mut result = self.assemble(bytes, embedded);
                result.metadata.properties.extend(document_info(&doc));
                result
            }
            Err(e) => {
                // lopdf rejects some damaged cross-reference tables that poppler still renders
                tracing::warn!("lopdf failed to parse PDF: {}. Falling back to OCR.", e);
                match self.rasterizer.page_count(bytes) {
                    Ok(count) => self.assemble(bytes, vec![None; count]),
                    Err(fallback) => ExtractionResult::failed(ExtractionFailure::Corrupt {
                        reason: format!(
                            "failed to load PDF ({}); page count fallback failed: {}",
                            e, fallback
                        ),
                    }),
                }
            }
        }
    }

    fn supports(&self, declared: DeclaredType) -> bool {
        matches!(declared, DeclaredType::Pdf)
    }
}

impl PdfExtractor {
    /// Builds the document text page by page, OCRing pages without usable
    /// embedded text. A failed page contributes an empty string and a note.
    fn assemble(&self, bytes: &[u8], embedded: Vec<Option<String>>) -> ExtractionResult {
        let page_count = embedded.len();
        if page_count == 0 {
            return ExtractionResult::failed(ExtractionFailure::Corrupt {
                reason: "PDF has no pages".to_string(),
            });
        }

        let mut builder = UnitTextBuilder::new("\n\n");
        let mut notes = Vec::new();
        let mut unavailable = 0usize;
        let mut ocr_pages = 0usize;

        for (index, text) in embedded.into_iter().enumerate() {
            let label = format!("page {}", index + 1);

            if let Some(text) = text.filter(|t| self.has_usable_text(t)) {
                builder.push(label, UnitSource::Embedded, text.trim(), None);
                continue;
            }

            ocr_pages += 1;
            match self.ocr_page(bytes, index) {
                Ok(text) => builder.push(label, UnitSource::Ocr, text.trim(), None),
                Err(err) => {
                    if matches!(err, EngineError::Unavailable(_)) {
                        unavailable += 1;
                    }
                    let note = format!("page {}: {}", index + 1, err);
                    tracing::debug!("{}", note);
                    builder.push(label, UnitSource::Failed, "", Some(note.clone()));
                    notes.push(note);
                }
            }
        }

        let (text, units) = builder.finish();
        let metadata = ExtractionMetadata {
            page_count: Some(page_count),
            units,
            notes,
            ..ExtractionMetadata::default()
        }
        .with_property("ocr_pages", ocr_pages);

        if metadata.notes.len() == page_count {
            let failure = if unavailable == page_count {
                ExtractionFailure::EngineUnavailable {
                    engine: "ocr".to_string(),
                    reason: metadata.notes[0].clone(),
                }
            } else {
                ExtractionFailure::AllUnitsFailed {
                    count: page_count,
                    first: metadata.notes[0].clone(),
                }
            };
            return ExtractionResult::failed_with_metadata(failure, metadata);
        }

        ExtractionResult::success(text, metadata)
    }

    fn ocr_page(&self, bytes: &[u8], page_index: usize) -> Result<String, EngineError> {
        let image = self.rasterizer.render(bytes, page_index)?;
        self.ocr.recognize(&image)
    }

    fn has_usable_text(&self, text: &str) -> bool {
        let visible = text.chars().filter(|c| !c.is_whitespace()).count();
        visible > 0 && visible >= self.options.min_page_chars && !looks_garbled(text)
    }
}

/// Info dictionary entries copied into the extraction properties.
const INFO_KEYS: [(&str, &[u8]); 8] = [
    ("title", b"Title"),
    ("author", b"Author"),
    ("subject", b"Subject"),
    ("keywords", b"Keywords"),
    ("creator", b"Creator"),
    ("producer", b"Producer"),
    ("creation_date", b"CreationDate"),
    ("mod_date", b"ModDate"),
];

/// The PDF version plus the non-empty text entries of the trailer's Info
/// dictionary. Dates are rewritten as ISO 8601 when they parse.
fn document_info(doc: &lopdf::Document) -> BTreeMap<String, serde_json::Value> {
    let mut properties = BTreeMap::new();
    properties.insert("pdf_version".to_string(), doc.version.clone().into());

    let Some(info) = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_dict().ok())
    else {
        return properties;
    };

    for (key, name) in INFO_KEYS {
        let Some(Object::String(bytes, _)) = info.get(name).ok().and_then(|obj| resolve(doc, obj))
        else {
            continue;
        };
        let text = decode_text_string(bytes);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let value = if key.ends_with("_date") {
            pdf_date(text).unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        };
        properties.insert(key.to_string(), value.into());
    }
    properties
}

fn resolve<'a>(doc: &'a lopdf::Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// PDF text strings are UTF-16BE or UTF-8 behind a byte order mark, and
/// PDFDocEncoding otherwise, read here as Latin-1.
fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// `D:YYYYMMDDHHmmSS` with optional trailing fields and zone, as local
/// time without the offset.
fn pdf_date(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim_start_matches("D:")
        .chars()
        .take_while(char::is_ascii_digit)
        .take(14)
        .collect();
    if digits.len() < 8 {
        return None;
    }
    let digits = format!("{:0<14}", digits);
    NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Pattern for Identity-H Unimplemented errors (common with CID fonts).
const IDENTITY_H_PATTERN: &str = "?Identity-H Unimplemented?";

/// Below this many characters the alphanumeric ratio check is skipped.
const MIN_TOTAL_CHARS: usize = 50;

const MIN_ALPHANUMERIC_PERCENT: usize = 10;

/// True when extracted text is font-encoding noise rather than content.
fn looks_garbled(text: &str) -> bool {
    let trimmed = text.trim();

    let cleaned = trimmed
        .replace(IDENTITY_H_PATTERN, "")
        .replace(['\n', ' '], "");
    if cleaned.is_empty() {
        return true;
    }

    let total_chars = trimmed.chars().count();
    let alphanumeric_chars = trimmed.chars().filter(|c| c.is_alphanumeric()).count();

    total_chars > MIN_TOTAL_CHARS
        && alphanumeric_chars * 100 < total_chars * MIN_ALPHANUMERIC_PERCENT
}
