use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::schema::DeclaredType;
use crate::error::ExtractionFailure;
use crate::processor::ooxml::{self, push_reference, push_text};
use crate::processor::{
    ExtractionMetadata, ExtractionResult, Extractor, UnitSource, UnitTextBuilder,
};

const DOCUMENT_PART: &str = "word/document.xml";

pub struct DocxExtractor;

impl DocxExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DocxExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for DocxExtractor {
    fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        let _span = tracing::info_span!("processor.docx", bytes = bytes.len()).entered();

        let xml = match ooxml::open_archive(bytes)
            .and_then(|mut archive| ooxml::read_part(&mut archive, DOCUMENT_PART))
        {
            Ok(Some(xml)) => xml,
            Ok(None) => {
                return ExtractionResult::unsupported(ExtractionFailure::Unsupported {
                    reason: "not a word-processing document".to_string(),
                })
            }
            Err(failure) => return ExtractionResult::failed(failure),
        };

        let body = match parse_document_xml(&xml) {
            Ok(body) => body,
            Err(failure) => return ExtractionResult::failed(failure),
        };

        let mut builder = UnitTextBuilder::new("");
        builder.push(
            "document".to_string(),
            UnitSource::Embedded,
            &body.lines.join("\n"),
            None,
        );
        let (text, units) = builder.finish();

        let metadata = ExtractionMetadata {
            units,
            ..ExtractionMetadata::default()
        }
        .with_property("paragraphs", body.paragraphs)
        .with_property("table_rows", body.table_rows);

        ExtractionResult::success(text, metadata)
    }

    fn supports(&self, declared: DeclaredType) -> bool {
        matches!(declared, DeclaredType::Docx)
    }
}

#[derive(Debug, Default)]
struct DocumentBody {
    lines: Vec<String>,
    paragraphs: usize,
    table_rows: usize,
}

/// Walks `word/document.xml`. Body paragraphs become lines; a table row
/// becomes one line of its non-empty cells separated by spaces.
fn parse_document_xml(xml: &str) -> Result<DocumentBody, ExtractionFailure> {
    let mut reader = Reader::from_str(xml);

    let mut body = DocumentBody::default();
    let mut paragraph = String::new();
    let mut cell = String::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut in_text = false;
    let mut table_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tbl" => table_depth += 1,
                b"tr" if table_depth == 1 => row_cells.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" | b"br" | b"cr" => paragraph.push(' '),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = paragraph.trim().to_string();
                    paragraph.clear();
                    if table_depth == 0 {
                        body.paragraphs += 1;
                        if !line.is_empty() {
                            body.lines.push(line);
                        }
                    } else if !line.is_empty() {
                        if !cell.is_empty() {
                            cell.push(' ');
                        }
                        cell.push_str(&line);
                    }
                }
                b"tc" if table_depth == 1 => {
                    let text = cell.trim().to_string();
                    if !text.is_empty() {
                        row_cells.push(text);
                    }
                    cell.clear();
                }
                b"tr" if table_depth == 1 => {
                    body.table_rows += 1;
                    if !row_cells.is_empty() {
                        body.lines.push(row_cells.join(" "));
                    }
                    row_cells.clear();
                }
                b"tbl" => table_depth = table_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_text => push_text(&mut paragraph, e),
            Ok(Event::GeneralRef(ref e)) if in_text => push_reference(&mut paragraph, e),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml::xml_error(DOCUMENT_PART, e)),
            _ => {}
        }
    }

    Ok(body)
}
