use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::schema::DeclaredType;
use crate::error::ExtractionFailure;
use crate::processor::ooxml::{self, attribute, push_reference, push_text, Archive};
use crate::processor::{
    ExtractionMetadata, ExtractionResult, Extractor, UnitSource, UnitTextBuilder,
};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

pub struct XlsxExtractor;

impl XlsxExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for XlsxExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SheetRef {
    name: String,
    rel_id: Option<String>,
}

impl Extractor for XlsxExtractor {
    fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        let _span = tracing::info_span!("processor.xlsx", bytes = bytes.len()).entered();

        match extract_workbook(bytes) {
            Ok(Some(result)) => result,
            Ok(None) => ExtractionResult::unsupported(ExtractionFailure::Unsupported {
                reason: "not a spreadsheet document".to_string(),
            }),
            Err(failure) => ExtractionResult::failed(failure),
        }
    }

    fn supports(&self, declared: DeclaredType) -> bool {
        matches!(declared, DeclaredType::Xlsx)
    }
}

/// `Ok(None)` when the container has no workbook part.
fn extract_workbook(bytes: &[u8]) -> Result<Option<ExtractionResult>, ExtractionFailure> {
    let mut archive = ooxml::open_archive(bytes)?;

    let Some(workbook_xml) = ooxml::read_part(&mut archive, WORKBOOK_PART)? else {
        return Ok(None);
    };
    let sheets = parse_workbook(&workbook_xml)?;

    let targets = match ooxml::read_part(&mut archive, WORKBOOK_RELS_PART)? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };
    let shared = match ooxml::read_part(&mut archive, SHARED_STRINGS_PART)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut builder = UnitTextBuilder::new("\n\n");
    let mut notes = Vec::new();
    let mut cell_count = 0usize;

    for (index, sheet) in sheets.iter().enumerate() {
        let part = sheet_part(sheet, index, &targets);
        match read_sheet(&mut archive, &part, &shared) {
            Ok(Some((rows, cells))) => {
                cell_count += cells;
                builder.push(sheet.name.clone(), UnitSource::Cells, &rows.join("\n"), None);
            }
            Ok(None) => {
                let note = format!("sheet '{}': part {} is missing", sheet.name, part);
                builder.push(sheet.name.clone(), UnitSource::Failed, "", Some(note.clone()));
                notes.push(note);
            }
            Err(failure) => {
                let note = format!("sheet '{}': {}", sheet.name, failure);
                builder.push(sheet.name.clone(), UnitSource::Failed, "", Some(note.clone()));
                notes.push(note);
            }
        }
    }

    if !sheets.is_empty() && notes.len() == sheets.len() {
        return Err(ExtractionFailure::AllUnitsFailed {
            count: sheets.len(),
            first: notes[0].clone(),
        });
    }

    let (text, units) = builder.finish();
    let metadata = ExtractionMetadata {
        page_count: Some(sheets.len()),
        units,
        notes,
        ..ExtractionMetadata::default()
    }
    .with_property("sheets", sheets.len())
    .with_property("cells", cell_count);

    Ok(Some(ExtractionResult::success(text, metadata)))
}

fn sheet_part(sheet: &SheetRef, index: usize, targets: &HashMap<String, String>) -> String {
    sheet
        .rel_id
        .as_ref()
        .and_then(|id| targets.get(id))
        .map(|target| match target.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => format!("xl/{}", target),
        })
        .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", index + 1))
}

fn read_sheet(
    archive: &mut Archive<'_>,
    part: &str,
    shared: &[String],
) -> Result<Option<(Vec<String>, usize)>, ExtractionFailure> {
    match ooxml::read_part(archive, part)? {
        Some(xml) => parse_sheet(&xml, part, shared).map(Some),
        None => Ok(None),
    }
}

fn parse_workbook(xml: &str) -> Result<Vec<SheetRef>, ExtractionFailure> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"sheet" =>
            {
                let name = attribute(e.attributes(), b"name")
                    .unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
                sheets.push(SheetRef {
                    name,
                    rel_id: attribute(e.attributes(), b"id"),
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml::xml_error(WORKBOOK_PART, e)),
            _ => {}
        }
    }

    Ok(sheets)
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>, ExtractionFailure> {
    let mut reader = Reader::from_str(xml);
    let mut targets = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (
                    attribute(e.attributes(), b"Id"),
                    attribute(e.attributes(), b"Target"),
                ) {
                    targets.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml::xml_error(WORKBOOK_RELS_PART, e)),
            _ => {}
        }
    }

    Ok(targets)
}

/// Shared strings in table order. Phonetic runs (`rPh`) are skipped.
fn parse_shared_strings(xml: &str) -> Result<Vec<String>, ExtractionFailure> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut phonetic_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"rPh" => phonetic_depth += 1,
                b"t" => in_text = phonetic_depth == 0,
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"si" => {
                strings.push(String::new());
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_text => push_text(&mut current, e),
            Ok(Event::GeneralRef(ref e)) if in_text => push_reference(&mut current, e),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml::xml_error(SHARED_STRINGS_PART, e)),
            _ => {}
        }
    }

    Ok(strings)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Boolean,
    Inline,
    Plain,
}

impl CellKind {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("s") => CellKind::Shared,
            Some("b") => CellKind::Boolean,
            Some("inlineStr") => CellKind::Inline,
            // "str", "e", "n" and untyped numbers are stored as written
            _ => CellKind::Plain,
        }
    }
}

/// Rows of one worksheet as space-joined cell values, plus the count of
/// non-empty cells. Formulas are skipped; their cached values are kept.
fn parse_sheet(
    xml: &str,
    part: &str,
    shared: &[String],
) -> Result<(Vec<String>, usize), ExtractionFailure> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cells = 0usize;

    let mut kind = CellKind::Plain;
    let mut raw = String::new();
    let mut capture = false;
    let mut in_phonetic = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    kind = CellKind::from_attr(attribute(e.attributes(), b"t").as_deref());
                    raw.clear();
                }
                b"v" => capture = true,
                b"t" if kind == CellKind::Inline && !in_phonetic => capture = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"rPh" => in_phonetic = false,
                b"c" => {
                    if let Some(value) = cell_value(kind, raw.trim(), shared) {
                        cells += 1;
                        row.push(value);
                    }
                    raw.clear();
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) if capture => push_text(&mut raw, e),
            Ok(Event::GeneralRef(ref e)) if capture => push_reference(&mut raw, e),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml::xml_error(part, e)),
            _ => {}
        }
    }

    Ok((rows, cells))
}

fn cell_value(kind: CellKind, raw: &str, shared: &[String]) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let value = match kind {
        CellKind::Shared => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i))
            .map(|s| s.trim().to_string())?,
        CellKind::Boolean => match raw {
            "1" => "TRUE".to_string(),
            _ => "FALSE".to_string(),
        },
        CellKind::Inline | CellKind::Plain => raw.to_string(),
    };
    (!value.is_empty()).then_some(value)
}


#[cfg(test)]
mod tests {
    use super::test_support::build_xlsx;
    use super::*;
    use crate::processor::ooxml::test_support::build_zip;
    use crate::processor::ExtractionStatus;

    #[test]
    fn test_supports_xlsx_type() {
        let extractor = XlsxExtractor::new();
        assert!(extractor.supports(DeclaredType::Xlsx));
        assert!(!extractor.supports(DeclaredType::Docx));
    }

    #[test]
    fn test_sheets_become_units() {
        let bytes = build_xlsx(&[
            ("Budget", &[&["Rent", "900"], &["Food", "300"]]),
            ("Notes", &[&["paid"]]),
        ]);
        let result = XlsxExtractor::new().extract(&bytes);
        assert!(result.is_success());
        assert_eq!(result.text, "Rent 900\nFood 300\n\npaid");

        let units = &result.metadata.units;
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].label, "Budget");
        assert_eq!(units[1].source, UnitSource::Cells);
        assert_eq!(&result.text[units[1].start..units[1].end], "paid");
        assert_eq!(result.metadata.properties["cells"], 5);
    }

    #[test]
    fn test_cell_types() {
        let shared = vec!["Alpha".to_string(), "  Beta ".to_string()];
        let xml = r#"<worksheet><sheetData>
            <row r="1">
              <c r="A1" t="s"><v>1</v></c>
              <c r="B1" t="b"><v>1</v></c>
              <c r="C1"><f>SUM(D1:D2)</f><v>42.5</v></c>
              <c r="D1" t="str"><f>A1</f><v>Alpha</v></c>
              <c r="E1" t="e"><v>#DIV/0!</v></c>
              <c r="F1" t="s"><v>99</v></c>
              <c r="G1"/>
            </row>
            <row r="2"><c r="A2" t="b"><v>0</v></c></row>
            <row r="3"></row>
        </sheetData></worksheet>"#;
        let (rows, cells) = parse_sheet(xml, "sheet1.xml", &shared).unwrap();
        assert_eq!(rows, vec!["Beta TRUE 42.5 Alpha #DIV/0!", "FALSE"]);
        assert_eq!(cells, 6);
    }

    #[test]
    fn test_shared_strings_skip_phonetic_runs() {
        let xml = r#"<sst>
            <si><t>Plain</t></si>
            <si><r><t>Rich </t></r><r><t>text</t></r></si>
            <si><t>東京</t><rPh sb="0" eb="2"><t>トウキョウ</t></rPh></si>
            <si/>
        </sst>"#;
        let strings = parse_shared_strings(xml).unwrap();
        assert_eq!(strings, vec!["Plain", "Rich text", "東京", ""]);
    }

    #[test]
    fn test_sheet_part_resolution() {
        let mut targets = HashMap::new();
        targets.insert("rId1".to_string(), "worksheets/sheet1.xml".to_string());
        targets.insert("rId2".to_string(), "/xl/worksheets/data.xml".to_string());

        let sheet = |id: Option<&str>| SheetRef {
            name: "S".to_string(),
            rel_id: id.map(str::to_string),
        };
        assert_eq!(sheet_part(&sheet(Some("rId1")), 0, &targets), "xl/worksheets/sheet1.xml");
        assert_eq!(sheet_part(&sheet(Some("rId2")), 1, &targets), "xl/worksheets/data.xml");
        assert_eq!(sheet_part(&sheet(None), 2, &targets), "xl/worksheets/sheet3.xml");
    }

    #[test]
    fn test_missing_workbook_is_unsupported() {
        let bytes = build_zip(&[("word/document.xml", "<w:document/>")]);
        let result = XlsxExtractor::new().extract(&bytes);
        assert_eq!(result.status, ExtractionStatus::Unsupported);
    }

    #[test]
    fn test_every_sheet_missing_fails() {
        let bytes = build_zip(&[(
            "xl/workbook.xml",
            r#"<workbook><sheets><sheet name="Gone" sheetId="1"/></sheets></workbook>"#,
        )]);
        let result = XlsxExtractor::new().extract(&bytes);
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(ExtractionFailure::AllUnitsFailed { count: 1, .. })
        ));
    }
}
