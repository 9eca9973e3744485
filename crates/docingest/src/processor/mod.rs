pub mod docx;
pub mod image;
pub mod ocr;
pub mod ooxml;
pub mod pdf;
pub mod rasterizer;
pub mod sniff;
pub mod xlsx;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::schema::OcrConfig;
use crate::error::ExtractionFailure;

pub use crate::config::schema::DeclaredType;
pub use ocr::{OcrEngine, UnavailableEngine};
pub use rasterizer::{PdfRasterizer, PdftoppmRasterizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Unsupported,
    Failed,
}

/// Where the text of one unit (page, sheet, image) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSource {
    Embedded,
    Ocr,
    Cells,
    Failed,
}

/// Byte range of one unit inside [`ExtractionResult::text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitBoundary {
    pub index: usize,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub source: UnitSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitBoundary>,
    /// Warning-level remarks, such as per-page OCR failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ExtractionMetadata {
    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub status: ExtractionStatus,
    pub text: String,
    pub metadata: ExtractionMetadata,
    pub error: Option<ExtractionFailure>,
}

impl ExtractionResult {
    pub fn success(text: String, metadata: ExtractionMetadata) -> Self {
        Self {
            status: ExtractionStatus::Success,
            text,
            metadata,
            error: None,
        }
    }

    pub fn unsupported(failure: ExtractionFailure) -> Self {
        Self {
            status: ExtractionStatus::Unsupported,
            text: String::new(),
            metadata: ExtractionMetadata::default(),
            error: Some(failure),
        }
    }

    pub fn failed(failure: ExtractionFailure) -> Self {
        Self::failed_with_metadata(failure, ExtractionMetadata::default())
    }

    pub fn failed_with_metadata(failure: ExtractionFailure, metadata: ExtractionMetadata) -> Self {
        Self {
            status: ExtractionStatus::Failed,
            text: String::new(),
            metadata,
            error: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExtractionStatus::Success
    }

    /// The failure behind a non-success result.
    pub fn failure(&self) -> Option<&ExtractionFailure> {
        self.error.as_ref()
    }
}

/// Appends unit texts with a separator while recording their boundaries.
pub(crate) struct UnitTextBuilder {
    separator: &'static str,
    text: String,
    units: Vec<UnitBoundary>,
}

impl UnitTextBuilder {
    pub(crate) fn new(separator: &'static str) -> Self {
        Self {
            separator,
            text: String::new(),
            units: Vec::new(),
        }
    }

    pub(crate) fn push(
        &mut self,
        label: String,
        source: UnitSource,
        text: &str,
        note: Option<String>,
    ) {
        if !self.units.is_empty() {
            self.text.push_str(self.separator);
        }
        let start = self.text.len();
        self.text.push_str(text);
        self.units.push(UnitBoundary {
            index: self.units.len(),
            label,
            start,
            end: self.text.len(),
            source,
            note,
        });
    }

    pub(crate) fn finish(self) -> (String, Vec<UnitBoundary>) {
        (self.text, self.units)
    }
}

/// One strategy of the extraction set. Implementations work on bytes only.
pub trait Extractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> ExtractionResult;
    fn supports(&self, declared: DeclaredType) -> bool;
}

pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        rasterizer: Arc<dyn PdfRasterizer>,
        pdf_options: pdf::PdfOptions,
    ) -> Self {
        let extractors: Vec<Box<dyn Extractor>> = vec![
            Box::new(pdf::PdfExtractor::new(
                Arc::clone(&ocr),
                rasterizer,
                pdf_options,
            )),
            Box::new(image::ImageExtractor::new(ocr)),
            Box::new(docx::DocxExtractor::new()),
            Box::new(xlsx::XlsxExtractor::new()),
        ];

        Self { extractors }
    }

    /// Production wiring: Tesseract (or the unavailable engine) plus pdftoppm.
    pub fn from_config(config: &OcrConfig) -> Self {
        let ocr = ocr::engine_from_config(config);
        let rasterizer: Arc<dyn PdfRasterizer> = Arc::new(PdftoppmRasterizer::new(config.dpi));
        Self::new(
            ocr,
            rasterizer,
            pdf::PdfOptions {
                min_page_chars: config.min_page_chars,
            },
        )
    }

    pub fn with_extractors(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Checks the input, sniffs its content, then dispatches on the declared type.
    pub fn extract(&self, bytes: &[u8], declared: DeclaredType) -> ExtractionResult {
        if bytes.is_empty() {
            return ExtractionResult::failed(ExtractionFailure::Empty);
        }

        let kind = sniff::sniff(bytes);
        if let Err(failure) = sniff::check_declared(declared, kind) {
            return ExtractionResult::unsupported(failure);
        }

        let Some(extractor) = self.extractors.iter().find(|e| e.supports(declared)) else {
            return ExtractionResult::unsupported(ExtractionFailure::Unsupported {
                reason: format!("no extractor registered for {}", declared),
            });
        };

        match panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(bytes))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("{} extractor panicked: {}", declared, message);
                ExtractionResult::failed(ExtractionFailure::Panicked(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct FixedExtractor(&'static str);

    impl Extractor for FixedExtractor {
        fn extract(&self, _bytes: &[u8]) -> ExtractionResult {
            ExtractionResult::success(self.0.to_string(), ExtractionMetadata::default())
        }

        fn supports(&self, declared: DeclaredType) -> bool {
            declared == DeclaredType::Pdf
        }
    }

    struct PanickingExtractor;

    impl Extractor for PanickingExtractor {
        fn extract(&self, _bytes: &[u8]) -> ExtractionResult {
            panic!("boom");
        }

        fn supports(&self, _declared: DeclaredType) -> bool {
            true
        }
    }

    struct NoRasterizer;

    impl PdfRasterizer for NoRasterizer {
        fn render(&self, _pdf: &[u8], _page_index: usize) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::Unavailable("test".to_string()))
        }

        fn page_count(&self, _pdf: &[u8]) -> Result<usize, EngineError> {
            Err(EngineError::Unavailable("test".to_string()))
        }
    }

    #[test]
    fn test_empty_input_fails() {
        let registry = ExtractorRegistry::with_extractors(vec![Box::new(FixedExtractor("x"))]);
        let result = registry.extract(&[], DeclaredType::Pdf);
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert_eq!(result.error, Some(ExtractionFailure::Empty));
    }

    #[test]
    fn test_type_mismatch_is_unsupported() {
        let registry = ExtractorRegistry::with_extractors(vec![Box::new(FixedExtractor("x"))]);
        let png_signature = b"\x89PNG\r\n\x1a\n rest of image";
        let result = registry.extract(png_signature, DeclaredType::Pdf);
        assert_eq!(result.status, ExtractionStatus::Unsupported);
        assert!(matches!(
            result.error,
            Some(ExtractionFailure::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_dispatch_by_declared_type() {
        let registry =
            ExtractorRegistry::with_extractors(vec![Box::new(FixedExtractor("pdf text"))]);
        let result = registry.extract(b"%PDF-1.7 body", DeclaredType::Pdf);
        assert!(result.is_success());
        assert_eq!(result.text, "pdf text");
    }

    #[test]
    fn test_missing_extractor_is_unsupported() {
        let registry = ExtractorRegistry::with_extractors(vec![Box::new(FixedExtractor("x"))]);
        let result = registry.extract(b"PK\x03\x04zip", DeclaredType::Xlsx);
        assert_eq!(result.status, ExtractionStatus::Unsupported);
    }

    #[test]
    fn test_panicking_extractor_is_contained() {
        let registry = ExtractorRegistry::with_extractors(vec![Box::new(PanickingExtractor)]);
        let result = registry.extract(b"%PDF-1.4", DeclaredType::Pdf);
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert_eq!(
            result.error,
            Some(ExtractionFailure::Panicked("boom".to_string()))
        );
    }

    #[test]
    fn test_registry_rejects_undecodable_image() {
        let registry = ExtractorRegistry::new(
            Arc::new(UnavailableEngine::new("disabled")),
            Arc::new(NoRasterizer),
            pdf::PdfOptions::default(),
        );
        let result = registry.extract(b"\x89PNG\r\n\x1a\nnot really", DeclaredType::Image);
        assert_eq!(result.status, ExtractionStatus::Failed);
    }

    #[test]
    fn test_unit_text_builder_records_boundaries() {
        let mut builder = UnitTextBuilder::new("\n\n");
        builder.push("page 1".to_string(), UnitSource::Embedded, "alpha", None);
        builder.push("page 2".to_string(), UnitSource::Failed, "", Some("n".into()));
        builder.push("page 3".to_string(), UnitSource::Ocr, "gamma", None);
        let (text, units) = builder.finish();

        assert_eq!(text, "alpha\n\n\n\ngamma");
        assert_eq!(&text[units[0].start..units[0].end], "alpha");
        assert_eq!(units[1].start, units[1].end);
        assert_eq!(&text[units[2].start..units[2].end], "gamma");
        assert_eq!(units[2].index, 2);
    }
}
