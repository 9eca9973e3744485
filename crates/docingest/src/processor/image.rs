use std::sync::Arc;

use image::GenericImageView;

use crate::config::schema::DeclaredType;
use crate::error::{EngineError, ExtractionFailure};
use crate::processor::ocr::OcrEngine;
use crate::processor::{
    ExtractionMetadata, ExtractionResult, Extractor, UnitSource, UnitTextBuilder,
};

pub struct ImageExtractor {
    ocr: Arc<dyn OcrEngine>,
}

impl ImageExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr }
    }
}

impl Extractor for ImageExtractor {
    fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        let _span = tracing::info_span!("processor.image", bytes = bytes.len()).entered();

        let img = match image::load_from_memory(bytes) {
            Ok(img) => img,
            Err(e) => {
                return ExtractionResult::failed(ExtractionFailure::Corrupt {
                    reason: format!("failed to decode image: {}", e),
                })
            }
        };
        let (width, height) = img.dimensions();

        let text = match self.ocr.recognize(bytes) {
            Ok(text) => text,
            Err(EngineError::Unavailable(reason)) => {
                return ExtractionResult::failed(ExtractionFailure::EngineUnavailable {
                    engine: "ocr".to_string(),
                    reason,
                })
            }
            Err(EngineError::Failed(reason)) => {
                return ExtractionResult::failed(ExtractionFailure::OcrFailed { reason })
            }
        };

        let text = text.trim();
        let mut notes = Vec::new();
        if text.is_empty() {
            notes.push("no text recognized".to_string());
        }

        let mut builder = UnitTextBuilder::new("");
        builder.push("image".to_string(), UnitSource::Ocr, text, None);
        let (text, units) = builder.finish();

        let metadata = ExtractionMetadata {
            page_count: Some(1),
            units,
            notes,
            ..ExtractionMetadata::default()
        }
        .with_property("width", width)
        .with_property("height", height);

        ExtractionResult::success(text, metadata)
    }

    fn supports(&self, declared: DeclaredType) -> bool {
        matches!(declared, DeclaredType::Image)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    pub fn build_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_png;
    use super::*;
    use crate::processor::ocr::UnavailableEngine;
    use crate::processor::ExtractionStatus;

    struct FixedOcr(Result<String, EngineError>);

    impl OcrEngine for FixedOcr {
        fn recognize(&self, _image: &[u8]) -> Result<String, EngineError> {
            self.0.clone()
        }
    }

    fn extractor(result: Result<String, EngineError>) -> ImageExtractor {
        ImageExtractor::new(Arc::new(FixedOcr(result)))
    }

    #[test]
    fn test_supports_image_type() {
        let extractor = ImageExtractor::new(Arc::new(UnavailableEngine::new("off")));
        assert!(extractor.supports(DeclaredType::Image));
        assert!(!extractor.supports(DeclaredType::Pdf));
        assert!(!extractor.supports(DeclaredType::Docx));
    }

    #[test]
    fn test_recognized_text_and_dimensions() {
        let result = extractor(Ok("  Invoice 42\n".to_string())).extract(&build_png(40, 20));
        assert!(result.is_success());
        assert_eq!(result.text, "Invoice 42");
        assert_eq!(result.metadata.units.len(), 1);
        assert_eq!(result.metadata.units[0].label, "image");
        assert_eq!(result.metadata.properties["width"], 40);
        assert_eq!(result.metadata.properties["height"], 20);
    }

    #[test]
    fn test_blank_image_succeeds_with_note() {
        let result = extractor(Ok(String::new())).extract(&build_png(8, 8));
        assert!(result.is_success());
        assert!(result.text.is_empty());
        assert_eq!(result.metadata.notes, vec!["no text recognized".to_string()]);
    }

    #[test]
    fn test_unavailable_engine_fails() {
        let result =
            extractor(Err(EngineError::Unavailable("disabled".into()))).extract(&build_png(8, 8));
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert!(result.failure().unwrap().is_engine_unavailable());
    }

    #[test]
    fn test_engine_failure_is_ocr_failed() {
        let result = extractor(Err(EngineError::Failed("tess crashed".into()))).extract(&build_png(8, 8));
        assert_eq!(
            result.error,
            Some(ExtractionFailure::OcrFailed {
                reason: "tess crashed".to_string()
            })
        );
    }

    #[test]
    fn test_undecodable_image_is_corrupt() {
        let result = extractor(Ok("x".into())).extract(b"\x89PNG\r\n\x1a\nbroken");
        assert!(matches!(result.error, Some(ExtractionFailure::Corrupt { .. })));
    }
}
