use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};

use crate::config::schema::OcrConfig;
use crate::error::EngineError;

/// Turns image bytes into text.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &[u8]) -> Result<String, EngineError>;
}

/// Engine used when OCR is disabled or not compiled in. Every call reports
/// [`EngineError::Unavailable`].
pub struct UnavailableEngine {
    reason: String,
}

impl UnavailableEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl OcrEngine for UnavailableEngine {
    fn recognize(&self, _image: &[u8]) -> Result<String, EngineError> {
        Err(EngineError::Unavailable(self.reason.clone()))
    }
}

pub fn engine_from_config(config: &OcrConfig) -> Arc<dyn OcrEngine> {
    if !config.enabled {
        log::info!("OCR disabled by configuration");
        return Arc::new(UnavailableEngine::new("OCR disabled by configuration"));
    }

    #[cfg(feature = "tesseract")]
    {
        Arc::new(TesseractEngine::new(&config.languages, config.preprocess))
    }

    #[cfg(not(feature = "tesseract"))]
    {
        log::warn!("OCR requested but docingest was built without the `tesseract` feature");
        Arc::new(UnavailableEngine::new(
            "built without the `tesseract` feature",
        ))
    }
}

#[cfg(feature = "tesseract")]
pub use tesseract::TesseractEngine;

#[cfg(feature = "tesseract")]
mod tesseract {
    use std::io::Cursor;
    use std::sync::Arc;

    use image::DynamicImage;

    use super::{preprocess, OcrEngine};
    use crate::error::EngineError;

    #[derive(Clone)]
    pub struct TesseractEngine {
        inner: Arc<TesseractEngineInner>,
    }

    struct TesseractEngineInner {
        languages: String,
        preprocess: bool,
    }

    impl TesseractEngine {
        pub fn new(languages: &[String], preprocess: bool) -> Self {
            let lang_str = if languages.is_empty() {
                "eng".to_string()
            } else {
                languages.join("+")
            };

            Self {
                inner: Arc::new(TesseractEngineInner {
                    languages: lang_str,
                    preprocess,
                }),
            }
        }

        pub fn languages(&self) -> &str {
            &self.inner.languages
        }
    }

    impl OcrEngine for TesseractEngine {
        fn recognize(&self, image_data: &[u8]) -> Result<String, EngineError> {
            let _span = tracing::info_span!("processor.ocr", bytes = image_data.len()).entered();

            let img = image::load_from_memory(image_data)
                .map_err(|e| EngineError::Failed(format!("Failed to load image: {}", e)))?;

            let img = if self.inner.preprocess {
                DynamicImage::ImageLuma8(preprocess(&img))
            } else {
                img
            };

            // leptess reads encoded images, so hand it a PNG
            let mut png_data = Vec::new();
            img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)
                .map_err(|e| EngineError::Failed(format!("Failed to convert image: {}", e)))?;

            let mut lt = leptess::LepTess::new(None, &self.inner.languages).map_err(|e| {
                EngineError::Unavailable(format!("Failed to initialize Tesseract: {}", e))
            })?;

            lt.set_image_from_mem(&png_data)
                .map_err(|e| EngineError::Failed(format!("Failed to set image for OCR: {}", e)))?;

            lt.get_utf8_text()
                .map_err(|e| EngineError::Failed(format!("OCR failed: {}", e)))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_language_string() {
            let engine = TesseractEngine::new(&["eng".to_string(), "deu".to_string()], true);
            assert_eq!(engine.languages(), "eng+deu");
            assert_eq!(TesseractEngine::new(&[], true).languages(), "eng");
        }

        #[test]
        fn test_invalid_image_data_error() {
            let engine = TesseractEngine::new(&["eng".to_string()], true);
            match engine.recognize(b"not valid image data") {
                Err(EngineError::Failed(msg)) => assert!(msg.contains("Failed to load image")),
                other => panic!("Expected Failed error, got {:?}", other),
            }
        }
    }
}

/// Small scans are upscaled to this width before recognition.
const TARGET_WIDTH: u32 = 1800;
const CONTRAST_PERCENT: f32 = 40.0;

/// Prepares a scan for recognition: upscale, grayscale, contrast, a 3x3
/// median to drop speckles, then a binarization threshold derived from the
/// mean brightness.
pub fn preprocess(img: &DynamicImage) -> GrayImage {
    let (width, height) = (img.width(), img.height());
    let scaled = if width > 0 && width < TARGET_WIDTH {
        let ratio = TARGET_WIDTH as f64 / width as f64;
        let new_height = ((height as f64 * ratio).round() as u32).max(1);
        img.resize_exact(TARGET_WIDTH, new_height, FilterType::Lanczos3)
    } else {
        img.clone()
    };

    let gray = image::imageops::contrast(&scaled.to_luma8(), CONTRAST_PERCENT);
    let mut gray = median3x3(&gray);

    let threshold = binarization_threshold(&gray);
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
    gray
}

fn binarization_threshold(img: &GrayImage) -> u8 {
    let count = u64::from(img.width()) * u64::from(img.height());
    if count == 0 {
        return 128;
    }
    let sum: u64 = img.pixels().map(|p| u64::from(p.0[0])).sum();
    let mean = sum as f64 / count as f64;
    ((mean * 0.9) as u32).clamp(80, 140) as u8
}

fn median3x3(img: &GrayImage) -> GrayImage {
    let (width, height) = img.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut window = [0u8; 9];
        let mut n = 0;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let nx = (i64::from(x) + dx).clamp(0, i64::from(width) - 1) as u32;
                let ny = (i64::from(y) + dy).clamp(0, i64::from(height) - 1) as u32;
                window[n] = img.get_pixel(nx, ny).0[0];
                n += 1;
            }
        }
        window.sort_unstable();
        Luma([window[4]])
    })
}
