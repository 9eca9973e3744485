use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::EngineError;

/// Renders PDF pages to raster images for OCR.
pub trait PdfRasterizer: Send + Sync {
    /// Renders the zero-based `page_index` to encoded image bytes.
    fn render(&self, pdf: &[u8], page_index: usize) -> Result<Vec<u8>, EngineError>;

    /// Counts pages without a PDF object parser; used when lopdf gives up.
    fn page_count(&self, pdf: &[u8]) -> Result<usize, EngineError>;
}

/// Rasterizer backed by poppler-utils (`pdftoppm` and `pdfinfo`).
pub struct PdftoppmRasterizer {
    dpi: u32,
    temp_dir: PathBuf,
}

impl PdftoppmRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi,
            temp_dir: std::env::temp_dir(),
        }
    }

    pub fn with_temp_dir(dpi: u32, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            dpi,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }
}

/// Temp file removed on drop, so every early return cleans up.
struct TempFile(PathBuf);

impl TempFile {
    fn write(path: PathBuf, bytes: &[u8]) -> Result<Self, EngineError> {
        std::fs::write(&path, bytes)
            .map_err(|e| EngineError::Failed(format!("Failed to write temp PDF: {}", e)))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn run_tool(program: &str, command: &mut Command) -> Result<Output, EngineError> {
    let output = command.output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            EngineError::Unavailable(format!(
                "{} not found. Make sure poppler-utils is installed.",
                program
            ))
        } else {
            EngineError::Failed(format!("Failed to run {}: {}", program, e))
        }
    })?;

    if !output.status.success() {
        return Err(EngineError::Failed(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output)
}

impl PdfRasterizer for PdftoppmRasterizer {
    fn render(&self, pdf: &[u8], page_index: usize) -> Result<Vec<u8>, EngineError> {
        let id = uuid::Uuid::new_v4();
        let pdf_file = TempFile::write(self.temp_dir.join(format!("docingest_{}.pdf", id)), pdf)?;
        let output_prefix = self.temp_dir.join(format!("docingest_page_{}", id));
        // -singlefile writes exactly `<prefix>.png`
        let image_file = TempFile(output_prefix.with_extension("png"));

        let page = (page_index + 1).to_string();
        run_tool(
            "pdftoppm",
            Command::new("pdftoppm")
                .args(["-png", "-singlefile", "-r", &self.dpi.to_string()])
                .args(["-f", &page, "-l", &page])
                .arg(pdf_file.path())
                .arg(&output_prefix),
        )?;

        std::fs::read(image_file.path())
            .map_err(|e| EngineError::Failed(format!("Failed to read rendered page: {}", e)))
    }

    fn page_count(&self, pdf: &[u8]) -> Result<usize, EngineError> {
        let pdf_file = TempFile::write(
            self.temp_dir
                .join(format!("docingest_pagecount_{}.pdf", uuid::Uuid::new_v4())),
            pdf,
        )?;

        let output = run_tool("pdfinfo", Command::new("pdfinfo").arg(pdf_file.path()))?;
        parse_page_count(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| EngineError::Failed("pdfinfo reported no page count".to_string()))
    }
}

fn parse_page_count(pdfinfo_output: &str) -> Option<usize> {
    pdfinfo_output
        .lines()
        .filter_map(|line| line.strip_prefix("Pages:"))
        .find_map(|count| count.trim().parse().ok())
}
