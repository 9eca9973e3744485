//! Shared fixtures for the integration tests.
//!
//! `builders` produces small but real PDF, PNG, DOCX and XLSX files;
//! `harness` wires an [`docingest::Ingestor`] to in-memory stores and fake
//! OCR engines inside a temporary directory.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FakeOcr, FakeRasterizer, TestHarness};
