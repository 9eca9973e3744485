//! Document repository: rows of the `documents` table and their queries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::config::DeclaredType;

pub type DocumentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "indexed" => DocumentStatus::Indexed,
            "failed" => DocumentStatus::Failed,
            other => {
                log::warn!("Unknown document status '{}', treating as failed", other);
                DocumentStatus::Failed
            }
        }
    }
}

/// A persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    /// Identity of the document: re-ingesting the same source replaces it.
    pub source_path: String,
    pub filename: String,
    pub declared_type: DeclaredType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let declared: String = row.get("declared_type")?;
        let declared_type = DeclaredType::parse(&declared).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown declared type '{}'", declared).into(),
            )
        })?;
        let metadata: String = row.get("metadata")?;
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let size: i64 = row.get("size_bytes")?;

        Ok(Self {
            id: row.get("id")?,
            source_path: row.get("source_path")?,
            filename: row.get("filename")?,
            declared_type,
            mime_type: row.get("mime_type")?,
            size_bytes: size.max(0) as u64,
            content: row.get("content")?,
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            status: DocumentStatus::parse(&status),
            error: row.get("error")?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }
}

/// The write side of a document: everything but id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub source_path: String,
    pub filename: String,
    pub declared_type: DeclaredType,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub status: DocumentStatus,
    pub error: Option<String>,
}

impl NewDocument {
    pub fn indexed(
        source_path: impl Into<String>,
        filename: impl Into<String>,
        declared_type: DeclaredType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            filename: filename.into(),
            declared_type,
            mime_type: None,
            size_bytes: 0,
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
            status: DocumentStatus::Indexed,
            error: None,
        }
    }

    /// A terminally failed extraction, kept so the failure is queryable.
    pub fn failed(
        source_path: impl Into<String>,
        filename: impl Into<String>,
        declared_type: DeclaredType,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: DocumentStatus::Failed,
            error: Some(error.into()),
            ..Self::indexed(source_path, filename, declared_type, "")
        }
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Inserts or replaces the document for `doc.source_path`. The row id and
/// `created_at` survive a replacement; everything else is overwritten.
pub fn upsert(db: &Database, doc: &NewDocument) -> Result<DocumentId, DatabaseError> {
    let now = format_timestamp(Utc::now());
    let metadata = doc.metadata.to_string();
    db.with_conn(|conn| {
        let id = conn.query_row(
            "INSERT INTO documents (source_path, filename, declared_type, mime_type, size_bytes,
             content, metadata, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(source_path) DO UPDATE SET
                filename = excluded.filename,
                declared_type = excluded.declared_type,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                content = excluded.content,
                metadata = excluded.metadata,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
             RETURNING id",
            params![
                doc.source_path,
                doc.filename,
                doc.declared_type.as_str(),
                doc.mime_type,
                doc.size_bytes as i64,
                doc.content,
                metadata,
                doc.status.as_str(),
                doc.error,
                now,
            ],
            |r| r.get(0),
        )?;
        Ok(id)
    })
}

pub fn find_by_id(db: &Database, id: DocumentId) -> Result<Option<Document>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id],
                Document::from_row,
            )
            .optional()?)
    })
}

pub fn find_by_source(db: &Database, source_path: &str) -> Result<Option<Document>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM documents WHERE source_path = ?1",
                params![source_path],
                Document::from_row,
            )
            .optional()?)
    })
}

pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
        Ok(n as u64)
    })
}

/// Indexed documents, newest first, with the total count.
pub fn latest(
    conn: &Connection,
    limit: usize,
    offset: usize,
) -> Result<(Vec<Document>, u64), DatabaseError> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE status = 'indexed'",
        [],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT * FROM documents WHERE status = 'indexed'
         ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let docs = stmt
        .query_map(params![limit as i64, offset as i64], Document::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((docs, total as u64))
}

/// A full-text hit: the document, its raw bm25 rank (lower is better) and a
/// highlighted snippet.
pub struct FtsRow {
    pub document: Document,
    pub rank: f64,
    pub snippet: String,
}

pub fn fts_search(conn: &Connection, match_expr: &str) -> Result<Vec<FtsRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT d.*, bm25(documents_fts) AS fts_rank,
                snippet(documents_fts, 1, '[', ']', '…', 12) AS snip
         FROM documents_fts
         JOIN documents d ON d.id = documents_fts.rowid
         WHERE documents_fts MATCH ?1 AND d.status = 'indexed'
         ORDER BY fts_rank",
    )?;
    let rows = stmt
        .query_map(params![match_expr], |row| {
            Ok(FtsRow {
                document: Document::from_row(row)?,
                rank: row.get("fts_rank")?,
                snippet: row.get("snip")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Case-insensitive substring match over content and filename.
pub fn substring_search(conn: &Connection, term: &str) -> Result<Vec<Document>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM documents
         WHERE status = 'indexed'
           AND (instr(lower(content), lower(?1)) > 0 OR instr(lower(filename), lower(?1)) > 0)",
    )?;
    let docs = stmt
        .query_map(params![term], Document::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs)
}

/// Distinct full-text terms of `min_chars..=max_chars` characters. Terms
/// are lowercased with diacritics folded, as the tokenizer stores them.
pub fn vocabulary(
    conn: &Connection,
    min_chars: usize,
    max_chars: usize,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT term FROM documents_vocab WHERE length(term) BETWEEN ?1 AND ?2")?;
    let terms = stmt
        .query_map(params![min_chars as i64, max_chars as i64], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(terms)
}

/// Indexed documents whose content or filename holds any of `terms`,
/// newest first, at most `limit`.
pub fn containing_any(
    conn: &Connection,
    terms: &[String],
    limit: usize,
) -> Result<Vec<Document>, DatabaseError> {
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let match_expr = terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ");
    let mut stmt = conn.prepare(
        "SELECT d.* FROM documents_fts
         JOIN documents d ON d.id = documents_fts.rowid
         WHERE documents_fts MATCH ?1 AND d.status = 'indexed'
         ORDER BY d.created_at DESC, d.id DESC
         LIMIT ?2",
    )?;
    let docs = stmt
        .query_map(params![match_expr, limit as i64], Document::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_is_idempotent_by_source() {
        let db = Database::open_in_memory().unwrap();
        let first = upsert(
            &db,
            &NewDocument::indexed("/scans/a.pdf", "a.pdf", DeclaredType::Pdf, "first"),
        )
        .unwrap();
        let created = find_by_id(&db, first).unwrap().unwrap().created_at;

        let second = upsert(
            &db,
            &NewDocument::indexed("/scans/a.pdf", "a.pdf", DeclaredType::Pdf, "second")
                .with_size(42)
                .with_metadata(json!({"page_count": 1})),
        )
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(count(&db).unwrap(), 1);
        let doc = find_by_source(&db, "/scans/a.pdf").unwrap().unwrap();
        assert_eq!(doc.content, "second");
        assert_eq!(doc.size_bytes, 42);
        assert_eq!(doc.metadata["page_count"], 1);
        assert_eq!(doc.created_at, created);
    }

    #[test]
    fn test_failed_document_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let id = upsert(
            &db,
            &NewDocument::failed("/scans/b.png", "b.png", DeclaredType::Image, "ocr missing")
                .with_mime_type(Some("image/png".to_string())),
        )
        .unwrap();

        let doc = find_by_id(&db, id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.error.as_deref(), Some("ocr missing"));
        assert_eq!(doc.mime_type.as_deref(), Some("image/png"));
        assert_eq!(doc.declared_type, DeclaredType::Image);
    }

    #[test]
    fn test_latest_excludes_failed() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &NewDocument::indexed("/a", "a.pdf", DeclaredType::Pdf, "x")).unwrap();
        upsert(&db, &NewDocument::failed("/b", "b.pdf", DeclaredType::Pdf, "bad")).unwrap();

        let (docs, total) = db.with_conn(|conn| latest(conn, 10, 0)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(docs[0].filename, "a.pdf");
    }

    #[test]
    fn test_vocabulary_lists_terms_in_length_range() {
        let db = Database::open_in_memory().unwrap();
        upsert(
            &db,
            &NewDocument::indexed("/a", "Café.pdf", DeclaredType::Pdf, "an invoise for tea"),
        )
        .unwrap();

        let mut terms = db.with_conn(|conn| vocabulary(conn, 4, 7)).unwrap();
        terms.sort();
        assert_eq!(terms, vec!["cafe", "invoise"]);
    }

    #[test]
    fn test_containing_any_skips_failed_and_limits() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &NewDocument::indexed("/a", "a.pdf", DeclaredType::Pdf, "alpha")).unwrap();
        upsert(&db, &NewDocument::indexed("/b", "b.pdf", DeclaredType::Pdf, "beta")).unwrap();
        upsert(&db, &NewDocument::indexed("/c", "c.pdf", DeclaredType::Pdf, "gamma")).unwrap();
        upsert(&db, &NewDocument::failed("/d", "alpha.pdf", DeclaredType::Pdf, "bad")).unwrap();

        let terms = vec!["alpha".to_string(), "beta".to_string(), "say \"hi\"".to_string()];
        let docs = db.with_conn(|conn| containing_any(conn, &terms, 10)).unwrap();
        let mut names: Vec<_> = docs.iter().map(|d| d.filename.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);

        let limited = db.with_conn(|conn| containing_any(conn, &terms, 1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert!(db.with_conn(|conn| containing_any(conn, &[], 10)).unwrap().is_empty());
    }

    #[test]
    fn test_find_missing_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(find_by_id(&db, 99).unwrap().is_none());
        assert!(find_by_source(&db, "/nope").unwrap().is_none());
    }
}
