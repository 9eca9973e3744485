//! The persistence capability the pipeline writes extracted documents to.

use super::document_repo::{self, Document, DocumentId, NewDocument};
use super::{Database, DatabaseError};
use crate::search::{self, SearchQuery, SearchResults};

/// Stores documents keyed by source path and answers ranked searches.
///
/// Upserts must be idempotent per source path: re-ingesting a file
/// replaces its document instead of adding a second one.
pub trait DocumentStore: Send + Sync {
    fn upsert(&self, doc: &NewDocument) -> Result<DocumentId, DatabaseError>;
    fn get(&self, id: DocumentId) -> Result<Option<Document>, DatabaseError>;
    fn find_by_source(&self, source_path: &str) -> Result<Option<Document>, DatabaseError>;
    fn search(&self, query: &SearchQuery) -> Result<SearchResults, DatabaseError>;
    fn count(&self) -> Result<u64, DatabaseError>;
}

/// SQLite-backed documents with an FTS5 index kept in sync by triggers.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Database,
    similarity_threshold: f64,
}

impl SqliteDocumentStore {
    pub fn new(db: Database, similarity_threshold: f64) -> Self {
        Self {
            db,
            similarity_threshold,
        }
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn upsert(&self, doc: &NewDocument) -> Result<DocumentId, DatabaseError> {
        let id = document_repo::upsert(&self.db, doc)?;
        log::debug!(
            "Stored document {} ({}, {})",
            id,
            doc.filename,
            doc.status.as_str()
        );
        Ok(id)
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>, DatabaseError> {
        document_repo::find_by_id(&self.db, id)
    }

    fn find_by_source(&self, source_path: &str) -> Result<Option<Document>, DatabaseError> {
        document_repo::find_by_source(&self.db, source_path)
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchResults, DatabaseError> {
        let _span = tracing::info_span!("db.search", limit = query.limit, offset = query.offset)
            .entered();
        let results = search::run(&self.db, query, self.similarity_threshold)?;
        log::debug!(
            "Search returned {} of {} hits",
            results.hits.len(),
            results.total
        );
        Ok(results)
    }

    fn count(&self) -> Result<u64, DatabaseError> {
        document_repo::count(&self.db)
    }
}
