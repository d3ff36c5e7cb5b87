use crate::allocator::{CodeProbe, IdentifierAllocator};
use crate::config::Config;
use crate::error::StoreError;
use crate::model::{CreateDocument, DEFAULT_TITLE, Document};
use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

const SYSTEM_MIGRATIONS: &[(&str, &str)] = &[(
    "system/000_migrations_table.sql",
    include_str!("migrations/system/000_migrations_table.sql"),
)];

const MIGRATIONS: &[(&str, &str)] = &[("001_documents.sql", include_str!("migrations/001_documents.sql"))];

/// Allocate+insert rounds the create flow makes before giving up. Each round
/// only starts after the previous insert lost the race on the unique index,
/// so more than one round is already rare.
const CREATE_ROUNDS: u32 = 3;

const DOCUMENT_COLUMNS: &str = "id, short_code, title, content, created_at";

pub struct Database {
    db: LibsqlDatabase,
    conn: Connection,
    query_timeout: Duration,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl Database {
    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone();
        let turso_auth_token = cfg.app.turso_auth_token.clone();

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[db] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        Self::setup(db, Duration::from_millis(cfg.app.query_timeout_ms), turso_url, turso_auth_token).await
    }

    async fn setup(
        db: LibsqlDatabase,
        query_timeout: Duration,
        turso_url: Option<String>,
        turso_auth_token: Option<String>,
    ) -> Result<Self> {
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Database {
            db,
            conn,
            query_timeout,
            turso_url,
            turso_auth_token,
        })
    }

    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::setup(db, Duration::from_secs(5), None, None).await
    }

    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<()> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {}", e))?;
        }
        Ok(())
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        let record = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(record, libsql::params![name]).await?;
        Ok(())
    }

    /// Runs a statement under the store's I/O timeout so a hung backend
    /// fails the calling request after a bounded interval.
    async fn with_timeout<T, F>(&self, fut: F) -> Result<libsql::Result<T>, StoreError>
    where
        F: Future<Output = libsql::Result<T>>,
    {
        tokio::time::timeout(self.query_timeout, fut).await.map_err(|_| {
            StoreError::Unavailable(format!("query timed out after {}ms", self.query_timeout.as_millis()))
        })
    }

    fn row_to_document(row: &libsql::Row) -> Result<Document, StoreError> {
        Ok(Document {
            id: row.get(0)?,
            short_code: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    /// Atomic insert keyed by `short_code`. The UNIQUE index on that column
    /// is the authoritative collision detector; losing the race surfaces as
    /// `DuplicateCode` and the caller reallocates.
    pub async fn insert_document(&self, content: &str, title: &str, short_code: &str) -> Result<Document, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::Validation("content must not be empty".to_string()));
        }

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let query = format!(
            r#"
            INSERT INTO documents (short_code, title, content, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING {DOCUMENT_COLUMNS}
        "#
        );

        let result = self
            .with_timeout(async {
                let mut rows = self
                    .conn
                    .query(&query, libsql::params![short_code, title, content, created_at.as_str()])
                    .await?;
                rows.next().await
            })
            .await?;

        let row = match result {
            Ok(row) => row,
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                return Err(StoreError::DuplicateCode(short_code.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match row {
            Some(row) => Self::row_to_document(&row),
            None => Err(StoreError::Unavailable("insert returned no row".to_string())),
        }
    }

    pub async fn get_document_by_code(&self, short_code: &str) -> Result<Document, StoreError> {
        let query = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE short_code = ?");

        let row = self
            .with_timeout(async {
                let mut rows = self.conn.query(&query, libsql::params![short_code]).await?;
                rows.next().await
            })
            .await??;

        match row {
            Some(row) => Self::row_to_document(&row),
            None => Err(StoreError::NotFound(short_code.to_string())),
        }
    }

    /// The create flow: allocate a code, insert, and reallocate when the
    /// insert loses the unique-index race. Bounded so a pathological store
    /// state becomes a visible error instead of an infinite loop.
    pub async fn create_document(
        &self,
        allocator: &IdentifierAllocator,
        input: CreateDocument,
    ) -> Result<Document, StoreError> {
        if input.content.trim().is_empty() {
            return Err(StoreError::Validation("content must not be empty".to_string()));
        }

        let title = input
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        for _ in 0..CREATE_ROUNDS {
            let code = allocator.allocate(self).await?;
            match self.insert_document(&input.content, &title, &code).await {
                Err(StoreError::DuplicateCode(code)) => {
                    tracing::warn!(code = %code, "short code taken between probe and insert, reallocating");
                }
                other => return other,
            }
        }

        Err(StoreError::AllocationExhausted(CREATE_ROUNDS))
    }
}

impl CodeProbe for Database {
    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        let query = "SELECT 1 FROM documents WHERE short_code = ? LIMIT 1";

        let row = self
            .with_timeout(async {
                let mut rows = self.conn.query(query, libsql::params![code]).await?;
                rows.next().await
            })
            .await??;

        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    async fn memory_db() -> Database {
        Database::open_in_memory().await.expect("in-memory database")
    }

    async fn count_documents(db: &Database) -> i64 {
        let mut rows = db.conn.query("SELECT COUNT(*) FROM documents", ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    fn paste(content: &str, title: Option<&str>) -> CreateDocument {
        CreateDocument {
            content: content.to_string(),
            title: title.map(|t| t.to_string()),
        }
    }

    #[tokio::test]
    async fn create_then_fetch_round_trips() {
        let db = memory_db().await;
        let allocator = IdentifierAllocator::default();
        let content = "# Notes\n\nsome **bold** text\n\n\u{00e9}\u{00e8}\u{00ea} unicode";

        let created = db
            .create_document(&allocator, paste(content, Some("Notes")))
            .await
            .unwrap();
        assert_eq!(created.short_code.len(), allocator.code_length());
        assert!(!created.created_at.is_empty());

        let fetched = db.get_document_by_code(&created.short_code).await.unwrap();
        assert_eq!(fetched.content, content);
        assert_eq!(fetched.title, "Notes");
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[tokio::test]
    async fn missing_title_defaults() {
        let db = memory_db().await;
        let allocator = IdentifierAllocator::default();

        let created = db.create_document(&allocator, paste("hello", None)).await.unwrap();
        assert_eq!(created.title, DEFAULT_TITLE);

        let created = db.create_document(&allocator, paste("hello", Some("  "))).await.unwrap();
        assert_eq!(created.title, DEFAULT_TITLE);
    }

    #[tokio::test]
    async fn empty_content_is_rejected_without_a_write() {
        let db = memory_db().await;
        let allocator = IdentifierAllocator::default();

        let result = db.create_document(&allocator, paste("", Some("Title"))).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(count_documents(&db).await, 0);
    }

    #[tokio::test]
    async fn whitespace_only_content_is_rejected_without_a_write() {
        let db = memory_db().await;
        let allocator = IdentifierAllocator::default();

        let result = db.create_document(&allocator, paste("   \n\t", Some("Title"))).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(count_documents(&db).await, 0);

        let result = db.insert_document("  ", "Title", "abcde").await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(count_documents(&db).await, 0);
    }

    #[tokio::test]
    async fn hung_statement_surfaces_as_unavailable() {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        let db = Database::setup(db, Duration::from_millis(10), None, None).await.unwrap();

        // A statement that never completes must fail after the bounded
        // interval instead of stalling the request.
        let result = db.with_timeout(std::future::pending::<libsql::Result<()>>()).await;
        match result {
            Err(StoreError::Unavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn fetch_unknown_code_is_not_found() {
        let db = memory_db().await;

        match db.get_document_by_code("zzzzz").await {
            Err(StoreError::NotFound(code)) => assert_eq!(code, "zzzzz"),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_hits_the_unique_index() {
        let db = memory_db().await;

        db.insert_document("first", "a", "abcde").await.unwrap();
        match db.insert_document("second", "b", "abcde").await {
            Err(StoreError::DuplicateCode(code)) => assert_eq!(code, "abcde"),
            other => panic!("expected DuplicateCode, got {:?}", other.map(|_| ())),
        }
        assert_eq!(count_documents(&db).await, 1);
    }

    #[tokio::test]
    async fn create_skips_occupied_candidate_codes() {
        let db = memory_db().await;
        db.insert_document("occupant", "t", "taken").await.unwrap();

        // Scripted draw returns an occupied code first; the probe catches it
        // and the allocator redraws.
        let queue = Mutex::new(vec!["taken".to_string(), "fresh".to_string()]);
        let allocator = IdentifierAllocator::with_draw(5, Box::new(move |_| queue.lock().unwrap().remove(0)));

        let created = db.create_document(&allocator, paste("new doc", None)).await.unwrap();
        assert_eq!(created.short_code, "fresh");
    }

    #[tokio::test]
    async fn reads_are_stable_across_fetches() {
        let db = memory_db().await;
        let allocator = IdentifierAllocator::default();

        let created = db
            .create_document(&allocator, paste("immutable", Some("T")))
            .await
            .unwrap();

        let first = db.get_document_by_code(&created.short_code).await.unwrap();
        let second = db.get_document_by_code(&created.short_code).await.unwrap();
        assert_eq!(first.content, second.content);
        assert_eq!(first.title, second.title);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_codes() {
        let db = Arc::new(memory_db().await);
        let allocator = Arc::new(IdentifierAllocator::default());

        let mut handles = Vec::new();
        for i in 0..100 {
            let db = db.clone();
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                db.create_document(&allocator, paste(&format!("# document {i}"), None))
                    .await
            }));
        }

        let mut codes = HashSet::new();
        let mut created = Vec::new();
        for handle in handles {
            let doc = handle.await.unwrap().unwrap();
            assert!(codes.insert(doc.short_code.clone()), "duplicate code {}", doc.short_code);
            created.push(doc);
        }
        assert_eq!(codes.len(), 100);

        for doc in created {
            let fetched = db.get_document_by_code(&doc.short_code).await.unwrap();
            assert_eq!(fetched.content, doc.content);
        }
    }
}
